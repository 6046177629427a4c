//! Core math and data types.

pub mod se3;
pub mod types;
