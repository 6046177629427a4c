//! Persistence: PCD map export and estimation-result export.

pub mod pcd;
pub mod results;
