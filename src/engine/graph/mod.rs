//! Factor graph: factor library, sparse linear algebra and the incremental
//! smoother.

pub mod factors;
pub mod linalg;
pub mod smoother;
