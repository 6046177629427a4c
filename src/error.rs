//! Error types for gati-slam.
//!
//! # Error Recovery Strategies
//!
//! Per-scan degradations are *not* errors: insufficient registration
//! features, an unreachable detector, an association above the match gate,
//! a stale GNSS sample or a non-converging loop candidate are all absorbed
//! by the pipeline exactly as the estimator contract describes (the scan
//! still completes, tracks coast on their motion model). The variants below
//! are the conditions that cannot be absorbed:
//!
//! - **`UnknownKey`**: a factor referenced a variable that was never
//!   inserted. This is a programming error in the staging logic; the
//!   smoother refuses the whole buffer rather than corrupt its state.
//! - **`Solver`**: the damped normal equations could not be factorized even
//!   after raising the damping. The smoother state is suspect after this;
//!   the system is not designed to resume from it.
//! - **`DetectorDisconnected`**: the detector worker hung up mid-scan.
//! - **`Io`** / **`Serialization`**: map or result export failed.

use thiserror::Error;

/// Errors that can occur in gati-slam.
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("factor references unknown variable key {0}")]
    UnknownKey(u64),

    #[error("linear solve failed: {0}")]
    Solver(String),

    #[error("detector worker disconnected")]
    DetectorDisconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
