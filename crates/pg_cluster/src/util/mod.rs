pub mod cluster_status;
pub mod errors;
pub mod metrics;
pub mod status;
pub mod task_status;
pub mod telemetry;

pub use errors::{Error, Result, StdError};
