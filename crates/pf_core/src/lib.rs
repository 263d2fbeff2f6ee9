//! Shared identity, status-flag, error, and config types for the
//! coloring-book order pipeline.

pub mod config;
pub mod error;
pub mod ids;
pub mod status;
pub mod types;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use status::{ColoringStatus, OrderStatus, ProcessingStatus, StatusFlags, SvgStatus};
pub use types::FileRef;
