pub mod config;
pub mod error;
pub mod log;
pub mod params;
pub mod recording;
pub mod sorting;
pub mod synthetic;
pub mod types;

pub use config::Config;
pub use error::{Result, SortError};
pub use log::ExecutionLog;
pub use params::{ParamSpec, Params};
pub use recording::{Recording, RecordingRef, RecordingSpec};
pub use sorting::SortingResult;
pub use types::*;
