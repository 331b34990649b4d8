pub mod api;
pub mod config;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod gcs;
pub mod inference;
pub mod metrics;
pub mod overlay;
pub mod pipeline;
pub mod preprocess;
pub mod storage;
pub mod volume;

pub use error::{Result, SegmentError};
