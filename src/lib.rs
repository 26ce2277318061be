//! Memora: on-device style image captioning for a local photo library.
//!
//! Images enter a persistent record store by import or by a library scan,
//! wait in a FIFO queue, and are captioned one at a time by a pluggable
//! vision provider. Background runs are gated by network, power, a
//! time-of-day window and a scan frequency.

pub mod caption;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod scanner;
pub mod schedule;
pub mod settings;
pub mod tasks;

pub use error::{PipelineError, Result};
pub use pipeline::{
    BackgroundFetchResult, ImageRecord, ImageStatus, Pipeline, PipelineOptions, PipelineSnapshot,
    RunContext, RunReport, Trigger,
};
