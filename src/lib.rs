//! # Sensible Recorder
//!
//! Multi-source recorder: attaches sensors and media recorders, buffers
//! their samples in bounded circular timeframes, persists them to one
//! append-only stream per source and lets the operator split the recording
//! into labelled intervals.
//!
//! ## Modules
//! - `timeframe`: ring buffer with batched, retained flushing
//! - `session`: lifecycle state machine and ingestion
//! - `registry`: per-source timeframe chains, drivers and writers
//! - `storage` / `writer`: asynchronous storage service and per-stream writer tasks
//! - `source` / `simulated`: driver capability contract and synthetic drivers

pub mod config;
pub mod error;
pub mod index;
pub mod label;
pub mod record;
pub mod registry;
pub mod sample;
pub mod session;
pub mod simulated;
pub mod source;
pub mod storage;
pub mod timeframe;
pub mod writer;

pub use config::RecorderConfig;
pub use error::{BufferError, ConfigError, SessionError, StorageError};
pub use session::{FinishReport, RecorderContext, RecordingSession, SessionState, StartReport};
pub use source::{SourceConfig, SourceKind};
