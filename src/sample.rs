//! # Sample Module
//!
//! The unit of data every source produces: a timestamp, a fixed number of
//! numeric components, and the label that was active when it was captured.
//! Samples are immutable and cheap to clone so they can sit in a ring, a
//! flush buffer and an outgoing write batch at the same time.

use crate::label::LabelRef;
use std::sync::Arc;

/// One timestamped measurement tuple
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Capture time in milliseconds since the Unix epoch
    pub time_ms: i64,
    values: Arc<[f64]>,
    label: Option<LabelRef>,
}

impl Sample {
    pub fn new(time_ms: i64, values: impl Into<Arc<[f64]>>) -> Self {
        Self {
            time_ms,
            values: values.into(),
            label: None,
        }
    }

    /// Same sample attributed to `label`
    pub fn with_label(self, label: Option<LabelRef>) -> Self {
        Self { label, ..self }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn label(&self) -> Option<&LabelRef> {
        self.label.as_ref()
    }
}

/// Batch of samples pushed by one driver callback
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub source: crate::source::SourceKind,
    pub samples: Vec<Sample>,
}

pub trait SampleSliceExt {
    /// First and last capture time, if any
    fn time_span(&self) -> Option<(i64, i64)>;
}

impl SampleSliceExt for [Sample] {
    fn time_span(&self) -> Option<(i64, i64)> {
        self.iter().fold(None, |acc, sample| match acc {
            None => Some((sample.time_ms, sample.time_ms)),
            Some((min, max)) => Some((min.min(sample.time_ms), max.max(sample.time_ms))),
        })
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
