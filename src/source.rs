//! # Source Module
//!
//! The closed set of supported sources and the capability contract their
//! drivers satisfy.
//!
//! ## Source kinds
//! | id | class | components |
//! |---|---|---|
//! | accelerometer | sensor | x, y, z |
//! | gyroscope | sensor | x, y, z |
//! | magnetometer | sensor | x, y, z |
//! | barometer | sensor | pressure |
//! | gps | sensor | latitude, longitude, altitude |
//! | microphone | recorder | amplitude |
//! | camera | recorder | frame |
//!
//! ## Driver contract
//! A driver is created once per attached source by a `DriverFactory` and is
//! handed a `SampleSender` at construction. After `enable` it pushes
//! `SampleBatch`es through the sender from whatever thread or task it runs
//! on; after `disable` it stops.

use crate::error::SessionError;
use crate::sample::{Sample, SampleBatch};
use async_trait::async_trait;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Barometer,
    Gps,
    Microphone,
    Camera,
}

/// Continuous measurement or media capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceClass {
    Sensor,
    Recorder,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Accelerometer,
        SourceKind::Gyroscope,
        SourceKind::Magnetometer,
        SourceKind::Barometer,
        SourceKind::Gps,
        SourceKind::Microphone,
        SourceKind::Camera,
    ];

    /// Identifier used in file names and metadata
    pub fn id(&self) -> &'static str {
        match self {
            SourceKind::Accelerometer => "accelerometer",
            SourceKind::Gyroscope => "gyroscope",
            SourceKind::Magnetometer => "magnetometer",
            SourceKind::Barometer => "barometer",
            SourceKind::Gps => "gps",
            SourceKind::Microphone => "microphone",
            SourceKind::Camera => "camera",
        }
    }

    pub fn class(&self) -> SourceClass {
        match self {
            SourceKind::Microphone | SourceKind::Camera => SourceClass::Recorder,
            _ => SourceClass::Sensor,
        }
    }

    /// Column names of one sample, in order
    pub fn components(&self) -> &'static [&'static str] {
        match self {
            SourceKind::Accelerometer | SourceKind::Gyroscope | SourceKind::Magnetometer => {
                &["x", "y", "z"]
            }
            SourceKind::Barometer => &["pressure"],
            SourceKind::Gps => &["latitude", "longitude", "altitude"],
            SourceKind::Microphone => &["amplitude"],
            SourceKind::Camera => &["frame"],
        }
    }

    /// File name of this source's stream inside a session folder
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.id())
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for SourceKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.id() == wanted)
            .ok_or_else(|| SessionError::UnsupportedSource(s.to_string()))
    }
}

/// Per-source options given at attach time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Overrides the session-wide sample-rate hint
    pub sample_rate_hz: Option<u32>,
}

/// Push callback handed to a driver at construction.
///
/// Cheap to clone and safe to use from any thread.
#[derive(Debug, Clone)]
pub struct SampleSender {
    kind: SourceKind,
    tx: Sender<SampleBatch>,
}

impl SampleSender {
    pub fn new(kind: SourceKind, tx: Sender<SampleBatch>) -> Self {
        Self { kind, tx }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Deliver samples to the session. Returns `false` once the session is gone.
    pub fn send(&self, samples: Vec<Sample>) -> bool {
        if samples.is_empty() {
            return true;
        }
        self.tx
            .send(SampleBatch {
                source: self.kind,
                samples,
            })
            .is_ok()
    }
}

/// Capability every sensor or recorder driver provides
#[async_trait]
pub trait SourceDriver: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Start producing samples, at roughly `sample_rate_hz` if supported
    async fn enable(&mut self, sample_rate_hz: u32) -> Result<(), SessionError>;

    /// Stop producing samples. Disabling a stopped driver is a no-op.
    async fn disable(&mut self) -> Result<(), SessionError>;

    /// Capability probe: is the underlying device usable
    async fn is_working(&self) -> bool;
}

/// Resolves a source kind to a driver, once, at attach time
pub trait DriverFactory: Send + Sync {
    fn create(
        &self,
        kind: SourceKind,
        config: &SourceConfig,
        sender: SampleSender,
    ) -> Result<Box<dyn SourceDriver>, SessionError>;
}
