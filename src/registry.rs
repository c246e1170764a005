//! # Source Registry Module
//!
//! Arena of everything a session owns per source: the driver, the chain of
//! timeframes (oldest to newest, append-only), the stream writer and the
//! write queue every timeframe of the chain flushes into.
//!
//! Code outside the registry refers to a timeframe through a
//! `TimeframeHandle` (`source`, position in its chain) rather than a
//! reference, so sealing or appending timeframes never invalidates it.

use crate::error::{BufferError, SessionError};
use crate::label::LabelRef;
use crate::source::{SourceConfig, SourceDriver, SourceKind};
use crate::timeframe::{CircularTimeframe, FlushQueue};
use crate::writer::StreamWriter;
use std::collections::BTreeMap;

/// Stable address of one timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeframeHandle {
    pub source: SourceKind,
    pub index: usize,
}

pub struct SourceStream {
    kind: SourceKind,
    config: SourceConfig,
    driver: Box<dyn SourceDriver>,
    chain: Vec<CircularTimeframe>,
    writer: StreamWriter,
    queue: FlushQueue,
    capacity: usize,
    flush_threshold: usize,
}

impl SourceStream {
    /// Bundle a driver and writer, installing an unlabelled first timeframe
    pub fn new(
        kind: SourceKind,
        config: SourceConfig,
        driver: Box<dyn SourceDriver>,
        writer: StreamWriter,
        capacity: usize,
        flush_threshold: usize,
    ) -> Self {
        let queue = FlushQueue::new(Box::new(writer.sink()));
        let mut stream = Self {
            kind,
            config,
            driver,
            chain: Vec::new(),
            writer,
            queue,
            capacity,
            flush_threshold,
        };
        let first = stream.new_timeframe(None);
        stream.chain.push(first);
        stream
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn driver(&self) -> &dyn SourceDriver {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> &mut dyn SourceDriver {
        self.driver.as_mut()
    }

    pub fn writer(&self) -> &StreamWriter {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut StreamWriter {
        &mut self.writer
    }

    pub fn queue(&self) -> &FlushQueue {
        &self.queue
    }

    pub fn chain(&self) -> &[CircularTimeframe] {
        &self.chain
    }

    /// Timeframe receiving new samples
    pub fn current(&self) -> Option<&CircularTimeframe> {
        self.chain.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut CircularTimeframe> {
        self.chain.last_mut()
    }

    pub fn current_handle(&self) -> TimeframeHandle {
        TimeframeHandle {
            source: self.kind,
            index: self.chain.len().saturating_sub(1),
        }
    }

    /// Seal the current timeframe and append a fresh one bound to `label`.
    ///
    /// Samples of the sealed timeframe that are not yet durable stay queued
    /// ahead of anything the new timeframe flushes.
    pub fn rotate(&mut self, label: Option<LabelRef>) -> Result<TimeframeHandle, BufferError> {
        if let Some(current) = self.chain.last_mut() {
            current.seal()?;
        }
        let next = self.new_timeframe(label);
        self.chain.push(next);
        Ok(self.current_handle())
    }

    /// Flush every timeframe in chain order and wait for the queue to empty.
    ///
    /// Returns the number of samples confirmed.
    pub async fn drain_chain(&mut self, max_retries: u32) -> Result<u64, SessionError> {
        let confirmed_before = self.queue.stats().samples_confirmed;
        for timeframe in &mut self.chain {
            timeframe.pop_and_save(timeframe.live_count())?;
        }
        if let Err(e) = self.queue.drain(max_retries).await {
            log::error!("Failed to drain {} stream: {}", self.kind, e);
            return Err(e.into());
        }
        Ok(self.queue.stats().samples_confirmed - confirmed_before)
    }

    fn new_timeframe(&self, label: Option<LabelRef>) -> CircularTimeframe {
        CircularTimeframe::new(
            self.capacity,
            self.flush_threshold,
            label,
            self.queue.clone(),
        )
    }
}

#[derive(Default)]
pub struct SourceRegistry {
    streams: BTreeMap<SourceKind, SourceStream>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, kind: SourceKind) -> bool {
        self.streams.contains_key(&kind)
    }

    /// Add a stream. An already attached kind is rejected and the registry
    /// keeps its existing entry.
    pub fn insert(&mut self, stream: SourceStream) -> Result<(), SessionError> {
        let kind = stream.kind();
        if self.contains(kind) {
            return Err(SessionError::DuplicateSource(kind));
        }
        self.streams.insert(kind, stream);
        Ok(())
    }

    pub fn get(&self, kind: SourceKind) -> Result<&SourceStream, SessionError> {
        self.streams
            .get(&kind)
            .ok_or(SessionError::UnknownSource(kind))
    }

    pub fn get_mut(&mut self, kind: SourceKind) -> Result<&mut SourceStream, SessionError> {
        self.streams
            .get_mut(&kind)
            .ok_or(SessionError::UnknownSource(kind))
    }

    pub fn timeframe(&self, handle: TimeframeHandle) -> Option<&CircularTimeframe> {
        self.streams.get(&handle.source)?.chain.get(handle.index)
    }

    pub fn kinds(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.streams.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceStream> {
        self.streams.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SourceStream> {
        self.streams.values_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
