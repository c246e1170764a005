//! # Recording Session Module
//!
//! Orchestrates one recording from attaching sources to finishing or
//! cancelling it.
//!
//! ## Lifecycle
//! ```text
//! Building ──arm──► Armed ──start──► Recording ──finish──► Finishing ──► Finished
//!    │                │                                        │
//!    └──── start (arms implicitly)                             └──────► Cancelled (discard)
//! ```
//!
//! - `Building`: sources are attached, each opening its stream file
//! - `Armed`: the label stream and `info.json` exist
//! - `Recording`: drivers are enabled, samples flow, labels change freely
//! - `Finishing`: drivers are stopped, every timeframe is drained and every
//!   stream closed, collecting failures instead of stopping at the first one
//! - `Finished` appends the session to the index; `Cancelled` deletes the folder
//!
//! ## Ingestion
//! Drivers push batches through a `SampleSender`. `ingest_pending` drains the
//! queue without blocking and routes every batch to the current timeframe
//! of its source, stamping samples with that timeframe's label.

use crate::config::RecorderConfig;
use crate::error::{SessionError, StorageError};
use crate::index::{self, IndexEntry};
use crate::label::{Label, LabelBook, LabelRef};
use crate::record::{encode_label, stream_header, SessionMetadata, LABEL_HEADER};
use crate::registry::{SourceRegistry, SourceStream, TimeframeHandle};
use crate::sample::{now_ms, Sample, SampleBatch};
use crate::source::{DriverFactory, SampleSender, SourceClass, SourceConfig, SourceKind};
use crate::storage::StorageService;
use crate::timeframe::{CircularTimeframe, PendingWrite};
use crate::writer::StreamWriter;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const LABEL_FILE: &str = "labels.csv";
pub const METADATA_FILE: &str = "info.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Building,
    Armed,
    Recording,
    Finishing,
    Finished,
    Cancelled,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Building => "building",
            SessionState::Armed => "armed",
            SessionState::Recording => "recording",
            SessionState::Finishing => "finishing",
            SessionState::Finished => "finished",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared collaborators for every session of one recorder.
///
/// Passed explicitly; nothing here is process-global.
pub struct RecorderContext {
    config: RecorderConfig,
    storage: Arc<dyn StorageService>,
    factory: Arc<dyn DriverFactory>,
    next_id: AtomicU64,
}

impl RecorderContext {
    /// Create a context whose session ids start at 1
    pub fn new(
        config: RecorderConfig,
        storage: Arc<dyn StorageService>,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            factory,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create a context that continues numbering after the session folders
    /// already present under `save_root`
    pub async fn open(
        config: RecorderConfig,
        storage: Arc<dyn StorageService>,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, SessionError> {
        let context = Self::new(config, storage, factory)?;
        context.storage.create_dir(&context.config.save_root).await?;

        let mut id = 1;
        while context.storage.exists(&context.session_folder(id)).await? {
            id += 1;
        }
        context.next_id.store(id, Ordering::Relaxed);
        log::debug!("Next session id is {}", id);
        Ok(context)
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageService> {
        &self.storage
    }

    pub fn session_folder(&self, id: u64) -> PathBuf {
        self.config.save_root.join(format!("recording_{}", id))
    }

    /// Finished sessions listed in the index
    pub async fn list_sessions(&self) -> Result<Vec<IndexEntry>, SessionError> {
        Ok(index::read_index(self.storage.as_ref(), &self.config.index_path()).await?)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Outcome of `start`: sources that are producing samples and those that
/// failed to arm
#[derive(Debug, Default)]
pub struct StartReport {
    pub armed: Vec<SourceKind>,
    pub failed: Vec<(SourceKind, SessionError)>,
}

impl StartReport {
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Stream a finish failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishTarget {
    Source(SourceKind),
    Labels,
    Metadata,
    Index,
    Folder,
}

impl fmt::Display for FinishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishTarget::Source(kind) => write!(f, "source {}", kind),
            FinishTarget::Labels => f.write_str("label stream"),
            FinishTarget::Metadata => f.write_str("metadata"),
            FinishTarget::Index => f.write_str("session index"),
            FinishTarget::Folder => f.write_str("session folder"),
        }
    }
}

#[derive(Debug)]
pub struct FinishFailure {
    pub target: FinishTarget,
    pub error: SessionError,
}

/// Aggregate result of `finish`: the terminal state plus every failure seen
#[derive(Debug)]
pub struct FinishReport {
    pub state: SessionState,
    pub failures: Vec<FinishFailure>,
}

impl FinishReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_sources(&self) -> Vec<SourceKind> {
        self.failures
            .iter()
            .filter_map(|failure| match failure.target {
                FinishTarget::Source(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    fn push(&mut self, target: FinishTarget, error: impl Into<SessionError>) {
        let error = error.into();
        log::error!("Finishing failed for {}: {}", target, error);
        self.failures.push(FinishFailure { target, error });
    }
}

pub struct RecordingSession {
    id: u64,
    name: String,
    folder: PathBuf,
    start_time: Option<i64>,
    state: SessionState,
    context: Arc<RecorderContext>,
    registry: SourceRegistry,
    labels: LabelBook,
    label_writer: Option<StreamWriter>,
    label_writes: Vec<PendingWrite>,
    sample_tx: Sender<SampleBatch>,
    sample_rx: Receiver<SampleBatch>,
    dropped_samples: u64,
}

impl RecordingSession {
    /// Create an empty session and its folder.
    ///
    /// Without a name the session is called `Recording <id>`.
    pub async fn create(
        context: Arc<RecorderContext>,
        name: Option<String>,
    ) -> Result<Self, SessionError> {
        let id = context.allocate_id();
        let folder = context.session_folder(id);
        context.storage.create_dir(&folder).await?;

        let name = name.unwrap_or_else(|| format!("Recording {}", id));
        log::info!("Created session {} ({}) in {}", id, name, folder.display());

        let (sample_tx, sample_rx) = unbounded();
        Ok(Self {
            id,
            name,
            folder,
            start_time: None,
            state: SessionState::Building,
            context,
            registry: SourceRegistry::new(),
            labels: LabelBook::new(),
            label_writer: None,
            label_writes: Vec::new(),
            sample_tx,
            sample_rx,
            dropped_samples: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    pub fn labels(&self) -> &LabelBook {
        &self.labels
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Samples discarded because they arrived outside `Recording`/`Finishing`
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    pub fn stream_path(&self, kind: SourceKind) -> PathBuf {
        self.folder.join(kind.file_name())
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), SessionError> {
        self.require_not_terminal("rename")?;
        self.name = name.into();
        Ok(())
    }

    /// Attach a source by identifier, e.g. `"accelerometer"`
    pub async fn attach_source_id(
        &mut self,
        id: &str,
        config: SourceConfig,
    ) -> Result<(), SessionError> {
        let kind: SourceKind = id.parse()?;
        self.attach_source(kind, config).await
    }

    /// Resolve a driver for `kind`, open its stream and install its first timeframe
    pub async fn attach_source(
        &mut self,
        kind: SourceKind,
        config: SourceConfig,
    ) -> Result<(), SessionError> {
        self.require(SessionState::Building, "attach a source")?;
        if self.registry.contains(kind) {
            return Err(SessionError::DuplicateSource(kind));
        }

        let sender = SampleSender::new(kind, self.sample_tx.clone());
        let driver = self.context.factory.create(kind, &config, sender)?;

        let header = stream_header(kind.components());
        let writer = StreamWriter::open(
            self.context.storage.clone(),
            self.stream_path(kind),
            header.as_bytes(),
        )
        .await?;

        let settings = &self.context.config;
        self.registry.insert(SourceStream::new(
            kind,
            config,
            driver,
            writer,
            settings.timeframe_capacity,
            settings.flush_threshold,
        ))?;
        log::info!("Session {}: attached {}", self.id, kind);
        Ok(())
    }

    /// Make the session durable: open the label stream and write `info.json`
    pub async fn arm(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Building, "arm")?;

        let writer = StreamWriter::open(
            self.context.storage.clone(),
            self.folder.join(LABEL_FILE),
            LABEL_HEADER.as_bytes(),
        )
        .await?;
        self.label_writer = Some(writer);
        self.write_metadata().await?;

        self.state = SessionState::Armed;
        log::info!(
            "Session {} armed with {} sources",
            self.id,
            self.registry.len()
        );
        Ok(())
    }

    /// Enable every attached driver.
    ///
    /// A source that fails its capability check or refuses to enable is
    /// reported and skipped; the rest keep recording.
    pub async fn start(&mut self) -> Result<StartReport, SessionError> {
        if self.state == SessionState::Building {
            self.arm().await?;
        }
        self.require(SessionState::Armed, "start")?;

        let default_rate = self.context.config.sample_rate_hz;
        let mut report = StartReport::default();
        for stream in self.registry.iter_mut() {
            let kind = stream.kind();
            let rate = stream.config().sample_rate_hz.unwrap_or(default_rate);

            if !stream.driver().is_working().await {
                log::warn!("Session {}: {} failed its capability check", self.id, kind);
                report.failed.push((
                    kind,
                    SessionError::Driver {
                        kind,
                        reason: "capability check failed".to_string(),
                    },
                ));
                continue;
            }
            match stream.driver_mut().enable(rate).await {
                Ok(()) => report.armed.push(kind),
                Err(e) => {
                    log::warn!("Session {}: could not enable {}: {}", self.id, kind, e);
                    report.failed.push((kind, e));
                }
            }
        }

        self.start_time = Some(now_ms());
        self.state = SessionState::Recording;
        log::info!(
            "Session {} recording ({} armed, {} failed)",
            self.id,
            report.armed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Close the open label at `time_ms`, open `name` there and give every
    /// source a fresh timeframe bound to it.
    ///
    /// The label book only changes once every source has rotated.
    pub fn begin_label(&mut self, name: &str, time_ms: i64) -> Result<LabelRef, SessionError> {
        self.require(SessionState::Recording, "begin a label")?;

        let label = self.labels.next_ref(name, time_ms)?;
        for stream in self.registry.iter_mut() {
            stream.rotate(Some(label.clone()))?;
        }
        let (closed, opened) = self.labels.begin(name, time_ms)?;
        if let Some(closed) = closed {
            self.persist_label(&closed);
        }
        log::info!("Session {}: label '{}' from {}", self.id, opened, time_ms);
        Ok(opened)
    }

    /// Close the open label at `time_ms` without opening a new one
    pub fn end_label(&mut self, time_ms: i64) -> Result<Option<Label>, SessionError> {
        if !matches!(self.state, SessionState::Recording | SessionState::Finishing) {
            return Err(self.invalid("end a label"));
        }
        let closed = self.labels.end(time_ms)?;
        if let Some(label) = &closed {
            self.persist_label(label);
        }
        Ok(closed)
    }

    /// Route samples to the current timeframe of `kind`.
    ///
    /// Returns the number of samples accepted.
    pub fn ingest(&mut self, kind: SourceKind, samples: Vec<Sample>) -> Result<usize, SessionError> {
        let stream = self.registry.get_mut(kind)?;
        let expected = kind.components().len();
        if let Some(sample) = samples.iter().find(|s| s.values().len() != expected) {
            return Err(SessionError::SampleWidth {
                kind,
                expected,
                found: sample.values().len(),
            });
        }
        if !matches!(self.state, SessionState::Recording | SessionState::Finishing) {
            log::warn!(
                "Session {}: dropping {} {} samples while {}",
                self.id,
                samples.len(),
                kind,
                self.state
            );
            self.dropped_samples += samples.len() as u64;
            return Ok(0);
        }

        let Some(timeframe) = stream.current_mut() else {
            return Err(SessionError::UnknownSource(kind));
        };
        let label = timeframe.label().cloned();
        let count = samples.len();
        timeframe.add_samples(
            samples
                .into_iter()
                .map(|sample| sample.with_label(label.clone())),
        )?;
        Ok(count)
    }

    /// Drain everything drivers have pushed so far without blocking.
    ///
    /// A rejected batch is logged and skipped; the rest of the channel is
    /// still ingested. The first rejection is returned once the channel is empty.
    pub fn ingest_pending(&mut self) -> Result<usize, SessionError> {
        let mut accepted = 0;
        let mut first_error = None;
        loop {
            match self.sample_rx.try_recv() {
                Ok(batch) => {
                    let source = batch.source;
                    match self.ingest(source, batch.samples) {
                        Ok(n) => accepted += n,
                        Err(e) => {
                            log::error!("Session {}: rejected {} batch: {}", self.id, source, e);
                            first_error.get_or_insert(e);
                        }
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(accepted),
        }
    }

    /// Most recent live sample of `kind`
    pub fn latest_sample(&self, kind: SourceKind) -> Result<Option<&Sample>, SessionError> {
        Ok(self
            .registry
            .get(kind)?
            .current()
            .and_then(CircularTimeframe::latest_sample))
    }

    /// Handle of the timeframe currently receiving samples for `kind`
    pub fn latest_timeframe(&self, kind: SourceKind) -> Result<TimeframeHandle, SessionError> {
        Ok(self.registry.get(kind)?.current_handle())
    }

    pub fn timeframe(&self, handle: TimeframeHandle) -> Option<&CircularTimeframe> {
        self.registry.timeframe(handle)
    }

    /// Read a source's stream file. Fails with `FileBusy` while it is open.
    pub async fn export_source(&self, kind: SourceKind) -> Result<Vec<u8>, SessionError> {
        self.registry.get(kind)?;
        Ok(self.context.storage.read(&self.stream_path(kind)).await?)
    }

    /// Metadata record for `info.json`
    pub fn metadata(&self) -> SessionMetadata {
        let ids = |class: SourceClass| -> Vec<String> {
            self.registry
                .kinds()
                .filter(|kind| kind.class() == class)
                .map(|kind| kind.id().to_string())
                .collect()
        };
        SessionMetadata {
            id: self.id,
            name: self.name.clone(),
            start_time: self.start_time,
            sources: ids(SourceClass::Sensor),
            recorders: ids(SourceClass::Recorder),
        }
    }

    /// Stop, flush and close everything, then persist or delete the session.
    ///
    /// Every source is attempted even if another one fails; all failures are
    /// returned in the report. With `discard` the session folder is deleted,
    /// otherwise `info.json` is rewritten and one index line is appended.
    pub async fn finish(&mut self, discard: bool) -> Result<FinishReport, SessionError> {
        if !matches!(
            self.state,
            SessionState::Building | SessionState::Armed | SessionState::Recording
        ) {
            return Err(self.invalid("finish"));
        }
        let was_recording = self.state == SessionState::Recording;
        self.state = SessionState::Finishing;
        log::info!("Session {} finishing (discard: {})", self.id, discard);

        let mut report = FinishReport {
            state: SessionState::Finishing,
            failures: Vec::new(),
        };

        if let Some(open) = self.labels.open() {
            let end = now_ms().max(open.start_ms);
            if let Err(e) = self.end_label(end) {
                report.push(FinishTarget::Labels, e);
            }
        }

        if was_recording {
            for stream in self.registry.iter_mut() {
                if let Err(e) = stream.driver_mut().disable().await {
                    report.push(FinishTarget::Source(stream.kind()), e);
                }
            }
            while let Ok(batch) = self.sample_rx.try_recv() {
                let kind = batch.source;
                if let Err(e) = self.ingest(kind, batch.samples) {
                    report.push(FinishTarget::Source(kind), e);
                }
            }
        }

        let max_retries = self.context.config.max_flush_retries;
        for stream in self.registry.iter_mut() {
            let kind = stream.kind();
            match stream.drain_chain(max_retries).await {
                Ok(confirmed) => log::debug!("{}: {} samples flushed at finish", kind, confirmed),
                Err(e) => report.push(FinishTarget::Source(kind), e),
            }
            if let Err(e) = stream.writer_mut().close().await {
                report.push(FinishTarget::Source(kind), e);
            }
        }

        for pending in self.label_writes.drain(..) {
            if let Err(e) = pending.wait().await {
                report.push(FinishTarget::Labels, e);
            }
        }
        if let Some(writer) = self.label_writer.as_mut() {
            if let Err(e) = writer.close().await {
                report.push(FinishTarget::Labels, e);
            }
        }

        if discard {
            if let Err(e) = self.context.storage.delete(&self.folder, true).await {
                report.push(FinishTarget::Folder, e);
            }
            self.state = SessionState::Cancelled;
        } else {
            if let Err(e) = self.write_metadata().await {
                report.push(FinishTarget::Metadata, e);
            }
            let entry = IndexEntry::new(self.name.clone(), self.folder.clone());
            let index_path = self.context.config.index_path();
            if let Err(e) =
                index::append_entry(self.context.storage.as_ref(), &index_path, &entry).await
            {
                report.push(FinishTarget::Index, e);
            }
            self.state = SessionState::Finished;
        }

        report.state = self.state;
        log::info!(
            "Session {} {} with {} failures",
            self.id,
            self.state,
            report.failures.len()
        );
        Ok(report)
    }

    fn persist_label(&mut self, label: &Label) {
        match &self.label_writer {
            Some(writer) => self
                .label_writes
                .push(writer.append_bytes(encode_label(label).into_bytes())),
            None => log::warn!("Session {}: no label stream for '{}'", self.id, label.name),
        }
    }

    async fn write_metadata(&self) -> Result<(), SessionError> {
        let storage = self.context.storage.as_ref();
        let path = self.folder.join(METADATA_FILE);
        let bytes = self
            .metadata()
            .to_json()
            .map_err(|e| StorageError::io(&path, e.into()))?;

        if storage.exists(&path).await? {
            storage.delete(&path, false).await?;
        }
        let handle = storage.open(&path).await?;
        let written = storage.write(&handle, &bytes).await;
        let closed = storage.close(&handle).await;
        written.and(closed)?;
        Ok(())
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn require_not_terminal(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            Err(self.invalid(operation))
        } else {
            Ok(())
        }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }
}

impl fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("folder", &self.folder)
            .field("state", &self.state)
            .field("sources", &self.registry.kinds().collect::<Vec<_>>())
            .field("labels", &self.labels.len())
            .finish()
    }
}
