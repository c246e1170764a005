//! # Circular Timeframe Module
//!
//! Fixed-capacity ring of samples bound to one label, plus the batching and
//! retention that stand between eviction and durable storage.
//!
//! ## Flow
//! ```text
//! driver ──► add_sample ──► ring (capacity slots) ──evict──► batch ──► FlushQueue ──► FlushSink
//!                                                                       ▲             │
//!                                                                       └─ retained ◄─┘ on failure
//! ```
//!
//! ## Flush policy
//! `pop_and_save(n)` removes the `n` oldest live samples. A partial pop whose
//! samples still fit under `flush_threshold` together with what is already
//! batched stays in the timeframe. Anything else is a flush trigger: the batch
//! is handed to the source's [`FlushQueue`] as one write.
//!
//! ## Retention
//! One [`FlushQueue`] serves every timeframe of a source. It holds every
//! sample that is not yet confirmed durable, in arrival order. At most one
//! write is in flight per queue and it always covers a prefix of the queue,
//! so a failed write is re-sent as part of the next one and nothing is lost,
//! duplicated or reordered, even across label transitions.
//!
//! ## Pointer math
//! All index arithmetic goes through [`move_circular_pointer`].

use crate::error::{BufferError, SessionError, StorageError};
use crate::label::LabelRef;
use crate::sample::{Sample, SampleSliceExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Sender half used by a writer to report the outcome of one write
pub type WriteAck = oneshot::Sender<Result<(), StorageError>>;

/// Outcome of a write that may still be running
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<(), StorageError>>,
}

impl PendingWrite {
    /// Create a linked ack/pending pair
    pub fn channel() -> (WriteAck, PendingWrite) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingWrite { rx })
    }

    /// A write that has already finished with `result`
    pub fn ready(result: Result<(), StorageError>) -> PendingWrite {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Non-blocking check. `None` while the write is still running.
    fn poll_now(&mut self) -> Option<Result<(), StorageError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(StorageError::WriterGone)),
        }
    }

    /// Wait for the write to finish
    pub async fn wait(self) -> Result<(), StorageError> {
        self.rx.await.unwrap_or(Err(StorageError::WriterGone))
    }
}

/// Destination of flushed batches.
///
/// `submit` must not block; the returned `PendingWrite` resolves once the
/// batch is durable (or failed).
pub trait FlushSink: Send {
    fn submit(&mut self, batch: Vec<Sample>) -> PendingWrite;
}

/// Move a pointer `shift` positions around a ring of `size` physical slots
/// holding `element_count` valid elements.
///
/// The result is always in `[0, size)`.
pub fn move_circular_pointer(
    shift: isize,
    index: usize,
    element_count: usize,
    size: usize,
) -> Result<usize, BufferError> {
    if shift.unsigned_abs() > element_count || size == 0 {
        return Err(BufferError::ShiftOutOfRange {
            shift,
            element_count,
        });
    }
    let size = size as isize;
    Ok((index as isize % size + shift % size).rem_euclid(size) as usize)
}

/// Counters describing the write traffic of one source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub writes_issued: u64,
    pub failed_writes: u64,
    pub samples_confirmed: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct InFlight {
    /// Number of queued samples covered by the write
    len: usize,
    pending: PendingWrite,
}

struct QueueState {
    unconfirmed: Vec<Sample>,
    in_flight: Option<InFlight>,
    sink: Box<dyn FlushSink>,
    stats: FlushStats,
}

/// Ordered write queue shared by every timeframe of one source.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct FlushQueue {
    state: Arc<Mutex<QueueState>>,
}

impl FlushQueue {
    pub fn new(sink: Box<dyn FlushSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                unconfirmed: Vec::new(),
                in_flight: None,
                sink,
                stats: FlushStats::default(),
            })),
        }
    }

    /// Append a batch behind everything already queued and issue a write,
    /// unless the previous one is still running.
    pub fn push(&self, batch: Vec<Sample>) {
        let mut state = self.state.lock();
        state.unconfirmed.extend(batch);
        state.flush();
    }

    /// Samples handed over but not yet confirmed durable
    pub fn unconfirmed_count(&self) -> usize {
        self.state.lock().unconfirmed.len()
    }

    /// True when nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.unconfirmed.is_empty() && state.in_flight.is_none()
    }

    pub fn stats(&self) -> FlushStats {
        self.state.lock().stats.clone()
    }

    /// Wait until every queued sample is durable.
    ///
    /// A failed write is retried up to `max_retries` times; after that the
    /// error is returned and the unwritten samples stay queued.
    /// Returns the number of samples confirmed by this call.
    pub async fn drain(&self, max_retries: u32) -> Result<u64, StorageError> {
        let confirmed_before = self.state.lock().stats.samples_confirmed;
        let mut failures = 0u32;
        loop {
            let in_flight = {
                let mut state = self.state.lock();
                if state.in_flight.is_none() {
                    if state.unconfirmed.is_empty() {
                        return Ok(state.stats.samples_confirmed - confirmed_before);
                    }
                    state.submit();
                }
                state.in_flight.take()
            };
            let Some(in_flight) = in_flight else {
                continue;
            };

            let result = in_flight.pending.wait().await;
            let mut state = self.state.lock();
            match result {
                Ok(()) => state.confirm(in_flight.len),
                Err(e) => {
                    failures += 1;
                    state.record_failure(&e);
                    if failures > max_retries {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for FlushQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FlushQueue")
            .field("unconfirmed", &state.unconfirmed.len())
            .field("in_flight", &state.in_flight.as_ref().map(|w| w.len))
            .field("stats", &state.stats)
            .finish()
    }
}

impl QueueState {
    /// Settle the previous write, then send everything unconfirmed
    fn flush(&mut self) {
        self.settle();
        if let Some(in_flight) = &self.in_flight {
            log::debug!(
                "Write of {} samples still pending, deferring {} queued samples",
                in_flight.len,
                self.unconfirmed.len() - in_flight.len
            );
            return;
        }
        if !self.unconfirmed.is_empty() {
            self.submit();
        }
    }

    fn settle(&mut self) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        match in_flight.pending.poll_now() {
            None => {}
            Some(Ok(())) => {
                let len = in_flight.len;
                self.in_flight = None;
                self.confirm(len);
            }
            Some(Err(e)) => {
                self.in_flight = None;
                self.record_failure(&e);
            }
        }
    }

    fn submit(&mut self) {
        let batch = self.unconfirmed.clone();
        let len = batch.len();
        if let Some((first, last)) = batch.time_span() {
            log::debug!("Flushing {} samples ({}..{} ms)", len, first, last);
        }
        let pending = self.sink.submit(batch);
        self.stats.writes_issued += 1;
        self.in_flight = Some(InFlight { len, pending });
    }

    fn confirm(&mut self, len: usize) {
        self.unconfirmed.drain(..len);
        self.stats.samples_confirmed += len as u64;
    }

    fn record_failure(&mut self, error: &StorageError) {
        log::warn!(
            "Write of {} samples failed, keeping them queued: {}",
            self.unconfirmed.len(),
            error
        );
        self.stats.failed_writes += 1;
        self.stats.last_error = Some(error.to_string());
    }
}

pub struct CircularTimeframe {
    slots: Vec<Option<Sample>>,
    head: usize,
    live: usize,
    batch: Vec<Sample>,
    flush_threshold: usize,
    label: Option<LabelRef>,
    sealed: bool,
    queue: FlushQueue,
}

impl CircularTimeframe {
    /// Create an empty timeframe.
    ///
    /// # Arguments
    /// * `capacity` - Number of live samples kept in the ring (at least one)
    /// * `flush_threshold` - Evicted samples batched before a write is issued
    /// * `label` - Label every sample in this timeframe belongs to
    /// * `queue` - Write queue of the source, shared with the rest of its chain
    pub fn new(
        capacity: usize,
        flush_threshold: usize,
        label: Option<LabelRef>,
        queue: FlushQueue,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            live: 0,
            batch: Vec::new(),
            flush_threshold,
            label,
            sealed: false,
            queue,
        }
    }

    /// Timeframe with a queue of its own
    pub fn with_sink(
        capacity: usize,
        flush_threshold: usize,
        label: Option<LabelRef>,
        sink: Box<dyn FlushSink>,
    ) -> Self {
        Self::new(capacity, flush_threshold, label, FlushQueue::new(sink))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn head_index(&self) -> usize {
        self.head
    }

    /// Samples evicted from the ring and batched, not yet handed to the queue
    pub fn buffered_count(&self) -> usize {
        self.batch.len()
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    pub fn label(&self) -> Option<&LabelRef> {
        self.label.as_ref()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn queue(&self) -> &FlushQueue {
        &self.queue
    }

    pub fn stats(&self) -> FlushStats {
        self.queue.stats()
    }

    /// True once every sample of the source is durable
    pub fn is_drained(&self) -> bool {
        self.live == 0 && self.batch.is_empty() && self.queue.is_idle()
    }

    /// Insert one sample, evicting the oldest first when the ring is full
    pub fn add_sample(&mut self, sample: Sample) -> Result<(), BufferError> {
        if self.sealed {
            return Err(BufferError::Sealed);
        }
        if self.live == self.capacity() {
            self.pop_and_save(1)?;
        }
        self.insert_unchecked(sample)
    }

    /// Insert samples in order.
    ///
    /// Consecutive evictions caused by the same batch are popped together, so a
    /// large batch produces fewer flush events than the equivalent loop.
    pub fn add_samples<I>(&mut self, samples: I) -> Result<(), BufferError>
    where
        I: IntoIterator<Item = Sample>,
    {
        if self.sealed {
            return Err(BufferError::Sealed);
        }
        let mut incoming = samples.into_iter().peekable();
        let mut pending: Vec<Sample> = Vec::new();

        while incoming.peek().is_some() {
            pending.clear();
            pending.extend(incoming.by_ref().take(self.capacity()));

            let free = self.capacity() - self.live;
            let overflow = pending.len().saturating_sub(free);
            if overflow > 0 {
                self.pop_and_save(overflow.min(self.live))?;
            }
            for sample in pending.drain(..) {
                self.insert_unchecked(sample)?;
            }
        }
        Ok(())
    }

    /// Remove the `n` oldest live samples and save them.
    ///
    /// Popping every live sample always flushes, which is how a timeframe is
    /// emptied at the end of a label or session.
    pub fn pop_and_save(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.live {
            return Err(BufferError::Underflow {
                requested: n,
                available: self.live,
            });
        }
        let partial = n < self.live;
        let removed = self.take_oldest(n)?;
        self.batch.extend(removed);

        if partial && self.batch.len() <= self.flush_threshold {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.batch);
        log::trace!(
            "Handing {} samples to the write queue (label {:?})",
            batch.len(),
            self.label.as_ref().map(|l| l.name.as_ref())
        );
        self.queue.push(batch);
        Ok(())
    }

    /// Most recently inserted live sample
    pub fn latest_sample(&self) -> Option<&Sample> {
        if self.live == 0 {
            return None;
        }
        let index = move_circular_pointer(-1, self.head, self.live, self.capacity()).ok()?;
        self.slots[index].as_ref()
    }

    /// Live samples, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &Sample> + '_ {
        let capacity = self.capacity();
        let oldest = self.oldest_index().unwrap_or(0);
        (0..self.live).filter_map(move |offset| {
            let index = move_circular_pointer(offset as isize, oldest, self.live, capacity).ok()?;
            self.slots[index].as_ref()
        })
    }

    /// Stop accepting samples and hand everything still live to the queue.
    ///
    /// The write is fire-and-forget; call [`drain`](Self::drain) to wait for it.
    pub fn seal(&mut self) -> Result<(), BufferError> {
        self.sealed = true;
        self.pop_and_save(self.live)
    }

    /// Flush all live and batched samples and wait until the queue is durable.
    ///
    /// Returns the number of samples confirmed by this call.
    pub async fn drain(&mut self, max_retries: u32) -> Result<u64, SessionError> {
        self.pop_and_save(self.live)?;
        Ok(self.queue.drain(max_retries).await?)
    }

    fn insert_unchecked(&mut self, sample: Sample) -> Result<(), BufferError> {
        if self.live >= self.capacity() {
            return Err(BufferError::CapacityInvariantViolation {
                live: self.live + 1,
                capacity: self.capacity(),
            });
        }
        self.slots[self.head] = Some(sample);
        self.live += 1;
        self.head = move_circular_pointer(1, self.head, self.live, self.capacity())?;
        Ok(())
    }

    fn oldest_index(&self) -> Result<usize, BufferError> {
        move_circular_pointer(-(self.live as isize), self.head, self.live, self.capacity())
    }

    fn take_oldest(&mut self, n: usize) -> Result<Vec<Sample>, BufferError> {
        let capacity = self.capacity();
        let oldest = self.oldest_index()?;
        let mut removed = Vec::with_capacity(n);
        for offset in 0..n {
            let index = move_circular_pointer(offset as isize, oldest, self.live, capacity)?;
            let sample = self.slots[index]
                .take()
                .ok_or(BufferError::CapacityInvariantViolation {
                    live: self.live,
                    capacity,
                })?;
            removed.push(sample);
        }
        self.live -= n;
        Ok(removed)
    }
}

impl std::fmt::Debug for CircularTimeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularTimeframe")
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("live", &self.live)
            .field("buffered", &self.batch.len())
            .field("label", &self.label)
            .field("sealed", &self.sealed)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sink that answers every write immediately and records the batches
    /// that succeeded
    pub(crate) struct CaptureSink {
        pub written: Arc<Mutex<Vec<Vec<Sample>>>>,
        pub attempts: Arc<Mutex<usize>>,
        failures: Option<(StdRng, f64)>,
    }

    impl CaptureSink {
        pub fn new() -> Self {
            Self {
                written: Arc::new(Mutex::new(Vec::new())),
                attempts: Arc::new(Mutex::new(0)),
                failures: None,
            }
        }

        pub fn flaky(seed: u64, failure_rate: f64) -> Self {
            Self {
                failures: Some((StdRng::seed_from_u64(seed), failure_rate)),
                ..Self::new()
            }
        }
    }

    impl FlushSink for CaptureSink {
        fn submit(&mut self, batch: Vec<Sample>) -> PendingWrite {
            *self.attempts.lock() += 1;
            if let Some((rng, rate)) = self.failures.as_mut() {
                if rng.gen_bool(*rate) {
                    return PendingWrite::ready(Err(StorageError::Injected("flaky".into())));
                }
            }
            self.written.lock().push(batch);
            PendingWrite::ready(Ok(()))
        }
    }

    /// Sink whose writes stay pending until the test answers them.
    /// With `auto` set it succeeds immediately instead.
    #[derive(Clone, Default)]
    struct ManualSink {
        outstanding: Arc<Mutex<Vec<(Vec<Sample>, WriteAck)>>>,
        written: Arc<Mutex<Vec<Vec<Sample>>>>,
        auto: Arc<AtomicBool>,
    }

    impl ManualSink {
        /// Complete the oldest outstanding write and return its batch
        fn answer(&self, result: Result<(), StorageError>) -> Vec<i64> {
            let (batch, ack) = self.outstanding.lock().remove(0);
            if result.is_ok() {
                self.written.lock().push(batch.clone());
            }
            let _ = ack.send(result);
            times(&batch)
        }

        fn outstanding(&self) -> usize {
            self.outstanding.lock().len()
        }

        fn written_times(&self) -> Vec<i64> {
            self.written.lock().iter().flat_map(|b| times(b)).collect()
        }
    }

    impl FlushSink for ManualSink {
        fn submit(&mut self, batch: Vec<Sample>) -> PendingWrite {
            if self.auto.load(Ordering::SeqCst) {
                self.written.lock().push(batch);
                return PendingWrite::ready(Ok(()));
            }
            let (ack, pending) = PendingWrite::channel();
            self.outstanding.lock().push((batch, ack));
            pending
        }
    }

    fn s(t: i64) -> Sample {
        Sample::new(t, vec![t as f64])
    }

    fn times(batch: &[Sample]) -> Vec<i64> {
        batch.iter().map(|s| s.time_ms).collect()
    }

    fn capture(capacity: usize, threshold: usize) -> (CircularTimeframe, Arc<Mutex<Vec<Vec<Sample>>>>) {
        let sink = CaptureSink::new();
        let written = sink.written.clone();
        (
            CircularTimeframe::with_sink(capacity, threshold, None, Box::new(sink)),
            written,
        )
    }

    #[test]
    fn test_move_circular_pointer_wraps() {
        assert_eq!(move_circular_pointer(1, 4, 5, 5).unwrap(), 0);
        assert_eq!(move_circular_pointer(-1, 0, 5, 5).unwrap(), 4);
        assert_eq!(move_circular_pointer(-5, 2, 5, 5).unwrap(), 2);
        assert_eq!(move_circular_pointer(3, 1, 3, 10).unwrap(), 4);
        assert_eq!(move_circular_pointer(0, 3, 0, 5).unwrap(), 3);
    }

    #[test]
    fn test_move_circular_pointer_rejects_large_shift() {
        let err = move_circular_pointer(4, 0, 3, 10).unwrap_err();
        assert_eq!(
            err,
            BufferError::ShiftOutOfRange {
                shift: 4,
                element_count: 3
            }
        );
        assert!(move_circular_pointer(-4, 0, 3, 10).is_err());
    }

    #[test]
    fn test_move_circular_pointer_is_congruent() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5_000 {
            let size = rng.gen_range(1..64usize);
            let element_count = rng.gen_range(0..=size);
            let index = rng.gen_range(0..size);
            let shift = rng.gen_range(-(element_count as isize)..=element_count as isize);
            let moved = move_circular_pointer(shift, index, element_count, size).unwrap();
            assert!(moved < size);
            assert_eq!(
                (moved as isize - index as isize - shift).rem_euclid(size as isize),
                0
            );
        }
    }

    #[test]
    fn test_latest_sample_tracks_inserts() {
        let (mut tf, _) = capture(3, 1);
        assert!(tf.latest_sample().is_none());
        for t in 1..=10 {
            tf.add_sample(s(t)).unwrap();
            assert_eq!(tf.latest_sample().map(|s| s.time_ms), Some(t));
            assert!(tf.live_count() <= tf.capacity());
            assert!(tf.head_index() < tf.capacity());
        }
        assert_eq!(times(&tf.samples().cloned().collect::<Vec<_>>()), vec![8, 9, 10]);
    }

    #[test]
    fn test_batched_eviction_scenario() {
        let (mut tf, written) = capture(5, 2);
        for t in 1..=7 {
            tf.add_sample(s(t)).unwrap();
        }
        // s1 and s2 were evicted but still fit under the threshold
        assert!(written.lock().is_empty());
        assert_eq!(tf.buffered_count(), 2);
        assert_eq!(tf.live_count(), 5);

        tf.pop_and_save(tf.live_count()).unwrap();
        let written = written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(times(&written[0]), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_threshold_exceeded_triggers_single_write() {
        let (mut tf, written) = capture(2, 2);
        for t in 1..=5 {
            tf.add_sample(s(t)).unwrap();
        }
        // Third eviction overflows the threshold: one write with s1..s3
        assert_eq!(written.lock().len(), 1);
        assert_eq!(times(&written.lock()[0]), vec![1, 2, 3]);
        assert_eq!(tf.stats().writes_issued, 1);
    }

    #[test]
    fn test_pop_underflow() {
        let (mut tf, _) = capture(4, 2);
        tf.add_sample(s(1)).unwrap();
        let err = tf.pop_and_save(2).unwrap_err();
        assert_eq!(
            err,
            BufferError::Underflow {
                requested: 2,
                available: 1
            }
        );
        assert_eq!(tf.live_count(), 1);
    }

    #[test]
    fn test_sealed_rejects_samples() {
        let (mut tf, written) = capture(4, 2);
        tf.add_samples((1..=3).map(s)).unwrap();
        tf.seal().unwrap();
        assert!(tf.is_sealed());
        assert_eq!(tf.add_sample(s(4)), Err(BufferError::Sealed));
        assert_eq!(times(&written.lock()[0]), vec![1, 2, 3]);
    }

    #[test]
    fn test_add_samples_larger_than_capacity() {
        let (mut tf, written) = capture(3, 2);
        tf.add_samples((1..=10).map(s)).unwrap();
        assert_eq!(tf.live_count(), 3);
        assert_eq!(tf.latest_sample().map(|s| s.time_ms), Some(10));
        tf.pop_and_save(3).unwrap();
        let flat: Vec<i64> = written.lock().iter().flat_map(|b| times(b)).collect();
        assert_eq!(flat, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_failed_write_is_retained_and_resent() {
        let sink = ManualSink::default();
        let mut tf = CircularTimeframe::with_sink(2, 1, None, Box::new(sink.clone()));

        // s3 and s4 evict both live samples at once -> write [s1, s2]
        tf.add_samples((1..=4).map(s)).unwrap();
        let failed = sink.answer(Err(StorageError::Injected("disk full".into())));
        assert_eq!(failed, vec![1, 2]);

        // Next trigger notices the failure and resends everything unconfirmed
        tf.add_samples((5..=6).map(s)).unwrap();
        assert_eq!(sink.answer(Ok(())), vec![1, 2, 3, 4]);
        assert_eq!(tf.stats().failed_writes, 1);

        tf.add_samples((7..=8).map(s)).unwrap();
        assert_eq!(tf.stats().samples_confirmed, 4);
        assert_eq!(sink.answer(Ok(())), vec![5, 6]);
    }

    #[test]
    fn test_pending_write_defers_next_flush() {
        let sink = ManualSink::default();
        let mut tf = CircularTimeframe::with_sink(1, 1, None, Box::new(sink.clone()));

        tf.add_samples((1..=3).map(s)).unwrap();
        assert_eq!(sink.outstanding(), 1);
        // Write still pending: later evictions queue up instead of racing it
        tf.add_samples((4..=6).map(s)).unwrap();
        assert_eq!(sink.outstanding(), 1);
        assert_eq!(tf.queue().unconfirmed_count(), 5);
    }

    #[test]
    fn test_sealed_leftovers_stay_ahead_of_next_timeframe() {
        let sink = ManualSink::default();
        let queue = FlushQueue::new(Box::new(sink.clone()));
        let mut first = CircularTimeframe::new(5, 2, None, queue.clone());

        // s8 pushes the batch over the threshold: write [1, 2, 3] goes out
        for t in 1..=10 {
            first.add_sample(s(t)).unwrap();
        }
        assert_eq!(sink.outstanding(), 1);
        // Sealed while that write is still running
        first.seal().unwrap();

        let mut second = CircularTimeframe::new(5, 2, None, queue.clone());
        second.add_samples((100..=110).map(s)).unwrap();
        assert_eq!(sink.outstanding(), 1);

        assert_eq!(sink.answer(Ok(())), vec![1, 2, 3]);
        for t in 111..=113 {
            second.add_sample(s(t)).unwrap();
        }
        let resumed = sink.answer(Ok(()));
        assert_eq!(resumed[..7], [4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(resumed[7], 100);

        second.seal().unwrap();
        sink.answer(Ok(()));
        let mut expected: Vec<i64> = (1..=10).collect();
        expected.extend(100..=113);
        assert_eq!(sink.written_times(), expected);
    }

    #[tokio::test]
    async fn test_drain_flushes_everything() {
        let (mut tf, written) = capture(5, 2);
        tf.add_samples((1..=7).map(s)).unwrap();
        let confirmed = tf.drain(3).await.unwrap();
        assert_eq!(confirmed, 7);
        assert!(tf.is_drained());
        assert_eq!(written.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_retries() {
        let sink = CaptureSink::flaky(1, 1.0);
        let attempts = sink.attempts.clone();
        let mut tf = CircularTimeframe::with_sink(3, 2, None, Box::new(sink));
        tf.add_samples((1..=3).map(s)).unwrap();

        let err = tf.drain(2).await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(StorageError::Injected(_))));
        assert_eq!(*attempts.lock(), 3);
        assert_eq!(tf.queue().unconfirmed_count(), 3);
    }

    #[tokio::test]
    async fn test_round_trip_random_interleavings() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for round in 0..200u64 {
            let capacity = rng.gen_range(3..=50);
            let threshold = rng.gen_range(1..=20);
            let failure_rate = if round % 3 == 0 { 0.25 } else { 0.0 };
            let sink = CaptureSink::flaky(round, failure_rate);
            let written = sink.written.clone();
            let mut tf = CircularTimeframe::with_sink(capacity, threshold, None, Box::new(sink));

            let mut next = 0i64;
            for _ in 0..rng.gen_range(1..40) {
                if rng.gen_bool(0.2) && tf.live_count() > 0 {
                    let n = rng.gen_range(0..=tf.live_count());
                    tf.pop_and_save(n).unwrap();
                } else {
                    let count = rng.gen_range(0..(capacity * 2) as i64);
                    tf.add_samples((next..next + count).map(s)).unwrap();
                    next += count;
                }
                assert!(tf.live_count() <= tf.capacity());
            }
            tf.drain(1_000).await.unwrap();

            let flat: Vec<i64> = written.lock().iter().flat_map(|b| times(b)).collect();
            assert_eq!(flat, (0..next).collect::<Vec<_>>(), "round {round}");
        }
    }

    #[tokio::test]
    async fn test_chain_round_trip_with_seals_and_slow_writes() {
        let mut rng = StdRng::seed_from_u64(0xc4a1);
        for round in 0..200u64 {
            let capacity = rng.gen_range(1..=20);
            let threshold = rng.gen_range(1..=10);
            let sink = ManualSink::default();
            let queue = FlushQueue::new(Box::new(sink.clone()));
            let mut chain = vec![CircularTimeframe::new(capacity, threshold, None, queue.clone())];

            let mut next = 0i64;
            for _ in 0..rng.gen_range(1..60) {
                match rng.gen_range(0..10) {
                    0 | 1 => {
                        if let Some(last) = chain.last_mut() {
                            last.seal().unwrap();
                        }
                        chain.push(CircularTimeframe::new(capacity, threshold, None, queue.clone()));
                    }
                    2 | 3 if sink.outstanding() > 0 => {
                        let result = if rng.gen_bool(0.75) {
                            Ok(())
                        } else {
                            Err(StorageError::Injected("slow disk".into()))
                        };
                        sink.answer(result);
                    }
                    _ => {
                        let count = rng.gen_range(0..=(capacity * 2) as i64);
                        if let Some(last) = chain.last_mut() {
                            last.add_samples((next..next + count).map(s)).unwrap();
                        }
                        next += count;
                    }
                }
                assert!(sink.outstanding() <= 1, "round {round}");
            }

            while sink.outstanding() > 0 {
                sink.answer(Ok(()));
            }
            sink.auto.store(true, Ordering::SeqCst);
            for tf in chain.iter_mut() {
                tf.pop_and_save(tf.live_count()).unwrap();
            }
            queue.drain(0).await.unwrap();

            assert_eq!(sink.written_times(), (0..next).collect::<Vec<_>>(), "round {round}");
        }
    }
}
