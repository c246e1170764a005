//! Synthetic drivers that satisfy the `SourceDriver` contract without
//! hardware. Each enabled driver runs a tokio task that emits noisy samples
//! on a fixed tick until its stop flag is raised.

use crate::error::SessionError;
use crate::sample::{now_ms, Sample};
use crate::source::{DriverFactory, SampleSender, SourceConfig, SourceDriver, SourceKind};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_millis(20);
const MAX_SAMPLES_PER_TICK: u64 = 1_000;

pub struct SimulatedDriver {
    kind: SourceKind,
    sender: SampleSender,
    working: bool,
    should_stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedDriver {
    pub fn new(kind: SourceKind, sender: SampleSender) -> Self {
        Self {
            kind,
            sender,
            working: true,
            should_stop: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// A driver whose device never comes up
    pub fn broken(kind: SourceKind, sender: SampleSender) -> Self {
        let mut driver = Self::new(kind, sender);
        driver.working = false;
        driver
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

#[async_trait]
impl SourceDriver for SimulatedDriver {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn enable(&mut self, sample_rate_hz: u32) -> Result<(), SessionError> {
        if !self.working {
            return Err(SessionError::Driver {
                kind: self.kind,
                reason: "device not available".to_string(),
            });
        }
        if self.task.is_some() {
            return Ok(());
        }

        let per_tick = (u64::from(sample_rate_hz) * TICK.as_millis() as u64 / 1_000)
            .clamp(1, MAX_SAMPLES_PER_TICK) as usize;
        log::info!(
            "Simulated {} enabled at {} Hz ({} samples per tick)",
            self.kind,
            sample_rate_hz,
            per_tick
        );

        self.should_stop.store(false, Ordering::Relaxed);
        self.task = Some(tokio::spawn(emit_loop(
            self.kind,
            self.sender.clone(),
            per_tick,
            self.should_stop.clone(),
        )));
        Ok(())
    }

    async fn disable(&mut self) -> Result<(), SessionError> {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| SessionError::Driver {
                kind: self.kind,
                reason: e.to_string(),
            })?;
            log::info!("Simulated {} disabled", self.kind);
        }
        Ok(())
    }

    async fn is_working(&self) -> bool {
        self.working
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }
}

async fn emit_loop(
    kind: SourceKind,
    sender: SampleSender,
    per_tick: usize,
    should_stop: Arc<AtomicBool>,
) {
    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval(TICK);
    let mut phase = 0f64;

    while !should_stop.load(Ordering::Relaxed) {
        interval.tick().await;
        let time_ms = now_ms();
        let samples: Vec<Sample> = (0..per_tick)
            .map(|_| {
                phase += 0.01;
                Sample::new(time_ms, synthesize(kind, phase, &mut rng))
            })
            .collect();
        if !sender.send(samples) {
            log::debug!("Simulated {}: session gone, stopping", kind);
            break;
        }
    }
}

fn synthesize(kind: SourceKind, phase: f64, rng: &mut StdRng) -> Vec<f64> {
    let mut noise = || -> f64 { rng.gen_range(-0.05..0.05) };
    match kind {
        SourceKind::Accelerometer => vec![phase.sin() + noise(), phase.cos() + noise(), 9.81 + noise()],
        SourceKind::Gyroscope | SourceKind::Magnetometer => {
            vec![noise(), noise(), (phase * 0.5).sin() + noise()]
        }
        SourceKind::Barometer => vec![1013.25 + noise()],
        SourceKind::Gps => vec![52.52 + noise() * 1e-3, 13.405 + noise() * 1e-3, 34.0 + noise()],
        SourceKind::Microphone => vec![(phase * 40.0).sin() * 0.5 + noise()],
        SourceKind::Camera => vec![(phase * 100.0).floor()],
    }
}

/// Factory producing `SimulatedDriver`s
#[derive(Debug, Default, Clone)]
pub struct SimulatedFactory {
    broken: HashSet<SourceKind>,
    refused: HashSet<SourceKind>,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drivers for `kind` fail their capability check and refuse to enable
    pub fn with_broken(mut self, kind: SourceKind) -> Self {
        self.broken.insert(kind);
        self
    }

    /// `kind` is not available on this device at all
    pub fn without(mut self, kind: SourceKind) -> Self {
        self.refused.insert(kind);
        self
    }
}

impl DriverFactory for SimulatedFactory {
    fn create(
        &self,
        kind: SourceKind,
        _config: &SourceConfig,
        sender: SampleSender,
    ) -> Result<Box<dyn SourceDriver>, SessionError> {
        if self.refused.contains(&kind) {
            return Err(SessionError::UnsupportedSource(kind.id().to_string()));
        }
        let driver = if self.broken.contains(&kind) {
            SimulatedDriver::broken(kind, sender)
        } else {
            SimulatedDriver::new(kind, sender)
        };
        Ok(Box::new(driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enabled_driver_pushes_samples() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = SampleSender::new(SourceKind::Accelerometer, tx);
        let mut driver = SimulatedDriver::new(SourceKind::Accelerometer, sender);
        assert!(driver.is_working().await);

        driver.enable(1_000).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        driver.disable().await.unwrap();
        assert!(!driver.is_running());

        let batches: Vec<_> = rx.try_iter().collect();
        assert!(!batches.is_empty());
        for batch in &batches {
            assert_eq!(batch.source, SourceKind::Accelerometer);
            assert!(batch.samples.iter().all(|s| s.values().len() == 3));
        }

        // Nothing more arrives once disabled
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broken_driver_refuses_enable() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let factory = SimulatedFactory::new().with_broken(SourceKind::Camera);
        let mut driver = factory
            .create(
                SourceKind::Camera,
                &SourceConfig::default(),
                SampleSender::new(SourceKind::Camera, tx),
            )
            .unwrap();
        assert!(!driver.is_working().await);
        assert!(matches!(
            driver.enable(30).await,
            Err(SessionError::Driver { kind: SourceKind::Camera, .. })
        ));
        driver.disable().await.unwrap();
    }

    #[test]
    fn test_factory_can_refuse_a_kind() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let factory = SimulatedFactory::new().without(SourceKind::Gps);
        let result = factory.create(
            SourceKind::Gps,
            &SourceConfig::default(),
            SampleSender::new(SourceKind::Gps, tx),
        );
        assert!(matches!(result, Err(SessionError::UnsupportedSource(_))));
    }
}
