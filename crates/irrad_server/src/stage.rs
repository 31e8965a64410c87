//! Motor stage axes: the driver trait, movement telemetry and a mock.
//!
//! Axis positions are native steps; conversion to millimeters happens at the
//! edges via the axis' steps-per-mm constant. Speeds and accelerations are
//! mm/s and mm/s^2 throughout.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use irrad_core::Publisher;
use irrad_types::DataPacket;

#[derive(Debug, Error)]
pub enum AxisError {
    #[error("axis rejected the request: {0}")]
    Rejected(String),

    #[error("axis hardware fault: {0}")]
    Fault(String),
}

/// One linear stage axis.
///
/// Absolute positions and the return values of movement calls are native
/// steps. Movement calls resolve once the axis has physically stopped.
#[async_trait]
pub trait StageAxis: Send + Sync + 'static {
    async fn move_abs(&self, target: i64) -> Result<i64, AxisError>;
    async fn move_rel(&self, delta: i64) -> Result<i64, AxisError>;
    async fn set_speed(&self, mm_per_s: f64) -> Result<(), AxisError>;
    async fn get_speed(&self) -> Result<f64, AxisError>;
    async fn get_accel(&self) -> Result<f64, AxisError>;
    async fn position(&self) -> Result<i64, AxisError>;
    fn steps_per_mm(&self) -> f64;
}

/// Millimeters to native steps for a given axis.
pub fn to_native(axis: &dyn StageAxis, mm: f64) -> i64 {
    (mm * axis.steps_per_mm()).round() as i64
}

/// Native steps to millimeters.
pub fn to_mm(axis: &dyn StageAxis, native: i64) -> f64 {
    native as f64 / axis.steps_per_mm()
}

/// The two-axis scan stage. `x` is the horizontal (scan) axis, `y` the
/// vertical (row) axis.
#[derive(Clone)]
pub struct ScanStage {
    pub x: Arc<dyn StageAxis>,
    pub y: Arc<dyn StageAxis>,
}

impl ScanStage {
    pub fn new(x: Arc<dyn StageAxis>, y: Arc<dyn StageAxis>) -> Self {
        Self { x, y }
    }
}

/// Wrapper publishing every completed movement as `stage` telemetry.
pub struct TrackedAxis {
    inner: Arc<dyn StageAxis>,
    axis: &'static str,
    process: String,
    publisher: Publisher,
}

impl TrackedAxis {
    pub fn new(
        inner: Arc<dyn StageAxis>,
        axis: &'static str,
        process: impl Into<String>,
        publisher: Publisher,
    ) -> Self {
        Self {
            inner,
            axis,
            process: process.into(),
            publisher,
        }
    }

    async fn publish_position(&self, native: i64) {
        let speed = self.inner.get_speed().await.unwrap_or(0.0);
        let packet = DataPacket::new(
            self.process.clone(),
            "stage",
            json!({
                "axis": self.axis,
                "position": to_mm(self.inner.as_ref(), native),
                "speed": speed,
            }),
        );
        if let Err(e) = self.publisher.publish_json(&packet) {
            warn!(axis = self.axis, error = %e, "could not publish stage telemetry");
        }
    }
}

#[async_trait]
impl StageAxis for TrackedAxis {
    async fn move_abs(&self, target: i64) -> Result<i64, AxisError> {
        let position = self.inner.move_abs(target).await?;
        self.publish_position(position).await;
        Ok(position)
    }

    async fn move_rel(&self, delta: i64) -> Result<i64, AxisError> {
        let position = self.inner.move_rel(delta).await?;
        self.publish_position(position).await;
        Ok(position)
    }

    async fn set_speed(&self, mm_per_s: f64) -> Result<(), AxisError> {
        self.inner.set_speed(mm_per_s).await
    }

    async fn get_speed(&self) -> Result<f64, AxisError> {
        self.inner.get_speed().await
    }

    async fn get_accel(&self) -> Result<f64, AxisError> {
        self.inner.get_accel().await
    }

    async fn position(&self) -> Result<i64, AxisError> {
        self.inner.position().await
    }

    fn steps_per_mm(&self) -> f64 {
        self.inner.steps_per_mm()
    }
}

/// In-memory axis for development setups and tests.
///
/// Moves complete after a configurable delay. Completed moves are recorded
/// and can additionally be appended to a journal shared between both axes,
/// preserving cross-axis ordering.
pub struct MockAxis {
    label: char,
    position: AtomicI64,
    speed: Mutex<f64>,
    accel: f64,
    steps_per_mm: f64,
    move_delay: Duration,
    fail_next: AtomicBool,
    moves: Mutex<Vec<i64>>,
    journal: Option<Arc<Mutex<Vec<(char, i64)>>>>,
}

impl MockAxis {
    pub fn new(label: char, steps_per_mm: f64) -> Self {
        Self {
            label,
            position: AtomicI64::new(0),
            speed: Mutex::new(20.0),
            accel: 500.0,
            steps_per_mm,
            move_delay: Duration::from_millis(1),
            fail_next: AtomicBool::new(false),
            moves: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<(char, i64)>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Make the next movement call fail with a hardware fault.
    pub fn fail_next_move(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Targets of every completed absolute move, in order.
    pub fn completed_moves(&self) -> Vec<i64> {
        match self.moves.lock() {
            Ok(moves) => moves.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, target: i64) {
        if let Ok(mut moves) = self.moves.lock() {
            moves.push(target);
        }
        if let Some(journal) = &self.journal {
            if let Ok(mut journal) = journal.lock() {
                journal.push((self.label, target));
            }
        }
    }
}

#[async_trait]
impl StageAxis for MockAxis {
    async fn move_abs(&self, target: i64) -> Result<i64, AxisError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AxisError::Fault("injected fault".into()));
        }
        tokio::time::sleep(self.move_delay).await;
        self.position.store(target, Ordering::SeqCst);
        self.record(target);
        Ok(target)
    }

    async fn move_rel(&self, delta: i64) -> Result<i64, AxisError> {
        let target = self.position.load(Ordering::SeqCst) + delta;
        self.move_abs(target).await
    }

    async fn set_speed(&self, mm_per_s: f64) -> Result<(), AxisError> {
        if mm_per_s <= 0.0 {
            return Err(AxisError::Rejected(format!(
                "speed must be positive, got {mm_per_s}"
            )));
        }
        if let Ok(mut speed) = self.speed.lock() {
            *speed = mm_per_s;
        }
        Ok(())
    }

    async fn get_speed(&self) -> Result<f64, AxisError> {
        Ok(self.speed.lock().map(|s| *s).unwrap_or(0.0))
    }

    async fn get_accel(&self) -> Result<f64, AxisError> {
        Ok(self.accel)
    }

    async fn position(&self) -> Result<i64, AxisError> {
        Ok(self.position.load(Ordering::SeqCst))
    }

    fn steps_per_mm(&self) -> f64 {
        self.steps_per_mm
    }
}
