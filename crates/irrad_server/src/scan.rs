//! Raster scan controller for the two-axis stage.
//!
//! A scan sweeps the horizontal axis across rectangular rows while stepping
//! the vertical axis between them. Full passes alternate row order (zigzag)
//! to minimize travel. All external interaction is cooperative: signals set
//! flags the scan loop observes at row boundaries, never forcing the motion
//! task. Whatever way a scan ends, cleanup runs: speeds drop to a safe
//! default, both axes return to the raster origin vertical-then-horizontal
//! and all flags are cleared so the controller is reusable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use irrad_core::Publisher;
use irrad_types::{DataPacket, ScanPass, ScanProgress};

use crate::stage::{to_mm, to_native, AxisError, ScanStage, StageAxis};

/// Speed both axes are reset to during cleanup, mm/s.
const SAFE_SPEED: f64 = 10.0;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no scan prepared, call prepare first")]
    NotPrepared,

    #[error("row {row} outside prepared raster of {n_rows} rows")]
    RowOutOfRange { row: u32, n_rows: u32 },

    #[error("scan stopped on request")]
    Stopped,

    #[error("{axis} axis failed during {what}: {source}")]
    Axis {
        axis: &'static str,
        what: &'static str,
        #[source]
        source: AxisError,
    },

    #[error("a scan is already in progress")]
    Busy,

    #[error("invalid raster geometry: {0}")]
    BadGeometry(String),
}

/// External control vocabulary understood by a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSignal {
    Abort,
    Finish,
    Pause,
    Continue,
    BeamDown,
    BeamJitter,
    BeamOk,
}

impl ScanSignal {
    pub fn from_cmd(cmd: &str) -> Option<Self> {
        Some(match cmd {
            "abort" => ScanSignal::Abort,
            "finish" => ScanSignal::Finish,
            "pause" => ScanSignal::Pause,
            "continue" => ScanSignal::Continue,
            "beam_down" => ScanSignal::BeamDown,
            "beam_jitter" => ScanSignal::BeamJitter,
            "beam_ok" => ScanSignal::BeamOk,
            _ => return None,
        })
    }
}

/// Raster geometry as received from the console, relative to the stage
/// position at preparation time. Lengths in mm, speed in mm/s.
#[derive(Debug, Clone, Deserialize)]
pub struct RasterGeometry {
    pub rel_start: (f64, f64),
    pub rel_end: (f64, f64),
    pub speed: f64,
    pub row_sep: f64,
}

/// Parameters derived exactly once per prepared scan, all native units.
#[derive(Debug, Clone)]
struct ScanParams {
    origin: (i64, i64),
    start: (i64, i64),
    end: (i64, i64),
    speed: f64,
    row_sep: f64,
    n_rows: u32,
    rows: BTreeMap<u32, i64>,
}

#[derive(Default)]
struct ScanFlags {
    stop: AtomicBool,
    finish: AtomicBool,
    pause: AtomicBool,
    standby: AtomicBool,
    scanning: AtomicBool,
}

pub struct ScanController {
    stage: ScanStage,
    data_pub: Publisher,
    process: String,
    flags: ScanFlags,
    params: Mutex<Option<ScanParams>>,
    active: AtomicBool,
    poll: Mutex<Duration>,
}

impl ScanController {
    pub fn new(stage: ScanStage, data_pub: Publisher, process: impl Into<String>) -> Self {
        Self {
            stage,
            data_pub,
            process: process.into(),
            flags: ScanFlags::default(),
            params: Mutex::new(None),
            active: AtomicBool::new(false),
            poll: Mutex::new(Duration::from_secs(1)),
        }
    }

    /// Interval at which a waiting scan re-checks pause/standby flags.
    pub fn set_poll_interval(&self, poll: Duration) {
        if let Ok(mut guard) = self.poll.lock() {
            *guard = poll;
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll
            .lock()
            .map(|p| *p)
            .unwrap_or(Duration::from_secs(1))
    }

    /// Horizontal sweep currently in progress.
    pub fn is_scanning(&self) -> bool {
        self.flags.scanning.load(Ordering::SeqCst)
    }

    /// Derive absolute scan parameters from the current stage position.
    pub async fn prepare(&self, geometry: RasterGeometry) -> Result<u32, ScanError> {
        let x = self.stage.x.as_ref();
        let y = self.stage.y.as_ref();
        let origin = (
            x.position().await.map_err(axis_err("x", "prepare"))?,
            y.position().await.map_err(axis_err("y", "prepare"))?,
        );

        // All mm-to-native conversion happens here, never mid-scan.
        let start = (
            origin.0 - to_native(x, geometry.rel_start.0),
            origin.1 - to_native(y, geometry.rel_start.1),
        );
        let end = (
            origin.0 - to_native(x, geometry.rel_end.0),
            origin.1 - to_native(y, geometry.rel_end.1),
        );
        let row_sep_native = to_native(y, geometry.row_sep);
        if row_sep_native <= 0 {
            return Err(ScanError::BadGeometry(format!(
                "row separation must be positive, got {} mm",
                geometry.row_sep
            )));
        }
        if geometry.speed <= 0.0 {
            return Err(ScanError::BadGeometry(format!(
                "scan speed must be positive, got {} mm/s",
                geometry.speed
            )));
        }
        let n_rows = ((end.1 - start.1).unsigned_abs() / row_sep_native.unsigned_abs()) as u32;

        let mut rows = BTreeMap::new();
        for row in 0..n_rows {
            rows.insert(row, start.1 - i64::from(row) * row_sep_native);
        }

        info!(n_rows, ?origin, ?start, ?end, "scan prepared");
        let params = ScanParams {
            origin,
            start,
            end,
            speed: geometry.speed,
            row_sep: geometry.row_sep,
            n_rows,
            rows,
        };
        if let Ok(mut guard) = self.params.lock() {
            *guard = Some(params);
        }
        Ok(n_rows)
    }

    /// Apply one external control signal to the running scan.
    pub fn signal(&self, signal: ScanSignal) {
        info!(?signal, "scan signal received");
        match signal {
            ScanSignal::Abort => self.flags.stop.store(true, Ordering::SeqCst),
            ScanSignal::Finish => self.flags.finish.store(true, Ordering::SeqCst),
            ScanSignal::Pause => self.flags.pause.store(true, Ordering::SeqCst),
            ScanSignal::Continue => self.flags.pause.store(false, Ordering::SeqCst),
            ScanSignal::BeamDown | ScanSignal::BeamJitter => {
                self.flags.standby.store(true, Ordering::SeqCst)
            }
            ScanSignal::BeamOk => self.flags.standby.store(false, Ordering::SeqCst),
        }
    }

    fn prepared(&self) -> Result<ScanParams, ScanError> {
        self.params
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(ScanError::NotPrepared)
    }

    fn claim(&self) -> Result<(), ScanError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(ScanError::Busy);
        }
        Ok(())
    }

    /// Scan one row standalone, on its own task so command dispatch never
    /// blocks on motion. Positions from and returns to the raster origin.
    pub fn scan_row(
        self: &Arc<Self>,
        row: u32,
        speed: Option<f64>,
    ) -> Result<JoinHandle<Result<(), ScanError>>, ScanError> {
        let params = self.prepared()?;
        if !params.rows.contains_key(&row) {
            return Err(ScanError::RowOutOfRange {
                row,
                n_rows: params.n_rows,
            });
        }
        self.claim()?;

        let controller = self.clone();
        Ok(tokio::spawn(async move {
            let result = controller
                .sweep_row(&params, row, ScanPass::SingleRow, speed, true)
                .await;
            if let Err(e) = &result {
                error!(row, error = %e, "row scan failed");
            }
            controller.active.store(false, Ordering::SeqCst);
            result
        }))
    }

    /// Run the full raster scan on its own task.
    pub fn scan_device(self: &Arc<Self>) -> Result<JoinHandle<Result<(), ScanError>>, ScanError> {
        let params = self.prepared()?;
        self.claim()?;

        let controller = self.clone();
        Ok(tokio::spawn(async move {
            let result = controller.raster_passes(&params).await;
            if let Err(e) = &result {
                error!(error = %e, "raster scan failed");
            }
            // Cleanup runs whatever way the scan ended.
            controller.clean_up(&params).await;
            controller.active.store(false, Ordering::SeqCst);
            result
        }))
    }

    async fn raster_passes(&self, params: &ScanParams) -> Result<(), ScanError> {
        self.publish_progress(ScanProgress::ScanInit {
            n_rows: params.n_rows,
            row_sep: params.row_sep,
        });

        let x = self.stage.x.as_ref();
        let y = self.stage.y.as_ref();
        x.move_abs(params.start.0)
            .await
            .map_err(axis_err("x", "move to start corner"))?;
        y.move_abs(params.start.1)
            .await
            .map_err(axis_err("y", "move to start corner"))?;
        x.set_speed(params.speed)
            .await
            .map_err(axis_err("x", "set scan speed"))?;

        let mut pass: u32 = 0;
        // Finish is graceful and only honored between passes; stop is
        // checked before every row.
        while !(self.flags.stop.load(Ordering::SeqCst) || self.flags.finish.load(Ordering::SeqCst))
        {
            for row in pass_rows(pass, params.n_rows) {
                if self.flags.stop.load(Ordering::SeqCst) {
                    return Err(ScanError::Stopped);
                }
                self.sweep_row(params, row, ScanPass::Full(pass), None, false)
                    .await?;
            }
            pass += 1;
        }

        info!(passes = pass, "raster scan complete");
        Ok(())
    }

    /// Sweep the horizontal axis across one row.
    async fn sweep_row(
        &self,
        params: &ScanParams,
        row: u32,
        pass: ScanPass,
        speed: Option<f64>,
        from_origin: bool,
    ) -> Result<(), ScanError> {
        self.wait_until_clear().await?;

        let x = self.stage.x.as_ref();
        let y = self.stage.y.as_ref();
        let row_y = params.rows[&row];

        if let Some(speed) = speed {
            x.set_speed(speed).await.map_err(axis_err("x", "set row speed"))?;
        }
        if from_origin {
            x.move_abs(params.start.0)
                .await
                .map_err(axis_err("x", "move to row edge"))?;
        }
        y.move_abs(row_y).await.map_err(axis_err("y", "move to row"))?;

        let x_pos = x.position().await.map_err(axis_err("x", "read position"))?;
        let x_speed = x.get_speed().await.map_err(axis_err("x", "read speed"))?;
        let x_accel = x.get_accel().await.map_err(axis_err("x", "read accel"))?;
        self.publish_progress(ScanProgress::ScanStart {
            scan: pass.number(),
            row,
            speed: x_speed,
            accel: x_accel,
            x_start: to_mm(x, x_pos),
            y_start: to_mm(y, row_y),
        });

        // Sweep to whichever edge the axis does not currently occupy.
        let target = if x_pos == params.start.0 {
            params.end.0
        } else {
            params.start.0
        };
        self.flags.scanning.store(true, Ordering::SeqCst);
        let swept = x.move_abs(target).await;
        self.flags.scanning.store(false, Ordering::SeqCst);
        let x_stop = swept.map_err(axis_err("x", "row sweep"))?;

        self.publish_progress(ScanProgress::ScanStop {
            x_stop: to_mm(x, x_stop),
            y_stop: to_mm(y, row_y),
        });

        if from_origin {
            // Vertical first, to avoid dragging the sample back through
            // the beam.
            y.move_abs(params.origin.1)
                .await
                .map_err(axis_err("y", "return to origin"))?;
            x.move_abs(params.origin.0)
                .await
                .map_err(axis_err("x", "return to origin"))?;
        }
        Ok(())
    }

    /// Block at a row boundary while pause or standby is set. A stop
    /// request observed while waiting aborts instead of sweeping.
    async fn wait_until_clear(&self) -> Result<(), ScanError> {
        loop {
            if self.flags.stop.load(Ordering::SeqCst) {
                return Err(ScanError::Stopped);
            }
            let pause = self.flags.pause.load(Ordering::SeqCst);
            let standby = self.flags.standby.load(Ordering::SeqCst);
            if !pause && !standby {
                return Ok(());
            }
            warn!(pause, standby, "scan waiting at row boundary");
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Unconditional end-of-scan path. Errors here are logged, never
    /// propagated, so the original scan outcome survives.
    async fn clean_up(&self, params: &ScanParams) {
        self.publish_progress(ScanProgress::ScanFinished);

        let x = self.stage.x.as_ref();
        let y = self.stage.y.as_ref();
        for (label, axis) in [("x", x), ("y", y)] {
            if let Err(e) = axis.set_speed(SAFE_SPEED).await {
                warn!(axis = label, error = %e, "could not reset speed after scan");
            }
        }
        if let Err(e) = y.move_abs(params.origin.1).await {
            warn!(error = %e, "could not return y axis to origin");
        }
        if let Err(e) = x.move_abs(params.origin.0).await {
            warn!(error = %e, "could not return x axis to origin");
        }

        self.flags.stop.store(false, Ordering::SeqCst);
        self.flags.finish.store(false, Ordering::SeqCst);
        self.flags.pause.store(false, Ordering::SeqCst);
        self.flags.standby.store(false, Ordering::SeqCst);
        self.flags.scanning.store(false, Ordering::SeqCst);
    }

    fn publish_progress(&self, progress: ScanProgress) {
        let value = match serde_json::to_value(&progress) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "could not encode scan progress");
                return;
            }
        };
        let packet = DataPacket::new(self.process.clone(), "stage", value);
        if let Err(e) = self.data_pub.publish_json(&packet) {
            warn!(error = %e, "could not publish scan progress");
        }
    }
}

fn axis_err(axis: &'static str, what: &'static str) -> impl FnOnce(AxisError) -> ScanError {
    move |source| ScanError::Axis { axis, what, source }
}

/// Row order for one full pass: even passes run top to bottom, odd passes
/// bottom to top.
fn pass_rows(pass: u32, n_rows: u32) -> Vec<u32> {
    if pass % 2 == 0 {
        (0..n_rows).collect()
    } else {
        (0..n_rows).rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_alternate_row_order() {
        assert_eq!(pass_rows(0, 3), vec![0, 1, 2]);
        assert_eq!(pass_rows(1, 3), vec![2, 1, 0]);
        assert_eq!(pass_rows(2, 3), vec![0, 1, 2]);
        assert_eq!(pass_rows(0, 0), Vec::<u32>::new());
    }

    #[test]
    fn signals_map_from_command_strings() {
        assert_eq!(ScanSignal::from_cmd("abort"), Some(ScanSignal::Abort));
        assert_eq!(ScanSignal::from_cmd("beam_ok"), Some(ScanSignal::BeamOk));
        assert_eq!(ScanSignal::from_cmd("warp"), None);
    }
}
