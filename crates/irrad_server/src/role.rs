//! Command handling and event mirroring for the device server.
//!
//! Commands address one of four targets: `server` (lifecycle), `stage`
//! (direct axis motion), `scan` (raster scan control) and `event` (registry
//! administration). Each target has a closed command set; anything else is
//! rejected with an error reply before touching any hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use irrad_core::{EventKind, EventRegistry, Publisher, ReplyHandle, RoleHandler};
use irrad_types::EventRecord;

use crate::daq::{self, CurrentSource, SamplerContext};
use crate::scan::{RasterGeometry, ScanController, ScanError, ScanSignal};
use crate::stage::{to_mm, to_native, ScanStage, StageAxis};

enum ServerCmd {
    Start,
    Shutdown,
    Motorstages,
}

enum StageCmd {
    MoveAbs,
    MoveRel,
    SetSpeed,
    GetSpeed,
    GetPosition,
}

enum ScanCmd {
    Prepare,
    ScanRow,
    ScanDevice,
    Signal(ScanSignal),
}

enum EventCmd {
    SetDisabled,
}

impl ServerCmd {
    fn parse(cmd: &str) -> Option<Self> {
        Some(match cmd {
            "start" => ServerCmd::Start,
            "shutdown" => ServerCmd::Shutdown,
            "motorstages" => ServerCmd::Motorstages,
            _ => return None,
        })
    }
}

impl StageCmd {
    fn parse(cmd: &str) -> Option<Self> {
        Some(match cmd {
            "move_abs" => StageCmd::MoveAbs,
            "move_rel" => StageCmd::MoveRel,
            "set_speed" => StageCmd::SetSpeed,
            "get_speed" => StageCmd::GetSpeed,
            "get_position" => StageCmd::GetPosition,
            _ => return None,
        })
    }
}

impl ScanCmd {
    fn parse(cmd: &str) -> Option<Self> {
        Some(match cmd {
            "prepare" => ScanCmd::Prepare,
            "scan_row" => ScanCmd::ScanRow,
            "scan_device" => ScanCmd::ScanDevice,
            other => ScanCmd::Signal(ScanSignal::from_cmd(other)?),
        })
    }
}

impl EventCmd {
    fn parse(cmd: &str) -> Option<Self> {
        match cmd {
            "set_disabled" => Some(EventCmd::SetDisabled),
            _ => None,
        }
    }
}

pub struct DeviceServer {
    name: String,
    token: CancellationToken,
    registry: Arc<EventRegistry>,
    stage: ScanStage,
    scan: Arc<ScanController>,
    data_pub: Publisher,
    event_pub: Publisher,
    current_source: Arc<dyn CurrentSource>,
    sample_interval: Duration,
    min_current: f64,
    sampler_started: AtomicBool,
    scan_task: Mutex<Option<JoinHandle<Result<(), ScanError>>>>,
}

impl DeviceServer {
    pub fn new(
        name: impl Into<String>,
        token: CancellationToken,
        stage: ScanStage,
        data_pub: Publisher,
        event_pub: Publisher,
        current_source: Arc<dyn CurrentSource>,
        sample_interval: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            registry: Arc::new(EventRegistry::new(name.clone())),
            scan: Arc::new(ScanController::new(
                stage.clone(),
                data_pub.clone(),
                name.clone(),
            )),
            name,
            token,
            stage,
            data_pub,
            event_pub,
            current_source,
            sample_interval,
            min_current: 1.0,
            sampler_started: AtomicBool::new(false),
            scan_task: Mutex::new(None),
        }
    }

    /// Beam current threshold below which `BeamOff` is raised, nA.
    pub fn set_min_current(&mut self, min_current: f64) {
        self.min_current = min_current;
    }

    pub fn scan_controller(&self) -> Arc<ScanController> {
        self.scan.clone()
    }

    fn axis(&self, which: &str) -> anyhow::Result<&Arc<dyn StageAxis>> {
        match which {
            "x" => Ok(&self.stage.x),
            "y" => Ok(&self.stage.y),
            other => bail!("unknown axis '{other}'"),
        }
    }

    async fn handle_server(&self, cmd: ServerCmd, reply: ReplyHandle) -> anyhow::Result<()> {
        match cmd {
            ServerCmd::Start => {
                if !self.sampler_started.swap(true, Ordering::SeqCst) {
                    let ctx = SamplerContext {
                        process: self.name.clone(),
                        data_pub: self.data_pub.clone(),
                        event_pub: self.event_pub.clone(),
                        registry: self.registry.clone(),
                        scan: self.scan.clone(),
                        min_current: self.min_current,
                        interval: self.sample_interval,
                    };
                    tokio::spawn(daq::run_sampler(
                        self.current_source.clone(),
                        ctx,
                        self.token.clone(),
                    ));
                }
                reply.standard(Some(json!({ "pid": std::process::id() })));
            }
            ServerCmd::Shutdown => {
                info!("shutdown requested by commander");
                reply.standard(None);
                self.token.cancel();
            }
            ServerCmd::Motorstages => {
                let mut axes = serde_json::Map::new();
                for (label, axis) in [("x", &self.stage.x), ("y", &self.stage.y)] {
                    let position = axis.position().await?;
                    axes.insert(
                        label.into(),
                        json!({
                            "position": to_mm(axis.as_ref(), position),
                            "speed": axis.get_speed().await?,
                            "accel": axis.get_accel().await?,
                        }),
                    );
                }
                reply.standard(Some(Value::Object(axes)));
            }
        }
        Ok(())
    }

    async fn handle_stage(
        &self,
        cmd: StageCmd,
        data: Option<Value>,
        reply: ReplyHandle,
    ) -> anyhow::Result<()> {
        match cmd {
            StageCmd::MoveAbs | StageCmd::MoveRel => {
                let data = data.context("missing move data")?;
                let which = required_str(&data, "axis")?;
                let mm = required_f64(&data, "value")?;
                let axis = self.axis(which)?;
                let native = to_native(axis.as_ref(), mm);
                let position = match cmd {
                    StageCmd::MoveAbs => axis.move_abs(native).await?,
                    _ => axis.move_rel(native).await?,
                };
                reply.standard(Some(json!({ "position": to_mm(axis.as_ref(), position) })));
            }
            StageCmd::SetSpeed => {
                let data = data.context("missing speed data")?;
                let which = required_str(&data, "axis")?;
                let speed = required_f64(&data, "value")?;
                self.axis(which)?.set_speed(speed).await?;
                reply.standard(None);
            }
            StageCmd::GetSpeed => {
                let data = data.context("missing axis data")?;
                let which = required_str(&data, "axis")?;
                let speed = self.axis(which)?.get_speed().await?;
                reply.standard(Some(json!({ "speed": speed })));
            }
            StageCmd::GetPosition => {
                let x = self.stage.x.position().await?;
                let y = self.stage.y.position().await?;
                reply.standard(Some(json!({
                    "x": to_mm(self.stage.x.as_ref(), x),
                    "y": to_mm(self.stage.y.as_ref(), y),
                })));
            }
        }
        Ok(())
    }

    async fn handle_scan(
        &self,
        cmd: ScanCmd,
        data: Option<Value>,
        reply: ReplyHandle,
    ) -> anyhow::Result<()> {
        match cmd {
            ScanCmd::Prepare => {
                let geometry: RasterGeometry =
                    serde_json::from_value(data.context("missing raster geometry")?)?;
                let n_rows = self.scan.prepare(geometry).await?;
                reply.standard(Some(json!({ "n_rows": n_rows })));
            }
            ScanCmd::ScanRow => {
                let data = data.context("missing row data")?;
                let row = required_f64(&data, "row")? as u32;
                let speed = data.get("speed").and_then(Value::as_f64);
                // Motion continues in the background; the reply only
                // acknowledges that the row scan started.
                let running = self.scan.scan_row(row, speed)?;
                self.track_scan(running);
                reply.standard(None);
            }
            ScanCmd::ScanDevice => {
                let running = self.scan.scan_device()?;
                self.track_scan(running);
                reply.standard(None);
            }
            ScanCmd::Signal(signal) => {
                self.scan.signal(signal);
                reply.standard(None);
            }
        }
        Ok(())
    }

    async fn handle_registry(
        &self,
        cmd: EventCmd,
        data: Option<Value>,
        reply: ReplyHandle,
    ) -> anyhow::Result<()> {
        match cmd {
            EventCmd::SetDisabled => {
                let data = data.context("missing event data")?;
                let name = required_str(&data, "event")?;
                let disabled = data
                    .get("disabled")
                    .and_then(Value::as_bool)
                    .context("missing 'disabled' field")?;
                let kind = EventKind::from_name(name)
                    .with_context(|| format!("unknown event '{name}'"))?;
                if let Some(record) = self.registry.set_disabled(kind, disabled) {
                    self.event_pub.publish_json(&record)?;
                }
                reply.standard(Some(json!({ "event": name, "disabled": disabled })));
            }
        }
        Ok(())
    }

    /// Keep the handle of the scan in progress so clean-up can wait for
    /// its origin return. The previous scan is over by the time a new one
    /// is accepted.
    fn track_scan(&self, running: JoinHandle<Result<(), ScanError>>) {
        if let Ok(mut slot) = self.scan_task.lock() {
            *slot = Some(running);
        }
    }

    /// Re-derive the scan standby state from the beam-quality aggregate.
    fn update_standby(&self) {
        if self.registry.beam_ok() {
            self.scan.signal(ScanSignal::BeamOk);
        } else {
            self.scan.signal(ScanSignal::BeamDown);
        }
    }
}

#[async_trait]
impl RoleHandler for DeviceServer {
    async fn handle_cmd(
        &self,
        target: &str,
        cmd: &str,
        data: Option<Value>,
        reply: ReplyHandle,
    ) -> anyhow::Result<()> {
        match target {
            "server" => match ServerCmd::parse(cmd) {
                Some(parsed) => self.handle_server(parsed, reply).await,
                None => bail!("unknown server command '{cmd}'"),
            },
            "stage" => match StageCmd::parse(cmd) {
                Some(parsed) => self.handle_stage(parsed, data, reply).await,
                None => bail!("unknown stage command '{cmd}'"),
            },
            "scan" => match ScanCmd::parse(cmd) {
                Some(parsed) => self.handle_scan(parsed, data, reply).await,
                None => bail!("unknown scan command '{cmd}'"),
            },
            "event" => match EventCmd::parse(cmd) {
                Some(parsed) => self.handle_registry(parsed, data, reply).await,
                None => bail!("unknown event command '{cmd}'"),
            },
            other => bail!("unknown target '{other}'"),
        }
    }

    async fn handle_event(&self, record: EventRecord) {
        if record.server != self.name {
            debug!(server = %record.server, event = %record.event, "ignoring foreign event");
            return;
        }
        match self.registry.apply(&record) {
            Some(kind) if kind.is_beam() => self.update_standby(),
            Some(_) => {}
            None => warn!(event = %record.event, "unknown event in broadcast"),
        }
    }

    async fn clean_up(&self) {
        // Stop any running scan and wait for the stage to park at the
        // raster origin before the process exits.
        self.scan.signal(ScanSignal::Abort);
        let running = self.scan_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(running) = running {
            match tokio::time::timeout(Duration::from_secs(5), running).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "scan task failed during shutdown"),
                Err(_) => warn!("scan did not park within the shutdown deadline"),
            }
        }
        info!("device server cleaned up");
    }
}

fn required_str<'a>(data: &'a Value, field: &str) -> anyhow::Result<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .with_context(|| format!("missing '{field}' field"))
}

fn required_f64(data: &Value, field: &str) -> anyhow::Result<f64> {
    data.get(field)
        .and_then(Value::as_f64)
        .with_context(|| format!("missing '{field}' field"))
}
