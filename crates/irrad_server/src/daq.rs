//! Beam current sampling loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use irrad_core::{EventKind, EventRegistry, Publisher};
use irrad_types::DataPacket;

use crate::scan::{ScanController, ScanSignal};

/// Source of beam current readings in nA.
#[async_trait]
pub trait CurrentSource: Send + Sync + 'static {
    async fn read_current(&self) -> anyhow::Result<f64>;
}

/// Synthetic source for development setups and tests.
pub struct MockCurrentSource {
    pub baseline: f64,
}

#[async_trait]
impl CurrentSource for MockCurrentSource {
    async fn read_current(&self) -> anyhow::Result<f64> {
        // Small deterministic ripple around the baseline.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let ripple = f64::from(nanos % 1000) / 1000.0 - 0.5;
        Ok(self.baseline + ripple)
    }
}

/// Everything the sampler loop needs besides the current source itself.
pub struct SamplerContext {
    pub process: String,
    pub data_pub: Publisher,
    pub event_pub: Publisher,
    pub registry: Arc<EventRegistry>,
    pub scan: Arc<ScanController>,
    /// Readings below this raise `BeamOff`, nA.
    pub min_current: f64,
    pub interval: Duration,
}

/// Publish raw current readings at a fixed interval until shutdown.
///
/// Readings below the minimum raise the `BeamOff` condition through the
/// registry (cooldown-gated) and put a running scan into standby; recovery
/// clears both.
pub async fn run_sampler(source: Arc<dyn CurrentSource>, ctx: SamplerContext, token: CancellationToken) {
    info!(interval = ?ctx.interval, "beam current sampler started");
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(ctx.interval) => {}
        }

        let current = match source.read_current().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "current readout failed");
                continue;
            }
        };
        let packet =
            DataPacket::new(ctx.process.clone(), "raw_data", json!({ "current": current }));
        if let Err(e) = ctx.data_pub.publish_json(&packet) {
            warn!(error = %e, "could not publish current reading");
            break;
        }

        if let Some(record) = ctx
            .registry
            .set_active(EventKind::BeamOff, current < ctx.min_current)
        {
            if let Err(e) = ctx.event_pub.publish_json(&record) {
                warn!(error = %e, "could not broadcast beam event");
            }
            let signal = if ctx.registry.beam_ok() {
                ScanSignal::BeamOk
            } else {
                ScanSignal::BeamDown
            };
            ctx.scan.signal(signal);
        }
    }
    info!("beam current sampler stopped");
}
