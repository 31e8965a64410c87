//! Registry of boolean operational conditions with trigger cooldowns.
//!
//! Every process holds the full fixed set of event entities. An event can be
//! active or inactive and independently disabled by an operator; a disabled
//! event keeps tracking its state but is excluded from control decisions.
//! Activation is rate-limited per event by a cooldown so a flickering
//! condition cannot flood the event channel.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use irrad_types::EventRecord;

/// The closed set of known operational conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    BeamOff,
    BeamUnstable,
    BeamLoss,
    BeamDrift,
    BeamLow,
    DutTempHigh,
    BlmTempHigh,
    DoseRateHigh,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::BeamOff,
        EventKind::BeamUnstable,
        EventKind::BeamLoss,
        EventKind::BeamDrift,
        EventKind::BeamLow,
        EventKind::DutTempHigh,
        EventKind::BlmTempHigh,
        EventKind::DoseRateHigh,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BeamOff => "BeamOff",
            EventKind::BeamUnstable => "BeamUnstable",
            EventKind::BeamLoss => "BeamLoss",
            EventKind::BeamDrift => "BeamDrift",
            EventKind::BeamLow => "BeamLow",
            EventKind::DutTempHigh => "DUTTempHigh",
            EventKind::BlmTempHigh => "BLMTempHigh",
            EventKind::DoseRateHigh => "DoseRateHigh",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Beam conditions gate scanning; the others are advisory.
    pub fn is_beam(self) -> bool {
        matches!(
            self,
            EventKind::BeamOff
                | EventKind::BeamUnstable
                | EventKind::BeamLoss
                | EventKind::BeamDrift
                | EventKind::BeamLow
        )
    }

    /// Minimum interval between two activations of this event.
    pub fn cooldown(self) -> Duration {
        match self {
            kind if kind.is_beam() => Duration::from_secs(1),
            EventKind::DutTempHigh | EventKind::BlmTempHigh => Duration::from_secs(20),
            _ => Duration::from_secs(60),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            EventKind::BeamOff => "Beam current is off",
            EventKind::BeamUnstable => "Beam current is unstable",
            EventKind::BeamLoss => "Beam loss exceeds threshold",
            EventKind::BeamDrift => "Beam position drifted off center",
            EventKind::BeamLow => "Beam current below minimum",
            EventKind::DutTempHigh => "Device-under-test temperature too high",
            EventKind::BlmTempHigh => "Beam loss monitor temperature too high",
            EventKind::DoseRateHigh => "Dose rate exceeds threshold",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct EventState {
    active: bool,
    disabled: bool,
    last_triggered: Option<Instant>,
    cooldown: Duration,
}

/// One registry per process, holding every [`EventKind`].
pub struct EventRegistry {
    server: String,
    states: [Mutex<EventState>; 8],
}

impl EventRegistry {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            states: std::array::from_fn(|i| {
                Mutex::new(EventState {
                    active: false,
                    disabled: false,
                    last_triggered: None,
                    cooldown: EventKind::ALL[i].cooldown(),
                })
            }),
        }
    }

    fn state(&self, kind: EventKind) -> std::sync::MutexGuard<'_, EventState> {
        match self.states[kind as usize].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Shrink an event's cooldown, e.g. for rapidly sampled conditions.
    pub fn set_cooldown(&self, kind: EventKind, cooldown: Duration) {
        self.state(kind).cooldown = cooldown;
    }

    /// Set the active flag, returning a broadcastable record when the state
    /// changed. Activation within the cooldown window is suppressed.
    pub fn set_active(&self, kind: EventKind, active: bool) -> Option<EventRecord> {
        let mut state = self.state(kind);
        if state.active == active {
            return None;
        }
        if active {
            let ready = state
                .last_triggered
                .map_or(true, |t| t.elapsed() > state.cooldown);
            if !ready {
                return None;
            }
            state.last_triggered = Some(Instant::now());
        }
        state.active = active;
        Some(self.record_locked(kind, &state))
    }

    /// Flip operator disabling, returning the updated record on change.
    pub fn set_disabled(&self, kind: EventKind, disabled: bool) -> Option<EventRecord> {
        let mut state = self.state(kind);
        if state.disabled == disabled {
            return None;
        }
        state.disabled = disabled;
        Some(self.record_locked(kind, &state))
    }

    /// Cooldown gate for producers: true once the cooldown window since the
    /// last activation has passed.
    pub fn is_ready(&self, kind: EventKind) -> bool {
        let state = self.state(kind);
        state
            .last_triggered
            .map_or(true, |t| t.elapsed() > state.cooldown)
    }

    /// Active and not operator-disabled.
    pub fn is_valid(&self, kind: EventKind) -> bool {
        let state = self.state(kind);
        state.active && !state.disabled
    }

    /// No beam condition currently valid.
    pub fn beam_ok(&self) -> bool {
        EventKind::ALL
            .into_iter()
            .filter(|kind| kind.is_beam())
            .all(|kind| !self.is_valid(kind))
    }

    /// Adopt a record received from another process' registry.
    pub fn apply(&self, record: &EventRecord) -> Option<EventKind> {
        let kind = EventKind::from_name(&record.event)?;
        let mut state = self.state(kind);
        state.active = record.active;
        state.disabled = record.disabled;
        Some(kind)
    }

    pub fn record(&self, kind: EventKind) -> EventRecord {
        let state = self.state(kind);
        self.record_locked(kind, &state)
    }

    fn record_locked(&self, kind: EventKind, state: &EventState) -> EventRecord {
        EventRecord {
            server: self.server.clone(),
            event: kind.as_str().to_string(),
            active: state.active,
            disabled: state.disabled,
        }
    }
}
