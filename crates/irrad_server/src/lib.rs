//! Device server: motor stages, beam telemetry and the raster scan routine.

pub mod daq;
pub mod role;
pub mod scan;
pub mod stage;

pub use role::DeviceServer;
pub use scan::{RasterGeometry, ScanController, ScanError, ScanSignal};
pub use stage::{MockAxis, ScanStage, StageAxis, TrackedAxis};
