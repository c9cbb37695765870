//! Core library for the B.I.T.E.S wearable instrument.
//!
//! Sensor channels are read by technology drivers into a lock-guarded
//! sensor table, smoothed by scalar Kalman filters, and turned into notes
//! on a fixed-capacity voice pool. Five periodic workers (sensing, audio,
//! inference, network, housekeeping) share that state. Hardware and time
//! are injected through the [`Hardware`] and [`Clock`] traits so the whole
//! pipeline runs against [`SimulatedHardware`] off the device.

pub mod clock;
pub mod config;
pub mod drivers;
pub mod error;
pub mod events;
pub mod filter;
pub mod fusion;
pub mod hal;
pub mod health;
pub mod inference;
pub mod instrument;
pub mod scheduler;
pub mod system;
pub mod table;
pub mod transport;
pub mod voice;
pub mod workers;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::{ChannelConfig, ConfigStore, SystemConfig};
pub use drivers::{CalibrationPlan, ChannelDescriptor, ChannelDriver, ChannelId, Technology};
pub use error::{BitesError, Result};
pub use events::{EventQueue, MusicEvent};
pub use filter::KalmanFilter;
pub use fusion::{FusionEstimates, SensorFusion};
pub use hal::{Hardware, PinMode, RawInertialFrame, SimulatedHardware, SimulatedHardwareHandle};
pub use health::{HealthMonitor, HealthReport, Watchdog};
pub use inference::{
    Chord, Gesture, InferenceEngine, InferenceFeatures, LearningSwitch, Pattern, PatternLearner,
};
pub use instrument::{Instrument, InstrumentKind, InstrumentPlayer};
pub use scheduler::{PeriodicTask, Priority, Scheduler, WorkerRole, WorkerSpec, WorkerState};
pub use system::{System, SystemState};
pub use table::{PollOutcome, SensorSample, SensorTable};
pub use transport::{LogTransport, RecordingTransport, Transport};
pub use voice::{PlayOutcome, Voice, VoicePool};
pub use workers::{AudioCommand, AudioCommands};
