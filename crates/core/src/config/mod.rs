use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::drivers::{CalibrationPlan, ChannelId, Technology};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::health::DEFAULT_WATCHDOG_TIMEOUT;
use crate::inference::InferenceFeatures;
use crate::instrument::{InstrumentKind, DEFAULT_KEY_COUNT};
use crate::scheduler::{Priority, WorkerRole, WorkerSpec};
use crate::table::{SensorTable, DEFAULT_LOCK_TIMEOUT};
use crate::voice::{DEFAULT_TRACK_COUNT, DEFAULT_VOICE_CAPACITY};
use crate::{BitesError, Result};

/// Top-level configuration structure for the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub instrument: InstrumentConfig,
    pub sensing: SensingConfig,
    /// Per-channel calibration overrides applied after registration.
    pub channels: Vec<ChannelConfig>,
    pub voices: VoiceConfig,
    pub workers: WorkersConfig,
    pub watchdog_timeout_ms: u64,
    pub inference: InferenceFeatures,
    pub event_queue_capacity: usize,
    pub audio_command_capacity: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            instrument: InstrumentConfig::default(),
            sensing: SensingConfig::default(),
            channels: Vec::new(),
            voices: VoiceConfig::default(),
            workers: WorkersConfig::default(),
            watchdog_timeout_ms: DEFAULT_WATCHDOG_TIMEOUT.as_millis() as u64,
            inference: InferenceFeatures::default(),
            event_queue_capacity: DEFAULT_EVENT_CAPACITY,
            audio_command_capacity: 64,
        }
    }
}

impl SystemConfig {
    pub fn for_instrument(kind: InstrumentKind) -> Self {
        Self {
            instrument: InstrumentConfig {
                kind,
                ..InstrumentConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.voices.capacity == 0 {
            return Err(BitesError::Config("voice capacity must be non-zero".into()));
        }
        if self.voices.tracks == 0 {
            return Err(BitesError::Config("track count must be non-zero".into()));
        }
        if self.instrument.track >= self.voices.tracks {
            return Err(BitesError::Config(format!(
                "instrument track {} is outside the {} configured tracks",
                self.instrument.track, self.voices.tracks
            )));
        }
        if self.event_queue_capacity == 0 || self.audio_command_capacity == 0 {
            return Err(BitesError::Config("queue capacities must be non-zero".into()));
        }
        if self.sensing.calibration_samples == 0 {
            return Err(BitesError::Config(
                "calibration needs at least one sample".into(),
            ));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(BitesError::Config("watchdog timeout must be non-zero".into()));
        }
        for role in WorkerRole::ALL {
            if self.workers.get(role).period_us == 0 {
                return Err(BitesError::Config(format!(
                    "worker `{role}` has a zero period"
                )));
            }
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.channel_id) {
                return Err(BitesError::Config(format!(
                    "channel {} is configured twice",
                    channel.channel_id
                )));
            }
        }
        Ok(())
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn worker_spec(&self, role: WorkerRole) -> WorkerSpec {
        let worker = self.workers.get(role);
        WorkerSpec::new(role)
            .with_period(Duration::from_micros(worker.period_us))
            .with_priority(worker.priority)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ChannelConfig> {
        self.channels.iter().find(|channel| channel.channel_id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub kind: InstrumentKind,
    pub track: u8,
    /// Only used by the keyboard.
    pub keys: u8,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            kind: InstrumentKind::BassGuitar,
            track: 0,
            keys: DEFAULT_KEY_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensingConfig {
    pub lock_timeout_us: u64,
    pub calibration_samples: u32,
    pub calibration_interval_ms: u64,
    /// Calibrate every channel before the workers start.
    pub calibrate_on_start: bool,
}

impl Default for SensingConfig {
    fn default() -> Self {
        let plan = CalibrationPlan::default();
        Self {
            lock_timeout_us: DEFAULT_LOCK_TIMEOUT.as_micros() as u64,
            calibration_samples: plan.samples,
            calibration_interval_ms: plan.interval.as_millis() as u64,
            calibrate_on_start: false,
        }
    }
}

impl SensingConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_micros(self.lock_timeout_us)
    }

    pub fn calibration_plan(&self) -> CalibrationPlan {
        CalibrationPlan {
            samples: self.calibration_samples,
            interval: Duration::from_millis(self.calibration_interval_ms),
        }
    }
}

/// Calibration of one channel. Unset fields keep the driver's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technology: Option<Technology>,
    /// With `technology`, registers the channel if the instrument did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

impl ChannelConfig {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            technology: None,
            pin: None,
            baseline: None,
            threshold: None,
            debounce_ms: None,
            enabled: true,
        }
    }

    /// Applies the overrides to a registered channel, or drops the channel
    /// when it is disabled.
    pub fn apply(&self, table: &SensorTable) -> Result<()> {
        if !self.enabled {
            return table.unregister_channel(self.channel_id);
        }
        if table.technology(self.channel_id).is_none() {
            match (self.technology, self.pin) {
                (Some(technology), Some(pin)) => {
                    table.register_channel(technology, self.channel_id, pin)?
                }
                _ => return Err(BitesError::InvalidChannel(self.channel_id)),
            }
        }
        if let Some(baseline) = self.baseline {
            table.set_baseline(self.channel_id, baseline);
        }
        if let Some(threshold) = self.threshold {
            table.set_threshold(self.channel_id, threshold);
        }
        if let Some(debounce) = self.debounce_ms {
            table.set_debounce_time(self.channel_id, Duration::from_millis(debounce));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub capacity: usize,
    pub tracks: u8,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_VOICE_CAPACITY,
            tracks: DEFAULT_TRACK_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub period_us: u64,
    pub priority: Priority,
}

impl WorkerConfig {
    fn defaults(role: WorkerRole) -> Self {
        Self {
            period_us: role.default_period().as_micros() as u64,
            priority: role.default_priority(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub sensing: WorkerConfig,
    pub audio: WorkerConfig,
    pub inference: WorkerConfig,
    pub network: WorkerConfig,
    pub housekeeping: WorkerConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            sensing: WorkerConfig::defaults(WorkerRole::Sensing),
            audio: WorkerConfig::defaults(WorkerRole::Audio),
            inference: WorkerConfig::defaults(WorkerRole::Inference),
            network: WorkerConfig::defaults(WorkerRole::Network),
            housekeeping: WorkerConfig::defaults(WorkerRole::Housekeeping),
        }
    }
}

impl WorkersConfig {
    pub fn get(&self, role: WorkerRole) -> &WorkerConfig {
        match role {
            WorkerRole::Sensing => &self.sensing,
            WorkerRole::Audio => &self.audio,
            WorkerRole::Inference => &self.inference,
            WorkerRole::Network => &self.network,
            WorkerRole::Housekeeping => &self.housekeeping,
        }
    }
}

/// Loads and saves [`SystemConfig`] as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the configuration. A missing file yields the defaults.
    pub fn load(&self) -> Result<SystemConfig> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str::<SystemConfig>(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no configuration file, using defaults");
                SystemConfig::default()
            }
            Err(err) => return Err(err.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &SystemConfig) -> Result<()> {
        config.validate()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, text)?;
        info!(path = %self.path.display(), "configuration saved");
        Ok(())
    }

    /// Copies the table's current calibration into `config`, replacing any
    /// override for the same channel.
    pub fn capture_calibration(config: &mut SystemConfig, table: &SensorTable) {
        for descriptor in table.descriptors() {
            let entry = match config
                .channels
                .iter_mut()
                .position(|channel| channel.channel_id == descriptor.channel_id)
            {
                Some(index) => &mut config.channels[index],
                None => {
                    config.channels.push(ChannelConfig::new(descriptor.channel_id));
                    let last = config.channels.len() - 1;
                    &mut config.channels[last]
                }
            };
            entry.technology = Some(descriptor.technology);
            entry.pin = Some(descriptor.hardware_pin);
            entry.baseline = Some(descriptor.baseline);
            entry.threshold = Some(descriptor.threshold);
            entry.debounce_ms = Some(descriptor.debounce_window.as_millis() as u64);
            entry.enabled = true;
        }
        config.channels.sort_by_key(|channel| channel.channel_id);
    }
}
