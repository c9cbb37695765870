//! The owned runtime: one sensor table, one scheduler and the five workers.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::SystemConfig;
use crate::events::{EventQueue, MusicEvent};
use crate::hal::Hardware;
use crate::health::{HealthMonitor, HealthReport, VoiceGauge, Watchdog};
use crate::inference::{InferenceEngine, LearningSwitch};
use crate::instrument::{self, InstrumentPlayer};
use crate::scheduler::{PeriodicTask, Scheduler, SchedulerStats, WorkerRole};
use crate::table::SensorTable;
use crate::transport::Transport;
use crate::voice::VoicePool;
use crate::workers::{
    AudioCommand, AudioCommands, AudioTask, HousekeepingTask, InferenceTask, NetworkTask,
    SensingTask,
};
use crate::{BitesError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// Built, no workers yet.
    Idle,
    Running,
    Suspended,
    Stopped,
}

/// Everything the instrument needs at runtime, built from a [`SystemConfig`].
///
/// Channels are registered by [`System::prepare`] (called by `start` if
/// needed). Workers exist between [`System::start`] and
/// [`System::shutdown`]; dropping the system shuts it down.
pub struct System {
    config: SystemConfig,
    clock: SharedClock,
    started_at: Duration,
    table: Arc<SensorTable>,
    events: EventQueue,
    audio: AudioCommands,
    audio_rx: Option<Receiver<AudioCommand>>,
    player: Option<InstrumentPlayer>,
    transports: Vec<Box<dyn Transport>>,
    scheduler: Scheduler,
    watchdog: Arc<Watchdog>,
    voices: Arc<VoiceGauge>,
    health: Option<Arc<Mutex<Option<HealthReport>>>>,
    learning: LearningSwitch,
    prepared: bool,
    state: SystemState,
}

impl System {
    pub fn new(config: SystemConfig, hardware: Box<dyn Hardware>, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let table = Arc::new(
            SensorTable::new(hardware, clock.clone())
                .with_lock_timeout(config.sensing.lock_timeout())
                .with_calibration_plan(config.sensing.calibration_plan()),
        );
        let (audio, audio_rx) = AudioCommands::bounded(config.audio_command_capacity);
        let watchdog = Arc::new(Watchdog::new(config.watchdog_timeout(), clock.clone()));

        Ok(Self {
            started_at: clock.now(),
            events: EventQueue::new(config.event_queue_capacity),
            table,
            audio,
            audio_rx: Some(audio_rx),
            player: None,
            transports: Vec::new(),
            scheduler: Scheduler::new(),
            watchdog,
            voices: Arc::new(VoiceGauge::default()),
            health: None,
            learning: LearningSwitch::new(),
            prepared: false,
            state: SystemState::Idle,
            clock,
            config,
        })
    }

    /// Adds a transport served by the network worker. Only takes effect
    /// before [`System::start`].
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Registers the instrument's channels and applies the configured
    /// channel overrides. Does nothing after the first success.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }

        let instrument = &self.config.instrument;
        let player = InstrumentPlayer::new(instrument::create(
            instrument.kind,
            instrument.track,
            instrument.keys,
        ));
        player.init(&self.table)?;

        for channel in &self.config.channels {
            if let Err(err) = channel.apply(&self.table) {
                warn!(channel = channel.channel_id, error = %err, "channel override not applied");
            }
        }

        self.player = Some(player);
        self.prepared = true;
        Ok(())
    }

    /// Creates and starts every worker.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SystemState::Idle {
            return Err(BitesError::msg(format!(
                "cannot start a system that is {:?}",
                self.state
            )));
        }
        self.prepare()?;

        if self.config.sensing.calibrate_on_start {
            if let Err(err) = self.table.calibrate_all() {
                warn!(error = %err, "calibration on start incomplete");
            }
        }

        let (Some(player), Some(audio_rx)) = (self.player.take(), self.audio_rx.take()) else {
            return Err(BitesError::msg("system was already started once"));
        };

        let pool = VoicePool::new(self.config.voices.capacity, self.clock.clone())
            .with_tracks(self.config.voices.tracks);
        let engine = InferenceEngine::new(
            self.table.clone(),
            self.events.clone(),
            self.config.inference,
        )
        .with_learning_switch(self.learning.clone());
        let audio = AudioTask::new(
            self.table.clone(),
            pool,
            player,
            audio_rx,
            self.events.clone(),
            self.voices.clone(),
        )
        .with_note_feed(engine.note_sender());
        let monitor = HealthMonitor::new(
            self.scheduler.stats(),
            self.table.clone(),
            self.voices.clone(),
            self.watchdog.clone(),
        );
        let housekeeping = HousekeepingTask::new(
            monitor,
            self.watchdog.clone(),
            self.events.clone(),
            self.table.clone(),
        );
        self.health = Some(housekeeping.reports());
        let transports = std::mem::take(&mut self.transports);

        let tasks: Vec<(WorkerRole, Box<dyn PeriodicTask>)> = vec![
            (
                WorkerRole::Sensing,
                Box::new(SensingTask::new(self.table.clone(), self.events.clone())),
            ),
            (WorkerRole::Audio, Box::new(audio)),
            (WorkerRole::Inference, Box::new(InferenceTask::new(engine))),
            (
                WorkerRole::Network,
                Box::new(NetworkTask::new(self.events.clone(), transports)),
            ),
            (WorkerRole::Housekeeping, Box::new(housekeeping)),
        ];
        let config = &self.config;
        let result = self.scheduler.create_all(
            tasks
                .into_iter()
                .map(|(role, task)| (config.worker_spec(role), task)),
        );

        if let Err(err) = result {
            error!(error = %err, "worker creation failed, shutting down");
            self.shutdown();
            return Err(err);
        }

        self.watchdog.enable();
        self.state = SystemState::Running;
        info!(
            instrument = %self.config.instrument.kind,
            channels = self.table.len(),
            "system running"
        );
        Ok(())
    }

    /// Pauses every worker. The watchdog is disabled while suspended.
    pub fn suspend(&mut self) {
        if self.state != SystemState::Running {
            return;
        }
        self.scheduler.suspend_all();
        self.watchdog.disable();
        self.state = SystemState::Suspended;
        info!("system suspended");
    }

    pub fn resume(&mut self) {
        if self.state != SystemState::Suspended {
            return;
        }
        self.watchdog.enable();
        self.scheduler.resume_all();
        self.state = SystemState::Running;
        info!("system resumed");
    }

    /// Calibrates every channel with the workers paused.
    pub fn calibrate(&mut self) -> Result<()> {
        self.prepare()?;
        let was_running = self.state == SystemState::Running;
        if was_running {
            self.suspend();
        }

        let result = self.table.calibrate_all();
        self.events.publish(MusicEvent::ConfigChanged {
            timestamp: self.clock.now(),
            key: "calibration".to_string(),
        });

        if was_running {
            self.resume();
        }
        result
    }

    /// Stops and joins every worker. Notes still sounding are abandoned.
    pub fn shutdown(&mut self) {
        if self.state == SystemState::Stopped {
            return;
        }
        self.scheduler.delete_all();
        self.watchdog.disable();
        self.state = SystemState::Stopped;
        info!(uptime_ms = self.uptime().as_millis() as u64, "system stopped");
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn uptime(&self) -> Duration {
        self.clock.now().saturating_sub(self.started_at)
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<SensorTable> {
        &self.table
    }

    pub fn audio_commands(&self) -> AudioCommands {
        self.audio.clone()
    }

    /// The queue the workers publish to. The network worker drains it while
    /// the system runs.
    pub fn events(&self) -> EventQueue {
        self.events.clone()
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn scheduler_stats(&self) -> Arc<SchedulerStats> {
        self.scheduler.stats()
    }

    /// Voices sounding as of the last audio tick.
    pub fn active_voices(&self) -> usize {
        self.voices.active()
    }

    /// Starts and stops pattern learning on the inference worker. Has no
    /// effect unless the `pattern_learning` feature is enabled.
    pub fn pattern_learning(&self) -> LearningSwitch {
        self.learning.clone()
    }

    /// Latest report from the housekeeping worker.
    pub fn health(&self) -> Option<HealthReport> {
        self.health.as_ref().and_then(|report| report.lock().clone())
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("state", &self.state)
            .field("instrument", &self.config.instrument.kind)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
