//! Bodies of the five periodic workers.
//!
//! Each task owns what only it touches (the audio task owns the voice pool)
//! and reaches shared state through the sensor table, the event queue and
//! bounded channels.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::events::{EventQueue, MusicEvent};
use crate::health::{HealthMonitor, HealthReport, VoiceGauge, Watchdog};
use crate::inference::InferenceEngine;
use crate::instrument::InstrumentPlayer;
use crate::scheduler::PeriodicTask;
use crate::table::{PollOutcome, SensorTable};
use crate::transport::Transport;
use crate::voice::VoicePool;
use crate::{BitesError, Result};

/// Requests applied to the voice pool by the audio worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioCommand {
    Play { track: u8, note: u8, velocity: f32 },
    Stop { track: u8, note: u8 },
    StopAll,
    SetVolume(f32),
}

/// Cloneable submit side of the audio command queue.
#[derive(Debug, Clone)]
pub struct AudioCommands {
    tx: Sender<AudioCommand>,
}

impl AudioCommands {
    /// Creates a bounded queue and returns its submit handle and receiver.
    pub fn bounded(capacity: usize) -> (Self, Receiver<AudioCommand>) {
        let (tx, rx) = channel::bounded(capacity);
        (Self { tx }, rx)
    }

    /// Queues `command` without blocking.
    pub fn submit(&self, command: AudioCommand) -> Result<()> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BitesError::CapacityExceeded {
                what: "audio command queue",
                capacity: self.tx.capacity().unwrap_or(0),
            }),
            Err(TrySendError::Disconnected(_)) => {
                Err(BitesError::msg("audio worker is not running"))
            }
        }
    }

    pub fn play(&self, track: u8, note: u8, velocity: f32) -> Result<()> {
        self.submit(AudioCommand::Play { track, note, velocity })
    }

    pub fn stop(&self, track: u8, note: u8) -> Result<()> {
        self.submit(AudioCommand::Stop { track, note })
    }

    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Polls the sensor table and announces fresh triggers.
#[derive(Debug)]
pub struct SensingTask {
    table: Arc<SensorTable>,
    events: EventQueue,
}

impl SensingTask {
    pub fn new(table: Arc<SensorTable>, events: EventQueue) -> Self {
        Self { table, events }
    }
}

impl PeriodicTask for SensingTask {
    fn tick(&mut self) {
        let PollOutcome::Completed(summary) = self.table.poll() else {
            return;
        };
        for id in summary.triggered() {
            let sample = self.table.get_sample(id);
            self.events.publish(MusicEvent::SensorTriggered {
                timestamp: summary.timestamp,
                channel_id: id,
                value: sample.value,
                velocity: sample.velocity,
            });
        }
    }
}

/// Sole owner of the voice pool.
pub struct AudioTask {
    table: Arc<SensorTable>,
    pool: VoicePool,
    player: InstrumentPlayer,
    commands: Receiver<AudioCommand>,
    events: EventQueue,
    played_notes: Option<Sender<u8>>,
    gauge: Arc<VoiceGauge>,
}

impl AudioTask {
    pub fn new(
        table: Arc<SensorTable>,
        pool: VoicePool,
        player: InstrumentPlayer,
        commands: Receiver<AudioCommand>,
        events: EventQueue,
        gauge: Arc<VoiceGauge>,
    ) -> Self {
        gauge.record(pool.total_active(), pool.capacity());
        Self {
            table,
            pool,
            player,
            commands,
            events,
            played_notes: None,
            gauge,
        }
    }

    /// Forwards every note that starts sounding, e.g. to chord prediction.
    pub fn with_note_feed(mut self, notes: Sender<u8>) -> Self {
        self.played_notes = Some(notes);
        self
    }

    pub fn pool(&self) -> &VoicePool {
        &self.pool
    }

    fn apply(&mut self, command: AudioCommand) -> Option<u8> {
        let timestamp = self.table.clock().now();
        match command {
            AudioCommand::Play { track, note, velocity } => {
                match self.pool.play_note(track, note, velocity) {
                    Ok(_) => {
                        self.events.publish(MusicEvent::NotePlayed {
                            timestamp,
                            track_id: track,
                            note_id: note,
                            velocity,
                        });
                        Some(note)
                    }
                    Err(err) => {
                        debug!(track, note, error = %err, "audio command rejected");
                        None
                    }
                }
            }
            AudioCommand::Stop { track, note } => {
                if self.pool.stop_note(track, note) {
                    self.events.publish(MusicEvent::NoteStopped {
                        timestamp,
                        track_id: track,
                        note_id: note,
                    });
                }
                None
            }
            AudioCommand::StopAll => {
                self.pool.stop_all();
                None
            }
            AudioCommand::SetVolume(volume) => {
                self.pool.set_volume(volume);
                None
            }
        }
    }

    fn feed_note(&self, note: u8) {
        if let Some(notes) = &self.played_notes {
            if notes.try_send(note).is_err() {
                trace!(note, "note feed full");
            }
        }
    }
}

impl PeriodicTask for AudioTask {
    fn tick(&mut self) {
        let pending: Vec<AudioCommand> = self.commands.try_iter().collect();
        for command in pending {
            if let Some(note) = self.apply(command) {
                self.feed_note(note);
            }
        }

        let played = self.player.update(&self.table, &mut self.pool, &self.events);
        for note in played {
            self.feed_note(note);
        }
        self.gauge
            .record(self.pool.total_active(), self.pool.capacity());
    }
}

impl std::fmt::Debug for AudioTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTask")
            .field("player", &self.player)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct InferenceTask {
    engine: InferenceEngine,
}

impl InferenceTask {
    pub fn new(engine: InferenceEngine) -> Self {
        Self { engine }
    }
}

impl PeriodicTask for InferenceTask {
    fn tick(&mut self) {
        self.engine.step();
    }
}

/// Drains the event queue into every transport.
pub struct NetworkTask {
    events: EventQueue,
    transports: Vec<Box<dyn Transport>>,
}

impl NetworkTask {
    pub fn new(events: EventQueue, transports: Vec<Box<dyn Transport>>) -> Self {
        Self { events, transports }
    }
}

impl PeriodicTask for NetworkTask {
    fn tick(&mut self) {
        for event in self.events.drain() {
            for transport in &mut self.transports {
                if let Err(err) = transport.deliver(&event) {
                    warn!(transport = transport.name(), kind = event.kind(), error = %err, "delivery failed");
                }
            }
        }
        for transport in &mut self.transports {
            if let Err(err) = transport.service() {
                warn!(transport = transport.name(), error = %err, "transport service failed");
            }
        }
    }
}

impl std::fmt::Debug for NetworkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTask")
            .field(
                "transports",
                &self.transports.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Checks health, then feeds the watchdog.
#[derive(Debug)]
pub struct HousekeepingTask {
    monitor: HealthMonitor,
    watchdog: Arc<Watchdog>,
    events: EventQueue,
    table: Arc<SensorTable>,
    last_report: Arc<Mutex<Option<HealthReport>>>,
}

impl HousekeepingTask {
    pub fn new(
        monitor: HealthMonitor,
        watchdog: Arc<Watchdog>,
        events: EventQueue,
        table: Arc<SensorTable>,
    ) -> Self {
        Self {
            monitor,
            watchdog,
            events,
            table,
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared slot holding the latest report.
    pub fn reports(&self) -> Arc<Mutex<Option<HealthReport>>> {
        Arc::clone(&self.last_report)
    }
}

impl PeriodicTask for HousekeepingTask {
    fn tick(&mut self) {
        let report = self.monitor.check();
        if report.watchdog_expired {
            self.events.publish(MusicEvent::SystemError {
                timestamp: self.table.clock().now(),
                message: "watchdog expired".to_string(),
            });
        }
        self.watchdog.feed();
        *self.last_report.lock() = Some(report);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::drivers::Technology;
    use crate::hal::SimulatedHardware;
    use crate::health::DEFAULT_WATCHDOG_TIMEOUT;
    use crate::instrument::{self, InstrumentKind};
    use crate::scheduler::SchedulerStats;
    use crate::transport::RecordingTransport;

    struct Rig {
        clock: ManualClock,
        hardware: crate::hal::SimulatedHardwareHandle,
        table: Arc<SensorTable>,
        events: EventQueue,
    }

    fn rig() -> Rig {
        let clock = ManualClock::new();
        let hardware = SimulatedHardware::new();
        let handle = hardware.handle();
        let table = Arc::new(SensorTable::new(Box::new(hardware), Arc::new(clock.clone())));
        Rig {
            clock,
            hardware: handle,
            table,
            events: EventQueue::new(64),
        }
    }

    fn audio_task(rig: &Rig, kind: InstrumentKind) -> (AudioTask, AudioCommands, Arc<VoiceGauge>) {
        let player = InstrumentPlayer::new(instrument::create(kind, 0, 4));
        player.init(&rig.table).unwrap();
        let (commands, rx) = AudioCommands::bounded(8);
        let gauge = Arc::new(VoiceGauge::default());
        let clock: SharedClock = Arc::new(rig.clock.clone());
        let task = AudioTask::new(
            rig.table.clone(),
            VoicePool::new(2, clock),
            player,
            rx,
            rig.events.clone(),
            gauge.clone(),
        );
        (task, commands, gauge)
    }

    #[test]
    fn sensing_publishes_triggered_channels() {
        let rig = rig();
        rig.table.register_channel(Technology::Contact, 3, 17).unwrap();
        let mut sensing = SensingTask::new(rig.table.clone(), rig.events.clone());

        rig.hardware.set_analog(17, 4095);
        rig.clock.advance(Duration::from_millis(10));
        sensing.tick();

        let events = rig.events.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            MusicEvent::SensorTriggered { channel_id: 3, .. }
        ));
    }

    #[test]
    fn audio_applies_commands_and_reports_occupancy() {
        let rig = rig();
        let (mut audio, commands, gauge) = audio_task(&rig, InstrumentKind::Drums);
        let (notes_tx, notes_rx) = channel::bounded(8);
        audio = audio.with_note_feed(notes_tx);

        commands.play(0, 60, 0.5).unwrap();
        commands.play(0, 64, 0.5).unwrap();
        commands.play(0, 67, 0.5).unwrap();
        audio.tick();

        assert_eq!(gauge.active(), 2);
        assert_eq!(gauge.capacity(), 2);
        assert!(!audio.pool().is_playing(0, 67));
        assert_eq!(notes_rx.try_iter().collect::<Vec<_>>(), vec![60, 64]);

        commands.submit(AudioCommand::StopAll).unwrap();
        commands.submit(AudioCommand::SetVolume(0.25)).unwrap();
        audio.tick();
        assert_eq!(gauge.active(), 0);
        assert_eq!(audio.pool().volume(), 0.25);

        let kinds: Vec<_> = rig.events.drain().iter().map(MusicEvent::kind).collect();
        assert_eq!(kinds, vec!["note_played", "note_played"]);
    }

    #[test]
    fn full_command_queue_is_a_capacity_error() {
        let (commands, _rx) = AudioCommands::bounded(1);
        commands.stop(0, 1).unwrap();
        let err = commands.stop(0, 2).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(commands.pending(), 1);
    }

    #[test]
    fn network_drains_into_every_transport() {
        let rig = rig();
        let first = RecordingTransport::new();
        let second = RecordingTransport::new();
        let mut network = NetworkTask::new(
            rig.events.clone(),
            vec![Box::new(first.clone()), Box::new(second.clone())],
        );

        rig.events.publish(MusicEvent::TempoDetected {
            timestamp: Duration::ZERO,
            bpm: 100.0,
        });
        network.tick();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(rig.events.is_empty());
    }

    #[test]
    fn housekeeping_reports_and_feeds_the_watchdog() {
        let rig = rig();
        let shared: SharedClock = Arc::new(rig.clock.clone());
        let watchdog = Arc::new(Watchdog::new(DEFAULT_WATCHDOG_TIMEOUT, shared));
        let monitor = HealthMonitor::new(
            Arc::new(SchedulerStats::default()),
            rig.table.clone(),
            Arc::new(VoiceGauge::default()),
            watchdog.clone(),
        );
        let mut housekeeping =
            HousekeepingTask::new(monitor, watchdog.clone(), rig.events.clone(), rig.table.clone());
        let reports = housekeeping.reports();

        rig.clock.advance(Duration::from_secs(11));
        housekeeping.tick();
        let report = reports.lock().clone().unwrap();
        assert!(report.watchdog_expired);
        assert!(!watchdog.is_expired());
        assert!(matches!(
            rig.events.try_next(),
            Some(MusicEvent::SystemError { .. })
        ));
    }
}
