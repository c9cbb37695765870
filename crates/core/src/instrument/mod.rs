//! Instrument policies: which channels an instrument uses and which notes
//! its triggers play.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::drivers::{ChannelId, Technology, DRIVER_CAPACITY};
use crate::events::{EventQueue, MusicEvent};
use crate::table::{SensorSample, SensorTable, TriggerTracker, TABLE_CAPACITY};
use crate::voice::VoicePool;
use crate::{BitesError, Result};

/// First analog input pin.
pub const ANALOG_BASE_PIN: u8 = 14;
/// First digital input pin used by break-beam receivers.
pub const DIGITAL_BASE_PIN: u8 = 2;
/// Bus address slot of the inertial unit.
pub const INERTIAL_PIN: u8 = 0;

/// Keys are pressure channels, so one pressure driver bounds the count.
pub const DEFAULT_KEY_COUNT: u8 = DRIVER_CAPACITY as u8;
const LOWEST_KEY_NOTE: u8 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    BassGuitar,
    Guitar,
    Keyboard,
    Drums,
}

impl InstrumentKind {
    pub const ALL: [InstrumentKind; 4] = [
        InstrumentKind::BassGuitar,
        InstrumentKind::Guitar,
        InstrumentKind::Keyboard,
        InstrumentKind::Drums,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentKind::BassGuitar => "bass_guitar",
            InstrumentKind::Guitar => "guitar",
            InstrumentKind::Keyboard => "keyboard",
            InstrumentKind::Drums => "drums",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentKind {
    type Err = BitesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "bass" | "bass_guitar" => Ok(InstrumentKind::BassGuitar),
            "guitar" => Ok(InstrumentKind::Guitar),
            "keyboard" | "keys" => Ok(InstrumentKind::Keyboard),
            "drums" => Ok(InstrumentKind::Drums),
            other => Err(BitesError::Config(format!("unknown instrument `{other}`"))),
        }
    }
}

/// One channel an instrument registers on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub channel_id: ChannelId,
    pub technology: Technology,
    pub pin: u8,
}

/// What an instrument wants done with the voice pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoteAction {
    Play { track: u8, note: u8, velocity: f32 },
    Stop { track: u8, note: u8 },
}

/// Mapping policy of one instrument.
pub trait Instrument: Send {
    fn kind(&self) -> InstrumentKind;

    fn track(&self) -> u8;

    /// Channels to register, in registration order.
    fn channel_layout(&self) -> Vec<ChannelSpec>;

    /// Maps a fresh trigger on `channel` to an action.
    fn handle_sensor_input(
        &mut self,
        channel: ChannelId,
        value: f32,
        velocity: f32,
    ) -> Option<NoteAction>;

    /// Whether [`Instrument::handle_idle`] needs calling.
    fn releases_notes(&self) -> bool {
        false
    }

    /// Called for channels without a fresh trigger; lets held notes end.
    fn handle_idle(&mut self, _channel: ChannelId, _value: f32, _threshold: f32) -> Option<NoteAction> {
        None
    }
}

fn analog_channels(count: u8, technology: Technology) -> Vec<ChannelSpec> {
    (0..count)
        .map(|index| ChannelSpec {
            channel_id: index,
            technology,
            pin: ANALOG_BASE_PIN + index,
        })
        .collect()
}

fn with_inertial(mut layout: Vec<ChannelSpec>) -> Vec<ChannelSpec> {
    let channel_id = layout.len() as ChannelId;
    layout.push(ChannelSpec {
        channel_id,
        technology: Technology::Inertial,
        pin: INERTIAL_PIN,
    });
    layout
}

/// Four piezo strings tuned E A D G.
#[derive(Debug, Clone)]
pub struct BassGuitar {
    track: u8,
}

impl BassGuitar {
    const NOTES: [u8; 4] = [40, 45, 50, 55];

    pub fn new(track: u8) -> Self {
        Self { track }
    }
}

impl Instrument for BassGuitar {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::BassGuitar
    }

    fn track(&self) -> u8 {
        self.track
    }

    fn channel_layout(&self) -> Vec<ChannelSpec> {
        with_inertial(analog_channels(Self::NOTES.len() as u8, Technology::Contact))
    }

    fn handle_sensor_input(&mut self, channel: ChannelId, value: f32, _velocity: f32) -> Option<NoteAction> {
        let note = *Self::NOTES.get(usize::from(channel))?;
        Some(NoteAction::Play {
            track: self.track,
            note,
            velocity: (value / 1000.0).clamp(0.0, 1.0),
        })
    }
}

/// Six break-beam strings in standard tuning, always full velocity.
#[derive(Debug, Clone)]
pub struct Guitar {
    track: u8,
}

impl Guitar {
    const NOTES: [u8; 6] = [40, 45, 50, 55, 59, 64];

    pub fn new(track: u8) -> Self {
        Self { track }
    }
}

impl Instrument for Guitar {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Guitar
    }

    fn track(&self) -> u8 {
        self.track
    }

    fn channel_layout(&self) -> Vec<ChannelSpec> {
        let strings = (0..Self::NOTES.len() as u8)
            .map(|index| ChannelSpec {
                channel_id: index,
                technology: Technology::BreakBeam,
                pin: DIGITAL_BASE_PIN + index,
            })
            .collect();
        with_inertial(strings)
    }

    fn handle_sensor_input(&mut self, channel: ChannelId, _value: f32, _velocity: f32) -> Option<NoteAction> {
        let note = *Self::NOTES.get(usize::from(channel))?;
        Some(NoteAction::Play {
            track: self.track,
            note,
            velocity: 1.0,
        })
    }
}

/// Pressure keys from A0 upwards. A key sounds until its pressure falls
/// back under the channel threshold.
#[derive(Debug, Clone)]
pub struct Keyboard {
    track: u8,
    keys: u8,
    pressed: [bool; TABLE_CAPACITY],
}

impl Keyboard {
    pub fn new(track: u8, keys: u8) -> Self {
        let keys = keys.clamp(1, DRIVER_CAPACITY as u8);
        Self {
            track,
            keys,
            pressed: [false; TABLE_CAPACITY],
        }
    }

    pub fn keys(&self) -> u8 {
        self.keys
    }
}

impl Instrument for Keyboard {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Keyboard
    }

    fn track(&self) -> u8 {
        self.track
    }

    fn channel_layout(&self) -> Vec<ChannelSpec> {
        with_inertial(analog_channels(self.keys, Technology::Pressure))
    }

    fn handle_sensor_input(&mut self, channel: ChannelId, value: f32, _velocity: f32) -> Option<NoteAction> {
        if channel >= self.keys {
            return None;
        }
        let pressed = &mut self.pressed[usize::from(channel)];
        if *pressed {
            return None;
        }
        *pressed = true;
        Some(NoteAction::Play {
            track: self.track,
            note: LOWEST_KEY_NOTE + channel,
            velocity: (value / 5.0).clamp(0.0, 1.0),
        })
    }

    fn releases_notes(&self) -> bool {
        true
    }

    fn handle_idle(&mut self, channel: ChannelId, value: f32, threshold: f32) -> Option<NoteAction> {
        if channel >= self.keys {
            return None;
        }
        let pressed = &mut self.pressed[usize::from(channel)];
        if !*pressed || value > threshold {
            return None;
        }
        *pressed = false;
        Some(NoteAction::Stop {
            track: self.track,
            note: LOWEST_KEY_NOTE + channel,
        })
    }
}

/// Eight piezo pads on the General MIDI drum map.
#[derive(Debug, Clone)]
pub struct Drums {
    track: u8,
}

impl Drums {
    /// Kick, snare, hi-hat, tom 1-3, crash, ride.
    const NOTES: [u8; 8] = [36, 38, 42, 48, 45, 41, 49, 51];

    pub fn new(track: u8) -> Self {
        Self { track }
    }
}

impl Instrument for Drums {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Drums
    }

    fn track(&self) -> u8 {
        self.track
    }

    fn channel_layout(&self) -> Vec<ChannelSpec> {
        with_inertial(analog_channels(Self::NOTES.len() as u8, Technology::Contact))
    }

    fn handle_sensor_input(&mut self, channel: ChannelId, value: f32, _velocity: f32) -> Option<NoteAction> {
        let note = *Self::NOTES.get(usize::from(channel))?;
        Some(NoteAction::Play {
            track: self.track,
            note,
            velocity: (value / 2000.0).clamp(0.0, 1.0),
        })
    }
}

pub fn create(kind: InstrumentKind, track: u8, keys: u8) -> Box<dyn Instrument> {
    match kind {
        InstrumentKind::BassGuitar => Box::new(BassGuitar::new(track)),
        InstrumentKind::Guitar => Box::new(Guitar::new(track)),
        InstrumentKind::Keyboard => Box::new(Keyboard::new(track, keys)),
        InstrumentKind::Drums => Box::new(Drums::new(track)),
    }
}

/// Drives one instrument from the sensor table into the voice pool.
pub struct InstrumentPlayer {
    instrument: Box<dyn Instrument>,
    triggers: TriggerTracker,
}

impl InstrumentPlayer {
    pub fn new(instrument: Box<dyn Instrument>) -> Self {
        Self {
            instrument,
            triggers: TriggerTracker::new(),
        }
    }

    pub fn kind(&self) -> InstrumentKind {
        self.instrument.kind()
    }

    /// Registers the instrument's channels. A missing inertial unit is
    /// logged and skipped. Any other failure unregisters the channels this
    /// call registered and is returned.
    pub fn init(&self, table: &SensorTable) -> Result<usize> {
        let mut registered = Vec::new();
        for spec in self.instrument.channel_layout() {
            match table.register_channel(spec.technology, spec.channel_id, spec.pin) {
                Ok(()) => registered.push(spec.channel_id),
                Err(BitesError::HardwareUnavailable(reason))
                    if spec.technology == Technology::Inertial =>
                {
                    warn!(channel = spec.channel_id, %reason, "continuing without inertial unit");
                }
                Err(err) => {
                    warn!(
                        instrument = %self.kind(),
                        channel = spec.channel_id,
                        error = %err,
                        "instrument init failed, rolling back"
                    );
                    for id in registered {
                        let _ = table.unregister_channel(id);
                    }
                    return Err(err);
                }
            }
        }
        info!(instrument = %self.kind(), channels = registered.len(), "instrument initialised");
        Ok(registered.len())
    }

    /// Applies every trigger accepted since the previous call. Returns the
    /// notes that started sounding.
    pub fn update(&mut self, table: &SensorTable, pool: &mut VoicePool, events: &EventQueue) -> Vec<u8> {
        let samples = table.snapshot();
        let thresholds = if self.instrument.releases_notes() {
            table
                .descriptors()
                .into_iter()
                .map(|descriptor| (descriptor.channel_id, descriptor.threshold))
                .collect()
        } else {
            Vec::new()
        };

        let mut played = Vec::new();
        for sample in &samples {
            let action = if self.triggers.fresh(sample) {
                self.instrument
                    .handle_sensor_input(sample.channel_id, sample.value, sample.velocity)
            } else {
                thresholds
                    .iter()
                    .find(|(id, _)| *id == sample.channel_id)
                    .and_then(|&(_, threshold)| {
                        self.instrument
                            .handle_idle(sample.channel_id, sample.value, threshold)
                    })
            };
            if let Some(action) = action {
                if let Some(note) = Self::apply(action, sample, pool, events) {
                    played.push(note);
                }
            }
        }
        played
    }

    fn apply(
        action: NoteAction,
        sample: &SensorSample,
        pool: &mut VoicePool,
        events: &EventQueue,
    ) -> Option<u8> {
        let timestamp = sample.timestamp;
        match action {
            NoteAction::Play { track, note, velocity } => {
                pool.play_note(track, note, velocity).ok()?;
                events.publish(MusicEvent::NotePlayed {
                    timestamp,
                    track_id: track,
                    note_id: note,
                    velocity,
                });
                Some(note)
            }
            NoteAction::Stop { track, note } => {
                if pool.stop_note(track, note) {
                    events.publish(MusicEvent::NoteStopped {
                        timestamp,
                        track_id: track,
                        note_id: note,
                    });
                }
                None
            }
        }
    }
}

impl fmt::Debug for InstrumentPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentPlayer")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::hal::{SimulatedHardware, SimulatedHardwareHandle};

    fn rig() -> (SensorTable, SimulatedHardwareHandle, ManualClock, VoicePool) {
        let board = SimulatedHardware::new();
        let handle = board.handle();
        let clock = ManualClock::new();
        let shared: crate::clock::SharedClock = Arc::new(clock.clone());
        let table = SensorTable::new(Box::new(board), shared.clone());
        (table, handle, clock, VoicePool::new(16, shared))
    }

    #[test]
    fn parses_kind_names() {
        assert_eq!("bass".parse::<InstrumentKind>().unwrap(), InstrumentKind::BassGuitar);
        assert_eq!("Bass-Guitar".parse::<InstrumentKind>().unwrap(), InstrumentKind::BassGuitar);
        assert_eq!("drums".parse::<InstrumentKind>().unwrap(), InstrumentKind::Drums);
        assert!("theremin".parse::<InstrumentKind>().is_err());
        for kind in InstrumentKind::ALL {
            assert_eq!(kind.to_string().parse::<InstrumentKind>().unwrap(), kind);
        }
    }

    #[test]
    fn layouts_end_with_the_inertial_channel() {
        for kind in InstrumentKind::ALL {
            let layout = create(kind, 0, DEFAULT_KEY_COUNT).channel_layout();
            let last = layout.last().unwrap();
            assert_eq!(last.technology, Technology::Inertial);
            assert_eq!(usize::from(last.channel_id), layout.len() - 1);
            assert!(layout.len() <= TABLE_CAPACITY);
            for technology in Technology::ALL {
                let used = layout.iter().filter(|spec| spec.technology == technology).count();
                assert!(used <= DRIVER_CAPACITY, "{kind} uses {used} {technology} channels");
            }
        }
        assert_eq!(Keyboard::new(0, 40).keys(), DRIVER_CAPACITY as u8);
    }

    #[test]
    fn mappings_follow_each_instrument() {
        let mut bass = BassGuitar::new(0);
        assert_eq!(
            bass.handle_sensor_input(1, 2500.0, 0.0),
            Some(NoteAction::Play { track: 0, note: 45, velocity: 1.0 })
        );
        assert_eq!(bass.handle_sensor_input(4, 100.0, 0.0), None);

        let mut drums = Drums::new(2);
        assert_eq!(
            drums.handle_sensor_input(2, 1000.0, 0.0),
            Some(NoteAction::Play { track: 2, note: 42, velocity: 0.5 })
        );

        let mut guitar = Guitar::new(1);
        assert_eq!(
            guitar.handle_sensor_input(5, 0.0, 1.0),
            Some(NoteAction::Play { track: 1, note: 64, velocity: 1.0 })
        );
    }

    #[test]
    fn keyboard_holds_until_pressure_drops() {
        let mut keys = Keyboard::new(0, 4);
        assert!(matches!(
            keys.handle_sensor_input(3, 2.5, 0.0),
            Some(NoteAction::Play { note: 24, .. })
        ));
        assert_eq!(keys.handle_sensor_input(3, 2.5, 0.0), None);
        assert_eq!(keys.handle_idle(3, 0.5, 0.1), None);
        assert_eq!(
            keys.handle_idle(3, 0.05, 0.1),
            Some(NoteAction::Stop { track: 0, note: 24 })
        );
        assert_eq!(keys.handle_sensor_input(9, 2.5, 0.0), None);
    }

    #[test]
    fn player_drives_pool_and_events() {
        let (table, handle, clock, mut pool) = rig();
        let events = EventQueue::default();
        let mut player = InstrumentPlayer::new(create(InstrumentKind::Drums, 0, 0));
        assert_eq!(player.init(&table).unwrap(), 9);

        // Snare hit.
        handle.set_analog(ANALOG_BASE_PIN + 1, 2048);
        table.poll();
        assert_eq!(player.update(&table, &mut pool, &events), vec![38]);
        assert!(pool.is_playing(0, 38));

        // The same trigger is not replayed on the next update.
        clock.advance(Duration::from_millis(1));
        table.poll();
        assert!(player.update(&table, &mut pool, &events).is_empty());

        let played: Vec<MusicEvent> = events.drain();
        assert_eq!(played.len(), 1);
        assert!(matches!(played[0], MusicEvent::NotePlayed { note_id: 38, .. }));
    }

    #[test]
    fn keyboard_player_releases_notes() {
        let (table, handle, clock, mut pool) = rig();
        let events = EventQueue::default();
        let mut player = InstrumentPlayer::new(create(InstrumentKind::Keyboard, 1, 2));
        player.init(&table).unwrap();

        handle.set_analog(ANALOG_BASE_PIN, 2048);
        table.poll();
        assert_eq!(player.update(&table, &mut pool, &events), vec![21]);

        clock.advance(Duration::from_millis(5));
        handle.set_analog(ANALOG_BASE_PIN, 0);
        table.poll();
        player.update(&table, &mut pool, &events);

        assert!(!pool.is_playing(1, 21));
        let kinds: Vec<&str> = events.drain().iter().map(MusicEvent::kind).collect();
        assert_eq!(kinds, vec!["note_played", "note_stopped"]);
    }

    #[test]
    fn every_default_layout_initialises() {
        for kind in InstrumentKind::ALL {
            let (table, _, _, _) = rig();
            let player = InstrumentPlayer::new(create(kind, 0, DEFAULT_KEY_COUNT));
            let expected = player.instrument.channel_layout().len();
            assert_eq!(player.init(&table).unwrap(), expected, "{kind}");
            assert_eq!(table.len(), expected);
        }
    }

    #[test]
    fn failed_init_leaves_the_table_untouched() {
        let (table, _, _, _) = rig();
        // Occupies the id the inertial channel of the bass layout wants.
        table.register_channel(Technology::Flex, 4, 30).unwrap();
        let player = InstrumentPlayer::new(create(InstrumentKind::BassGuitar, 0, 0));
        assert!(matches!(player.init(&table), Err(BitesError::DuplicateChannel(4))));
        assert_eq!(table.channel_ids(), vec![4]);
    }

    #[test]
    fn missing_inertial_unit_is_not_fatal() {
        let (table, handle, _, _) = rig();
        handle.set_inertial_online(false);
        let player = InstrumentPlayer::new(create(InstrumentKind::BassGuitar, 0, 0));
        assert_eq!(player.init(&table).unwrap(), 4);
        assert_eq!(table.len(), 4);
    }
}
