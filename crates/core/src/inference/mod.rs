//! Heuristic gesture, chord and tempo classifiers, plus a phrase learner.
//!
//! These are small replaceable policies. [`InferenceEngine`] runs them on
//! the inference worker against the sensor table and fusion output.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::drivers::{InertialReading, Technology};
use crate::events::{EventQueue, MusicEvent};
use crate::fusion::SensorFusion;
use crate::table::{SensorTable, TriggerTracker};

/// Confidence attached to every recognised gesture.
pub const GESTURE_CONFIDENCE: f32 = 0.8;
pub const CHORD_CONFIDENCE: f32 = 0.7;
pub const DEFAULT_TEMPO_BPM: f32 = 120.0;
const HISTORY: usize = 16;

/// Notes in one learned phrase.
pub const PATTERN_LENGTH: usize = 32;
/// Learned phrases kept; the oldest is overwritten first.
pub const PATTERN_SLOTS: usize = 8;
/// Below this the engine does not report a match.
pub const MIN_PATTERN_SIMILARITY: f32 = 0.75;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    #[default]
    None,
    StrumDown,
    StrumUp,
    Pick,
    Strike,
}

/// Inertial feature vector the gesture classifier works on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GestureFeatures {
    pub accel: [f32; 3],
    pub gyro: [f32; 3],
    pub roll: f32,
    pub pitch: f32,
    pub accel_magnitude: f32,
    pub gyro_magnitude: f32,
}

impl From<&InertialReading> for GestureFeatures {
    fn from(reading: &InertialReading) -> Self {
        Self {
            accel: reading.accel,
            gyro: reading.gyro,
            roll: reading.roll,
            pitch: reading.pitch,
            accel_magnitude: reading.accel_magnitude(),
            gyro_magnitude: reading.gyro_magnitude(),
        }
    }
}

/// Threshold classifier over acceleration (g) and rotation (deg/s).
#[derive(Debug, Clone, Default)]
pub struct GestureClassifier {
    last: Gesture,
    confidence: f32,
}

impl GestureClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(features: &GestureFeatures) -> Gesture {
        let accel = features.accel_magnitude;
        let gyro = features.gyro_magnitude;

        if accel > 2.0 && gyro > 100.0 {
            if features.accel[1] > 0.0 {
                Gesture::StrumDown
            } else {
                Gesture::StrumUp
            }
        } else if accel > 1.5 && gyro < 50.0 {
            Gesture::Strike
        } else if accel > 0.5 && gyro < 20.0 {
            Gesture::Pick
        } else {
            Gesture::None
        }
    }

    /// Classifies `features` and remembers the result.
    pub fn update(&mut self, features: &GestureFeatures) -> Gesture {
        self.last = Self::classify(features);
        self.confidence = if self.last == Gesture::None {
            0.0
        } else {
            GESTURE_CONFIDENCE
        };
        self.last
    }

    pub fn last(&self) -> Gesture {
        self.last
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordQuality {
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Chord {
    /// Pitch class of the root, 0 = C.
    pub root: u8,
    pub quality: ChordQuality,
    pub confidence: f32,
}

/// Guesses a chord from the most recently played pitch classes.
#[derive(Debug, Clone, Default)]
pub struct ChordPredictor {
    notes: VecDeque<u8>,
    current: Option<Chord>,
}

impl ChordPredictor {
    pub fn new() -> Self {
        Self {
            notes: VecDeque::with_capacity(HISTORY),
            current: None,
        }
    }

    pub fn add_played_note(&mut self, note: u8) {
        if self.notes.len() == HISTORY {
            self.notes.pop_front();
        }
        self.notes.push_back(note % 12);
    }

    /// Key = most frequent pitch class (lowest wins ties); minor when a
    /// minor third above it was played.
    pub fn predict(&self) -> Option<Chord> {
        if self.notes.is_empty() {
            return None;
        }

        let mut counts = [0u8; 12];
        for &class in &self.notes {
            counts[usize::from(class)] += 1;
        }
        let mut root = 0u8;
        for (class, &count) in counts.iter().enumerate() {
            if count > counts[usize::from(root)] {
                root = class as u8;
            }
        }

        let minor_third = (root + 3) % 12;
        let quality = if self.notes.contains(&minor_third) {
            ChordQuality::Minor
        } else {
            ChordQuality::Major
        };

        Some(Chord {
            root,
            quality,
            confidence: CHORD_CONFIDENCE,
        })
    }

    pub fn update(&mut self) -> Option<Chord> {
        if let Some(chord) = self.predict() {
            self.current = Some(chord);
        }
        self.current
    }

    pub fn current(&self) -> Option<Chord> {
        self.current
    }

    pub fn clear(&mut self) {
        self.notes.clear();
        self.current = None;
    }
}

/// Tempo from the spacing of recent beats.
#[derive(Debug, Clone)]
pub struct TempoDetector {
    beats: VecDeque<Duration>,
    tempo: f32,
    estimated: bool,
}

impl TempoDetector {
    /// Intervals outside this range (30-300 BPM) are ignored.
    const MIN_INTERVAL: Duration = Duration::from_millis(200);
    const MAX_INTERVAL: Duration = Duration::from_millis(2000);

    pub fn new() -> Self {
        Self {
            beats: VecDeque::with_capacity(HISTORY),
            tempo: DEFAULT_TEMPO_BPM,
            estimated: false,
        }
    }

    /// Records a beat at `time` and returns the updated tempo.
    pub fn record_beat(&mut self, time: Duration) -> f32 {
        if self.beats.len() == HISTORY {
            self.beats.pop_front();
        }
        self.beats.push_back(time);

        let mut total = Duration::ZERO;
        let mut intervals = 0u32;
        for (previous, next) in self.beats.iter().zip(self.beats.iter().skip(1)) {
            let interval = next.saturating_sub(*previous);
            if interval > Self::MIN_INTERVAL && interval < Self::MAX_INTERVAL {
                total += interval;
                intervals += 1;
            }
        }
        if intervals > 0 {
            let mean_ms = total.as_secs_f32() * 1000.0 / intervals as f32;
            self.tempo = 60_000.0 / mean_ms;
            self.estimated = true;
        }
        self.tempo
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    /// Whether the tempo comes from played beats rather than the default.
    pub fn is_estimated(&self) -> bool {
        self.estimated
    }

    pub fn beat_interval(&self) -> Duration {
        if self.tempo <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f32(60.0 / self.tempo)
    }

    pub fn reset(&mut self) {
        self.beats.clear();
        self.tempo = DEFAULT_TEMPO_BPM;
        self.estimated = false;
    }
}

impl Default for TempoDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// A phrase of played notes with the time each arrived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub notes: Vec<u8>,
    pub timings: Vec<Duration>,
}

impl Pattern {
    fn new() -> Self {
        Self {
            notes: Vec::with_capacity(PATTERN_LENGTH),
            timings: Vec::with_capacity(PATTERN_LENGTH),
        }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    fn is_full(&self) -> bool {
        self.notes.len() >= PATTERN_LENGTH
    }

    fn push(&mut self, note: u8, time: Duration) {
        self.notes.push(note);
        self.timings.push(time);
    }

    fn clear(&mut self) {
        self.notes.clear();
        self.timings.clear();
    }

    /// Fraction of positions holding the same note, over the shorter of
    /// the two. Zero when either is empty.
    pub fn similarity(&self, other: &Pattern) -> f32 {
        let len = self.len().min(other.len());
        if len == 0 {
            return 0.0;
        }
        let matches = self
            .notes
            .iter()
            .zip(&other.notes)
            .filter(|(a, b)| a == b)
            .count();
        matches as f32 / len as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternMatch {
    pub slot: usize,
    pub similarity: f32,
}

/// Records phrases while learning and recognises them afterwards.
///
/// Every note lands in a rolling window of the last [`PATTERN_LENGTH`]
/// notes used for recognition. While learning, notes also build the
/// pattern being learned; a full pattern is stored and a new one begins.
#[derive(Debug, Clone)]
pub struct PatternLearner {
    learning: bool,
    current: Pattern,
    recent: VecDeque<u8>,
    learned: Vec<Pattern>,
    next_slot: usize,
}

impl PatternLearner {
    pub fn new() -> Self {
        Self {
            learning: false,
            current: Pattern::new(),
            recent: VecDeque::with_capacity(PATTERN_LENGTH),
            learned: Vec::with_capacity(PATTERN_SLOTS),
            next_slot: 0,
        }
    }

    pub fn start_learning(&mut self) {
        self.learning = true;
        self.current.clear();
    }

    /// Stops learning and stores whatever was recorded. Returns the slot
    /// it went to.
    pub fn stop_learning(&mut self) -> Option<usize> {
        self.learning = false;
        self.store_current()
    }

    pub fn is_learning(&self) -> bool {
        self.learning
    }

    pub fn record_note(&mut self, note: u8, time: Duration) {
        if self.recent.len() == PATTERN_LENGTH {
            self.recent.pop_front();
        }
        self.recent.push_back(note);

        if !self.learning {
            return;
        }
        self.current.push(note, time);
        if self.current.is_full() {
            self.store_current();
        }
    }

    /// Best learned pattern for the notes just played, compared against
    /// as many trailing notes as the pattern holds.
    pub fn recognize(&self) -> Option<PatternMatch> {
        if self.recent.is_empty() {
            return None;
        }
        let mut best: Option<PatternMatch> = None;
        for (slot, pattern) in self.learned.iter().enumerate() {
            let len = pattern.len().min(self.recent.len());
            let tail = Pattern {
                notes: self.recent.iter().skip(self.recent.len() - len).copied().collect(),
                timings: Vec::new(),
            };
            let similarity = tail.similarity(pattern);
            if similarity > 0.0 && best.map_or(true, |b| similarity > b.similarity) {
                best = Some(PatternMatch { slot, similarity });
            }
        }
        best
    }

    pub fn learned(&self, slot: usize) -> Option<&Pattern> {
        self.learned.get(slot)
    }

    pub fn learned_count(&self) -> usize {
        self.learned.len()
    }

    /// The pattern being learned right now.
    pub fn current(&self) -> &Pattern {
        &self.current
    }

    fn store_current(&mut self) -> Option<usize> {
        if self.current.is_empty() {
            return None;
        }
        let pattern = std::mem::replace(&mut self.current, Pattern::new());
        let slot = self.next_slot;
        if slot < self.learned.len() {
            self.learned[slot] = pattern;
        } else {
            self.learned.push(pattern);
        }
        self.next_slot = (slot + 1) % PATTERN_SLOTS;
        debug!(slot, "pattern stored");
        Some(slot)
    }
}

impl Default for PatternLearner {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared on/off switch for pattern learning.
///
/// The engine lives on the inference worker; the switch lets other
/// threads start and stop learning. The engine acts on it at its next step.
#[derive(Debug, Clone, Default)]
pub struct LearningSwitch(Arc<AtomicBool>);

impl LearningSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Which classifiers the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceFeatures {
    pub gesture_recognition: bool,
    pub chord_prediction: bool,
    pub tempo_detection: bool,
    /// Off unless asked for; learning needs a deliberate start anyway.
    pub pattern_learning: bool,
}

impl Default for InferenceFeatures {
    fn default() -> Self {
        Self {
            gesture_recognition: true,
            chord_prediction: true,
            tempo_detection: true,
            pattern_learning: false,
        }
    }
}

/// Runs the enabled classifiers once per inference tick and publishes
/// changes to the event queue.
pub struct InferenceEngine {
    features: InferenceFeatures,
    table: Arc<SensorTable>,
    fusion: SensorFusion,
    events: EventQueue,
    gestures: GestureClassifier,
    chords: ChordPredictor,
    tempo: TempoDetector,
    patterns: PatternLearner,
    learning: LearningSwitch,
    beats: TriggerTracker,
    notes_tx: Sender<u8>,
    notes_rx: Receiver<u8>,
    published_chord: Option<Chord>,
    published_tempo: Option<f32>,
    published_pattern: Option<usize>,
}

impl InferenceEngine {
    pub fn new(table: Arc<SensorTable>, events: EventQueue, features: InferenceFeatures) -> Self {
        let (notes_tx, notes_rx) = channel::bounded(HISTORY * 4);
        let fusion = SensorFusion::new(table.clone());
        info!(?features, "inference engine initialised");
        Self {
            features,
            table,
            fusion,
            events,
            gestures: GestureClassifier::new(),
            chords: ChordPredictor::new(),
            tempo: TempoDetector::new(),
            patterns: PatternLearner::new(),
            learning: LearningSwitch::new(),
            beats: TriggerTracker::new(),
            notes_tx,
            notes_rx,
            published_chord: None,
            published_tempo: None,
            published_pattern: None,
        }
    }

    /// Shares `switch` instead of the engine's own learning switch.
    pub fn with_learning_switch(mut self, switch: LearningSwitch) -> Self {
        self.learning = switch;
        self
    }

    pub fn learning_switch(&self) -> LearningSwitch {
        self.learning.clone()
    }

    /// Sender the audio side uses to report played MIDI notes.
    pub fn note_sender(&self) -> Sender<u8> {
        self.notes_tx.clone()
    }

    pub fn features(&self) -> InferenceFeatures {
        self.features
    }

    pub fn set_features(&mut self, features: InferenceFeatures) {
        info!(?features, "inference features changed");
        self.features = features;
    }

    pub fn step(&mut self) {
        let now = self.table.clock().now();
        let estimates = self.fusion.update();

        if self.features.gesture_recognition {
            self.step_gestures(now);
        }
        if self.features.tempo_detection {
            self.step_tempo(now);
        }

        // Notes are drained even when nothing consumes them so the feed
        // never fills up.
        let notes: Vec<u8> = self.notes_rx.try_iter().collect();
        if self.features.pattern_learning {
            self.step_patterns(&notes, now);
        }
        if self.features.chord_prediction {
            self.step_chords(notes, now);
        }

        if let Some(estimates) = estimates {
            debug!(roll = estimates.roll, pitch = estimates.pitch, "fusion advanced");
        }
    }

    pub fn fusion(&self) -> &SensorFusion {
        &self.fusion
    }

    pub fn gesture(&self) -> Gesture {
        self.gestures.last()
    }

    pub fn chord(&self) -> Option<Chord> {
        self.chords.current()
    }

    pub fn tempo(&self) -> f32 {
        self.tempo.tempo()
    }

    pub fn patterns(&self) -> &PatternLearner {
        &self.patterns
    }

    fn step_gestures(&mut self, now: Duration) {
        let Some(reading) = self.fusion.latest_reading() else {
            return;
        };
        let previous = self.gestures.last();
        let gesture = self.gestures.update(&GestureFeatures::from(&reading));
        if gesture != previous && gesture != Gesture::None {
            self.events.publish(MusicEvent::GestureRecognized {
                timestamp: now,
                gesture,
                confidence: self.gestures.confidence(),
            });
        }
    }

    fn step_tempo(&mut self, now: Duration) {
        for sample in self.table.samples_of(Technology::Contact) {
            if self.beats.fresh(&sample) {
                if let Some(time) = sample.last_trigger_time {
                    self.tempo.record_beat(time);
                }
            }
        }

        if !self.tempo.is_estimated() {
            return;
        }
        let bpm = self.tempo.tempo();
        let changed = self
            .published_tempo
            .map_or(true, |last| (last - bpm).abs() >= 1.0);
        if changed {
            self.published_tempo = Some(bpm);
            self.events.publish(MusicEvent::TempoDetected { timestamp: now, bpm });
        }
    }

    fn step_patterns(&mut self, notes: &[u8], now: Duration) {
        let wanted = self.learning.is_on();
        if wanted != self.patterns.is_learning() {
            if wanted {
                self.patterns.start_learning();
                info!("pattern learning started");
            } else {
                let slot = self.patterns.stop_learning();
                info!(?slot, "pattern learning stopped");
            }
        }

        if notes.is_empty() {
            return;
        }
        for &note in notes {
            self.patterns.record_note(note, now);
        }
        if self.patterns.is_learning() {
            return;
        }

        match self.patterns.recognize() {
            Some(found) if found.similarity >= MIN_PATTERN_SIMILARITY => {
                if self.published_pattern != Some(found.slot) {
                    self.published_pattern = Some(found.slot);
                    self.events.publish(MusicEvent::PatternRecognized {
                        timestamp: now,
                        slot: found.slot as u8,
                        similarity: found.similarity,
                    });
                }
            }
            _ => self.published_pattern = None,
        }
    }

    fn step_chords(&mut self, notes: Vec<u8>, now: Duration) {
        if notes.is_empty() {
            return;
        }
        for note in notes {
            self.chords.add_played_note(note);
        }
        let chord = self.chords.update();
        if chord.is_some() && chord != self.published_chord {
            self.published_chord = chord;
            if let Some(chord) = chord {
                self.events.publish(MusicEvent::ChordDetected { timestamp: now, chord });
            }
        }
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("features", &self.features)
            .field("gesture", &self.gestures.last())
            .field("tempo", &self.tempo.tempo())
            .field("learning", &self.patterns.is_learning())
            .finish_non_exhaustive()
    }
}
