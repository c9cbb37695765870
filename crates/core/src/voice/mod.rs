//! Fixed-capacity polyphonic voice allocator.
//!
//! The pool has a single owner, the audio worker, and takes no lock. Other
//! contexts reach it through [`crate::workers::AudioCommand`]s. Sharing it
//! directly between threads needs a lock equivalent to the sensor table's.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::{BitesError, Result};

pub const DEFAULT_VOICE_CAPACITY: usize = 16;
pub const DEFAULT_TRACK_COUNT: u8 = 8;
/// Highest MIDI note number.
pub const MAX_NOTE: u8 = 127;

/// One playback slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub active: bool,
    pub track_id: u8,
    pub note_id: u8,
    /// Normalised to [0, 1].
    pub velocity: f32,
    pub start_time: Duration,
}

impl Voice {
    fn matches(&self, track_id: u8, note_id: u8) -> bool {
        self.active && self.track_id == track_id && self.note_id == note_id
    }
}

/// How a successful [`VoicePool::play_note`] was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// A free slot was claimed.
    Allocated(usize),
    /// The pair was already sounding; its start time was refreshed.
    Retriggered(usize),
}

impl PlayOutcome {
    pub fn slot(self) -> usize {
        match self {
            PlayOutcome::Allocated(slot) | PlayOutcome::Retriggered(slot) => slot,
        }
    }
}

pub struct VoicePool {
    voices: Box<[Voice]>,
    tracks: u8,
    volume: f32,
    clock: SharedClock,
}

impl VoicePool {
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        Self {
            voices: vec![Voice::default(); capacity].into_boxed_slice(),
            tracks: DEFAULT_TRACK_COUNT,
            volume: 1.0,
            clock,
        }
    }

    pub fn with_tracks(mut self, tracks: u8) -> Self {
        self.tracks = tracks;
        self
    }

    /// Starts `(track_id, note_id)`, or retriggers it if it is already
    /// sounding. A full pool rejects the note; no voice is evicted.
    pub fn play_note(&mut self, track_id: u8, note_id: u8, velocity: f32) -> Result<PlayOutcome> {
        self.check_ids(track_id, note_id)?;
        let now = self.clock.now();
        let velocity = velocity.clamp(0.0, 1.0);

        if let Some(slot) = self.find(track_id, note_id) {
            let voice = &mut self.voices[slot];
            voice.start_time = now;
            voice.velocity = velocity;
            debug!(track = track_id, note = note_id, slot, "voice retriggered");
            return Ok(PlayOutcome::Retriggered(slot));
        }

        let Some(slot) = self.voices.iter().position(|voice| !voice.active) else {
            warn!(track = track_id, note = note_id, "voices exhausted");
            return Err(BitesError::VoicesExhausted);
        };
        self.voices[slot] = Voice {
            active: true,
            track_id,
            note_id,
            velocity,
            start_time: now,
        };
        debug!(track = track_id, note = note_id, slot, velocity, "voice allocated");
        Ok(PlayOutcome::Allocated(slot))
    }

    /// Releases the matching voice. Returns `false` if nothing was sounding.
    pub fn stop_note(&mut self, track_id: u8, note_id: u8) -> bool {
        if self.check_ids(track_id, note_id).is_err() {
            return false;
        }
        match self.find(track_id, note_id) {
            Some(slot) => {
                self.voices[slot] = Voice::default();
                debug!(track = track_id, note = note_id, slot, "voice released");
                true
            }
            None => false,
        }
    }

    /// Releases every voice and returns how many were sounding.
    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for voice in self.voices.iter_mut().filter(|voice| voice.active) {
            *voice = Voice::default();
            stopped += 1;
        }
        if stopped > 0 {
            debug!(stopped, "all voices released");
        }
        stopped
    }

    pub fn is_playing(&self, track_id: u8, note_id: u8) -> bool {
        self.find(track_id, note_id).is_some()
    }

    /// Number of voices sounding on `track_id`.
    pub fn active_count(&self, track_id: u8) -> usize {
        if track_id >= self.tracks {
            warn!(track = track_id, "invalid track id");
            return 0;
        }
        self.voices
            .iter()
            .filter(|voice| voice.active && voice.track_id == track_id)
            .count()
    }

    pub fn total_active(&self) -> usize {
        self.voices.iter().filter(|voice| voice.active).count()
    }

    pub fn capacity(&self) -> usize {
        self.voices.len()
    }

    pub fn tracks(&self) -> u8 {
        self.tracks
    }

    pub fn active_voices(&self) -> impl Iterator<Item = &Voice> + '_ {
        self.voices.iter().filter(|voice| voice.active)
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    fn find(&self, track_id: u8, note_id: u8) -> Option<usize> {
        self.voices
            .iter()
            .position(|voice| voice.matches(track_id, note_id))
    }

    fn check_ids(&self, track_id: u8, note_id: u8) -> Result<()> {
        if track_id >= self.tracks {
            warn!(track = track_id, "invalid track id");
            return Err(BitesError::InvalidTrack(track_id));
        }
        if note_id > MAX_NOTE {
            warn!(note = note_id, "invalid note id");
            return Err(BitesError::InvalidNote(note_id));
        }
        Ok(())
    }
}

impl std::fmt::Debug for VoicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoicePool")
            .field("capacity", &self.capacity())
            .field("active", &self.total_active())
            .field("tracks", &self.tracks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    fn pool(capacity: usize) -> (VoicePool, ManualClock) {
        let clock = ManualClock::new();
        (VoicePool::new(capacity, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn small_pool_rejects_then_reuses_freed_slot() {
        let (mut pool, _) = pool(2);

        pool.play_note(0, 60, 1.0).unwrap();
        pool.play_note(0, 64, 1.0).unwrap();
        assert!(matches!(pool.play_note(0, 67, 1.0), Err(BitesError::VoicesExhausted)));

        assert!(pool.stop_note(0, 60));
        assert_eq!(pool.play_note(0, 67, 1.0).unwrap(), PlayOutcome::Allocated(0));
        assert!(pool.is_playing(0, 64));
        assert!(pool.is_playing(0, 67));
    }

    #[test]
    fn exhaustion_leaves_existing_voices_untouched() {
        let (mut pool, clock) = pool(DEFAULT_VOICE_CAPACITY);
        for note in 0..DEFAULT_VOICE_CAPACITY as u8 {
            clock.advance(Duration::from_millis(1));
            pool.play_note(1, 40 + note, 0.5).unwrap();
        }
        let before: Vec<Voice> = pool.active_voices().copied().collect();

        assert!(pool.play_note(1, 100, 0.5).is_err());
        let after: Vec<Voice> = pool.active_voices().copied().collect();
        assert_eq!(before, after);
        assert_eq!(pool.active_count(1), DEFAULT_VOICE_CAPACITY);
    }

    #[test]
    fn replaying_a_pair_retriggers_instead_of_allocating() {
        let (mut pool, clock) = pool(4);
        assert_eq!(pool.play_note(2, 50, 0.3).unwrap(), PlayOutcome::Allocated(0));

        clock.advance(Duration::from_millis(25));
        assert_eq!(pool.play_note(2, 50, 0.9).unwrap(), PlayOutcome::Retriggered(0));

        let voice = pool.active_voices().next().copied().unwrap();
        assert_eq!(voice.start_time, Duration::from_millis(25));
        assert_eq!(voice.velocity, 0.9);
        assert_eq!(pool.total_active(), 1);
    }

    #[test]
    fn active_pairs_stay_unique_under_mixed_calls() {
        let (mut pool, _) = pool(6);
        // Deterministic pseudo-random sequence over a small id space.
        let mut state = 0x2545_f491u32;
        for _ in 0..2_000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let track = (state % 3) as u8;
            let note = 60 + ((state >> 8) % 5) as u8;
            if state & 0x100 == 0 {
                let _ = pool.play_note(track, note, 1.0);
            } else {
                pool.stop_note(track, note);
            }

            let mut seen = HashSet::new();
            for voice in pool.active_voices() {
                assert!(seen.insert((voice.track_id, voice.note_id)));
            }
        }
    }

    #[test]
    fn invalid_ids_are_rejected_or_neutral() {
        let (mut pool, _) = pool(4);
        assert!(matches!(pool.play_note(8, 60, 1.0), Err(BitesError::InvalidTrack(8))));
        assert!(matches!(pool.play_note(0, 128, 1.0), Err(BitesError::InvalidNote(128))));
        assert!(!pool.stop_note(9, 60));
        assert_eq!(pool.active_count(12), 0);
        assert!(!pool.is_playing(0, 60));
    }

    #[test]
    fn stop_all_clears_every_track() {
        let (mut pool, _) = pool(4);
        pool.play_note(0, 40, 1.0).unwrap();
        pool.play_note(3, 41, 1.0).unwrap();
        assert_eq!(pool.stop_all(), 2);
        assert_eq!(pool.total_active(), 0);
        assert!(!pool.stop_note(0, 40));
    }
}
