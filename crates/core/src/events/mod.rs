//! Bounded multi-producer multi-consumer queue of musical events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::drivers::ChannelId;
use crate::inference::{Chord, Gesture};

pub const DEFAULT_EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MusicEvent {
    SensorTriggered {
        timestamp: Duration,
        channel_id: ChannelId,
        value: f32,
        velocity: f32,
    },
    NotePlayed {
        timestamp: Duration,
        track_id: u8,
        note_id: u8,
        velocity: f32,
    },
    NoteStopped {
        timestamp: Duration,
        track_id: u8,
        note_id: u8,
    },
    GestureRecognized {
        timestamp: Duration,
        gesture: Gesture,
        confidence: f32,
    },
    ChordDetected {
        timestamp: Duration,
        chord: Chord,
    },
    TempoDetected {
        timestamp: Duration,
        bpm: f32,
    },
    /// The latest phrase resembles a learned pattern.
    PatternRecognized {
        timestamp: Duration,
        slot: u8,
        similarity: f32,
    },
    ConfigChanged {
        timestamp: Duration,
        key: String,
    },
    SystemError {
        timestamp: Duration,
        message: String,
    },
}

impl MusicEvent {
    pub fn timestamp(&self) -> Duration {
        match self {
            MusicEvent::SensorTriggered { timestamp, .. }
            | MusicEvent::NotePlayed { timestamp, .. }
            | MusicEvent::NoteStopped { timestamp, .. }
            | MusicEvent::GestureRecognized { timestamp, .. }
            | MusicEvent::ChordDetected { timestamp, .. }
            | MusicEvent::TempoDetected { timestamp, .. }
            | MusicEvent::PatternRecognized { timestamp, .. }
            | MusicEvent::ConfigChanged { timestamp, .. }
            | MusicEvent::SystemError { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MusicEvent::SensorTriggered { .. } => "sensor_triggered",
            MusicEvent::NotePlayed { .. } => "note_played",
            MusicEvent::NoteStopped { .. } => "note_stopped",
            MusicEvent::GestureRecognized { .. } => "gesture_recognized",
            MusicEvent::ChordDetected { .. } => "chord_detected",
            MusicEvent::TempoDetected { .. } => "tempo_detected",
            MusicEvent::PatternRecognized { .. } => "pattern_recognized",
            MusicEvent::ConfigChanged { .. } => "config_changed",
            MusicEvent::SystemError { .. } => "system_error",
        }
    }
}

/// Cloneable handle to one shared event queue.
///
/// Publishing never blocks: a full queue drops the new event and counts it.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<MusicEvent>,
    rx: Receiver<MusicEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues `event`. Returns `false` if the queue was full.
    pub fn publish(&self, event: MusicEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(kind = event.kind(), dropped, "event queue full, event dropped");
                false
            }
        }
    }

    /// Waits at most `timeout` for the next event.
    pub fn subscribe(&self, timeout: Duration) -> Option<MusicEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_next(&self) -> Option<MusicEvent> {
        self.rx.try_recv().ok()
    }

    /// Takes every event queued right now.
    pub fn drain(&self) -> Vec<MusicEvent> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn clear(&self) {
        let cleared = self.rx.try_iter().count();
        if cleared > 0 {
            debug!(cleared, "event queue cleared");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn tempo(bpm: f32) -> MusicEvent {
        MusicEvent::TempoDetected {
            timestamp: Duration::from_millis(5),
            bpm,
        }
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let queue = EventQueue::new(2);
        assert!(queue.publish(tempo(100.0)));
        assert!(queue.publish(tempo(110.0)));
        assert!(!queue.publish(tempo(120.0)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_next(), Some(tempo(100.0)));
    }

    #[test]
    fn subscribe_times_out_on_empty_queue() {
        let queue = EventQueue::default();
        assert_eq!(queue.capacity(), DEFAULT_EVENT_CAPACITY);
        assert!(queue.subscribe(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn clones_share_the_queue_across_threads() {
        let queue = EventQueue::default();
        let producer = queue.clone();
        thread::spawn(move || {
            producer.publish(tempo(90.0));
        })
        .join()
        .unwrap();

        assert_eq!(queue.subscribe(Duration::from_millis(100)), Some(tempo(90.0)));
    }

    #[test]
    fn clear_and_drain_empty_the_queue() {
        let queue = EventQueue::default();
        for bpm in [60.0, 70.0, 80.0] {
            queue.publish(tempo(bpm));
        }
        assert_eq!(queue.drain().len(), 3);

        queue.publish(tempo(1.0));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn events_serialise_with_a_type_tag() {
        let event = MusicEvent::NotePlayed {
            timestamp: Duration::from_millis(1),
            track_id: 0,
            note_id: 40,
            velocity: 0.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "note_played");
        assert_eq!(json["note_id"], 40);
        assert_eq!(event.kind(), "note_played");
        assert_eq!(event.timestamp(), Duration::from_millis(1));
    }
}
