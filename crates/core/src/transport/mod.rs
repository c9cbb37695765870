//! Outbound delivery of musical events.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::events::MusicEvent;
use crate::Result;

/// A sink for events leaving the instrument (network, Bluetooth, logs).
pub trait Transport: Send {
    fn name(&self) -> &str;

    fn deliver(&mut self, event: &MusicEvent) -> Result<()>;

    /// Housekeeping for the link, run once per network tick.
    fn service(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes each event to the log as JSON.
#[derive(Debug, Default)]
pub struct LogTransport {
    delivered: u64,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl Transport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&mut self, event: &MusicEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.delivered += 1;
        info!(transport = "log", kind = event.kind(), event = %json, "event");
        Ok(())
    }
}

/// Keeps delivered events in memory for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    events: Arc<Mutex<Vec<MusicEvent>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events delivered so far. Clones share the same record.
    pub fn events(&self) -> Vec<MusicEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    fn deliver(&mut self, event: &MusicEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn error_event() -> MusicEvent {
        MusicEvent::SystemError {
            timestamp: Duration::from_secs(1),
            message: "inertial unit lost".to_string(),
        }
    }

    #[test]
    fn log_transport_counts_deliveries() {
        let mut transport = LogTransport::new();
        transport.deliver(&error_event()).unwrap();
        transport.service().unwrap();
        assert_eq!(transport.delivered(), 1);
        assert_eq!(transport.name(), "log");
    }

    #[test]
    fn recording_clones_share_history() {
        let recorder = RecordingTransport::new();
        let mut boxed: Box<dyn Transport> = Box::new(recorder.clone());
        boxed.deliver(&error_event()).unwrap();
        assert_eq!(recorder.events(), vec![error_event()]);
    }
}
