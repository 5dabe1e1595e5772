//! Engine configuration.

use crate::{Error, Result};
use std::time::Duration;

/// Configuration for a midilink session and its port chain.
///
/// The timeouts exist to surface deadlocks as errors instead of silent
/// freezes; the defaults match the granularity of an audio cycle
/// (hundreds of microseconds to a few milliseconds).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Slot capacity of the port chain, including the two control ports.
    pub max_ports: usize,
    /// Bound on administrative state-mutex acquisition.
    pub state_lock_timeout: Duration,
    /// Bound on rendezvous condition waits inside the worker halves.
    pub max_waiting_time: Duration,
    /// Bound on guarded-slot insert/remove waits.
    pub slot_timeout: Duration,
    /// Per-cycle MIDI event capacity of the concrete I/O ports.
    pub max_midi_events: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_ports: 512,
            state_lock_timeout: Duration::from_secs(10),
            max_waiting_time: Duration::from_millis(500),
            slot_timeout: Duration::from_millis(500),
            max_midi_events: 255,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_ports < 3 {
            return Err(Error::InvalidConfig(format!(
                "max_ports {} leaves no room for user ports (two slots are reserved)",
                self.max_ports
            )));
        }
        if self.max_midi_events == 0 {
            return Err(Error::InvalidConfig(
                "max_midi_events must be at least 1".to_string(),
            ));
        }
        if self.max_waiting_time.is_zero() || self.slot_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "wait bounds must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.max_ports, 512);
        assert_eq!(config.max_midi_events, 255);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_chain() {
        let config = LinkConfig {
            max_ports: 2,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
