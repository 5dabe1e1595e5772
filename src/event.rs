//! Raw MIDI event and per-cycle event buffer types.

use crate::{Error, Result};

/// Timing identity of one audio cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeCode {
    /// Frame time at which the cycle starts.
    pub start: u64,
    /// Length of the cycle in frames.
    pub duration: u64,
}

impl TimeCode {
    pub fn new(start: u64, duration: u64) -> Self {
        Self { start, duration }
    }
}

/// A raw MIDI event positioned within one audio cycle.
///
/// `frame` is the offset from the cycle's `time_code.start` in frames.
/// Short channel messages carry up to three bytes; `len` gives the number
/// of meaningful bytes in `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub frame: u32,
    pub len: u8,
    pub data: [u8; 3],
}

impl MidiEvent {
    pub fn new(frame: u32, data: [u8; 3]) -> Self {
        Self {
            frame,
            len: 3,
            data,
        }
    }

    pub fn with_len(frame: u32, len: u8, data: [u8; 3]) -> Self {
        debug_assert!((1..=3).contains(&len));
        Self { frame, len, data }
    }

    /// Status byte (first data byte).
    #[inline]
    pub fn status(&self) -> u8 {
        self.data[0]
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Bounded per-cycle event storage shared between the two halves of a
/// port's cycle.
///
/// The native half of an input port fills it from the server; the host
/// half reads it. On output ports the roles are swapped. Capacity is
/// fixed at construction; overflowing it is a [`Error::CapacityExceeded`]
/// fault of the cycle that produced it.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<MidiEvent>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Appends one event; fails once the cycle capacity is reached.
    pub fn push(&mut self, event: MidiEvent) -> Result<()> {
        if self.events.len() >= self.capacity {
            return Err(Error::CapacityExceeded("midi events per cycle"));
        }
        self.events.push(event);
        Ok(())
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    /// Verifies that frame offsets never go backwards, as required by the
    /// server's write API.
    pub fn check_ordered(&self) -> Result<()> {
        let mut offset = 0u32;
        for event in &self.events {
            if event.frame < offset {
                return Err(Error::OutOfOrderEvent { frame: event.frame });
            }
            offset = event.frame;
        }
        Ok(())
    }
}
