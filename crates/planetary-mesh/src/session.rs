//! Ordered delivery for interactive job streams.
//!
//! Each (announcement, direction) stream carries sequence numbers starting at
//! zero. The receiver delivers in order, buffers what arrives early and drops
//! duplicates. When the buffer grows past its limit, or its oldest entry has
//! waited too long, the missing range is reported as a gap and delivery
//! resumes from the lowest buffered sequence number.

use crate::types::InteractiveMessage;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Originator to executor
    Input,
    /// Executor to originator
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Deliver {
        direction: Direction,
        message: InteractiveMessage,
    },
    /// Sequence numbers `missing_from..resumed_at` never arrived
    MissingSequenceGap {
        announcement_id: String,
        direction: Direction,
        missing_from: u64,
        resumed_at: u64,
    },
}

#[derive(Debug)]
struct SequenceTracker {
    direction: Direction,
    next_expected: u64,
    buffer: BTreeMap<u64, (InteractiveMessage, Instant)>,
}

impl SequenceTracker {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            next_expected: 0,
            buffer: BTreeMap::new(),
        }
    }

    fn accept(&mut self, message: InteractiveMessage, now: Instant, limit: usize) -> Vec<SessionEvent> {
        let seq = message.sequence_number;
        if seq < self.next_expected || self.buffer.contains_key(&seq) {
            return Vec::new();
        }
        let announcement_id = message.announcement_id.clone();
        let mut events = Vec::new();
        if seq == self.next_expected {
            self.next_expected += 1;
            events.push(SessionEvent::Deliver {
                direction: self.direction,
                message,
            });
            self.drain(&mut events);
        } else {
            self.buffer.insert(seq, (message, now));
            if self.buffer.len() > limit {
                self.skip_gap(&announcement_id, &mut events);
            }
        }
        events
    }

    fn tick(&mut self, announcement_id: &str, now: Instant, max_wait: Duration) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let oldest = self.buffer.values().map(|(_, at)| *at).min();
        if let Some(oldest) = oldest {
            if now.saturating_duration_since(oldest) >= max_wait {
                self.skip_gap(announcement_id, &mut events);
            }
        }
        events
    }

    fn skip_gap(&mut self, announcement_id: &str, events: &mut Vec<SessionEvent>) {
        if let Some(&lowest) = self.buffer.keys().next() {
            events.push(SessionEvent::MissingSequenceGap {
                announcement_id: announcement_id.to_string(),
                direction: self.direction,
                missing_from: self.next_expected,
                resumed_at: lowest,
            });
            self.next_expected = lowest;
            self.drain(events);
        }
    }

    fn drain(&mut self, events: &mut Vec<SessionEvent>) {
        while let Some((message, _)) = self.buffer.remove(&self.next_expected) {
            self.next_expected += 1;
            events.push(SessionEvent::Deliver {
                direction: self.direction,
                message,
            });
        }
    }
}

/// Inbound ordering and outbound numbering for every interactive stream on
/// a node
#[derive(Debug)]
pub struct SessionRelay {
    buffer_limit: usize,
    max_wait: Duration,
    inbound: HashMap<(String, Direction), SequenceTracker>,
    outbound: HashMap<(String, Direction), u64>,
}

impl SessionRelay {
    pub fn new(buffer_limit: usize, max_wait: Duration) -> Self {
        Self {
            buffer_limit: buffer_limit.max(1),
            max_wait,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    /// Sequence number for the next outgoing message on a stream.
    pub fn next_sequence(&mut self, announcement_id: &str, direction: Direction) -> u64 {
        let counter = self
            .outbound
            .entry((announcement_id.to_string(), direction))
            .or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }

    pub fn receive(&mut self, direction: Direction, message: InteractiveMessage, now: Instant) -> Vec<SessionEvent> {
        let limit = self.buffer_limit;
        self.inbound
            .entry((message.announcement_id.clone(), direction))
            .or_insert_with(|| SequenceTracker::new(direction))
            .accept(message, now, limit)
    }

    /// Surface gaps whose wait bound has passed.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        let max_wait = self.max_wait;
        self.inbound
            .iter_mut()
            .flat_map(|((announcement_id, _), tracker)| tracker.tick(announcement_id, now, max_wait))
            .collect()
    }

    /// Forget both directions of a finished job.
    pub fn close(&mut self, announcement_id: &str) {
        self.inbound.retain(|(id, _), _| id != announcement_id);
        self.outbound.retain(|(id, _), _| id != announcement_id);
    }

    pub fn open_streams(&self) -> usize {
        self.inbound.len()
    }
}
