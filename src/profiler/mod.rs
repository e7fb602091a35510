//! Network profiler
//!
//! Sliding-window send/receive rates plus per-message-kind size statistics.
//! Frames are classified by peeking their header with a scratch reader, so
//! classification only sees production-mode (no debug header) payloads
//! precisely; anything unreadable is filed under its message id alone.

mod sampler;

pub use sampler::{Sampler, Stat};

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::core::{KindTable, TypeTag};
use crate::protocol::{BinaryReader, MessageId, Reader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Bucket of the bandwidth breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatKey {
    pub direction: Direction,
    pub msg: u8,
    pub tag: TypeTag,
    pub substate: Option<u8>,
}

/// Current window rates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub sent_bytes_per_sec: f64,
    pub sent_messages_per_sec: f64,
    pub received_bytes_per_sec: f64,
    pub received_messages_per_sec: f64,
}

#[derive(Debug)]
struct ProfilerState {
    sent: Sampler,
    received: Sampler,
    stats: HashMap<StatKey, Stat>,
}

/// Shared by every connection of a session.
#[derive(Debug)]
pub struct NetworkProfiler {
    enabled: AtomicBool,
    kinds: KindTable,
    state: Mutex<ProfilerState>,
}

impl NetworkProfiler {
    /// Starts enabled. `window` is clamped to at least two samples.
    pub fn new(window: usize, kinds: KindTable) -> Self {
        let window = window.max(2);
        Self {
            enabled: AtomicBool::new(true),
            kinds,
            state: Mutex::new(ProfilerState {
                sent: Sampler::new(window),
                received: Sampler::new(window),
                stats: HashMap::new(),
            }),
        }
    }

    pub fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_sent(&self, frame: &[u8]) {
        self.record(Direction::Sent, frame);
    }

    #[inline]
    pub fn record_received(&self, frame: &[u8]) {
        self.record(Direction::Received, frame);
    }

    fn record(&self, direction: Direction, frame: &[u8]) {
        if !self.is_enabled() || frame.is_empty() {
            return;
        }
        let key = self.classify(direction, frame);
        let mut state = self.state.lock();
        match direction {
            Direction::Sent => state.sent.add(frame.len()),
            Direction::Received => state.received.add(frame.len()),
        }
        state.stats.entry(key).or_default().add(frame.len() as u64);
    }

    fn classify(&self, direction: Direction, frame: &[u8]) -> StatKey {
        let msg = frame[0];
        let mut key = StatKey {
            direction,
            msg,
            tag: TypeTag::NONE,
            substate: None,
        };
        let replicated = matches!(
            MessageId::from_u8(msg),
            Some(
                MessageId::ObjectCreate
                    | MessageId::ObjectUpdate
                    | MessageId::ObjectDestroy
                    | MessageId::SubstateUpdate
            )
        );
        if replicated {
            if let Ok(header) = BinaryReader::new(frame).with_kinds(self.kinds).read_message_header() {
                key.tag = header.nid.tag();
                key.substate = header.substate.map(|s| s.id);
            }
        }
        key
    }

    pub fn rates(&self) -> Rates {
        let state = self.state.lock();
        Rates {
            sent_bytes_per_sec: state.sent.bytes_per_sec(),
            sent_messages_per_sec: state.sent.messages_per_sec(),
            received_bytes_per_sec: state.received.bytes_per_sec(),
            received_messages_per_sec: state.received.messages_per_sec(),
        }
    }

    /// `(sent, received)` byte totals since the last reset.
    pub fn totals(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.sent.total_bytes(), state.received.total_bytes())
    }

    /// Breakdown sorted by key.
    pub fn stats(&self) -> Vec<(StatKey, Stat)> {
        let mut rows: Vec<_> = self
            .state
            .lock()
            .stats
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        rows.sort_by_key(|(k, _)| *k);
        rows
    }

    /// Start a new profiling session.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.sent.reset();
        state.received.reset();
        state.stats.clear();
    }

    /// Bandwidth breakdown, one row per bucket.
    pub fn report_csv(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "direction,message,type,substate,count,min,max,sum,avg")?;
        for (key, stat) in self.stats() {
            let message = MessageId::from_u8(key.msg)
                .map(|m| m.name().to_owned())
                .unwrap_or_else(|| key.msg.to_string());
            let kind = match key.tag {
                TypeTag::NONE => String::new(),
                tag => self
                    .kinds
                    .name(tag)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("#{}", tag.0)),
            };
            let substate = key.substate.map(|s| s.to_string()).unwrap_or_default();
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{:.1}",
                key.direction.name(),
                message,
                kind,
                substate,
                stat.count,
                stat.min,
                stat.max,
                stat.sum,
                stat.avg()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{KindInfo, Nid};
    use crate::protocol::{BinaryWriter, MessageHeader, Writer};

    const ARMY: TypeTag = TypeTag(2);
    static ROWS: [KindInfo; 1] = [KindInfo::new(ARMY, "Army", false)];
    static KINDS: KindTable = KindTable::new(&ROWS);

    fn update(len: usize) -> Vec<u8> {
        let header = MessageHeader::new(MessageId::ObjectUpdate, Nid::new(ARMY, 0, 5).unwrap());
        let mut w = BinaryWriter::new().with_kinds(KINDS);
        w.write_message_header(&header).unwrap();
        w.write_bytes("body", &vec![0u8; len]).unwrap();
        w.into_bytes()
    }

    #[test]
    fn test_breakdown_by_type() {
        let profiler = NetworkProfiler::new(16, KINDS);
        profiler.record_sent(&update(10));
        profiler.record_sent(&update(30));
        profiler.record_received(&[MessageId::Ping as u8, 1]);

        let stats = profiler.stats();
        assert_eq!(stats.len(), 2);
        let (key, stat) = stats[0];
        assert_eq!(key.direction, Direction::Sent);
        assert_eq!(key.tag, ARMY);
        assert_eq!(stat.count, 2);
        assert_eq!(stat.max - stat.min, 20);
        assert_eq!(stats[1].0.tag, TypeTag::NONE);

        let mut csv = Vec::new();
        profiler.report_csv(&mut csv).unwrap();
        let csv = String::from_utf8(csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("sent,ObjectUpdate,Army,,2,"));
        assert!(lines[2].starts_with("received,Ping,,,1,2,2,2,"));
    }

    #[test]
    fn test_disabled_records_nothing() {
        let profiler = NetworkProfiler::new(16, KINDS);
        profiler.enable(false);
        profiler.record_sent(&update(1));
        assert!(profiler.stats().is_empty());

        profiler.enable(true);
        profiler.record_sent(&update(1));
        profiler.reset();
        assert_eq!(profiler.totals(), (0, 0));
    }
}
