//! Rate window and running statistics

use std::time::{Duration, Instant};

use crate::core::RingBuffer;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    at: Option<Instant>,
    bytes: u32,
}

/// Timestamped byte counts over a fixed window of recent messages.
#[derive(Debug, Clone)]
pub struct Sampler {
    window: RingBuffer<Sample>,
    total_bytes: u64,
    total_messages: u64,
}

impl Sampler {
    /// # Panics
    /// Panics if `window == 0`.
    pub fn new(window: usize) -> Self {
        Self {
            window: RingBuffer::new(window),
            total_bytes: 0,
            total_messages: 0,
        }
    }

    pub fn add(&mut self, bytes: usize) {
        self.add_at(Instant::now(), bytes);
    }

    pub fn add_at(&mut self, at: Instant, bytes: usize) {
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        self.window.push(Sample {
            at: Some(at),
            bytes,
        });
        self.total_bytes += u64::from(bytes);
        self.total_messages += 1;
    }

    /// Time between the oldest and newest sample in the window.
    pub fn span(&self) -> Duration {
        match (self.window.oldest(), self.window.newest()) {
            (Some(Sample { at: Some(a), .. }), Some(Sample { at: Some(b), .. })) => b.saturating_duration_since(a),
            _ => Duration::ZERO,
        }
    }

    /// Bytes per second over the window. The oldest sample only marks the
    /// window start; its bytes are not counted.
    pub fn bytes_per_sec(&self) -> f64 {
        let span = self.span().as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let bytes: u64 = self.window.iter().skip(1).map(|s| u64::from(s.bytes)).sum();
        bytes as f64 / span
    }

    pub fn messages_per_sec(&self) -> f64 {
        let span = self.span().as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.window.len() - 1) as f64 / span
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.total_bytes = 0;
        self.total_messages = 0;
    }
}

/// Count, min, max and sum of observed sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub sum: u64,
}

impl Stat {
    pub fn add(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }
}
