//! Framing send pump
//!
//! `send` appends `[var length][payload]` to the tail of a queue of pooled
//! buffers; small frames share a buffer, large ones span several. The pump
//! hands one buffer at a time to the [`FrameSink`] and waits for
//! [`AsyncSender::on_sent`] before handing over the next: at most one
//! transport write is outstanding, any number of buffers may be queued.
//!
//! Completion may arrive synchronously inside `transmit` or later from
//! another thread; both paths go through the same lock.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::core::{Buffer, BufferPool};
use crate::protocol::varint;

/// Where the pump delivers buffers.
pub trait FrameSink: Send + Sync {
    /// Start a transport write of `buffer`'s bytes.
    ///
    /// The sink must eventually hand the buffer back through
    /// [`AsyncSender::on_sent`], either before returning or from another
    /// thread.
    fn transmit(&self, sender: &AsyncSender, buffer: Buffer);

    /// Partial sends are only reported while connected.
    fn is_connected(&self) -> bool;
}

/// Pump counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub frames: u64,
    pub queued_buffers: usize,
    pub writes_started: u64,
    pub writes_completed: u64,
    pub partial_sends: u64,
    pub in_flight: bool,
}

#[derive(Debug, Default)]
struct SendState {
    queue: VecDeque<Buffer>,
    sending: bool,
    /// A thread is inside the pump loop
    pumping: bool,
    frames: u64,
    writes_started: u64,
    writes_completed: u64,
    partial_sends: u64,
}

/// Frames payloads into pooled buffers and pumps them single-flight.
#[derive(Debug)]
pub struct AsyncSender {
    pool: Arc<BufferPool>,
    state: Mutex<SendState>,
}

impl AsyncSender {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(SendState::default()),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Frame `data` and start pumping. Fire-and-forget.
    pub fn send(&self, data: &[u8], sink: &dyn FrameSink) {
        {
            let mut state = self.state.lock();
            self.enqueue_frame(&mut state.queue, data);
            state.frames += 1;
        }
        self.send_messages(sink);
    }

    fn enqueue_frame(&self, queue: &mut VecDeque<Buffer>, data: &[u8]) {
        let (prefix, prefix_len) = varint::encode_u32(data.len() as u32);

        let mut tail = queue.pop_back().unwrap_or_else(|| self.pool.get_buffer());
        // Prefer starting a prefix where at least two bytes fit
        if tail.remaining() < 2 && !tail.is_empty() {
            queue.push_back(tail);
            tail = self.pool.get_buffer();
        }

        for &byte in &prefix[..prefix_len] {
            if !tail.push(byte) {
                queue.push_back(tail);
                tail = self.pool.get_buffer();
                tail.push(byte);
            }
        }

        let mut rest = data;
        loop {
            let copied = tail.extend_from(rest);
            rest = &rest[copied..];
            if rest.is_empty() {
                break;
            }
            queue.push_back(tail);
            tail = self.pool.get_buffer();
        }
        queue.push_back(tail);
    }

    /// Hand the head buffer to `sink` if no write is outstanding.
    pub fn send_messages(&self, sink: &dyn FrameSink) {
        {
            let mut state = self.state.lock();
            if state.pumping {
                return;
            }
            state.pumping = true;
        }

        loop {
            let buffer = {
                let mut state = self.state.lock();
                if state.sending {
                    state.pumping = false;
                    return;
                }
                match state.queue.pop_front() {
                    Some(buffer) => {
                        state.sending = true;
                        state.writes_started += 1;
                        buffer
                    }
                    None => {
                        state.pumping = false;
                        return;
                    }
                }
            };
            trace!(seq = buffer.seq(), len = buffer.len(), "transmitting buffer");
            sink.transmit(self, buffer);
        }
    }

    /// Transport completion for the in-flight buffer.
    ///
    /// `sent_len` below the buffer's length while the sink is connected is a
    /// transport failure; it is logged and not retried.
    pub fn on_sent(&self, buffer: Buffer, sent_len: usize, sink: &dyn FrameSink) {
        {
            let mut state = self.state.lock();
            state.sending = false;
            state.writes_completed += 1;
            if sent_len < buffer.len() && sink.is_connected() {
                state.partial_sends += 1;
                error!(
                    seq = buffer.seq(),
                    sent = sent_len,
                    queued = buffer.len(),
                    "partial send; connection must be re-established"
                );
            }
        }
        self.pool.return_buffer(buffer);
        self.send_messages(sink);
    }

    pub fn stats(&self) -> SenderStats {
        let state = self.state.lock();
        SenderStats {
            frames: state.frames,
            queued_buffers: state.queue.len(),
            writes_started: state.writes_started,
            writes_completed: state.writes_completed,
            partial_sends: state.partial_sends,
            in_flight: state.sending,
        }
    }

    /// Return every queued buffer to the pool. The in-flight buffer, if any,
    /// comes back through `on_sent`.
    pub fn clear(&self) -> usize {
        let drained: Vec<Buffer> = self.state.lock().queue.drain(..).collect();
        let n = drained.len();
        for buffer in drained {
            self.pool.return_buffer(buffer);
        }
        n
    }
}
