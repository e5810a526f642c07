//! Timestamp framing on top of the raw byte queue (§4.B).
//!
//! The producer submits a 4-byte little-endian millisecond timestamp
//! followed by one or more MIDI bytes per call to
//! [`MidiFifo::submit`]. The consumer dequeues through [`MidiFifo::poll`],
//! which applies the staleness check and the ~100ms latency gate described
//! in §4.B before releasing a byte.

use super::ring_buffer::MidiRingBuffer;

/// Timestamp sanity window (§4.B): events more than this far from "now" in
/// either direction mark the FIFO as corrupt.
const STALENESS_WINDOW_MS: u32 = 600_000;

/// Bytes are held back this long after arrival to smooth jitter (§4.B).
const LATENCY_GATE_MS: u32 = 100;

pub enum PollResult {
    /// A byte is ready to be consumed.
    Byte(u8),
    /// Nothing ready yet (empty, or the next event is still latency-gated).
    Empty,
    /// The dequeued timestamp failed the staleness check; the caller must
    /// issue an all-voices-off. The FIFO has already been reset.
    Stale,
}

pub struct MidiFifo {
    bytes: MidiRingBuffer,
    /// Timestamp of the event currently being drained, once its 4-byte
    /// prefix has been consumed and validated.
    pending_timestamp: Option<u32>,
    /// Data bytes still owed to the event `pending_timestamp` belongs to.
    /// One entry per [`submit`](Self::submit) call's `data.len()`, queued
    /// in submission order so `poll` knows where each event's bytes end
    /// and the next event's 4-byte timestamp prefix begins.
    event_lengths: std::collections::VecDeque<usize>,
    pending_remaining: usize,
}

impl Default for MidiFifo {
    fn default() -> Self {
        MidiFifo {
            bytes: MidiRingBuffer::new(),
            pending_timestamp: None,
            event_lengths: std::collections::VecDeque::new(),
            pending_remaining: 0,
        }
    }
}

impl MidiFifo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side: writes a 4-byte LE timestamp followed by `data`.
    /// Matches §4.B's contract; on overflow, later bytes are silently
    /// dropped (overflow policy).
    pub fn submit(&mut self, timestamp_ms: u32, data: &[u8]) {
        let ts = timestamp_ms.to_le_bytes();
        self.bytes.push_slice(&ts);
        self.bytes.push_slice(data);
        self.event_lengths.push_back(data.len());
    }

    /// Consumer side: returns the next ready byte, or indicates the queue
    /// is empty/gated/stale (§4.B).
    pub fn poll(&mut self, now_ms: u32) -> PollResult {
        if self.pending_timestamp.is_none() {
            if self.bytes.len() < 4 {
                return PollResult::Empty;
            }
            let mut raw = [0u8; 4];
            for slot in &mut raw {
                *slot = self.bytes.pop().expect("length checked above");
            }
            let t_ev = u32::from_le_bytes(raw);
            let remaining = self.event_lengths.pop_front().unwrap_or(0);

            let stale = t_ev > now_ms.saturating_add(STALENESS_WINDOW_MS)
                || now_ms > t_ev.saturating_add(STALENESS_WINDOW_MS);
            if stale {
                self.bytes.flush();
                self.event_lengths.clear();
                self.pending_timestamp = None;
                self.pending_remaining = 0;
                return PollResult::Stale;
            }
            self.pending_timestamp = Some(t_ev);
            self.pending_remaining = remaining;
        }

        let t_ev = self.pending_timestamp.expect("set above");
        if t_ev.saturating_add(LATENCY_GATE_MS) > now_ms {
            // Not yet time to release this event's bytes.
            return PollResult::Empty;
        }

        if self.pending_remaining == 0 {
            // This event's data bytes are exhausted; the next poll should
            // read the following event's timestamp prefix instead of
            // mistaking it for more data.
            self.pending_timestamp = None;
            return PollResult::Empty;
        }

        match self.bytes.pop() {
            Some(byte) => {
                self.pending_remaining -= 1;
                if self.pending_remaining == 0 {
                    self.pending_timestamp = None;
                }
                PollResult::Byte(byte)
            }
            None => PollResult::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.pending_timestamp.is_none()
    }

    pub fn flush(&mut self) {
        self.bytes.flush();
        self.event_lengths.clear();
        self.pending_timestamp = None;
        self.pending_remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_event_is_gated_until_latency_window_elapses() {
        let mut fifo = MidiFifo::new();
        fifo.submit(1000, &[0x90, 60, 100]);
        assert!(matches!(fifo.poll(1000), PollResult::Empty));
        assert!(matches!(fifo.poll(1099), PollResult::Empty));
        assert!(matches!(fifo.poll(1100), PollResult::Byte(0x90)));
        assert!(matches!(fifo.poll(1100), PollResult::Byte(60)));
        assert!(matches!(fifo.poll(1100), PollResult::Byte(100)));
    }

    #[test]
    fn stale_future_timestamp_flushes_queue() {
        let mut fifo = MidiFifo::new();
        fifo.submit(1_000_000, &[0x90, 60, 100]);
        match fifo.poll(0) {
            PollResult::Stale => {}
            _ => panic!("expected staleness detection"),
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn stale_past_timestamp_flushes_queue() {
        let mut fifo = MidiFifo::new();
        fifo.submit(0, &[0x90, 60, 100]);
        match fifo.poll(1_000_000) {
            PollResult::Stale => {}
            _ => panic!("expected staleness detection"),
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn multiple_events_drain_in_order() {
        let mut fifo = MidiFifo::new();
        fifo.submit(0, &[0x90, 60, 100]);
        fifo.submit(0, &[0x80, 60, 0]);
        let mut drained = Vec::new();
        for _ in 0..6 {
            if let PollResult::Byte(b) = fifo.poll(10_000) {
                drained.push(b);
            }
        }
        assert_eq!(drained, vec![0x90, 60, 100, 0x80, 60, 0]);
    }
}
