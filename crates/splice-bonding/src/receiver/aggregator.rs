use bytes::Bytes;
use std::io;
use tracing::{debug, warn};

use super::sink::FrameSink;

/// First sequence number of every stream.
pub const FIRST_SEQ: u32 = 1;

/// Result of offering one data packet to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    /// Already flushed. Accepted as a no-op.
    Stale,
    /// Already buffered. Accepted as a no-op.
    Duplicate,
    /// Beyond the window; the packet is dropped.
    OutOfWindow,
}

impl InsertOutcome {
    /// Everything except a capacity drop counts as accepted.
    pub fn is_accepted(self) -> bool {
        self != InsertOutcome::OutOfWindow
    }
}

struct Slot {
    seq: u32,
    payload: Bytes,
}

/// Snapshot of reorder buffer counters for telemetry.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct ReorderStats {
    pub head_seq: u32,
    pub last_seq: Option<u32>,
    pub queue_depth: usize,
    pub stored: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
    pub flushed: u64,
}

/// Fixed-capacity ring that reorders data packets by sequence number.
///
/// The ring covers the window `[head_seq, head_seq + capacity)`. Packets are
/// released to a [`FrameSink`] only in order: [`flush`](Self::flush) stops at
/// the first hole. Holes that fall `lost_threshold` sequences behind the
/// newest packet are reported by the resumable loss scan.
pub struct ReorderBuffer {
    slots: Vec<Option<Slot>>,
    capacity: usize,
    buffered: usize,
    head_seq: u32,
    /// Highest sequence inserted; `None` while the buffer is empty.
    last_seq: Option<u32>,
    lost_threshold: u32,
    /// Last sequence of the stream once the tail is known.
    end_seq: Option<u32>,
    /// Next sequence the loss scan examines.
    scan_cursor: u32,
    stored: u64,
    stale: u64,
    duplicates: u64,
    out_of_window: u64,
    flushed: u64,
}

impl ReorderBuffer {
    pub fn new(capacity: usize, lost_threshold: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
            buffered: 0,
            head_seq: FIRST_SEQ,
            last_seq: None,
            lost_threshold,
            end_seq: None,
            scan_cursor: FIRST_SEQ,
            stored: 0,
            stale: 0,
            duplicates: 0,
            out_of_window: 0,
            flushed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn head_seq(&self) -> u32 {
        self.head_seq
    }

    pub fn last_seq(&self) -> Option<u32> {
        self.last_seq
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Declare `last` the final sequence of the stream. From then on the
    /// loss scan reaches `last` with no threshold, since nothing newer will
    /// arrive to push holes behind it.
    pub fn mark_end(&mut self, last: u32) {
        self.end_seq = Some(last);
        self.lost_threshold = 0;
    }

    /// Every sequence up to the marked end has been flushed.
    pub fn is_complete(&self) -> bool {
        self.end_seq.is_some_and(|end| self.head_seq > end)
    }

    #[inline]
    fn index(&self, seq: u32) -> usize {
        seq as usize % self.capacity
    }

    #[inline]
    fn is_occupied(&self, seq: u32) -> bool {
        self.slots[self.index(seq)].is_some()
    }

    /// Window width from the head to the newest packet, 0 when empty.
    fn span(&self) -> u32 {
        match self.last_seq {
            Some(last) if last >= self.head_seq => last - self.head_seq + 1,
            _ => 0,
        }
    }

    pub fn insert(&mut self, seq: u32, payload: Bytes) -> InsertOutcome {
        if seq < self.head_seq {
            self.stale += 1;
            debug!(seq, head = self.head_seq, "already flushed packet ignored");
            return InsertOutcome::Stale;
        }
        if u64::from(seq) >= u64::from(self.head_seq) + self.capacity as u64 {
            self.out_of_window += 1;
            warn!(seq, head = self.head_seq, "sequence beyond buffer window, packet dropped");
            return InsertOutcome::OutOfWindow;
        }

        let idx = self.index(seq);
        if self.slots[idx].is_some() {
            self.duplicates += 1;
            debug!(seq, "duplicate packet ignored");
            return InsertOutcome::Duplicate;
        }

        self.slots[idx] = Some(Slot { seq, payload });
        self.buffered += 1;
        self.stored += 1;
        if self.last_seq.is_none_or(|last| seq > last) {
            self.last_seq = Some(seq);
        }
        InsertOutcome::Stored
    }

    /// Occupied slots from the head up to the first hole.
    pub fn contiguous_count(&self) -> usize {
        let mut count = 0;
        let mut seq = self.head_seq;
        while count < self.capacity && self.is_occupied(seq) {
            count += 1;
            seq = seq.wrapping_add(1);
        }
        count
    }

    /// Release the contiguous run at the head to `sink`. Returns the number
    /// of frames written. A frame whose write fails is still consumed.
    pub fn flush<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> io::Result<usize> {
        let mut released = 0;
        loop {
            let idx = self.index(self.head_seq);
            let Some(slot) = self.slots[idx].take() else {
                break;
            };
            self.buffered -= 1;
            self.head_seq = self.head_seq.wrapping_add(1);
            if self.last_seq.is_some_and(|last| last < self.head_seq) {
                self.last_seq = None;
            }
            self.flushed += 1;
            released += 1;
            sink.write_frame(slot.seq, &slot.payload)?;
        }
        Ok(released)
    }

    /// `(last_seq - head_seq + 1) / capacity`, 0 when empty.
    pub fn occupancy(&self) -> f64 {
        (f64::from(self.span()) / self.capacity as f64).min(1.0)
    }

    /// Restart the loss scan at the head and return the first hole.
    pub fn first_lost(&mut self) -> Option<u32> {
        self.scan_cursor = self.head_seq;
        self.next_lost()
    }

    /// Next hole at least `lost_threshold` sequences behind the newest
    /// packet, continuing after the previous one. `None` ends the sweep.
    pub fn next_lost(&mut self) -> Option<u32> {
        let horizon = match (self.last_seq, self.end_seq) {
            (Some(last), Some(end)) => last.max(end),
            (last, end) => last.or(end)?,
        };
        if horizon < self.head_seq || horizon - self.head_seq + 1 <= self.lost_threshold {
            return None;
        }
        let window_end = self
            .head_seq
            .saturating_add(self.capacity as u32)
            .saturating_sub(1);
        let scan_end = (horizon - self.lost_threshold).min(window_end);
        let start = self.scan_cursor.max(self.head_seq);
        for seq in start..=scan_end {
            if !self.is_occupied(seq) {
                self.scan_cursor = seq.saturating_add(1);
                return Some(seq);
            }
        }
        self.scan_cursor = self.scan_cursor.max(scan_end.saturating_add(1));
        None
    }

    /// One full sweep of lost sequences as an iterator.
    pub fn lost(&mut self) -> LostScan<'_> {
        LostScan {
            buffer: self,
            started: false,
        }
    }

    pub fn get_stats(&self) -> ReorderStats {
        ReorderStats {
            head_seq: self.head_seq,
            last_seq: self.last_seq,
            queue_depth: self.buffered,
            stored: self.stored,
            stale: self.stale,
            duplicates: self.duplicates,
            out_of_window: self.out_of_window,
            flushed: self.flushed,
        }
    }
}

/// Iterator form of [`ReorderBuffer::first_lost`] / [`ReorderBuffer::next_lost`].
pub struct LostScan<'a> {
    buffer: &'a mut ReorderBuffer,
    started: bool,
}

impl Iterator for LostScan<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.started {
            self.buffer.next_lost()
        } else {
            self.started = true;
            self.buffer.first_lost()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(seq: u32) -> Bytes {
        Bytes::from(seq.to_be_bytes().to_vec())
    }

    struct SeqSink(Vec<u32>);

    impl FrameSink for SeqSink {
        fn write_frame(&mut self, seq: u32, _payload: &[u8]) -> io::Result<()> {
            self.0.push(seq);
            Ok(())
        }
    }

    #[test]
    fn contiguous_and_first_lost() {
        let mut buf = ReorderBuffer::new(8, 1);
        for seq in [1, 2, 4, 5] {
            assert_eq!(buf.insert(seq, payload(seq)), InsertOutcome::Stored);
        }
        assert_eq!(buf.contiguous_count(), 2);
        assert_eq!(buf.first_lost(), Some(3));
        assert_eq!(buf.next_lost(), None);
    }

    #[test]
    fn flush_full_run() {
        let mut buf = ReorderBuffer::new(8, 4);
        for seq in 1..=8 {
            buf.insert(seq, payload(seq));
        }
        let mut sink = SeqSink(Vec::new());
        assert_eq!(buf.flush(&mut sink).unwrap(), 8);
        assert_eq!(sink.0, (1..=8).collect::<Vec<_>>());
        assert_eq!(buf.head_seq(), 9);
        assert_eq!(buf.last_seq(), None);
        assert_eq!(buf.occupancy(), 0.0);
    }

    #[test]
    fn flush_stops_at_hole() {
        let mut buf = ReorderBuffer::new(8, 4);
        for seq in [1, 2, 4] {
            buf.insert(seq, payload(seq));
        }
        let mut sink = SeqSink(Vec::new());
        assert_eq!(buf.flush(&mut sink).unwrap(), 2);
        assert_eq!(buf.flush(&mut sink).unwrap(), 0);
        assert_eq!(buf.head_seq(), 3);
        assert_eq!(buf.last_seq(), Some(4));
        assert_eq!(buf.occupancy(), 2.0 / 8.0);
    }

    #[test]
    fn stale_duplicate_and_out_of_window() {
        let mut buf = ReorderBuffer::new(8, 4);
        buf.insert(1, payload(1));
        assert_eq!(buf.insert(1, payload(1)), InsertOutcome::Duplicate);
        buf.flush(&mut Vec::new()).unwrap();
        assert_eq!(buf.insert(1, payload(1)), InsertOutcome::Stale);
        assert_eq!(buf.insert(0, payload(0)), InsertOutcome::Stale);
        assert_eq!(buf.insert(10, payload(10)), InsertOutcome::OutOfWindow);
        assert!(!InsertOutcome::OutOfWindow.is_accepted());
        assert_eq!(buf.insert(9, payload(9)), InsertOutcome::Stored);

        let stats = buf.get_stats();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.stale, 2);
        assert_eq!(stats.out_of_window, 1);
        assert_eq!(stats.flushed, 1);
    }

    #[test]
    fn loss_scan_waits_for_threshold() {
        let mut buf = ReorderBuffer::new(16, 5);
        buf.insert(1, payload(1));
        buf.insert(5, payload(5));
        // span 5 <= threshold 5
        assert_eq!(buf.first_lost(), None);
        buf.insert(7, payload(7));
        // scan covers 1..=2
        assert_eq!(buf.lost().collect::<Vec<_>>(), vec![2]);
        buf.insert(9, payload(9));
        assert_eq!(buf.lost().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn loss_scan_resumes_without_repeats() {
        let mut buf = ReorderBuffer::new(32, 2);
        for seq in [1, 3, 6, 20] {
            buf.insert(seq, payload(seq));
        }
        assert_eq!(buf.first_lost(), Some(2));
        assert_eq!(buf.next_lost(), Some(4));
        assert_eq!(buf.next_lost(), Some(5));
        assert_eq!(buf.next_lost(), Some(7));
        buf.insert(8, payload(8));
        assert_eq!(buf.next_lost(), Some(9));
        // restarting the sweep finds the earlier holes again
        assert_eq!(buf.first_lost(), Some(2));
    }

    #[test]
    fn marked_end_reports_tail_holes() {
        let mut buf = ReorderBuffer::new(16, 8);
        for seq in [1, 2, 4] {
            buf.insert(seq, payload(seq));
        }
        assert_eq!(buf.first_lost(), None);
        buf.mark_end(6);
        assert_eq!(buf.lost().collect::<Vec<_>>(), vec![3, 5, 6]);
        assert!(!buf.is_complete());

        for seq in [3, 5, 6] {
            buf.insert(seq, payload(seq));
        }
        buf.flush(&mut Vec::new()).unwrap();
        assert!(buf.is_complete());
        assert_eq!(buf.first_lost(), None);
    }

    #[test]
    fn occupancy_tracks_span() {
        let mut buf = ReorderBuffer::new(10, 5);
        assert_eq!(buf.occupancy(), 0.0);
        buf.insert(1, payload(1));
        buf.insert(10, payload(10));
        assert_eq!(buf.occupancy(), 1.0);
        buf.flush(&mut Vec::new()).unwrap();
        assert_eq!(buf.occupancy(), 9.0 / 10.0);
    }
}
