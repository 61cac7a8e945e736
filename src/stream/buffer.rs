//! Per-direction TCP reassembly.
//!
//! A `ReassemblyBuffer` takes the segments of one direction of a connection in
//! whatever order they were captured and releases the payload bytes in
//! transmission order, each byte exactly once. Sequence numbers are mapped onto a
//! 64-bit stream offset relative to the delivered cursor, so a stream may wrap
//! around the 32-bit sequence space.

use bytes::Bytes;
use core::mem;
use core::time::Duration;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// How a stream finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// Every byte received up to the end of the stream was delivered
    Complete,
    /// Some received bytes could not be delivered because of a gap
    Lossy,
}

/// Bytes made contiguous by one operation, and whether the stream ended
#[derive(Debug, Default)]
pub(crate) struct Release {
    pub(crate) chunks: Vec<Bytes>,
    pub(crate) end: Option<StreamEnd>,
}

impl Release {
    pub(crate) fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Append the output of a later operation on the same buffer
    pub(crate) fn merge(&mut self, later: Release) {
        self.chunks.extend(later.chunks);
        self.end = self.end.or(later.end);
    }
}

#[derive(Debug)]
pub(crate) struct ReassemblyBuffer {
    /// Sequence number of stream offset 0, unknown until the stream is anchored
    isn: Option<u32>,
    delivered: u64,
    pending: BTreeMap<u64, Bytes>,
    pending_bytes: usize,
    /// Segments seen before the start of the stream is known
    held: Vec<(u32, Bytes)>,
    held_bytes: usize,
    held_fin: Option<u32>,
    first_seen: Option<Duration>,
    fin_at: Option<u64>,
    ended: Option<StreamEnd>,
    discarded: u64,
    max_pending: usize,
    start_grace: Duration,
}

impl ReassemblyBuffer {
    pub(crate) fn new(max_pending: usize, start_grace: Duration) -> Self {
        Self {
            isn: None,
            delivered: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            held: Vec::new(),
            held_bytes: 0,
            held_fin: None,
            first_seen: None,
            fin_at: None,
            ended: None,
            discarded: 0,
            max_pending,
            start_grace,
        }
    }

    /// Bytes released so far
    pub(crate) fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Sequence number of the next byte to release, once anchored
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn next_seq(&self) -> Option<u32> {
        self.isn.map(|isn| isn.wrapping_add(self.delivered as u32))
    }

    /// Out-of-order bytes waiting for a gap to fill
    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes + self.held_bytes
    }

    /// Segments dropped because every byte in them was already covered
    pub(crate) fn discarded(&self) -> u64 {
        self.discarded
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.is_some()
    }

    /// A SYN fixes the start of the stream one past its sequence number
    pub(crate) fn syn(&mut self, seq: u32) -> Release {
        let mut release = Release::default();
        if self.isn.is_none() && self.ended.is_none() {
            self.anchor(seq.wrapping_add(1), &mut release);
        }
        release
    }

    pub(crate) fn insert(&mut self, seq: u32, payload: Bytes, now: Duration) -> Release {
        let mut release = Release::default();
        if self.ended.is_some() || payload.is_empty() {
            return release;
        }

        if self.isn.is_none() {
            self.first_seen.get_or_insert(now);
            self.held_bytes += payload.len();
            self.held.push((seq, payload));
            if self.held_bytes > self.max_pending {
                self.anchor_held(&mut release);
            } else {
                self.anchor_held_if_due(now, &mut release);
            }
            return release;
        }

        self.place(seq, payload, &mut release);
        release
    }

    /// Record the end of the stream; `seq` is the sequence number the FIN occupies
    pub(crate) fn fin(&mut self, seq: u32) -> Release {
        let mut release = Release::default();
        if self.ended.is_some() {
            return release;
        }
        if self.isn.is_none() {
            if self.held.is_empty() {
                self.end(StreamEnd::Complete, &mut release);
            } else {
                self.held_fin = Some(seq);
            }
            return release;
        }
        self.fin_at = Some(self.clamped_offset(seq));
        self.check_fin(&mut release);
        release
    }

    /// Anchor a stream that started without a SYN once the grace period is over
    pub(crate) fn anchor_if_due(&mut self, now: Duration) -> Release {
        let mut release = Release::default();
        if self.ended.is_none() {
            self.anchor_held_if_due(now, &mut release);
        }
        release
    }

    /// End the stream now. Whatever is contiguous has already been released;
    /// bytes still behind a gap are dropped and the stream is marked lossy.
    pub(crate) fn close(&mut self) -> Release {
        let mut release = Release::default();
        if self.ended.is_some() {
            return release;
        }
        if self.isn.is_none() {
            self.anchor_held(&mut release);
            if self.ended.is_some() {
                return release;
            }
        }
        let complete =
            self.pending.is_empty() && self.fin_at.is_none_or(|fin| self.delivered >= fin);
        let end = if complete {
            StreamEnd::Complete
        } else {
            StreamEnd::Lossy
        };
        self.end(end, &mut release);
        release
    }

    fn anchor_held_if_due(&mut self, now: Duration, release: &mut Release) {
        let due = self
            .first_seen
            .is_some_and(|first| now.saturating_sub(first) >= self.start_grace);
        if self.isn.is_none() && due {
            self.anchor_held(release);
        }
    }

    fn anchor_held(&mut self, release: &mut Release) {
        if let Some(start) = lowest_seq(self.held.iter().map(|(seq, _)| *seq)) {
            self.anchor(start, release);
        }
    }

    fn anchor(&mut self, isn: u32, release: &mut Release) {
        self.isn = Some(isn);
        self.held_bytes = 0;
        for (seq, payload) in mem::take(&mut self.held) {
            self.place(seq, payload, release);
            if self.ended.is_some() {
                return;
            }
        }
        if let Some(fin) = self.held_fin.take() {
            self.fin_at = Some(self.clamped_offset(fin));
            self.check_fin(release);
        }
    }

    /// Stream offset of `seq`, negative when it lies before the start of the stream
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn offset_of(&self, seq: u32) -> i64 {
        let cursor = self.next_seq().unwrap_or(seq);
        self.delivered as i64 + i64::from(seq.wrapping_sub(cursor) as i32)
    }

    #[allow(clippy::cast_sign_loss)]
    fn clamped_offset(&self, seq: u32) -> u64 {
        self.offset_of(seq).max(0) as u64
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn place(&mut self, seq: u32, payload: Bytes, release: &mut Release) {
        let start = self.offset_of(seq);
        let end = start + payload.len() as i64;
        let delivered = self.delivered as i64;

        if end <= delivered {
            self.discarded += 1;
            return;
        }

        if start <= delivered {
            let fresh = payload.slice((delivered - start) as usize..);
            self.deliver(fresh, release);
            self.drain(release);
            self.check_fin(release);
            return;
        }

        let start = start as u64;
        match self.pending.entry(start) {
            Entry::Occupied(mut entry) => {
                if entry.get().len() >= payload.len() {
                    self.discarded += 1;
                    return;
                }
                self.pending_bytes += payload.len() - entry.get().len();
                entry.insert(payload);
            }
            Entry::Vacant(entry) => {
                self.pending_bytes += payload.len();
                entry.insert(payload);
            }
        }

        if self.pending_bytes > self.max_pending {
            self.end(StreamEnd::Lossy, release);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn drain(&mut self, release: &mut Release) {
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > self.delivered {
                break;
            }
            let chunk = entry.remove();
            self.pending_bytes -= chunk.len();
            let end = start + chunk.len() as u64;
            if end > self.delivered {
                let fresh = chunk.slice((self.delivered - start) as usize..);
                self.deliver(fresh, release);
            } else {
                self.discarded += 1;
            }
        }
    }

    fn deliver(&mut self, bytes: Bytes, release: &mut Release) {
        self.delivered += bytes.len() as u64;
        release.chunks.push(bytes);
    }

    fn check_fin(&mut self, release: &mut Release) {
        if self.ended.is_none() && self.fin_at.is_some_and(|fin| self.delivered >= fin) {
            self.end(StreamEnd::Complete, release);
        }
    }

    fn end(&mut self, end: StreamEnd, release: &mut Release) {
        self.ended = Some(end);
        self.pending.clear();
        self.pending_bytes = 0;
        self.held.clear();
        self.held_bytes = 0;
        release.end = Some(end);
    }
}

/// The sequence number that comes first, comparing in wrapping sequence space
#[allow(clippy::cast_possible_wrap)]
fn lowest_seq(seqs: impl Iterator<Item = u32>) -> Option<u32> {
    seqs.reduce(|lowest, seq| {
        if (seq.wrapping_sub(lowest) as i32) < 0 {
            seq
        } else {
            lowest
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_PENDING: usize = 1024;

    fn anchored(isn: u32) -> ReassemblyBuffer {
        let mut buffer = ReassemblyBuffer::new(MAX_PENDING, Duration::ZERO);
        buffer.syn(isn.wrapping_sub(1));
        buffer
    }

    fn collect(releases: impl IntoIterator<Item = Release>) -> Vec<u8> {
        releases
            .into_iter()
            .flat_map(|r| r.chunks)
            .flat_map(|c| c.to_vec())
            .collect()
    }

    fn segments(data: &[u8], isn: u32, size: usize) -> Vec<(u32, Bytes)> {
        data.chunks(size)
            .enumerate()
            .map(|(i, chunk)| {
                let offset = u32::try_from(i * size).unwrap();
                (isn.wrapping_add(offset), Bytes::copy_from_slice(chunk))
            })
            .collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = anchored(100);
        let a = buffer.insert(100, Bytes::from_static(b"Hello "), Duration::ZERO);
        let b = buffer.insert(106, Bytes::from_static(b"World"), Duration::ZERO);
        assert_eq!(collect([a, b]), b"Hello World");
        assert_eq!(buffer.delivered(), 11);
        assert_eq!(buffer.next_seq(), Some(111));
    }

    #[test]
    fn test_reorder_invariance() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut parts = segments(&data, 5000, 64);
        // interleave: evens reversed, then odds
        let (evens, odds): (Vec<_>, Vec<_>) = parts
            .drain(..)
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);
        let order = evens.into_iter().rev().chain(odds).map(|(_, s)| s);

        let mut buffer = anchored(5000);
        let released: Vec<Release> = order
            .map(|(seq, payload)| buffer.insert(seq, payload, Duration::ZERO))
            .collect();
        assert_eq!(collect(released), data);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_retransmission_is_idempotent() {
        let mut buffer = anchored(0);
        let mut released = vec![
            buffer.insert(0, Bytes::from_static(b"abc"), Duration::ZERO),
            buffer.insert(6, Bytes::from_static(b"ghi"), Duration::ZERO),
            buffer.insert(6, Bytes::from_static(b"ghi"), Duration::ZERO),
        ];
        assert_eq!(buffer.pending_bytes(), 3);
        released.push(buffer.insert(3, Bytes::from_static(b"def"), Duration::ZERO));
        released.push(buffer.insert(3, Bytes::from_static(b"def"), Duration::ZERO));
        assert_eq!(collect(released), b"abcdefghi");
        assert_eq!(buffer.discarded(), 2);
    }

    #[test]
    fn test_stale_segment_leaves_cursor_alone() {
        let mut buffer = anchored(10);
        buffer.insert(10, Bytes::from_static(b"GET / HT"), Duration::ZERO);
        let cursor = buffer.next_seq();

        let release = buffer.insert(10, Bytes::from_static(b"GET / HT"), Duration::ZERO);
        assert!(release.chunks.is_empty());
        assert_eq!(buffer.next_seq(), cursor);
        assert_eq!(buffer.delivered(), 8);
        assert_eq!(buffer.discarded(), 1);
    }

    #[test]
    fn test_partial_overlap_delivers_only_new_bytes() {
        let mut buffer = anchored(0);
        let a = buffer.insert(0, Bytes::from_static(b"abcd"), Duration::ZERO);
        let b = buffer.insert(2, Bytes::from_static(b"cdef"), Duration::ZERO);
        assert_eq!(collect([a, b]), b"abcdef");
    }

    #[test]
    fn test_longer_retransmission_replaces_pending() {
        let mut buffer = anchored(0);
        let mut released = vec![
            buffer.insert(4, Bytes::from_static(b"ef"), Duration::ZERO),
            buffer.insert(4, Bytes::from_static(b"efgh"), Duration::ZERO),
        ];
        released.push(buffer.insert(0, Bytes::from_static(b"abcd"), Duration::ZERO));
        assert_eq!(collect(released), b"abcdefgh");
    }

    #[test]
    fn test_sequence_wraparound() {
        let data = b"0123456789abcdefghij";
        let isn = u32::MAX - 7;
        let parts = segments(data, isn, 6);
        let mut buffer = anchored(isn);
        let released: Vec<Release> = parts
            .into_iter()
            .rev()
            .map(|(seq, payload)| buffer.insert(seq, payload, Duration::ZERO))
            .collect();
        assert_eq!(collect(released), data);
    }

    #[test]
    fn test_fin_ends_once_contiguous() {
        let mut buffer = anchored(0);
        buffer.insert(3, Bytes::from_static(b"def"), Duration::ZERO);
        let fin = buffer.fin(6);
        assert_eq!(fin.end, None);

        let release = buffer.insert(0, Bytes::from_static(b"abc"), Duration::ZERO);
        assert_eq!(release.end, Some(StreamEnd::Complete));
        assert_eq!(collect([release]), b"abcdef");
        assert!(buffer.is_ended());
    }

    #[test]
    fn test_close_with_gap_is_lossy() {
        let mut buffer = anchored(0);
        let a = buffer.insert(0, Bytes::from_static(b"abc"), Duration::ZERO);
        buffer.insert(10, Bytes::from_static(b"xyz"), Duration::ZERO);
        let closed = buffer.close();
        assert_eq!(closed.end, Some(StreamEnd::Lossy));
        assert!(closed.chunks.is_empty());
        assert_eq!(collect([a]), b"abc");

        // nothing is accepted after the end
        let late = buffer.insert(3, Bytes::from_static(b"def"), Duration::ZERO);
        assert!(late.chunks.is_empty());
        assert_eq!(buffer.delivered(), 3);
    }

    #[test]
    fn test_unanchored_segments_wait_for_grace() {
        let mut buffer = ReassemblyBuffer::new(MAX_PENDING, Duration::from_secs(1));
        let t0 = Duration::from_secs(100);
        let a = buffer.insert(20, Bytes::from_static(b"\r\n"), t0);
        assert!(a.chunks.is_empty());
        let b = buffer.insert(0, Bytes::from_static(b"GET / HTTP/1.1\r\nX:\r\n"), t0);
        assert!(b.chunks.is_empty());

        assert!(buffer.anchor_if_due(t0).chunks.is_empty());
        let due = buffer.anchor_if_due(t0 + Duration::from_secs(1));
        assert_eq!(
            collect([due]),
            b"GET / HTTP/1.1\r\nX:\r\n\r\n"
        );
    }

    #[test]
    fn test_close_anchors_held_segments() {
        let mut buffer = ReassemblyBuffer::new(MAX_PENDING, Duration::from_secs(60));
        buffer.insert(7, Bytes::from_static(b"world"), Duration::ZERO);
        buffer.insert(2, Bytes::from_static(b"hello"), Duration::ZERO);
        let closed = buffer.close();
        assert_eq!(closed.end, Some(StreamEnd::Complete));
        assert_eq!(collect([closed]), b"helloworld");
    }

    #[test]
    fn test_pending_overflow_ends_stream() {
        let mut buffer = ReassemblyBuffer::new(8, Duration::ZERO);
        buffer.syn(u32::MAX);
        buffer.insert(100, Bytes::from_static(b"12345"), Duration::ZERO);
        let overflow = buffer.insert(200, Bytes::from_static(b"67890"), Duration::ZERO);
        assert_eq!(overflow.end, Some(StreamEnd::Lossy));
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_lowest_seq_wraps() {
        assert_eq!(lowest_seq([5, 3, 9].into_iter()), Some(3));
        assert_eq!(lowest_seq([2, u32::MAX - 1].into_iter()), Some(u32::MAX - 1));
        assert_eq!(lowest_seq(core::iter::empty()), None);
    }
}
