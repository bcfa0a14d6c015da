// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The per-stream packet buffer (C1): a fixed-duration ring of demuxed
//! packets, kept keyframe-aligned so it can always be flushed into a valid
//! recording.
//!
//! Owned exclusively by its ingest thread; unlike the catalog, it needs no
//! internal locking (§4.1).

use std::collections::VecDeque;

use base::clock::Instant;
use bytes::Bytes;
use jiff::SignedDuration;

/// Which elementary stream a packet belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One demuxed access unit, stream-copy only (never transcoded).
#[derive(Clone, Debug)]
pub struct Packet {
    pub kind: StreamKind,
    pub keyframe: bool,
    pub data: Bytes,
    pub dts: i64,
    pub pts: i64,
}

struct Entry {
    packet: Packet,
    receipt: Instant,
}

/// Summary counters returned by [`PacketBuffer::stats`].
#[derive(Copy, Clone, Debug)]
pub struct BufferStats {
    pub count: usize,
    pub bytes: usize,
    pub span: SignedDuration,
}

/// A ring of packets bounded by wall-clock span rather than packet count.
///
/// Invariant (§8 property 7): the oldest packet is always a keyframe, or the
/// buffer is empty.
pub struct PacketBuffer {
    capacity: SignedDuration,
    packets: VecDeque<Entry>,
}

impl PacketBuffer {
    pub fn new(capacity: SignedDuration) -> Self {
        PacketBuffer {
            capacity,
            packets: VecDeque::new(),
        }
    }

    /// Appends `packet`, received at `receipt_time`, then evicts whole GOPs
    /// from the front until the buffered span fits `capacity`. Eviction
    /// always stops exactly at a keyframe boundary, never mid-GOP, so the
    /// head invariant holds after every call. Never fails: under pressure it
    /// just evicts more.
    pub fn push(&mut self, packet: Packet, receipt_time: Instant) {
        self.packets.push_back(Entry {
            packet,
            receipt: receipt_time,
        });
        self.evict(receipt_time);
    }

    fn evict(&mut self, newest: Instant) {
        while let Some(front) = self.packets.front() {
            if newest.checked_sub(front.receipt) <= self.capacity {
                break;
            }
            // Drop the old keyframe and every packet up to (but not
            // through) the next-newest keyframe, so the front always lands
            // back on a keyframe boundary.
            self.packets.pop_front();
            while let Some(p) = self.packets.front() {
                if p.packet.keyframe {
                    break;
                }
                self.packets.pop_front();
            }
        }
    }

    /// Invokes `f` for every buffered packet in order, skipping any leading
    /// non-keyframes (a defensive measure: the push invariant should already
    /// guarantee the head is a keyframe). Returns the count passed through.
    /// Does not clear the buffer. Aborts and propagates `f`'s error, if any.
    pub fn flush<E>(&self, mut f: impl FnMut(&Packet) -> Result<(), E>) -> Result<usize, E> {
        let mut count = 0;
        let mut seen_keyframe = false;
        for entry in &self.packets {
            if !seen_keyframe {
                if !entry.packet.keyframe {
                    continue;
                }
                seen_keyframe = true;
            }
            f(&entry.packet)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn stats(&self) -> BufferStats {
        let bytes = self.packets.iter().map(|e| e.packet.data.len()).sum();
        let span = match (self.packets.front(), self.packets.back()) {
            (Some(f), Some(b)) => b.receipt.checked_sub(f.receipt),
            _ => SignedDuration::ZERO,
        };
        BufferStats {
            count: self.packets.len(),
            bytes,
            span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(kind: StreamKind, keyframe: bool, dts: i64) -> Packet {
        Packet {
            kind,
            keyframe,
            data: Bytes::from_static(b"x"),
            dts,
            pts: dts,
        }
    }

    fn at(secs: i64) -> Instant {
        Instant::new(secs * 1_000_000_000)
    }

    #[test]
    fn head_stays_a_keyframe() {
        let mut buf = PacketBuffer::new(SignedDuration::from_secs(5));
        buf.push(pkt(StreamKind::Video, true, 0), at(0));
        buf.push(pkt(StreamKind::Video, false, 1), at(1));
        buf.push(pkt(StreamKind::Video, true, 2), at(2));
        buf.push(pkt(StreamKind::Video, false, 3), at(3));
        buf.push(pkt(StreamKind::Video, true, 10), at(10));
        // The GOP starting at t=0 should have been evicted wholesale; the
        // GOP starting at t=2 is within 5s of t=10 so it survives... no,
        // 10 - 2 = 8 > 5, so it too must be evicted, leaving only t=10.
        let stats = buf.stats();
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn zero_capacity_is_passthrough() {
        let mut buf = PacketBuffer::new(SignedDuration::ZERO);
        buf.push(pkt(StreamKind::Video, true, 0), at(0));
        buf.push(pkt(StreamKind::Video, true, 1), at(1));
        assert_eq!(buf.stats().count, 1);
        let mut seen = 0;
        buf.flush::<std::convert::Infallible>(|_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert!(seen <= 1);
    }

    #[test]
    fn flush_skips_leading_non_keyframe() {
        let mut buf = PacketBuffer::new(SignedDuration::from_secs(60));
        buf.packets.push_back(Entry {
            packet: pkt(StreamKind::Video, false, 0),
            receipt: at(0),
        });
        buf.packets.push_back(Entry {
            packet: pkt(StreamKind::Video, true, 1),
            receipt: at(1),
        });
        buf.packets.push_back(Entry {
            packet: pkt(StreamKind::Video, false, 2),
            receipt: at(2),
        });
        let mut dts = Vec::new();
        let count = buf
            .flush::<std::convert::Infallible>(|p| {
                dts.push(p.dts);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(dts, vec![1, 2]);
        // flush doesn't clear.
        assert_eq!(buf.stats().count, 3);
    }

    #[test]
    fn empty_buffer_flushes_nothing() {
        let buf = PacketBuffer::new(SignedDuration::from_secs(5));
        let count = buf.flush::<std::convert::Infallible>(|_| Ok(())).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn clear_drops_everything() {
        let mut buf = PacketBuffer::new(SignedDuration::from_secs(5));
        buf.push(pkt(StreamKind::Video, true, 0), at(0));
        buf.clear();
        assert_eq!(buf.stats().count, 0);
    }
}
