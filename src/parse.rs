//! Frame reassembly and binary decoders for the MSM notification stream.
//!
//! | Item | Role |
//! |---|---|
//! | [`FrameAssembler`] | stateful: raw notification chunks → whole [`DeviceFrame`]s |
//! | [`decode_frame`] | pure: one frame → `samples_per_frame` [`SampleVector`]s |
//! | [`read_battery`] | pure: battery field of one frame |
//!
//! The decoders are pure and safe to call from any async or sync context.
//! The assembler owns its buffer exclusively and is driven from the single
//! notification context of one link.

use bytes::BytesMut;
use log::debug;

use crate::error::{ClientError, Result};
use crate::protocol::{FrameLayout, BATTERY_LEN};
use crate::types::{DeviceFrame, SampleVector};

// ── Frame assembler ───────────────────────────────────────────────────────────

/// Counters kept by a [`FrameAssembler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Complete frames handed out.
    pub frames: u64,
    /// Times an exact-frame-length chunk replaced a pending partial buffer.
    pub resyncs: u64,
    /// Stale bytes thrown away by those resynchronisations.
    pub discarded_bytes: u64,
}

/// Accumulates notification payloads and cuts them into fixed-length frames.
///
/// The BLE transport delivers the frame stream in arbitrarily sized chunks: a
/// chunk may be a fraction of a frame, exactly one frame, or several frames
/// followed by the start of the next.  Every complete frame is returned in
/// arrival order; a trailing partial frame stays buffered for the next call.
///
/// # Resynchronisation
///
/// A chunk whose length is *exactly* `frame_len` is taken as a fresh frame
/// start: any pending partial bytes are discarded before it is buffered.  This
/// recovers from residue left over by an earlier broken cycle, which would
/// otherwise shift every following frame.
///
/// The heuristic is fragile: if the transport happens to deliver a
/// frame-length chunk that straddles two frames while a legitimate partial
/// frame is pending, that partial frame is lost and the stream stays shifted
/// until the next aligned frame-length chunk.
///
/// ```
/// # use msm_rs::parse::FrameAssembler;
/// let mut asm = FrameAssembler::new(4);
/// assert!(asm.ingest(&[1, 2]).is_empty());          // partial
/// let frames = asm.ingest(&[3, 4, 5]);              // completes one, starts another
/// assert_eq!(frames[0].as_bytes(), &[1, 2, 3, 4]);
/// assert_eq!(asm.pending(), 1);
/// ```
pub struct FrameAssembler {
    buffer: BytesMut,
    frame_len: usize,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            buffer: BytesMut::with_capacity(frame_len * 4),
            frame_len,
            stats: AssemblerStats::default(),
        }
    }

    /// Append one notification payload and return every frame it completes.
    ///
    /// Never fails: short tails wait for their continuation.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<DeviceFrame> {
        if chunk.len() == self.frame_len && !self.buffer.is_empty() {
            self.stats.resyncs += 1;
            self.stats.discarded_bytes += self.buffer.len() as u64;
            debug!(
                "resync: frame-length chunk arrived, dropping {} stale byte(s)",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::with_capacity(self.buffer.len() / self.frame_len);
        while self.buffer.len() >= self.frame_len {
            let bytes = self.buffer.split_to(self.frame_len).freeze();
            frames.push(DeviceFrame::from_bytes(bytes));
        }
        self.stats.frames += frames.len() as u64;
        frames
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.  Counters are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }
}

// ── Sample decoder ────────────────────────────────────────────────────────────

/// Big-endian unsigned integer of 1–4 bytes.
fn read_unsigned_be(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

/// Big-endian two's-complement integer of 1–4 bytes, sign-extended to `i32`.
fn read_signed_be(bytes: &[u8]) -> i32 {
    let raw = read_unsigned_be(bytes);
    let bits = bytes.len() * 8;
    if bits >= 32 {
        raw as i32
    } else {
        let shift = 32 - bits as u32;
        ((raw << shift) as i32) >> shift
    }
}

/// Decode one frame into `layout.samples_per_frame` sample vectors.
///
/// Timepoint `i`, channel `c` is read from
/// `header_len + stride*i + bytes_per_sample*c` as a signed big-endian
/// integer.  The single trigger field at [`FrameLayout::trigger_offset`] is
/// read once, unsigned big-endian, and copied into every vector.
///
/// The returned vectors carry `timestamp == 0.0`; the caller stamps them.
/// Deterministic: identical bytes always give identical vectors.
///
/// Returns [`ClientError::MalformedFrame`] if the frame length does not match
/// the layout, or if the layout places a field beyond the frame; such a frame
/// should be discarded.
pub fn decode_frame(frame: &DeviceFrame, layout: &FrameLayout) -> Result<Vec<SampleVector>> {
    let data = frame.as_bytes();
    if data.len() != layout.frame_len {
        return Err(ClientError::MalformedFrame {
            expected: layout.frame_len,
            actual: data.len(),
        });
    }

    // A layout that was never validated may point past the end of the frame.
    let field = |off: usize, len: usize| {
        data.get(off..off + len).ok_or(ClientError::MalformedFrame {
            expected: off + len,
            actual: data.len(),
        })
    };

    let width = layout.bytes_per_sample;
    let stride = layout.stride();
    let trigger = read_unsigned_be(field(layout.trigger_offset(), layout.trigger_len)?);

    (0..layout.samples_per_frame)
        .map(|i| {
            let base = layout.header_len + stride * i;
            let channels = (0..layout.channel_count)
                .map(|c| field(base + width * c, width).map(read_signed_be))
                .collect::<Result<Vec<i32>>>()?;
            Ok(SampleVector {
                timestamp: 0.0,
                channels,
                trigger,
            })
        })
        .collect()
}

/// Read the big-endian `u16` battery field at `offset`.
///
/// Returns `None` if the frame is too short to hold it.
pub fn read_battery(frame: &DeviceFrame, offset: usize) -> Option<u16> {
    frame
        .as_bytes()
        .get(offset..offset + BATTERY_LEN)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_LEN;

    /// An 8-channel frame with every channel at `value` and the given trigger.
    fn frame_with(value: i32, trigger: u8) -> Vec<u8> {
        let layout = FrameLayout::eight_channel();
        let mut data = vec![0u8; FRAME_LEN];
        data[0] = 0xA5;
        data[1] = 0x5A;
        let be = value.to_be_bytes();
        for i in 0..layout.samples_per_frame {
            for c in 0..layout.channel_count {
                let off = layout.header_len + layout.stride() * i + 3 * c;
                data[off..off + 3].copy_from_slice(&be[1..4]);
            }
        }
        data[layout.trigger_offset()] = trigger;
        data
    }

    #[test]
    fn single_frame_chunk_decodes_to_five_vectors() {
        let layout = FrameLayout::eight_channel();
        let mut asm = FrameAssembler::new(layout.frame_len);
        let frames = asm.ingest(&frame_with(100, 0x01));
        assert_eq!(frames.len(), 1);

        let vectors = decode_frame(&frames[0], &layout).unwrap();
        assert_eq!(vectors.len(), 5);
        for v in &vectors {
            assert_eq!(v.channels, vec![100; 8]);
            assert_eq!(v.trigger, 1);
        }
    }

    #[test]
    fn split_50_90_matches_single_chunk() {
        let layout = FrameLayout::eight_channel();
        let raw = frame_with(100, 0x01);

        let mut whole = FrameAssembler::new(layout.frame_len);
        let expected = decode_frame(&whole.ingest(&raw)[0], &layout).unwrap();

        let mut split = FrameAssembler::new(layout.frame_len);
        assert!(split.ingest(&raw[..50]).is_empty());
        let frames = split.ingest(&raw[50..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(decode_frame(&frames[0], &layout).unwrap(), expected);
        assert_eq!(split.pending(), 0);
    }

    #[test]
    fn negative_counts_are_sign_extended() {
        let layout = FrameLayout::eight_channel();
        let frame = DeviceFrame::from_bytes(frame_with(-8_388_608, 0));
        let vectors = decode_frame(&frame, &layout).unwrap();
        assert!(vectors.iter().all(|v| v.channels.iter().all(|&c| c == -8_388_608)));

        let frame = DeviceFrame::from_bytes(frame_with(-1, 0));
        let vectors = decode_frame(&frame, &layout).unwrap();
        assert_eq!(vectors[0].channels[0], -1);
    }

    #[test]
    fn channel_offsets_follow_stride() {
        let layout = FrameLayout::eight_channel();
        let mut data = vec![0u8; FRAME_LEN];
        // timepoint 2, channel 5 → 3 + 24*2 + 3*5 = 66
        data[66..69].copy_from_slice(&[0x00, 0x01, 0x00]);
        let vectors = decode_frame(&DeviceFrame::from_bytes(data), &layout).unwrap();
        assert_eq!(vectors[2].channels[5], 256);
        assert_eq!(vectors[2].channels[4], 0);
        assert_eq!(vectors[1].channels[5], 0);
    }

    #[test]
    fn all_zero_frame_decodes_to_zeros() {
        let layout = FrameLayout::eight_channel();
        let frame = DeviceFrame::from_bytes(vec![0u8; FRAME_LEN]);
        let a = decode_frame(&frame, &layout).unwrap();
        let b = decode_frame(&frame, &layout).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert!(a.iter().all(|v| v.trigger == 0 && v.channels.iter().all(|&c| c == 0)));
    }

    #[test]
    fn wrong_length_frame_is_malformed() {
        let layout = FrameLayout::eight_channel();
        let frame = DeviceFrame::from_bytes(vec![0u8; 139]);
        assert!(matches!(
            decode_frame(&frame, &layout),
            Err(ClientError::MalformedFrame { expected: 140, actual: 139 })
        ));
    }

    #[test]
    fn layout_reaching_past_frame_is_malformed() {
        let layout = FrameLayout {
            samples_per_frame: 6,
            ..FrameLayout::eight_channel()
        };
        let frame = DeviceFrame::from_bytes(vec![0u8; FRAME_LEN]);
        // trigger at 3 + 24*6 = 147
        assert!(matches!(
            decode_frame(&frame, &layout),
            Err(ClientError::MalformedFrame { expected: 148, actual: 140 })
        ));
    }

    #[test]
    fn multi_byte_trigger_is_unsigned() {
        let layout = FrameLayout {
            trigger_len: 2,
            ..FrameLayout::eight_channel()
        };
        let mut data = vec![0u8; FRAME_LEN];
        data[123] = 0xFF;
        data[124] = 0xFE;
        let vectors = decode_frame(&DeviceFrame::from_bytes(data), &layout).unwrap();
        assert!(vectors.iter().all(|v| v.trigger == 0xFFFE));
    }

    #[test]
    fn resync_discards_pending_partial() {
        let mut asm = FrameAssembler::new(FRAME_LEN);
        asm.ingest(&[0xEE; 30]);
        assert_eq!(asm.pending(), 30);

        let fresh = frame_with(7, 3);
        let frames = asm.ingest(&fresh);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), fresh.as_slice());
        assert_eq!(asm.pending(), 0);

        let stats = asm.stats();
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.discarded_bytes, 30);
        assert_eq!(stats.frames, 1);
    }

    #[test]
    fn frame_length_chunk_on_empty_buffer_is_not_a_resync() {
        let mut asm = FrameAssembler::new(FRAME_LEN);
        asm.ingest(&frame_with(1, 0));
        assert_eq!(asm.stats().resyncs, 0);
    }

    #[test]
    fn coalesced_chunk_yields_all_frames_and_keeps_tail() {
        let mut asm = FrameAssembler::new(FRAME_LEN);
        let mut chunk = frame_with(1, 1);
        chunk.extend(frame_with(2, 2));
        chunk.extend(&frame_with(3, 3)[..10]);
        let frames = asm.ingest(&chunk);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_bytes()[123], 2);
        assert_eq!(asm.pending(), 10);

        asm.reset();
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn battery_field_is_big_endian() {
        let mut data = vec![0u8; FRAME_LEN];
        data[136] = 0x01;
        data[137] = 0x02;
        let frame = DeviceFrame::from_bytes(data);
        assert_eq!(read_battery(&frame, 136), Some(0x0102));
        assert_eq!(read_battery(&frame, 139), None);
    }
}
