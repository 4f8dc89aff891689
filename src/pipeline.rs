//! The per-link ingest path: chunk → frames → sample vectors → stream.
//!
//! [`FramePipeline::ingest`] is called synchronously from the notification
//! loop for every chunk, so frames are assembled, decoded and published in
//! exactly the order their bytes arrived.  Everything here is CPU-only.

use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::parse::{decode_frame, AssemblerStats, FrameAssembler};
use crate::protocol::FrameLayout;
use crate::stream::SampleStream;
use crate::telemetry::{TelemetryExtractor, TelemetrySink};

// ── Timestamp helper ──────────────────────────────────────────────────────────

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Wall-clock stamps that never go backwards within a session, even if the
/// system clock is stepped.
#[derive(Debug, Default)]
struct SessionClock {
    last: f64,
}

impl SessionClock {
    fn stamp(&mut self) -> f64 {
        self.last = now_ms().max(self.last);
        self.last
    }
}

// ── FramePipeline ─────────────────────────────────────────────────────────────

pub struct FramePipeline {
    layout: FrameLayout,
    assembler: FrameAssembler,
    telemetry: TelemetryExtractor,
    stream: SampleStream,
    clock: SessionClock,
    malformed: u64,
}

impl FramePipeline {
    pub fn new(
        layout: FrameLayout,
        telemetry_interval: u64,
        stream: SampleStream,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            assembler: FrameAssembler::new(layout.frame_len),
            telemetry: TelemetryExtractor::new(telemetry_interval, layout.battery_offset, telemetry),
            layout,
            stream,
            clock: SessionClock::default(),
            malformed: 0,
        }
    }

    /// Feed one notification payload.  Returns the number of vectors published.
    pub fn ingest(&mut self, chunk: &[u8]) -> usize {
        let mut published = 0;
        for frame in self.assembler.ingest(chunk) {
            self.telemetry.observe(&frame);
            match decode_frame(&frame, &self.layout) {
                Ok(mut vectors) => {
                    for v in &mut vectors {
                        v.timestamp = self.clock.stamp();
                    }
                    published += vectors.len();
                    self.stream.publish_all(vectors);
                }
                Err(e) => {
                    self.malformed += 1;
                    warn!("discarding frame: {e}");
                }
            }
        }
        published
    }

    /// Forget any partial frame left by a previous link.
    pub fn reset_link(&mut self) {
        self.assembler.reset();
    }

    pub fn assembler_stats(&self) -> AssemblerStats {
        self.assembler.stats()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_LEN;

    fn frame(trigger: u8, battery: u16) -> Vec<u8> {
        let mut data = vec![0u8; FRAME_LEN];
        data[123] = trigger;
        data[136..138].copy_from_slice(&battery.to_be_bytes());
        data
    }

    #[test]
    fn inconsistent_layout_discards_frames() {
        let stream = SampleStream::new();
        let mut sub = stream.subscribe_lossless();
        let layout = FrameLayout {
            samples_per_frame: 6,
            ..FrameLayout::eight_channel()
        };
        let mut pipeline = FramePipeline::new(layout, 1, stream, TelemetrySink::new(4));

        assert_eq!(pipeline.ingest(&frame(1, 3800)), 0);
        assert_eq!(pipeline.malformed_frames(), 1);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn chunks_flow_through_to_subscribers_and_telemetry() {
        let stream = SampleStream::new();
        let mut sub = stream.subscribe_lossless();
        let sink = TelemetrySink::new(4);
        let mut pipeline =
            FramePipeline::new(FrameLayout::eight_channel(), 2, stream, sink.clone());

        let mut bytes = frame(1, 3800);
        bytes.extend(frame(2, 3799));
        bytes.extend(frame(3, 3798));
        let mut total = 0;
        for chunk in bytes.chunks(61) {
            total += pipeline.ingest(chunk);
        }
        assert_eq!(total, 15);

        let got = sub.drain();
        let triggers: Vec<u32> = got.iter().map(|v| v.trigger).collect();
        assert_eq!(triggers, [1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3]);
        assert!(got.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(got[0].timestamp > 0.0);

        let levels: Vec<u16> = sink.drain().iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![3800, 3798]);
        assert_eq!(pipeline.assembler_stats().frames, 3);
        assert_eq!(pipeline.malformed_frames(), 0);
    }

    #[test]
    fn reset_link_drops_partial_frame() {
        let stream = SampleStream::new();
        let mut sub = stream.subscribe_lossless();
        let mut pipeline = FramePipeline::new(
            FrameLayout::eight_channel(),
            50,
            stream,
            TelemetrySink::new(1),
        );
        let bytes = frame(9, 0);
        pipeline.ingest(&bytes[..70]);
        pipeline.reset_link();
        assert_eq!(pipeline.ingest(&bytes[..70]), 0);
        assert_eq!(pipeline.ingest(&bytes[70..]), 5);
        assert!(sub.drain().iter().all(|v| v.trigger == 9));
    }
}
