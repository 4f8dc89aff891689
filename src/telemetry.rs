//! Battery telemetry tapped from the EEG frame stream.
//!
//! The biosensor has no separate battery characteristic; instead every frame
//! carries a battery field.  Reading it once per frame would be wasteful, so
//! [`TelemetryExtractor`] samples every Nth frame (the 1st, the N+1th, …) and
//! pushes the value into a small [`TelemetrySink`].  A UI polls the sink at
//! ≤ 1 Hz.

use log::{debug, warn};

use crate::parse::read_battery;
use crate::queue::DropOldestQueue;
use crate::types::{BatteryReading, DeviceFrame};

/// Bounded, drop-oldest queue of battery readings.
///
/// When full, the oldest reading is evicted so the freshest level always wins.
pub type TelemetrySink = DropOldestQueue<BatteryReading>;

/// Per-link frame counter that forwards every `interval`-th battery reading.
pub struct TelemetryExtractor {
    interval: u64,
    battery_offset: usize,
    frames_seen: u64,
    sink: TelemetrySink,
}

impl TelemetryExtractor {
    pub fn new(interval: u64, battery_offset: usize, sink: TelemetrySink) -> Self {
        Self {
            interval: interval.max(1),
            battery_offset,
            frames_seen: 0,
            sink,
        }
    }

    /// Count one validated frame and forward its battery field if it is due.
    ///
    /// Never blocks; a full sink drops its oldest entry.
    pub fn observe(&mut self, frame: &DeviceFrame) -> Option<BatteryReading> {
        let index = self.frames_seen;
        self.frames_seen += 1;
        if index % self.interval != 0 {
            return None;
        }

        let Some(level) = read_battery(frame, self.battery_offset) else {
            warn!(
                "telemetry: {}-byte frame has no battery field at offset {}",
                frame.len(),
                self.battery_offset
            );
            return None;
        };
        let reading = BatteryReading {
            level,
            frame_index: index,
        };
        if self.sink.push(reading) {
            debug!("telemetry: sink full, oldest battery reading dropped");
        }
        Some(reading)
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn sink(&self) -> &TelemetrySink {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BATTERY_OFFSET, FRAME_LEN};

    fn frame_with_battery(level: u16) -> DeviceFrame {
        let mut data = vec![0u8; FRAME_LEN];
        data[BATTERY_OFFSET..BATTERY_OFFSET + 2].copy_from_slice(&level.to_be_bytes());
        DeviceFrame::from_bytes(data)
    }

    #[test]
    fn samples_first_and_every_nth_frame() {
        let sink = TelemetrySink::new(16);
        let mut ex = TelemetryExtractor::new(50, BATTERY_OFFSET, sink.clone());

        let forwarded: Vec<u64> = (0..120u16)
            .filter_map(|i| ex.observe(&frame_with_battery(i)))
            .map(|r| r.frame_index)
            .collect();

        assert_eq!(forwarded, vec![0, 50, 100]);
        let levels: Vec<u16> = sink.drain().iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![0, 50, 100]);
        assert_eq!(ex.frames_seen(), 120);
    }

    #[test]
    fn full_sink_keeps_freshest_readings() {
        let sink = TelemetrySink::new(2);
        let mut ex = TelemetryExtractor::new(1, BATTERY_OFFSET, sink.clone());
        for level in [3700, 3690, 3680] {
            ex.observe(&frame_with_battery(level));
        }
        let levels: Vec<u16> = sink.drain().iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![3690, 3680]);
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn short_frame_is_skipped() {
        let sink = TelemetrySink::new(2);
        let mut ex = TelemetryExtractor::new(1, BATTERY_OFFSET, sink.clone());
        assert!(ex.observe(&DeviceFrame::from_bytes(vec![0u8; 10])).is_none());
        assert!(sink.is_empty());
    }
}
