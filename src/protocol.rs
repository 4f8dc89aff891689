//! GATT UUIDs, frame-layout constants and control opcodes for MSM EEG biosensors.
//!
//! The biosensor streams fixed-length binary frames on a single notify
//! characteristic and accepts two-byte `{category, value}` commands on a
//! separate write characteristic.  Both characteristics live in the vendor's
//! 16-bit `0xFFEx` range under the Bluetooth base UUID.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{ClientError, Result};

// ── Characteristics ───────────────────────────────────────────────────────────

/// Notify characteristic carrying the EEG frame stream.
///
/// Notifications are *not* frame-aligned: the BLE stack may split one frame
/// across several notifications or coalesce several frames into one,
/// depending on the negotiated MTU.  See [`crate::parse::FrameAssembler`].
pub const NOTIFY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Write characteristic for device-mode and trigger commands.
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000ffe3_0000_1000_8000_00805f9b34fb);

/// Advertised-name substring matched during scanning.
pub const DEFAULT_DEVICE_NAME: &str = "MSM";

// ── 8-channel family ──────────────────────────────────────────────────────────

/// Total length of one device frame in bytes.
pub const FRAME_LEN: usize = 140;

/// Leading bytes before the first sample (two sync bytes + an order counter).
pub const HEADER_LEN: usize = 3;

/// EEG channels carried by the 8-channel family.
pub const CHANNEL_COUNT: usize = 8;

/// Timepoints carried by one frame.
pub const SAMPLES_PER_FRAME: usize = 5;

/// Width of one channel value: 24-bit big-endian two's complement.
pub const BYTES_PER_SAMPLE: usize = 3;

/// Width of the per-frame trigger field.
pub const TRIGGER_LEN: usize = 1;

/// Offset of the big-endian `u16` battery field.
pub const BATTERY_OFFSET: usize = 136;

/// Width of the battery field.
pub const BATTERY_LEN: usize = 2;

/// Divisor applied by file-writing sinks to turn raw counts into µV.
pub const SCALE_DIVISOR: f64 = 120.0;

/// Default montage for the 8-channel family, in frame order.
pub const EEG_CHANNEL_NAMES: [&str; CHANNEL_COUNT] =
    ["Fp1", "Fp2", "F3", "F4", "C3", "C4", "P3", "P4"];

// ── Control opcodes ───────────────────────────────────────────────────────────

/// Command category for device-mode configuration.
pub const CATEGORY_DEVICE_MODE: u8 = 0x02;

/// Command category for trigger markers echoed into the EEG stream.
pub const CATEGORY_TRIGGER: u8 = 0xFF;

/// Device-mode value sent first during initialisation.
pub const MODE_PREPARE: u8 = 0x02;

/// Device-mode value that starts acquisition.
pub const MODE_START: u8 = 0x01;

/// Pause between the two initialisation writes.
pub const INIT_STEP_DELAY: Duration = Duration::from_millis(500);

/// Trigger marking the end of an interrupted trial.
pub const TRIGGER_END_OF_INTERRUPT: u8 = 0xFF;

/// Trigger marking that a song played to completion.
pub const TRIGGER_SONG_FINISHED: u8 = 0xAA;

/// Trigger marking the start of a recorded segment.
pub const TRIGGER_SEGMENT_START: u8 = 0x01;

/// Trigger resetting the marker at the end of a recorded segment.
pub const TRIGGER_SEGMENT_END: u8 = 0x02;

// ── Frame layout ──────────────────────────────────────────────────────────────

/// Byte layout of one device frame.
///
/// ```text
/// [0 .. header_len)                     header
/// [header_len .. trigger_offset)        samples, timepoint-major:
///                                         timepoint i, channel c at
///                                         header_len + stride*i + bytes_per_sample*c
/// [trigger_offset .. +trigger_len)      one trigger per frame
/// [battery_offset .. +2)                battery level, u16 BE
/// ... padding up to frame_len
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub frame_len: usize,
    pub header_len: usize,
    pub channel_count: usize,
    pub samples_per_frame: usize,
    pub bytes_per_sample: usize,
    pub trigger_len: usize,
    pub battery_offset: usize,
}

impl FrameLayout {
    /// Layout of the 140-byte, 8-channel device family.
    pub const fn eight_channel() -> Self {
        Self {
            frame_len: FRAME_LEN,
            header_len: HEADER_LEN,
            channel_count: CHANNEL_COUNT,
            samples_per_frame: SAMPLES_PER_FRAME,
            bytes_per_sample: BYTES_PER_SAMPLE,
            trigger_len: TRIGGER_LEN,
            battery_offset: BATTERY_OFFSET,
        }
    }

    /// Bytes occupied by one timepoint across all channels (24 for 8 channels).
    pub fn stride(&self) -> usize {
        self.channel_count * self.bytes_per_sample
    }

    /// Offset of the trigger field, directly after the sample block.
    pub fn trigger_offset(&self) -> usize {
        self.header_len + self.stride() * self.samples_per_frame
    }

    /// Check that every field fits inside `frame_len`.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(ClientError::Config(msg));

        if self.channel_count == 0 {
            return bad("channel count must be at least 1".into());
        }
        if self.samples_per_frame == 0 {
            return bad("samples_per_frame must be at least 1".into());
        }
        if !(1..=4).contains(&self.bytes_per_sample) {
            return bad(format!(
                "bytes_per_sample must be 1..=4, got {}",
                self.bytes_per_sample
            ));
        }
        if !(1..=4).contains(&self.trigger_len) {
            return bad(format!("trigger_len must be 1..=4, got {}", self.trigger_len));
        }
        let trigger_end = self.trigger_offset() + self.trigger_len;
        if trigger_end > self.frame_len {
            return bad(format!(
                "samples and trigger need {trigger_end} bytes but frame_len is {}",
                self.frame_len
            ));
        }
        if self.battery_offset + BATTERY_LEN > self.frame_len {
            return bad(format!(
                "battery field at {} does not fit in a {}-byte frame",
                self.battery_offset, self.frame_len
            ));
        }
        Ok(())
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::eight_channel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_channel_offsets() {
        let layout = FrameLayout::eight_channel();
        assert_eq!(layout.stride(), 24);
        assert_eq!(layout.trigger_offset(), 123);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn rejects_overlong_sample_block() {
        let layout = FrameLayout {
            samples_per_frame: 6,
            ..FrameLayout::eight_channel()
        };
        assert!(matches!(layout.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_battery_past_end() {
        let layout = FrameLayout {
            battery_offset: 139,
            ..FrameLayout::eight_channel()
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn rejects_wide_samples() {
        let layout = FrameLayout {
            bytes_per_sample: 5,
            ..FrameLayout::eight_channel()
        };
        assert!(layout.validate().is_err());
    }
}
