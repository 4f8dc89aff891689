use std::fmt;

use bytes::Bytes;

use crate::protocol::{
    CATEGORY_DEVICE_MODE, CATEGORY_TRIGGER, MODE_PREPARE, MODE_START, TRIGGER_END_OF_INTERRUPT,
    TRIGGER_SONG_FINISHED,
};

/// One complete, length-validated device frame cut out of the notification stream.
///
/// Produced only by [`crate::parse::FrameAssembler`], which guarantees the
/// length equals the configured `frame_len`.  Frames are handed to the decoder
/// strictly in the order their bytes arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFrame {
    bytes: Bytes,
}

impl DeviceFrame {
    /// Wrap raw bytes as a frame.  The length is checked again by
    /// [`crate::parse::decode_frame`].
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One timepoint across all EEG channels plus the trigger channel.
///
/// Channel values are raw signed ADC counts; sinks that persist to disk divide
/// them by [`crate::protocol::SCALE_DIVISOR`].  Every vector decoded from the
/// same frame carries the same `trigger`, because the device sends one trigger
/// per frame, not per timepoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleVector {
    /// Wall-clock time in milliseconds since Unix epoch, assigned when the
    /// vector was decoded.  Non-decreasing within a session.
    pub timestamp: f64,
    /// Raw counts, one per channel in frame order.
    pub channels: Vec<i32>,
    /// Trigger value of the originating frame (`0` when no marker is active).
    pub trigger: u32,
}

impl SampleVector {
    /// `CHANNEL_COUNT + 1` slots: every channel followed by the trigger.
    pub fn values(&self) -> Vec<f64> {
        let mut out: Vec<f64> = self.channels.iter().map(|&c| c as f64).collect();
        out.push(self.trigger as f64);
        out
    }
}

/// Battery field sampled from every Nth validated frame.
///
/// The unit is whatever the firmware reports; it is forwarded unconverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    /// Raw big-endian `u16` from the frame.
    pub level: u16,
    /// Index (0-based, per session) of the frame it was read from.
    pub frame_index: u64,
}

/// Link lifecycle owned by [`crate::eeg_client::EegClient`].
///
/// ```text
/// Disconnected ─connect()─▶ Scanning ─subscribed─▶ Connected
///       ▲                      │                     │  ▲
///       │                  not found          transport │ retry
///       │                      ▼               error  ▼  │ succeeds
///       └──────── stop() ── Disconnected      Reconnecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// A two-byte `{category, value}` command written to the control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCommand {
    pub category: u8,
    pub value: u8,
}

impl ControlCommand {
    pub const fn new(category: u8, value: u8) -> Self {
        Self { category, value }
    }

    /// Trigger marker `{0xFF, tag}`; the tag is echoed into the EEG stream.
    pub const fn trigger(tag: u8) -> Self {
        Self::new(CATEGORY_TRIGGER, tag)
    }

    /// Device-mode configuration `{0x02, mode}`.
    pub const fn device_mode(mode: u8) -> Self {
        Self::new(CATEGORY_DEVICE_MODE, mode)
    }

    /// `{0xFF, 0xFF}`: end of an interrupted trial.
    pub const fn end_of_interrupt() -> Self {
        Self::trigger(TRIGGER_END_OF_INTERRUPT)
    }

    /// `{0xFF, 0xAA}`: a song finished playing.
    pub const fn song_finished() -> Self {
        Self::trigger(TRIGGER_SONG_FINISHED)
    }

    /// The two writes sent after every successful subscription, in order.
    /// [`crate::protocol::INIT_STEP_DELAY`] must elapse between them.
    pub const fn init_sequence() -> [Self; 2] {
        [Self::device_mode(MODE_PREPARE), Self::device_mode(MODE_START)]
    }

    pub fn is_trigger(&self) -> bool {
        self.category == CATEGORY_TRIGGER
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.category, self.value]
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{0x{:02X}, 0x{:02X}}}", self.category, self.value)
    }
}

/// A device the client found and subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established {
    /// Advertised name (e.g. `"MSM-8C-0142"`).
    pub name: String,
    /// Platform identifier: a MAC address on Linux, a UUID on macOS / Windows.
    pub id: String,
}
