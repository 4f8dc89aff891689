//! # msm-rs
//!
//! Async Rust library and CLI for streaming EEG data from MSM Bluetooth Low
//! Energy biosensors.
//!
//! ## Supported hardware
//!
//! | Family | Frame | EEG ch | Samples / frame | Trigger | Battery |
//! |---|---|---|---|---|---|
//! | MSM 8-channel | 140 B | 8 × 24-bit BE | 5 | 1 B @ 123 | u16 BE @ 136 |
//!
//! Other layouts are described with [`protocol::FrameLayout`] (or the
//! `[frame]` section of the config file).
//!
//! ## Data path
//!
//! ```text
//! notify chunks ─▶ FrameAssembler ─▶ decode_frame ─▶ SampleStream ─┬▶ Recorder (lossless)
//!                        │                                         └▶ display (drop-oldest)
//!                        └─▶ TelemetryExtractor ─▶ TelemetrySink
//! CommandChannel ─▶ EegClient receive loop ─▶ control characteristic
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use msm_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EegClientConfig::default();
//!     let backend = BtleplugBackend::new(
//!         config.notify_characteristic,
//!         config.control_characteristic,
//!         config.connect_timeout,
//!     );
//!     let mut client = EegClient::new(backend, config);
//!     let mut samples = client.samples().subscribe_lossless();
//!     let commands = client.command_channel();
//!
//!     client.connect().await?;
//!     tokio::spawn(async move { client.run().await });
//!
//!     commands.start_experiment_trigger(1)?;
//!     while let Some(v) = samples.recv().await {
//!         println!("{:.0} ms  {:?}  trigger={}", v.timestamp, v.channels, v.trigger);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`eeg_client`] | Scanning, connecting, the receive loop and auto-reconnect |
//! | [`command`] | [`command::CommandChannel`] and trigger helpers |
//! | [`stream`] | Publish / subscribe fan-out of decoded sample vectors |
//! | [`recorder`] | Lossless CSV recorder for named segments |
//! | [`pipeline`] | Per-link ingest: assemble, decode, timestamp, publish |
//! | [`parse`] | Frame reassembly and byte-to-sample decoding |
//! | [`telemetry`] | Battery sampling into a drop-oldest sink |
//! | [`queue`] | Bounded drop-oldest queue |
//! | [`transport`] | BLE capability traits used by the client |
//! | [`ble`] | `btleplug` implementation of [`transport`] |
//! | [`types`] | Frames, sample vectors, commands and connection state |
//! | [`protocol`] | GATT UUIDs, frame layout and control opcodes |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |

pub mod ble;
pub mod command;
pub mod config;
pub mod eeg_client;
pub mod error;
pub mod parse;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod recorder;
pub mod stream;
pub mod telemetry;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::ble::BtleplugBackend;
    pub use crate::command::CommandChannel;
    pub use crate::eeg_client::{EegClient, EegClientConfig, StopHandle};
    pub use crate::error::{ClientError, Result};

    // ── Data ──────────────────────────────────────────────────────────────────
    pub use crate::stream::{DeliveryPolicy, SampleStream, SampleSubscription};
    pub use crate::telemetry::TelemetrySink;
    pub use crate::types::{
        BatteryReading, ConnectionState, ControlCommand, Established, SampleVector,
    };

    // ── Recording ─────────────────────────────────────────────────────────────
    pub use crate::recorder::{Recorder, RecorderHandle, RecorderSettings};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{FrameLayout, EEG_CHANNEL_NAMES, SCALE_DIVISOR};
}
