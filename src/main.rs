use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use msm_rs::ble::BtleplugBackend;
use msm_rs::command::CommandChannel;
use msm_rs::config::Config;
use msm_rs::eeg_client::EegClient;
use msm_rs::recorder::{Recorder, RecorderHandle};
use msm_rs::stream::{SampleStream, SampleSubscription};
use msm_rs::telemetry::TelemetrySink;
use msm_rs::types::ConnectionState;

#[derive(Parser, Debug)]
#[command(name = "msm-rs", version, about = "Stream EEG from an MSM biosensor over BLE")]
struct Args {
    /// TOML configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Connect to the first device whose name contains this string
    #[arg(short, long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=msm_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(device) = args.device {
        config.bluetooth.device_name = device;
    }
    config.validate()?;
    let client_config = config.client_config()?;

    // ── Client and sinks ──────────────────────────────────────────────────────
    let backend = BtleplugBackend::new(
        client_config.notify_characteristic,
        client_config.control_characteristic,
        client_config.connect_timeout,
    );
    let mut client = EegClient::new(backend, client_config);
    let commands = client.command_channel();
    let stop = client.stop_handle();
    let telemetry = client.telemetry();
    let mut state = client.state();
    let samples = client.samples();

    let recorder = Recorder::new(config.recorder_settings()).spawn(samples.subscribe_lossless());
    let display = samples.subscribe_lossy(config.stream.display_queue_capacity);

    // ── Connect ───────────────────────────────────────────────────────────────
    info!("Scanning for {:?} …", config.bluetooth.device_name);
    let device = tokio::select! {
        r = client.connect() => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted.");
            return Ok(());
        }
    };
    info!("✅  Connected to: {} ({})", device.name, device.id);

    let receive = tokio::spawn(async move { client.run().await });
    let summary = tokio::spawn(live_summary(
        samples.clone(),
        display,
        telemetry.clone(),
        state.clone(),
        config.recording.scale_divisor,
    ));

    info!("Commands (type + Enter):");
    info!("  t <1-255>  – start-of-trial trigger");
    info!("  i          – end-of-interrupt trigger");
    info!("  f          – song-finished trigger");
    info!("  r <name>   – start recording segment <name>");
    info!("  s          – stop recording");
    info!("  b          – last battery reading");
    info!("  q          – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so the blocking StdinLock never
    // sits on the runtime.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) if line == "q" => break,
                Some(line) => handle_line(&line, &commands, &recorder, &telemetry).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = state.wait_for(|s| *s == ConnectionState::Disconnected) => {
                warn!("Receive loop ended.");
                break;
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    info!("Quit requested.");
    if commands.is_connected() {
        commands.segment_end_marker().ok();
    }
    match recorder.shutdown().await {
        Ok(Some(saved)) => info!("Saved {}", saved.path.display()),
        Ok(None) => {}
        Err(e) => error!("Recorder error: {e}"),
    }
    stop.stop();
    match receive.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Receive loop error: {e}"),
        Err(e) => error!("Receive task failed: {e}"),
    }
    summary.abort();
    info!("Exiting.");
    Ok(())
}

async fn handle_line(
    line: &str,
    commands: &CommandChannel,
    recorder: &RecorderHandle,
    telemetry: &TelemetrySink,
) {
    let (cmd, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    let result = match cmd {
        "" => return,
        "t" => match arg.parse::<u8>() {
            Ok(tag) => commands.start_experiment_trigger(tag),
            Err(_) => {
                warn!("usage: t <1-255>");
                return;
            }
        },
        "i" => commands.end_of_interrupt_trigger(),
        "f" => commands.song_finished_trigger(),
        "r" => {
            if arg.is_empty() {
                warn!("usage: r <name>");
                return;
            }
            if let Err(e) = recorder.start(arg) {
                error!("Recorder error: {e}");
                return;
            }
            commands.segment_start_marker()
        }
        "s" => {
            match recorder.stop().await {
                Ok(Some(saved)) => info!("Saved {} ({} rows)", saved.path.display(), saved.rows),
                Ok(None) => info!("Not recording."),
                Err(e) => error!("Recorder error: {e}"),
            }
            commands.segment_end_marker()
        }
        "b" => {
            match telemetry.latest() {
                Some(r) => println!("[BATTERY] level={}  (frame #{})", r.level, r.frame_index),
                None => println!("[BATTERY] no reading yet"),
            }
            return;
        }
        other => {
            warn!("Unknown command: '{other}'");
            return;
        }
    };
    if let Err(e) = result {
        error!("Command error: {e}");
    }
}

/// Print one line per second from the drop-oldest display subscription.
async fn live_summary(
    samples: SampleStream,
    mut display: SampleSubscription,
    telemetry: TelemetrySink,
    state: tokio::sync::watch::Receiver<ConnectionState>,
    scale_divisor: f64,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut last = Instant::now();
    let mut last_published = samples.published();
    loop {
        tick.tick().await;
        let batch = display.drain();
        let elapsed = last.elapsed().as_secs_f64();
        let published = samples.published();
        let rate = if elapsed > 0.0 {
            (published - last_published) as f64 / elapsed
        } else {
            0.0
        };
        last = Instant::now();
        last_published = published;
        let battery = telemetry
            .latest()
            .map(|r| r.level.to_string())
            .unwrap_or_else(|| "–".into());
        match batch.last() {
            Some(v) => println!(
                "[EEG] {rate:6.1} samples/s  trigger={:3}  ch0={:+10.2} µV  battery={battery}  dropped={}",
                v.trigger,
                v.channels.first().copied().unwrap_or(0) as f64 / scale_divisor,
                display.dropped(),
            ),
            None => println!("[EEG] no data  state={}  battery={battery}", *state.borrow()),
        }
    }
}
