use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::command::CommandChannel;
use crate::error::{ClientError, Result, TransportError};
use crate::parse::AssemblerStats;
use crate::pipeline::FramePipeline;
use crate::protocol::{
    FrameLayout, CONTROL_CHARACTERISTIC, DEFAULT_DEVICE_NAME, INIT_STEP_DELAY,
    NOTIFY_CHARACTERISTIC,
};
use crate::stream::SampleStream;
use crate::telemetry::TelemetrySink;
use crate::transport::{select_device, BleBackend, BleLink, DiscoveredDevice, Notifications};
use crate::types::{ConnectionState, ControlCommand, Established};

// ── EegClientConfig ───────────────────────────────────────────────────────────

/// Configuration for [`EegClient`].
#[derive(Debug, Clone)]
pub struct EegClientConfig {
    /// Connect to the first device whose advertised name contains this
    /// (case-sensitive).  Default: `"MSM"`.
    pub device_name: String,
    /// Scan attempts before [`EegClient::connect`] gives up.  Default: `3`.
    pub max_retries: u32,
    /// Pause between scan attempts.  Default: 1 s.
    pub retry_interval: Duration,
    /// Length of one scan cycle.  Default: 2 s.
    pub scan_duration: Duration,
    /// Pause before each reconnect attempt after the link is lost.  Default: 1 s.
    pub reconnect_backoff: Duration,
    /// Upper bound for establishing the BLE connection.  Default: 10 s.
    pub connect_timeout: Duration,
    pub notify_characteristic: Uuid,
    pub control_characteristic: Uuid,
    pub layout: FrameLayout,
    /// Forward the battery field of every Nth frame.  Default: `50`.
    pub battery_interval: u64,
    /// Capacity of the drop-oldest telemetry sink.  Default: `16`.
    pub telemetry_capacity: usize,
    /// Write the device-mode init sequence after every subscription.
    /// Default: `true`.
    pub send_init_sequence: bool,
}

impl Default for EegClientConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.into(),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            scan_duration: Duration::from_secs(2),
            reconnect_backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            notify_characteristic: NOTIFY_CHARACTERISTIC,
            control_characteristic: CONTROL_CHARACTERISTIC,
            layout: FrameLayout::eight_channel(),
            battery_interval: 50,
            telemetry_capacity: 16,
            send_init_sequence: true,
        }
    }
}

// ── StopHandle ────────────────────────────────────────────────────────────────

/// Cancels scanning, connection setup, backoff and the receive loop of one
/// [`EegClient`].
///
/// Idempotent, and callable from any task.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once stop has been requested.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    // An Err means every sender is gone, which can only happen once the
    // client itself is being torn down.
    let _ = rx.wait_for(|&s| s).await;
}

// ── EegClient ─────────────────────────────────────────────────────────────────

struct Link {
    handle: Box<dyn BleLink>,
    notifications: Notifications,
}

enum LinkEnd {
    Stopped,
    Lost(String),
}

enum SetupError {
    Stopped,
    Transport(TransportError),
}

impl From<TransportError> for SetupError {
    fn from(e: TransportError) -> Self {
        SetupError::Transport(e)
    }
}

/// Connection manager for one MSM biosensor.
///
/// Owns the device link and the whole ingest graph behind it:
///
/// | Piece | Reached through |
/// |---|---|
/// | decoded samples | [`EegClient::samples`] |
/// | battery readings | [`EegClient::telemetry`] |
/// | control writes | [`EegClient::command_channel`] |
/// | link state | [`EegClient::state`] |
/// | cancellation | [`EegClient::stop_handle`] |
///
/// Take the handles first, then call [`EegClient::connect`] and drive
/// [`EegClient::run`] (typically on a spawned task).  `run` keeps
/// reconnecting to the same device until stopped.
pub struct EegClient<B: BleBackend> {
    backend: B,
    config: EegClientConfig,
    state: watch::Sender<ConnectionState>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    commands_tx: mpsc::UnboundedSender<ControlCommand>,
    commands_rx: mpsc::UnboundedReceiver<ControlCommand>,
    stream: SampleStream,
    telemetry: TelemetrySink,
    pipeline: FramePipeline,
    device: Option<DiscoveredDevice>,
    link: Option<Link>,
}

impl<B: BleBackend> EegClient<B> {
    pub fn new(backend: B, config: EegClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let stream = SampleStream::new();
        let telemetry = TelemetrySink::new(config.telemetry_capacity);
        let pipeline = FramePipeline::new(
            config.layout,
            config.battery_interval,
            stream.clone(),
            telemetry.clone(),
        );
        Self {
            backend,
            config,
            state,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            commands_tx,
            commands_rx,
            stream,
            telemetry,
            pipeline,
            device: None,
            link: None,
        }
    }

    // ── Handles ──────────────────────────────────────────────────────────────

    pub fn samples(&self) -> SampleStream {
        self.stream.clone()
    }

    pub fn telemetry(&self) -> TelemetrySink {
        self.telemetry.clone()
    }

    pub fn command_channel(&self) -> CommandChannel {
        CommandChannel::new(self.commands_tx.clone(), self.state.subscribe())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The device chosen by the last successful [`EegClient::connect`].
    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.device.as_ref()
    }

    pub fn assembler_stats(&self) -> AssemblerStats {
        self.pipeline.assembler_stats()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("connection state: {prev} → {next}");
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Sleep for `duration` unless stop is requested first.
    async fn pause(&mut self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = stopped(&mut self.stop_rx) => Err(ClientError::Stopped),
        }
    }

    // ── connect ──────────────────────────────────────────────────────────────

    /// Scan for a device, connect, subscribe and initialise it.
    ///
    /// Up to `max_retries` scan cycles are run, `retry_interval` apart; the
    /// first advertised name containing `device_name` wins.  On failure the
    /// client is back in `Disconnected` and `connect` may be called again.
    ///
    /// Fails with [`ClientError::Config`] before scanning if `layout` does not
    /// describe a consistent frame.
    pub async fn connect(&mut self) -> Result<Established> {
        if self.is_stopped() {
            return Err(ClientError::Stopped);
        }
        self.config.layout.validate()?;
        self.set_state(ConnectionState::Scanning);
        let result = self.scan_and_establish().await;
        if result.is_err() {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    async fn scan_and_establish(&mut self) -> Result<Established> {
        let wanted = self.config.device_name.clone();
        let max = self.config.max_retries;
        let mut last_failure = None;

        for attempt in 1..=max {
            let scan = tokio::select! {
                r = self.backend.scan(self.config.scan_duration) => r,
                _ = stopped(&mut self.stop_rx) => return Err(ClientError::Stopped),
            };
            match scan {
                Ok(devices) => match select_device(&devices, &wanted).cloned() {
                    Some(device) => {
                        info!("Found device: {} ({})", device.name, device.id);
                        let stop = self.stop_rx.clone();
                        match Self::establish(&self.backend, &self.config, &device, stop).await {
                            Ok(link) => return self.adopt(device, link).await,
                            Err(SetupError::Stopped) => return Err(ClientError::Stopped),
                            Err(SetupError::Transport(e)) => {
                                warn!("attempt {attempt}/{max}: connect to {} failed: {e}", device.name);
                                last_failure = Some(e.to_string());
                            }
                        }
                    }
                    None => info!(
                        "attempt {attempt}/{max}: no device matching {wanted:?} among {} seen",
                        devices.len()
                    ),
                },
                Err(e) => warn!("attempt {attempt}/{max}: scan failed: {e}"),
            }
            if attempt < max {
                self.pause(self.config.retry_interval).await?;
            }
        }

        Err(match last_failure {
            Some(reason) => ClientError::ConnectFailed(reason),
            None => ClientError::DeviceNotFound {
                name: wanted,
                attempts: max,
            },
        })
    }

    /// Install a freshly established link, unless stop raced with it.
    async fn adopt(&mut self, device: DiscoveredDevice, link: Link) -> Result<Established> {
        if self.is_stopped() {
            link.handle.disconnect().await.ok();
            return Err(ClientError::Stopped);
        }
        let established = Established {
            name: device.name.clone(),
            id: device.id.clone(),
        };
        self.pipeline.reset_link();
        self.device = Some(device);
        self.link = Some(link);
        self.set_state(ConnectionState::Connected);
        info!("Streaming from {}", established.name);
        Ok(established)
    }

    /// Connect, subscribe, then send the init sequence.  Every step gives way
    /// to stop; the link is released again if any step fails or is stopped.
    ///
    /// Borrows fields rather than `&self`; `Notifications` is not `Sync`.
    async fn establish(
        backend: &B,
        config: &EegClientConfig,
        device: &DiscoveredDevice,
        mut stop: watch::Receiver<bool>,
    ) -> std::result::Result<Link, SetupError> {
        let handle = tokio::select! {
            r = backend.connect(device) => r?,
            _ = stopped(&mut stop) => return Err(SetupError::Stopped),
        };
        let setup = tokio::select! {
            r = Self::initialise(&*handle, config) => r.map_err(SetupError::from),
            _ = stopped(&mut stop) => Err(SetupError::Stopped),
        };
        match setup {
            Ok(notifications) => Ok(Link {
                handle,
                notifications,
            }),
            Err(e) => {
                handle.disconnect().await.ok();
                Err(e)
            }
        }
    }

    async fn initialise(
        handle: &dyn BleLink,
        config: &EegClientConfig,
    ) -> std::result::Result<Notifications, TransportError> {
        let notifications = handle.subscribe().await?;
        if config.send_init_sequence {
            for (i, command) in ControlCommand::init_sequence().into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(INIT_STEP_DELAY).await;
                }
                handle.write(&command.to_bytes()).await?;
                debug!("init: sent {command}");
            }
        }
        Ok(notifications)
    }

    // ── run ──────────────────────────────────────────────────────────────────

    /// Receive loop: feed notifications into the pipeline and write queued
    /// commands, reconnecting to the same device whenever the link is lost.
    ///
    /// Returns once [`StopHandle::stop`] is called.  Transport faults are
    /// logged and retried without limit, never returned.
    pub async fn run(&mut self) -> Result<()> {
        let device = self.device.clone().ok_or(ClientError::NotConnected)?;

        while !self.is_stopped() {
            let link = match self.link.take() {
                Some(link) => link,
                None => match self.reconnect(&device).await {
                    Ok(Some(link)) => link,
                    Ok(None) => continue,
                    Err(ClientError::Stopped) => break,
                    Err(e) => return Err(e),
                },
            };

            match self.drive(link).await {
                LinkEnd::Stopped => break,
                LinkEnd::Lost(reason) => {
                    let e = ClientError::TransportDisconnected(reason);
                    warn!("{}: {e}", device.name);
                    self.set_state(ConnectionState::Reconnecting);
                    self.discard_pending_commands();
                }
            }
        }

        // Stop may have landed between `connect` and `run`.
        if let Some(link) = self.link.take() {
            link.handle.disconnect().await.ok();
        }
        self.set_state(ConnectionState::Disconnected);
        info!("receive loop for {} stopped", device.name);
        Ok(())
    }

    /// One backoff + reconnect attempt.  `Ok(None)` means try again.
    async fn reconnect(&mut self, device: &DiscoveredDevice) -> Result<Option<Link>> {
        self.set_state(ConnectionState::Reconnecting);
        self.pause(self.config.reconnect_backoff).await?;
        info!("Reconnecting to {}…", device.name);
        let stop = self.stop_rx.clone();
        match Self::establish(&self.backend, &self.config, device, stop).await {
            Ok(link) => {
                if self.is_stopped() {
                    link.handle.disconnect().await.ok();
                    return Err(ClientError::Stopped);
                }
                self.pipeline.reset_link();
                self.set_state(ConnectionState::Connected);
                info!("Reconnected to {}", device.name);
                Ok(Some(link))
            }
            Err(SetupError::Stopped) => Err(ClientError::Stopped),
            Err(SetupError::Transport(e)) => {
                warn!("reconnect to {} failed: {e}", device.name);
                Ok(None)
            }
        }
    }

    async fn drive(&mut self, link: Link) -> LinkEnd {
        let Link {
            handle,
            mut notifications,
        } = link;
        let mut chunks: u64 = 0;

        let end = loop {
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop_rx) => break LinkEnd::Stopped,
                Some(command) = self.commands_rx.recv() => {
                    if let Err(e) = handle.write(&command.to_bytes()).await {
                        break LinkEnd::Lost(format!("write {command} failed: {e}"));
                    }
                    debug!("sent {command}");
                }
                chunk = notifications.next() => match chunk {
                    Some(bytes) => {
                        chunks += 1;
                        let published = self.pipeline.ingest(&bytes);
                        if chunks <= 3 || chunks % 500 == 0 {
                            debug!(
                                "notif #{chunks} len={} vectors={published} (total published: {})",
                                bytes.len(),
                                self.stream.published()
                            );
                        }
                    }
                    None => break LinkEnd::Lost("notification stream ended".into()),
                },
            }
        };

        if let Err(e) = handle.disconnect().await {
            debug!("disconnect: {e}");
        }
        end
    }

    fn discard_pending_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            warn!("command {command} discarded: link lost before it was written");
        }
    }

    /// Stop and release the current link, if any.  Only needed when
    /// [`EegClient::run`] is never called after a successful `connect`.
    pub async fn disconnect(&mut self) {
        self.stop_handle().stop();
        if let Some(link) = self.link.take() {
            if let Err(e) = link.handle.disconnect().await {
                debug!("disconnect: {e}");
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
