//! BLE capability seam between the connection manager and a Bluetooth stack.
//!
//! [`crate::eeg_client::EegClient`] only needs four things from the stack:
//! scan for advertising devices, connect to one, subscribe to the data
//! characteristic, and write to the control characteristic.  The
//! [`crate::ble`] module implements these on top of `btleplug`; tests use
//! `mocks`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TransportError;

/// Raw notification payloads, in arrival order.  The stream ends when the
/// link drops.
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// An advertising device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Advertised local name.
    pub name: String,
    /// Platform identifier used to connect.
    pub id: String,
}

#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    /// Run one scan cycle of `duration` and return every named device seen.
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Open a link to a device returned by [`BleBackend::scan`].
    async fn connect(&self, device: &DiscoveredDevice)
        -> Result<Box<dyn BleLink>, TransportError>;
}

#[async_trait]
pub trait BleLink: Send + Sync {
    /// Enable notifications on the data characteristic.
    async fn subscribe(&self) -> Result<Notifications, TransportError>;

    /// Write one payload to the control characteristic.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Release the link.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// First device whose advertised name contains `needle` (case-sensitive).
///
/// Scan order wins, not signal strength.
pub fn select_device<'a>(
    devices: &'a [DiscoveredDevice],
    needle: &str,
) -> Option<&'a DiscoveredDevice> {
    devices.iter().find(|d| d.name.contains(needle))
}

#[cfg(test)]
pub mod mocks {
    //! Scriptable in-memory backend.
    //!
    //! Every successful `connect` creates a new link whose notification
    //! stream is fed through [`MockBackend::push`]; dropping the feed with
    //! [`MockBackend::drop_link`] ends the stream like a lost connection.

    use super::*;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct State {
        scans: VecDeque<Vec<DiscoveredDevice>>,
        scan_count: usize,
        connect_count: usize,
        connect_failures: usize,
        feeds: Vec<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        writes: Vec<(usize, Vec<u8>)>,
        disconnects: Vec<usize>,
        fail_writes: bool,
        hang_connects: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockBackend {
        state: Arc<Mutex<State>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Backend whose every scan sees `names`.
        pub fn advertising(names: &[&str]) -> Self {
            let backend = Self::new();
            backend.script_scan(names);
            backend
        }

        /// Queue the result of the next scan.  The last scripted result repeats.
        pub fn script_scan(&self, names: &[&str]) {
            let devices = names
                .iter()
                .enumerate()
                .map(|(i, n)| DiscoveredDevice {
                    name: n.to_string(),
                    id: format!("AA:BB:CC:DD:EE:{i:02X}"),
                })
                .collect();
            self.state.lock().unwrap().scans.push_back(devices);
        }

        /// Make the next `n` connect attempts fail.
        pub fn fail_connects(&self, n: usize) {
            self.state.lock().unwrap().connect_failures = n;
        }

        /// Make connect attempts block forever, like a device that went out
        /// of range mid-handshake.
        pub fn hang_connects(&self, hang: bool) {
            self.state.lock().unwrap().hang_connects = hang;
        }

        pub fn fail_writes(&self, fail: bool) {
            self.state.lock().unwrap().fail_writes = fail;
        }

        /// Deliver a notification on link `link`.
        pub fn push(&self, link: usize, chunk: &[u8]) {
            let state = self.state.lock().unwrap();
            if let Some(Some(tx)) = state.feeds.get(link) {
                let _ = tx.send(chunk.to_vec());
            }
        }

        /// End link `link`'s notification stream.
        pub fn drop_link(&self, link: usize) {
            if let Some(feed) = self.state.lock().unwrap().feeds.get_mut(link) {
                feed.take();
            }
        }

        pub fn scan_count(&self) -> usize {
            self.state.lock().unwrap().scan_count
        }

        pub fn connect_count(&self) -> usize {
            self.state.lock().unwrap().connect_count
        }

        pub fn link_count(&self) -> usize {
            self.state.lock().unwrap().feeds.len()
        }

        /// `(link, payload)` for every successful write, in write order.
        pub fn writes(&self) -> Vec<(usize, Vec<u8>)> {
            self.state.lock().unwrap().writes.clone()
        }

        pub fn disconnects(&self) -> Vec<usize> {
            self.state.lock().unwrap().disconnects.clone()
        }
    }

    #[async_trait]
    impl BleBackend for MockBackend {
        async fn scan(&self, _duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
            let mut state = self.state.lock().unwrap();
            state.scan_count += 1;
            let result = if state.scans.len() > 1 {
                state.scans.pop_front()
            } else {
                state.scans.front().cloned()
            };
            Ok(result.unwrap_or_default())
        }

        async fn connect(
            &self,
            _device: &DiscoveredDevice,
        ) -> Result<Box<dyn BleLink>, TransportError> {
            let hang = {
                let mut state = self.state.lock().unwrap();
                state.connect_count += 1;
                state.hang_connects
            };
            if hang {
                futures::future::pending::<()>().await;
            }
            let mut state = self.state.lock().unwrap();
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(TransportError::Bluetooth("mock connect failure".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let index = state.feeds.len();
            state.feeds.push(Some(tx));
            Ok(Box::new(MockLink {
                index,
                rx: Mutex::new(Some(rx)),
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct MockLink {
        index: usize,
        rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
        state: Arc<Mutex<State>>,
    }

    #[async_trait]
    impl BleLink for MockLink {
        async fn subscribe(&self) -> Result<Notifications, TransportError> {
            let rx = self.rx.lock().unwrap().take().ok_or(TransportError::Closed)?;
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            });
            Ok(stream.boxed())
        }

        async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(TransportError::Bluetooth("mock write failure".into()));
            }
            state.writes.push((self.index, data.to_vec()));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.disconnects.push(self.index);
            if let Some(feed) = state.feeds.get_mut(self.index) {
                feed.take();
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            name: name.into(),
            id: name.into(),
        }
    }

    #[test]
    fn first_substring_match_wins() {
        let devices = [device("Keyboard"), device("MSM-8C-02"), device("MSM-8C-01")];
        assert_eq!(select_device(&devices, "MSM").unwrap().name, "MSM-8C-02");
    }

    #[test]
    fn match_is_case_sensitive() {
        let devices = [device("msm-lower")];
        assert!(select_device(&devices, "MSM").is_none());
        assert!(select_device(&[], "MSM").is_none());
    }
}
