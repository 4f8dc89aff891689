//! Command Channel: thread-safe handle for writing control bytes to the device.
//!
//! [`CommandChannel::send`] never touches the link itself.  It checks that a
//! link is established and hands the command to the client's receive loop,
//! which owns the link and performs every write in submission order.

use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::error::{ClientError, Result};
use crate::protocol::{TRIGGER_SEGMENT_END, TRIGGER_SEGMENT_START};
use crate::types::{ConnectionState, ControlCommand};

/// Cloneable sender half of the client's command queue.
#[derive(Clone)]
pub struct CommandChannel {
    tx: mpsc::UnboundedSender<ControlCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl CommandChannel {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<ControlCommand>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { tx, state }
    }

    /// Queue `command` for writing on the current link.
    ///
    /// Returns [`ClientError::NotConnected`] when no link is established; the
    /// command is dropped, never replayed after a later (re)connect.
    pub fn send(&self, command: ControlCommand) -> Result<()> {
        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            warn!("command {command} dropped: client is {state}");
            return Err(ClientError::NotConnected);
        }
        self.tx.send(command).map_err(|_| {
            warn!("command {command} dropped: receive loop has exited");
            ClientError::NotConnected
        })?;
        debug!("command {command} queued");
        Ok(())
    }

    /// Mark the start of an experiment trial with `tag` (e.g. a song id).
    pub fn start_experiment_trigger(&self, tag: u8) -> Result<()> {
        if tag == 0 {
            return Err(ClientError::InvalidTrigger(tag));
        }
        self.send(ControlCommand::trigger(tag))
    }

    /// Mark that a trial was interrupted before it finished.
    pub fn end_of_interrupt_trigger(&self) -> Result<()> {
        self.send(ControlCommand::end_of_interrupt())
    }

    /// Mark that the current song played to the end.
    pub fn song_finished_trigger(&self) -> Result<()> {
        self.send(ControlCommand::song_finished())
    }

    /// Marker written when a recorded segment begins.
    pub fn segment_start_marker(&self) -> Result<()> {
        self.send(ControlCommand::trigger(TRIGGER_SEGMENT_START))
    }

    /// Marker written when a recorded segment ends.
    pub fn segment_end_marker(&self) -> Result<()> {
        self.send(ControlCommand::trigger(TRIGGER_SEGMENT_END))
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(
        state: ConnectionState,
    ) -> (
        CommandChannel,
        mpsc::UnboundedReceiver<ControlCommand>,
        watch::Sender<ConnectionState>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state);
        (CommandChannel::new(tx, state_rx), rx, state_tx)
    }

    #[test]
    fn send_while_disconnected_is_rejected() {
        let (ch, mut rx, _state) = channel(ConnectionState::Disconnected);
        assert!(matches!(
            ch.send(ControlCommand::trigger(3)),
            Err(ClientError::NotConnected)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_while_reconnecting_is_rejected() {
        let (ch, _rx, _state) = channel(ConnectionState::Reconnecting);
        assert!(matches!(
            ch.song_finished_trigger(),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn helpers_queue_in_order() {
        let (ch, mut rx, _state) = channel(ConnectionState::Connected);
        ch.start_experiment_trigger(12).unwrap();
        ch.end_of_interrupt_trigger().unwrap();
        ch.song_finished_trigger().unwrap();
        ch.segment_start_marker().unwrap();
        ch.segment_end_marker().unwrap();

        let sent: Vec<[u8; 2]> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(ControlCommand::to_bytes)
            .collect();
        assert_eq!(sent, vec![[0xFF, 12], [0xFF, 0xFF], [0xFF, 0xAA], [0xFF, 0x01], [0xFF, 0x02]]);
    }

    #[test]
    fn zero_tag_is_invalid() {
        let (ch, _rx, _state) = channel(ConnectionState::Connected);
        assert!(matches!(
            ch.start_experiment_trigger(0),
            Err(ClientError::InvalidTrigger(0))
        ));
    }

    #[test]
    fn follows_state_changes() {
        let (ch, _rx, state) = channel(ConnectionState::Scanning);
        assert!(!ch.is_connected());
        state.send_replace(ConnectionState::Connected);
        assert!(ch.is_connected());
        assert!(ch.end_of_interrupt_trigger().is_ok());
    }
}
