use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, watch};

use super::{Link, LINK_CHANNEL_SIZE};

/// In-memory [`Link`] for tests: the test side injects inbound messages,
/// reads what the agent sent and flips the connection state.
pub struct MockLink<In, Out> {
    inject_tx: mpsc::Sender<In>,
    recv_rx: parking_lot::Mutex<Option<mpsc::Receiver<In>>>,
    send_tx: mpsc::Sender<Out>,
    sent_rx: parking_lot::Mutex<Option<mpsc::Receiver<Out>>>,
    connected: watch::Sender<bool>,
    reconnects: AtomicUsize,
}

impl<In, Out> Default for MockLink<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> MockLink<In, Out> {
    pub fn new() -> Self {
        let (inject_tx, recv_rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let (send_tx, sent_rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let (connected, _) = watch::channel(false);

        Self {
            inject_tx,
            recv_rx: parking_lot::Mutex::new(Some(recv_rx)),
            send_tx,
            sent_rx: parking_lot::Mutex::new(Some(sent_rx)),
            connected,
            reconnects: AtomicUsize::new(0),
        }
    }

    /// Handle for pushing inbound messages.
    pub fn injector(&self) -> mpsc::Sender<In> {
        self.inject_tx.clone()
    }

    /// Everything the agent sent. Only the first caller gets the receiver.
    pub fn sent(&self) -> Option<mpsc::Receiver<Out>> {
        self.sent_rx.lock().take()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl<In: Send, Out: Send> Link<In, Out> for MockLink<In, Out> {
    fn connect(&self) {
        self.set_connected(true);
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.set_connected(false);
        self.set_connected(true);
    }

    fn disconnect(&self) {
        self.set_connected(false);
    }

    fn send_chan(&self) -> mpsc::Sender<Out> {
        self.send_tx.clone()
    }

    fn recv_chan(&self) -> Option<mpsc::Receiver<In>> {
        self.recv_rx.lock().take()
    }

    fn connect_chan(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn status(&self) -> BTreeMap<String, String> {
        let state = if *self.connected.borrow() {
            "Connected"
        } else {
            "Disconnected"
        };
        BTreeMap::from([("mock-link".to_string(), state.to_string())])
    }
}
