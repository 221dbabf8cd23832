//! Duplex links to the management service.

pub mod api;
pub mod mock;
pub mod websocket;

use std::collections::BTreeMap;

use tokio::sync::{mpsc, watch};

pub use api::ApiClient;
pub use mock::MockLink;
pub use websocket::WebsocketLink;

/// Capacity of the inbound and outbound channels of a link.
pub const LINK_CHANNEL_SIZE: usize = 100;

/// A persistent, self-reconnecting message link.
///
/// Messages of type `In` arrive on the receive channel, messages of type
/// `Out` are queued on the send channel. Delivery is best effort: a message
/// in flight when the connection drops may be lost or sent twice.
pub trait Link<In, Out>: Send + Sync {
    /// Start the connection supervisor. Idempotent.
    fn connect(&self);

    /// Drop the current connection; the supervisor reconnects right away.
    fn reconnect(&self);

    /// Stop the supervisor and close the connection.
    fn disconnect(&self);

    /// Queue for outbound messages.
    fn send_chan(&self) -> mpsc::Sender<Out>;

    /// Inbound messages. Only the first caller gets the receiver.
    fn recv_chan(&self) -> Option<mpsc::Receiver<In>>;

    /// Link state: `true` after connecting, `false` after disconnecting.
    fn connect_chan(&self) -> watch::Receiver<bool>;

    /// Status fields of this link.
    fn status(&self) -> BTreeMap<String, String>;
}
