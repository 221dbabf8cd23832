use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{Link, LINK_CHANNEL_SIZE};
use crate::backoff::Backoff;
use crate::config::API_KEY_HEADER;
use crate::context::AgentContext;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

enum Disconnect {
    Stop,
    Reconnect,
    Error(anyhow::Error),
}

struct Inner<In, Out> {
    name: String,
    service: String,
    url: Url,
    api_key: String,
    keepalive: Duration,
    forward_recv: bool,
    recv_tx: mpsc::Sender<In>,
    send_rx: tokio::sync::Mutex<mpsc::Receiver<Out>>,
    requeue: parking_lot::Mutex<VecDeque<Out>>,
    connected: watch::Sender<bool>,
    reconnect: Notify,
    cancel: CancellationToken,
    ctx: AgentContext,
}

/// JSON-over-websocket [`Link`].
///
/// One supervisor task owns the socket. While connected it runs a receive
/// loop (any error drops the connection) and a send loop (5 s timeout per
/// message); the message being sent stays at the head of the requeue until
/// it is written, so a failed send is retried first after reconnecting.
pub struct WebsocketLink<In, Out> {
    inner: Arc<Inner<In, Out>>,
    send_tx: mpsc::Sender<Out>,
    recv_rx: parking_lot::Mutex<Option<mpsc::Receiver<In>>>,
    started: AtomicBool,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> WebsocketLink<In, Out>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Clone + Send + 'static,
{
    /// A link that reads and forwards inbound messages.
    pub fn new(name: &str, service: &str, url: Url, api_key: &str, ctx: AgentContext) -> Self {
        Self::build(name, service, url, api_key, ctx, true)
    }

    /// A link that only sends; inbound messages are read and discarded.
    pub fn send_only(name: &str, service: &str, url: Url, api_key: &str, ctx: AgentContext) -> Self {
        Self::build(name, service, url, api_key, ctx, false)
    }

    fn build(
        name: &str,
        service: &str,
        url: Url,
        api_key: &str,
        ctx: AgentContext,
        forward_recv: bool,
    ) -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let (send_tx, send_rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let (connected, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                service: service.to_string(),
                url,
                api_key: api_key.to_string(),
                keepalive: Duration::ZERO,
                forward_recv,
                recv_tx,
                send_rx: tokio::sync::Mutex::new(send_rx),
                requeue: parking_lot::Mutex::new(VecDeque::new()),
                connected,
                reconnect: Notify::new(),
                cancel: CancellationToken::new(),
                ctx,
            }),
            send_tx,
            recv_rx: parking_lot::Mutex::new(Some(recv_rx)),
            started: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    /// Ping the peer when the link has been idle this long.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.keepalive = keepalive;
        }
        self
    }
}

impl<In, Out> Link<In, Out> for WebsocketLink<In, Out>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Clone + Send + 'static,
{
    fn connect(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.supervise().await });
    }

    fn reconnect(&self) {
        // Only an open connection is dropped; no permit is stored.
        self.inner.reconnect.notify_waiters();
    }

    fn disconnect(&self) {
        self.inner.cancel.cancel();
    }

    fn send_chan(&self) -> mpsc::Sender<Out> {
        self.send_tx.clone()
    }

    fn recv_chan(&self) -> Option<mpsc::Receiver<In>> {
        self.recv_rx.lock().take()
    }

    fn connect_chan(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    fn status(&self) -> BTreeMap<String, String> {
        let mut status = BTreeMap::new();
        let field = format!("{}-link", self.inner.name);
        if let Some(value) = self.inner.ctx.status.get(&self.inner.service, &field) {
            status.insert(field, value);
        }
        status.insert(
            format!("{}-link-queue", self.inner.name),
            format!(
                "{} queued, {} pending resend",
                LINK_CHANNEL_SIZE - self.send_tx.capacity(),
                self.inner.requeue.lock().len()
            ),
        );
        status
    }
}

impl<In, Out> Inner<In, Out>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Clone + Send + 'static,
{
    fn set_status(&self, value: impl Into<String>) {
        self.ctx
            .status
            .update(&self.service, &format!("{}-link", self.name), value);
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
        self.ctx
            .health
            .link_connected
            .with_label_values(&[&self.name])
            .set(if connected { 1.0 } else { 0.0 });
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = Backoff::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_status(format!("Connecting {}", self.url));

            let ws = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = open(&self.url, &self.api_key) => res,
            };

            let ws = match ws {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(link = %self.name, error = %format!("{e:#}"), "connect failed");
                    self.set_status(format!("Disconnected: {e}"));
                    if !backoff.sleep(&self.cancel).await {
                        break;
                    }
                    continue;
                }
            };

            backoff.success();
            info!(link = %self.name, url = %self.url, "connected");
            self.set_status(format!("Connected {}", self.url));
            self.set_connected(true);

            let (mut sink, mut source) = ws.split();

            let reason = tokio::select! {
                _ = self.cancel.cancelled() => Disconnect::Stop,
                _ = self.reconnect.notified() => Disconnect::Reconnect,
                res = self.recv_loop(&mut source) => Disconnect::Error(res),
                res = self.send_loop(&mut sink) => Disconnect::Error(res),
            };

            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
            self.set_connected(false);

            match reason {
                Disconnect::Stop => break,
                Disconnect::Reconnect => {
                    info!(link = %self.name, "reconnecting on request");
                }
                Disconnect::Error(e) => {
                    warn!(link = %self.name, error = %format!("{e:#}"), "connection lost");
                    self.set_status(format!("Disconnected: {e}"));
                    if !backoff.sleep(&self.cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_connected(false);
        self.set_status("Stopped");
        debug!(link = %self.name, "link stopped");
    }

    /// Runs until the connection fails; the return value is the reason.
    async fn recv_loop(&self, source: &mut WsSource) -> anyhow::Error {
        while let Some(msg) = source.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => return anyhow!(e).context("receiving"),
            };

            let payload = match &msg {
                Message::Text(text) => text.as_bytes(),
                Message::Binary(data) => data.as_ref(),
                Message::Close(_) => return anyhow!("closed by peer"),
                _ => continue,
            };

            if !self.forward_recv {
                continue;
            }

            match serde_json::from_slice::<In>(payload) {
                Ok(value) => {
                    if self.recv_tx.send(value).await.is_err() {
                        return anyhow!("receiver dropped");
                    }
                }
                Err(e) => {
                    warn!(link = %self.name, error = %e, "discarding invalid message");
                }
            }
        }

        anyhow!("connection closed")
    }

    /// Runs until a send fails; the return value is the reason.
    async fn send_loop(&self, sink: &mut WsSink) -> anyhow::Error {
        let mut send_rx = self.send_rx.lock().await;

        loop {
            let pending = self.requeue.lock().front().cloned();

            let msg = match pending {
                Some(msg) => msg,
                None => {
                    let next = if self.keepalive.is_zero() {
                        send_rx.recv().await
                    } else {
                        match tokio::time::timeout(self.keepalive, send_rx.recv()).await {
                            Ok(next) => next,
                            Err(_) => {
                                if let Err(e) = write(sink, Message::Ping(Vec::new().into())).await {
                                    return e.context("keepalive ping");
                                }
                                continue;
                            }
                        }
                    };

                    let Some(msg) = next else {
                        return anyhow!("send channel closed");
                    };
                    self.requeue.lock().push_back(msg.clone());
                    msg
                }
            };

            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(link = %self.name, error = %e, "dropping unencodable message");
                    self.requeue.lock().pop_front();
                    continue;
                }
            };

            if let Err(e) = write(sink, Message::text(text)).await {
                return e;
            }

            self.requeue.lock().pop_front();
        }
    }
}

async fn write(sink: &mut WsSink, msg: Message) -> Result<()> {
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!(e).context("sending")),
        Err(_) => bail!("send timed out after {}s", SEND_TIMEOUT.as_secs()),
    }
}

async fn open(url: &Url, api_key: &str) -> Result<WsStream> {
    let mut req = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("building request for {url}"))?;

    req.headers_mut().insert(
        API_KEY_HEADER,
        HeaderValue::from_str(api_key).context("invalid API key header")?,
    );

    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(req))
        .await
        .map_err(|_| anyhow!("connect timed out after {}s", CONNECT_TIMEOUT.as_secs()))?
        .with_context(|| format!("connecting to {url}"))?;

    Ok(ws)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;

    use super::*;
    use crate::proto::{Cmd, Reply};

    /// Accepts one websocket, echoes each Cmd back as a Reply.
    async fn echo_server() -> (Url, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("handshake");

            // Push one command, then expect its reply.
            let cmd = Cmd::new("agent", "Ping");
            let json = serde_json::to_string(&cmd).expect("encode");
            ws.send(Message::text(json)).await.expect("send cmd");

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let reply: Reply = serde_json::from_str(text.as_str()).expect("reply");
                    assert_eq!(reply.id, cmd.id);
                    break;
                }
            }
        });

        let url = Url::parse(&format!("ws://{addr}/agents/abc/cmd")).expect("url");
        (url, handle)
    }

    #[tokio::test]
    async fn test_cmd_reply_roundtrip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctx = AgentContext::for_tests(tmp.path());
        let (url, server) = echo_server().await;

        let link: WebsocketLink<Cmd, Reply> = WebsocketLink::new("cmd", "agent", url, "key", ctx);
        let mut connected = link.connect_chan();
        let mut cmds = link.recv_chan().expect("receiver");
        assert!(link.recv_chan().is_none());

        link.connect();
        tokio::time::timeout(Duration::from_secs(5), connected.wait_for(|c| *c))
            .await
            .expect("connected in time")
            .expect("watch open");

        let cmd = tokio::time::timeout(Duration::from_secs(5), cmds.recv())
            .await
            .expect("cmd in time")
            .expect("channel open");
        assert_eq!(cmd.cmd, "Ping");

        link.send_chan().send(cmd.reply_ok()).await.expect("queue reply");
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server done")
            .expect("server ok");

        link.disconnect();
    }

    /// Accepts any number of websockets and keeps them open.
    async fn counting_server() -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let url = Url::parse(&format!("ws://{addr}/agents/abc/cmd")).expect("url");
        (url, accepted)
    }

    #[tokio::test]
    async fn test_reconnect_while_disconnected_is_not_remembered() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctx = AgentContext::for_tests(tmp.path());
        let (url, accepted) = counting_server().await;

        let link: WebsocketLink<Cmd, Reply> = WebsocketLink::new("cmd", "agent", url, "key", ctx);
        let mut connected = link.connect_chan();

        link.reconnect();
        link.connect();
        tokio::time::timeout(Duration::from_secs(5), connected.wait_for(|c| *c))
            .await
            .expect("connected in time")
            .expect("watch open");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(*link.connect_chan().borrow());

        // While connected the request does cycle the connection.
        link.reconnect();
        for _ in 0..250 {
            if accepted.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        link.disconnect();
    }

    #[tokio::test]
    async fn test_connect_failure_reports_status() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctx = AgentContext::for_tests(tmp.path());
        let status = Arc::clone(&ctx.status);

        // Nothing listens on this port.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/")).expect("url");
        let link: WebsocketLink<Cmd, Reply> = WebsocketLink::new("cmd", "agent", url, "key", ctx);
        link.connect();

        let mut disconnected = false;
        for _ in 0..100 {
            if status
                .get("agent", "cmd-link")
                .is_some_and(|s| s.starts_with("Disconnected"))
            {
                disconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(disconnected);
        assert!(!*link.connect_chan().borrow());

        link.disconnect();
    }
}
