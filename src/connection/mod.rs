//! A single TCP link to one nsqd instance: handshake, feature negotiation,
//! subscribe, message dispatch, heartbeats, and graceful/forced close.
//!
//! Mirrors the split the rest of this crate uses elsewhere: a cheap,
//! cloneable handle carries the command-sending half and the bits of state
//! other tasks need to read (RDY bookkeeping, lifecycle state), while the
//! socket and decode buffers are owned exclusively by the task running
//! [`Connection::run`].

pub mod state;

use crate::config::IdentifyOptions;
use crate::error::{is_fatal_error_code, NsqError, NsqResult};
use crate::topic::{Channel, Topic};
use crate::wire::codec::{
    self, encode_cls, encode_fin, encode_nop, encode_req, encode_rdy, encode_sub, encode_touch,
    Frame, Message, Reader, MAGIC_V2,
};
use crate::wire::compression::CompressedReader;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, trace, warn};

pub use state::ConnectionState;

/// Server capabilities returned in the `IDENTIFY` response when feature
/// negotiation is requested.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ServerFeatures {
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub deflate_level: i32,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub max_rdy_count: i64,
    #[serde(default)]
    pub max_msg_timeout: i64,
    #[serde(default)]
    pub msg_timeout: i64,
    #[serde(default)]
    pub auth_required: bool,
}

/// Events a connection emits for the RDY controller / consumer to react to.
/// Connections never hold a back-reference to their owner; this is the only
/// channel flowing the other way.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    MessageReceived { conn_id: String },
    Broken { conn_id: String },
    CloseWaitAcked { conn_id: String },
}

/// A command queued for the writer half of a connection's dispatch loop.
/// `ForceClose` jumps the queue ahead of the blocked socket read in
/// [`Connection::run`]'s `select!`, which is what lets a stuck peer be
/// abandoned without waiting for the read to ever return.
#[derive(Debug)]
enum ConnCommand {
    Write(Bytes),
    ForceClose,
}

enum Codec {
    Plain(Reader),
    Compressed(CompressedReader),
}

impl Codec {
    fn feed(&mut self, chunk: &[u8]) -> NsqResult<()> {
        match self {
            Codec::Plain(r) => {
                r.feed(chunk);
                Ok(())
            }
            Codec::Compressed(c) => Ok(c.feed(chunk)?),
        }
    }

    fn get(&mut self) -> NsqResult<Option<Frame>> {
        match self {
            Codec::Plain(r) => Ok(r.get()?),
            Codec::Compressed(c) => Ok(c.get()?),
        }
    }

    fn encode(&mut self, plain: &[u8]) -> NsqResult<Vec<u8>> {
        match self {
            Codec::Plain(_) => Ok(plain.to_vec()),
            Codec::Compressed(c) => Ok(c.encode(plain)?),
        }
    }
}

/// A lightweight, cloneable reference to a running connection. The RDY
/// controller and the consumer hold these instead of the connection itself;
/// mutation of shared fields is limited to atomics set from the connection's
/// own task (`rdy_count`, `last_rdy_sent`, `state`) and read-only elsewhere.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    rdy_count: Arc<AtomicU32>,
    last_rdy_sent: Arc<AtomicU32>,
    state: Arc<AtomicU8>,
    last_activity: Arc<StdMutex<Instant>>,
}

const STATE_INIT: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_SUBSCRIBED: u8 = 2;
const STATE_CLOSING: u8 = 3;
const STATE_CLOSED: u8 = 4;
const STATE_RECONNECTING: u8 = 5;

fn state_to_u8(s: ConnectionState) -> u8 {
    match s {
        ConnectionState::Init => STATE_INIT,
        ConnectionState::Connected => STATE_CONNECTED,
        ConnectionState::Subscribed => STATE_SUBSCRIBED,
        ConnectionState::Closing => STATE_CLOSING,
        ConnectionState::Closed => STATE_CLOSED,
        ConnectionState::Reconnecting => STATE_RECONNECTING,
    }
}

fn u8_to_state(v: u8) -> ConnectionState {
    match v {
        STATE_INIT => ConnectionState::Init,
        STATE_CONNECTED => ConnectionState::Connected,
        STATE_SUBSCRIBED => ConnectionState::Subscribed,
        STATE_CLOSING => ConnectionState::Closing,
        STATE_CLOSED => ConnectionState::Closed,
        _ => ConnectionState::Reconnecting,
    }
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        u8_to_state(self.state.load(Ordering::Acquire))
    }

    pub fn rdy_count(&self) -> u32 {
        self.rdy_count.load(Ordering::Acquire)
    }

    pub fn last_rdy_sent(&self) -> u32 {
        self.last_rdy_sent.load(Ordering::Acquire)
    }

    /// A connection is starved once its remaining credit drops to a quarter
    /// of what was last granted; the RDY controller uses this to decide
    /// whether to top up or redistribute.
    pub fn is_starved(&self) -> bool {
        let last = self.last_rdy_sent();
        if last == 0 {
            return false;
        }
        self.rdy_count() as f64 <= last as f64 * 0.25
    }

    /// `RDY n` replaces, rather than adds to, the server's notion of how
    /// many messages this connection may still receive.
    pub fn send_rdy(&self, n: u32) {
        self.last_rdy_sent.store(n, Ordering::Release);
        self.rdy_count.store(n, Ordering::Release);
        let _ = self.cmd_tx.send(ConnCommand::Write(encode_rdy(n)));
    }

    pub fn send_fin(&self, msg_id: &str) {
        let _ = self.cmd_tx.send(ConnCommand::Write(encode_fin(msg_id)));
    }

    pub fn send_req(&self, msg_id: &str, timeout_ms: u64) {
        let _ = self
            .cmd_tx
            .send(ConnCommand::Write(encode_req(msg_id, timeout_ms)));
    }

    pub fn send_touch(&self, msg_id: &str) {
        let _ = self.cmd_tx.send(ConnCommand::Write(encode_touch(msg_id)));
    }

    /// Request a graceful close: send `CLS` and wait for the dispatch loop to
    /// observe the server's `CLOSE_WAIT` acknowledgement on its own. Callers
    /// that need a bound on how long they wait should race this against a
    /// timeout and fall back to [`ConnectionHandle::force_close`].
    pub fn send_close(&self) {
        self.state.store(STATE_CLOSING, Ordering::Release);
        let _ = self.cmd_tx.send(ConnCommand::Write(encode_cls()));
    }

    /// Abandon the connection immediately, without waiting for any reply.
    /// Wakes the dispatch loop's `select!` even if it is currently blocked on
    /// a socket read that may never return.
    pub fn force_close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        let _ = self.cmd_tx.send(ConnCommand::ForceClose);
    }

    /// Time since the connection last saw any server frame (heartbeat,
    /// response, or message).
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.idle_for() > idle_timeout
    }
}

#[cfg(test)]
impl ConnectionHandle {
    pub(crate) fn for_test() -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: "test".to_string(),
            cmd_tx,
            rdy_count: Arc::new(AtomicU32::new(0)),
            last_rdy_sent: Arc::new(AtomicU32::new(0)),
            state: Arc::new(AtomicU8::new(STATE_CONNECTED)),
            last_activity: Arc::new(StdMutex::new(Instant::now())),
        };
        (handle, cmd_rx)
    }
}

/// A delivered message, paired with the handle of the connection it arrived
/// on so the application can FIN/REQ/TOUCH it.
pub struct Delivery {
    pub message: Message,
    pub connection: ConnectionHandle,
}

/// Owns the socket and decode state for one connection. Constructed via
/// [`Connection::open`], then driven to completion with [`Connection::run`]
/// on its own task.
pub struct Connection {
    id: String,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    codec: Codec,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    rdy_count: Arc<AtomicU32>,
    last_rdy_sent: Arc<AtomicU32>,
    state: Arc<AtomicU8>,
    heartbeat_interval: Duration,
    last_activity: Arc<StdMutex<Instant>>,
}

/// One round trip during handshake: write a command, read frames until a
/// non-heartbeat response/error arrives (heartbeats cannot occur before
/// `IDENTIFY` completes in practice, but are handled uniformly regardless).
async fn handshake_roundtrip(
    stream: &mut TcpStream,
    reader: &mut Reader,
    read_buf: &mut [u8],
    command: Bytes,
) -> NsqResult<Frame> {
    stream.write_all(&command).await?;
    loop {
        if let Some(frame) = reader.get()? {
            return Ok(frame);
        }
        let n = stream.read(read_buf).await?;
        if n == 0 {
            return Err(NsqError::ConnectionClosed);
        }
        reader.feed(&read_buf[..n]);
    }
}

/// Same shape as [`handshake_roundtrip`], but for commands issued after
/// compression has been installed (`AUTH` is sent post-`IDENTIFY`, so it must
/// go through whichever codec negotiation settled on).
async fn post_switch_roundtrip(
    stream: &mut TcpStream,
    codec_state: &mut Codec,
    read_buf: &mut [u8],
    command: Bytes,
) -> NsqResult<Frame> {
    let bytes = codec_state.encode(&command)?;
    stream.write_all(&bytes).await?;
    loop {
        if let Some(frame) = codec_state.get()? {
            return Ok(frame);
        }
        let n = stream.read(read_buf).await?;
        if n == 0 {
            return Err(NsqError::ConnectionClosed);
        }
        codec_state.feed(&read_buf[..n])?;
    }
}

impl Connection {
    /// Open a TCP connection, perform the V2 handshake, negotiate features
    /// via `IDENTIFY`, and install compression if both sides agreed to it.
    /// Returns the connection (not yet running) and a handle usable
    /// immediately.
    pub async fn open(
        addr: &str,
        identify: &IdentifyOptions,
        dial_timeout: Duration,
    ) -> NsqResult<(Connection, ConnectionHandle)> {
        identify
            .validate()
            .map_err(NsqError::InvalidState)?;

        let mut stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NsqError::Timeout)??;
        stream.write_all(MAGIC_V2).await?;

        let mut reader = Reader::new();
        let mut read_buf = [0u8; 16 * 1024];

        let identify_body = serde_json::to_vec(identify)?;
        let identify_cmd = codec::encode_identify(&identify_body);
        let reply = handshake_roundtrip(&mut stream, &mut reader, &mut read_buf, identify_cmd)
            .await?;

        let features = match reply {
            Frame::Response(body) if body.as_ref() == codec::OK_BODY => ServerFeatures::default(),
            Frame::Response(body) => serde_json::from_slice::<ServerFeatures>(&body)
                .unwrap_or_default(),
            Frame::Error { code, message } => {
                return Err(NsqError::Server {
                    code,
                    message: String::from_utf8_lossy(&message).into_owned(),
                })
            }
            Frame::Message(_) => return Err(NsqError::UnexpectedFrame),
        };

        let leftover = reader.take_unconsumed();
        let mut codec_state = if features.snappy {
            let mut c = CompressedReader::snappy();
            c.feed(&leftover)?;
            Codec::Compressed(c)
        } else if features.deflate {
            let level = if identify.deflate_level > 0 {
                identify.deflate_level as u32
            } else {
                6
            };
            let mut c = CompressedReader::deflate(level);
            c.feed(&leftover)?;
            Codec::Compressed(c)
        } else {
            let mut r = Reader::new();
            r.feed(&leftover);
            Codec::Plain(r)
        };

        if let Some(secret) = &identify.auth_secret {
            let auth_cmd = codec::encode_auth(secret);
            let reply =
                post_switch_roundtrip(&mut stream, &mut codec_state, &mut read_buf, auth_cmd)
                    .await?;
            match reply {
                Frame::Response(_) => {}
                Frame::Error { code, message } => {
                    return Err(NsqError::Server {
                        code,
                        message: String::from_utf8_lossy(&message).into_owned(),
                    })
                }
                Frame::Message(_) => return Err(NsqError::UnexpectedFrame),
            }
        }

        let id = addr.to_string();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let rdy_count = Arc::new(AtomicU32::new(0));
        let last_rdy_sent = Arc::new(AtomicU32::new(0));
        let state = Arc::new(AtomicU8::new(STATE_CONNECTED));
        let last_activity = Arc::new(StdMutex::new(Instant::now()));

        let (read_half, write_half) = stream.into_split();

        let handle = ConnectionHandle {
            id: id.clone(),
            cmd_tx,
            rdy_count: rdy_count.clone(),
            last_rdy_sent: last_rdy_sent.clone(),
            state: state.clone(),
            last_activity: last_activity.clone(),
        };

        let connection = Connection {
            id,
            read_half,
            write_half,
            codec: codec_state,
            cmd_rx,
            rdy_count,
            last_rdy_sent,
            state,
            heartbeat_interval: Duration::from_millis(identify.heartbeat_interval.max(1) as u64),
            last_activity,
        };

        Ok((connection, handle))
    }

    /// Issue `SUB topic channel` on a connection that is not yet running its
    /// dispatch loop. Must be called before [`Connection::run`].
    pub async fn subscribe(&mut self, topic: &Topic, channel: &Channel) -> NsqResult<()> {
        let cmd = encode_sub(topic.as_str(), channel.as_str());
        self.write_half.write_all(&cmd).await?;
        loop {
            if let Some(frame) = self.codec.get()? {
                return match frame {
                    Frame::Response(body) if body.as_ref() == codec::OK_BODY => {
                        self.state.store(STATE_SUBSCRIBED, Ordering::Release);
                        Ok(())
                    }
                    Frame::Error { code, message } => Err(NsqError::Server {
                        code,
                        message: String::from_utf8_lossy(&message).into_owned(),
                    }),
                    other => {
                        warn!(conn = %self.id, ?other, "unexpected frame during SUB");
                        Err(NsqError::UnexpectedFrame)
                    }
                };
            }
            let mut buf = [0u8; 16 * 1024];
            let n = self.read_half.read(&mut buf).await?;
            if n == 0 {
                return Err(NsqError::ConnectionClosed);
            }
            self.codec.feed(&buf[..n])?;
        }
    }

    /// Write a command and block on this connection until its response or
    /// error frame arrives, auto-replying to any heartbeat encountered along
    /// the way. Used by [`Producer`](crate::producer::Producer), which never
    /// subscribes and so never hands its socket to [`Connection::run`].
    pub async fn execute_raw(&mut self, cmd: Bytes) -> NsqResult<Frame> {
        let bytes = self.codec.encode(&cmd)?;
        self.write_half.write_all(&bytes).await?;
        let mut buf = [0u8; 16 * 1024];
        loop {
            if let Some(frame) = self.codec.get()? {
                match frame {
                    Frame::Response(body) if body.as_ref() == codec::HEARTBEAT_BODY => {
                        self.write_half.write_all(&encode_nop()).await?;
                        continue;
                    }
                    other => return Ok(other),
                }
            }
            let n = self.read_half.read(&mut buf).await?;
            if n == 0 {
                return Err(NsqError::ConnectionClosed);
            }
            self.codec.feed(&buf[..n])?;
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    /// Drive this connection until the socket closes, a fatal protocol/
    /// server error occurs, a `CLS` close-wait response is received, a
    /// `ForceClose` command arrives, or no server frame has been seen for
    /// twice the negotiated heartbeat interval.
    ///
    /// Emits [`ConnectionEvent::CloseWaitAcked`] for graceful exits and
    /// [`ConnectionEvent::Broken`] for everything else, so the owning
    /// supervisor only reconnects on genuine failures.
    pub async fn run(
        mut self,
        message_tx: mpsc::Sender<Delivery>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let handle_for_events = ConnectionHandle {
            id: self.id.clone(),
            cmd_tx: unused_sender(),
            rdy_count: self.rdy_count.clone(),
            last_rdy_sent: self.last_rdy_sent.clone(),
            state: self.state.clone(),
            last_activity: self.last_activity.clone(),
        };

        let mut read_buf = vec![0u8; 16 * 1024];
        let mut heartbeat_check = interval(self.heartbeat_interval);
        heartbeat_check.tick().await; // first tick fires immediately

        let result: NsqResult<bool> = 'conn_loop: loop {
            tokio::select! {
                biased;

                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(ConnCommand::Write(plain)) => {
                            match self.codec.encode(&plain) {
                                Ok(bytes) => {
                                    if let Err(e) = self.write_half.write_all(&bytes).await {
                                        break 'conn_loop Err(e.into());
                                    }
                                }
                                Err(e) => break 'conn_loop Err(e),
                            }
                        }
                        Some(ConnCommand::ForceClose) => {
                            debug!(conn = %self.id, "force_close requested");
                            break 'conn_loop Ok(true);
                        }
                        None => break 'conn_loop Ok(true),
                    }
                }

                _ = heartbeat_check.tick() => {
                    if self.last_activity
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .elapsed()
                        > self.heartbeat_interval * 2
                    {
                        warn!(conn = %self.id, "no server frame within 2x heartbeat interval, treating as broken");
                        break 'conn_loop Err(NsqError::Timeout);
                    }
                }

                read_result = self.read_half.read(&mut read_buf) => {
                    match read_result {
                        Ok(0) => break 'conn_loop Err(NsqError::ConnectionClosed),
                        Ok(n) => {
                            if let Err(e) = self.codec.feed(&read_buf[..n]) {
                                break 'conn_loop Err(e);
                            }
                            self.touch();
                        }
                        Err(e) => break 'conn_loop Err(e.into()),
                    }

                    loop {
                        match self.codec.get() {
                            Ok(Some(frame)) => {
                                if let Some(graceful) = self.dispatch_frame(frame, &message_tx, &handle_for_events).await {
                                    break 'conn_loop Ok(graceful);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => break 'conn_loop Err(e),
                        }
                    }
                }
            }
        };

        match result {
            Ok(true) => {
                debug!(conn = %self.id, "connection closed gracefully");
                self.state.store(STATE_CLOSED, Ordering::Release);
                let _ = event_tx.send(ConnectionEvent::CloseWaitAcked { conn_id: self.id.clone() });
            }
            Ok(false) => {
                warn!(conn = %self.id, "connection terminated by fatal server error");
                self.state.store(STATE_RECONNECTING, Ordering::Release);
                let _ = event_tx.send(ConnectionEvent::Broken { conn_id: self.id.clone() });
            }
            Err(e) => {
                warn!(conn = %self.id, error = %e, "connection terminated");
                self.state.store(STATE_RECONNECTING, Ordering::Release);
                let _ = event_tx.send(ConnectionEvent::Broken { conn_id: self.id.clone() });
            }
        }
    }

    /// `Some(true)` for a graceful exit (CLOSE_WAIT acked), `Some(false)` for
    /// a fatal, non-graceful one, `None` when the loop should keep running.
    async fn dispatch_frame(
        &mut self,
        frame: Frame,
        message_tx: &mpsc::Sender<Delivery>,
        handle: &ConnectionHandle,
    ) -> Option<bool> {
        match frame {
            Frame::Response(body) if body.as_ref() == codec::HEARTBEAT_BODY => {
                trace!(conn = %self.id, "heartbeat received, replying NOP");
                let _ = self.write_half.write_all(&encode_nop()).await;
                None
            }
            Frame::Response(body) if body.as_ref() == codec::CLOSE_WAIT_BODY => {
                debug!(conn = %self.id, "CLOSE_WAIT received");
                Some(true)
            }
            Frame::Response(_) => None,
            Frame::Error { code, message } => {
                if is_fatal_error_code(&code) {
                    warn!(conn = %self.id, %code, "fatal server error, closing connection");
                    Some(false)
                } else {
                    warn!(conn = %self.id, %code, msg = %String::from_utf8_lossy(&message), "non-fatal server error");
                    None
                }
            }
            Frame::Message(msg) => {
                let _ = self
                    .rdy_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
                self.touch();
                let _ = message_tx
                    .send(Delivery {
                        message: msg,
                        connection: handle.clone(),
                    })
                    .await;
                None
            }
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
            > idle_timeout
    }
}

/// A sender end nobody will ever read from; used for the `ConnectionHandle`
/// copy handed to `dispatch_frame`, which only needs the read-only fields.
fn unused_sender() -> mpsc::UnboundedSender<ConnCommand> {
    let (tx, _rx) = mpsc::unbounded_channel();
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_rdy_updates_rdy_count_and_last_rdy_sent() {
        let (handle, mut rx) = ConnectionHandle::for_test();
        handle.send_rdy(5);
        assert_eq!(handle.rdy_count(), 5);
        assert_eq!(handle.last_rdy_sent(), 5);
        match rx.try_recv() {
            Ok(ConnCommand::Write(bytes)) => assert!(bytes.starts_with(b"RDY")),
            other => panic!("expected a Write command, got {other:?}"),
        }
    }

    #[test]
    fn is_starved_once_credit_drops_to_a_quarter() {
        let (handle, _rx) = ConnectionHandle::for_test();
        handle.send_rdy(4);
        assert!(!handle.is_starved());
        handle.rdy_count.store(1, Ordering::Release);
        assert!(handle.is_starved());
    }

    #[test]
    fn force_close_transitions_state_to_closed_and_sends_command() {
        let (handle, mut rx) = ConnectionHandle::for_test();
        handle.force_close();
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(matches!(rx.try_recv(), Ok(ConnCommand::ForceClose)));
    }

    #[test]
    fn is_idle_reflects_elapsed_time_since_last_activity() {
        let (handle, _rx) = ConnectionHandle::for_test();
        assert!(!handle.is_idle(Duration::from_secs(60)));
        assert!(handle.is_idle(Duration::from_millis(0)));
    }
}
