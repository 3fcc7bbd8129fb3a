//! The channel multiplexer: owns the channel table and one or more
//! [`PortEngine`]s, dispatches inbound frames, and runs the control-channel
//! RPC that establishes virtual channels and asks the peer to dial out.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard,
    },
};

use sertun_proto::{
    control::{Cmd, ControlMessage, Flag, FrontEnd, Token},
    Frame, PayloadMap,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, RwLock},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    channel::{VirtualChannel, VirtualChannelInner},
    config::{MultiplexerConfig, PortEngineConfig},
    connect_handler::ConnectHandler,
    error::{CoreError, Result},
    port_engine::PortEngine,
};

/// The reserved channel id for control-channel RPC (`§4.6`).
const CONTROL_CID: i64 = 0;

fn lock_ignore_poison<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Removes a pending RPC's reply slot when dropped, regardless of whether
/// the owning future completed normally, was cancelled, or was simply
/// dropped by an enclosing timeout.
struct PendingGuard<'a> {
    pending: &'a StdMutex<HashMap<i64, oneshot::Sender<ControlMessage>>>,
    token: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_ignore_poison(self.pending).remove(&self.token);
    }
}

/// Owns the channel table and the physical port engines, and runs the
/// control-channel RPC.
///
/// Generic over the same device type its [`PortEngine`]s wrap, so tests build
/// a multiplexer entirely over `tokio::io::duplex` pairs. With more than one
/// port, a new channel binds to whichever engine currently reports the
/// lowest [`PortEngine::back_pressure`] (`§4.4`, S5).
pub struct Multiplexer<D> {
    ports: Vec<Arc<PortEngine<D>>>,
    config: MultiplexerConfig,
    channels: RwLock<HashMap<i64, Arc<VirtualChannelInner>>>,
    next_cid: AtomicI64,
    next_token: AtomicI64,
    /// Plain, synchronously-locked map rather than a `tokio::sync::Mutex`:
    /// entries are inserted/removed by a [`PendingGuard`] whose `Drop` runs
    /// even if the owning RPC future is cancelled externally (e.g. dropped
    /// by a `tokio::time::timeout`), which an async mutex cannot guarantee.
    pending: StdMutex<HashMap<i64, oneshot::Sender<ControlMessage>>>,
    connect_handler: Arc<dyn ConnectHandler>,
    close_tx: mpsc::UnboundedSender<i64>,
    close_rx: StdMutex<Option<mpsc::UnboundedReceiver<i64>>>,
    dispatch_rx: StdMutex<Option<mpsc::UnboundedReceiver<(usize, Frame)>>>,
}

impl<D> Multiplexer<D>
where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Builds a multiplexer over one port engine per device in `devices`,
    /// plus its control channel. Call [`Multiplexer::start`] to begin
    /// moving frames.
    #[must_use]
    pub fn new(
        devices: Vec<D>,
        port_config: PortEngineConfig,
        config: MultiplexerConfig,
        connect_handler: Arc<dyn ConnectHandler>,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let ports = devices
            .into_iter()
            .enumerate()
            .map(|(id, device)| PortEngine::new(id, device, port_config.clone(), dispatch_tx.clone()))
            .collect();
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            ports,
            config,
            channels: RwLock::new(HashMap::new()),
            next_cid: AtomicI64::new(1),
            next_token: AtomicI64::new(1),
            pending: StdMutex::new(HashMap::new()),
            connect_handler,
            close_tx,
            close_rx: StdMutex::new(Some(close_rx)),
            dispatch_rx: StdMutex::new(Some(dispatch_rx)),
        })
    }

    /// Starts every port engine plus the dispatch and close-drain tasks.
    /// Idempotent: a second call is a no-op because the queue receivers are
    /// only available once.
    pub fn start(self: &Arc<Self>) {
        for port in &self.ports {
            port.start();
        }

        let Some(mut dispatch_rx) = lock_ignore_poison(&self.dispatch_rx).take() else {
            return;
        };
        let Some(mut close_rx) = lock_ignore_poison(&self.close_rx).take() else {
            return;
        };

        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((port_id, frame)) = dispatch_rx.recv().await {
                    if frame.channel_id == CONTROL_CID {
                        // Control processing never blocks the data path: one
                        // slow RPC handler must not head-of-line-block
                        // inflight data frames from any port (§4.4).
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            this.handle_control_frame(port_id, frame.payload).await;
                        });
                    } else {
                        this.route_data_frame(frame).await;
                    }
                }
            });
        }

        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(cid) = close_rx.recv().await {
                    this.channels.write().await.remove(&cid);
                    debug!(cid, "channel removed from table after local close");
                }
            });
        }
    }

    /// The port engine with the lowest current outbound data-queue depth,
    /// for binding a new channel or sending a control message.
    fn select_port(&self) -> Option<Arc<PortEngine<D>>> {
        self.ports.iter().min_by_key(|p| p.back_pressure()).cloned()
    }

    /// Creates a new virtual channel bound to the least-loaded port engine
    /// and inserts it into the channel table. `cid` is the id to bind if the
    /// caller already negotiated one over RPC (the requesting side of an
    /// `Establish`); pass `None` to allocate a fresh one (the side servicing
    /// the `Establish`, which is always the allocator, `§4.4`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoPortsAvailable`] if no port engines are
    /// registered.
    pub async fn new_channel(self: &Arc<Self>, cid: Option<i64>) -> Result<VirtualChannel> {
        let port = self.select_port().ok_or(CoreError::NoPortsAvailable)?;
        let cid = cid.unwrap_or_else(|| self.next_cid.fetch_add(1, Ordering::Relaxed));
        let (channel, inner) =
            VirtualChannel::new(cid, port.data_sender(), self.config.channel_inbound_capacity, self.close_tx.clone());
        self.channels.write().await.insert(cid, inner);
        Ok(channel)
    }

    /// Asks the peer to allocate a channel, then binds a local handle to the
    /// id it returns. This is the entry point a front-end collaborator uses
    /// to start a new logical connection (`§4.7`).
    ///
    /// # Errors
    ///
    /// Propagates [`Multiplexer::rpc_establish`] and [`Multiplexer::new_channel`]
    /// failures.
    pub async fn establish_remote(self: &Arc<Self>, cancel: &CancellationToken) -> Result<VirtualChannel> {
        let cid = self.rpc_establish(cancel).await?;
        self.new_channel(Some(cid)).await
    }

    /// Removes `cid` from the channel table and signals its local consumer
    /// closed, if the channel is still present. Idempotent.
    pub async fn kill(&self, cid: i64, reason: &str) {
        let removed = self.channels.write().await.remove(&cid);
        if let Some(inner) = removed {
            inner.force_close().await;
            debug!(cid, reason, "channel killed");
        }
    }

    async fn route_data_frame(&self, frame: Frame) {
        let inner = self.channels.read().await.get(&frame.channel_id).cloned();
        match inner {
            Some(inner) if frame.is_close_signal() => {
                inner.force_close().await;
                self.channels.write().await.remove(&frame.channel_id);
            },
            Some(inner) => inner.deliver(frame.payload).await,
            None => debug!(cid = frame.channel_id, "dropping frame for unknown channel"),
        }
    }

    fn alloc_token(&self) -> i64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn send_control(&self, msg: &ControlMessage) {
        let Some(port) = self.select_port() else {
            warn!("no port engines available to send a control message");
            return;
        };
        let payload = match msg.encode() {
            Ok(p) => p.freeze(),
            Err(e) => {
                warn!(error = %e, "failed to encode control message");
                return;
            },
        };
        if let Err(e) = port.enqueue_out_control(Frame { channel_id: CONTROL_CID, payload }) {
            warn!(error = %e, "failed to enqueue control frame");
        }
    }

    /// Sends `msg` and awaits the callback sharing its token, or a
    /// cancellation. The pending slot is removed by `guard`'s `Drop` no
    /// matter which branch below resolves, and even if this future is
    /// itself dropped without completing (e.g. by an enclosing
    /// `tokio::time::timeout`).
    async fn rpc_call(&self, msg: ControlMessage, cancel: &CancellationToken) -> Result<ControlMessage> {
        let Token::Sequence(token) = msg.token()? else {
            return Err(CoreError::RpcFailed("outbound RPC tokens must be sequence-typed".to_owned()));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        lock_ignore_poison(&self.pending).insert(token, reply_tx);
        let _guard = PendingGuard { pending: &self.pending, token };

        let port = self.select_port().ok_or(CoreError::NoPortsAvailable)?;
        let payload = msg.encode()?.freeze();
        port.enqueue_out_control(Frame { channel_id: CONTROL_CID, payload })?;

        tokio::select! {
            () = cancel.cancelled() => Err(CoreError::RpcCancelled),
            result = reply_rx => result.map_err(|_| CoreError::RpcCancelled),
        }
    }

    /// Requests that the peer allocate a new channel id (`Cmd::Establish`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RpcFailed`] if the peer reports allocation
    /// failure, or any [`Multiplexer::rpc_call`] failure.
    pub async fn rpc_establish(&self, cancel: &CancellationToken) -> Result<i64> {
        let msg = ControlMessage::establish(Token::Sequence(self.alloc_token()))?;
        let reply = self.rpc_call(msg, cancel).await?;
        match reply.cid() {
            Ok(cid) if cid >= 0 => Ok(cid),
            Ok(_) => Err(CoreError::RpcFailed("peer failed to allocate a channel".to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    /// Asks the peer to dial `host:port` on behalf of the already-established
    /// channel `cid` (`Cmd::Connect`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RpcFailed`] if the peer could not service the
    /// request (e.g. the channel id is unknown to it), or any
    /// [`Multiplexer::rpc_call`] failure.
    pub async fn rpc_connect(
        &self,
        cid: i64,
        host: &str,
        port: u16,
        front_end: FrontEnd,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let msg = ControlMessage::connect(Token::Sequence(self.alloc_token()), cid, host, port, front_end)?;
        let reply = self.rpc_call(msg, cancel).await?;
        let ok = match reply.data() {
            Some(data) => data.get_as::<bool>("ok").unwrap_or(false),
            None => false,
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::RpcFailed(format!("peer could not service Connect for channel {cid}")))
        }
    }

    /// Announces that `cid` should be torn down (`Cmd::Dispose`). Fire and
    /// forget: the reserved command has no contract requiring the sender to
    /// await an acknowledgement.
    pub fn send_dispose(&self, cid: i64) {
        match ControlMessage::dispose_for(Token::Sequence(self.alloc_token()), cid) {
            Ok(msg) => self.send_control(&msg),
            Err(e) => warn!(error = %e, cid, "failed to build Dispose message"),
        }
    }

    async fn handle_control_frame(self: Arc<Self>, _port_id: usize, payload: bytes::Bytes) {
        let msg = match ControlMessage::decode(&payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed control message");
                return;
            },
        };

        match msg.flag() {
            Ok(Flag::Callback) => self.complete_pending(&msg),
            Ok(Flag::Control) => self.handle_request(&msg).await,
            Ok(Flag::Unset) | Err(_) => {
                debug!("ignoring control message with unset or unreadable flag");
            },
        }
    }

    fn complete_pending(&self, msg: &ControlMessage) {
        let Ok(Token::Sequence(token)) = msg.token() else {
            // Unknown/foreign token shape: we never issue GUID tokens
            // ourselves, so nothing in `pending` could match. Silently
            // dropped per §4.6.
            return;
        };
        if let Some(tx) = lock_ignore_poison(&self.pending).remove(&token) {
            let _ = tx.send(msg.clone());
        }
    }

    async fn handle_request(self: &Arc<Self>, msg: &ControlMessage) {
        let Ok(cmd) = msg.cmd() else {
            debug!("control request with unrecognized Cmd; ignoring");
            return;
        };
        match cmd {
            Cmd::Establish => self.handle_establish(msg).await,
            Cmd::Connect => self.handle_connect(msg).await,
            Cmd::Dispose => self.handle_dispose(msg).await,
            Cmd::Request => warn!("Request command is reserved; ignoring and not acknowledging"),
            Cmd::Unset => debug!("ignoring control message with Cmd::Unset"),
        }
    }

    async fn handle_establish(self: &Arc<Self>, msg: &ControlMessage) {
        let channel = self.new_channel(None).await;
        let reply = match channel {
            Ok(channel) => msg.establish_reply(Some(channel.cid())),
            Err(e) => {
                warn!(error = %e, "failed to allocate channel for Establish");
                msg.establish_reply(None)
            },
        };
        match reply {
            Ok(reply) => self.send_control(&reply),
            Err(e) => warn!(error = %e, "failed to build Establish reply"),
        }
    }

    async fn handle_connect(self: &Arc<Self>, msg: &ControlMessage) {
        let (cid, host, port) = match (msg.cid(), msg.host(), msg.port()) {
            (Ok(cid), Ok(host), Ok(port)) => (cid, host, port),
            _ => {
                debug!("Connect request missing cid/host/port; ignoring");
                return;
            },
        };

        let inner = self.channels.read().await.get(&cid).cloned();
        let ok = inner.is_some();
        if let Some(inner) = inner {
            let channel = VirtualChannel::from_inner(inner);
            let handler = Arc::clone(&self.connect_handler);
            tokio::spawn(async move { handler.connect(channel, host, port).await });
        } else {
            warn!(cid, "Connect RPC referenced an unknown channel");
        }

        let data = PayloadMap::new();
        let _ = data.set("ok", ok);
        match msg.reply(Some(data)) {
            Ok(reply) => self.send_control(&reply),
            Err(e) => warn!(error = %e, "failed to build Connect reply"),
        }
    }

    async fn handle_dispose(self: &Arc<Self>, msg: &ControlMessage) {
        if let Ok(cid) = msg.cid() {
            self.kill(cid, "peer Dispose").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use sertun_proto::control::FrontEnd;
    use tokio::io::duplex;

    use super::*;

    struct NoopConnectHandler;

    #[async_trait]
    impl ConnectHandler for NoopConnectHandler {
        async fn connect(&self, _channel: VirtualChannel, _host: String, _port: u16) {}
    }

    fn test_multiplexer(n_ports: usize) -> (Arc<Multiplexer<tokio::io::DuplexStream>>, Vec<tokio::io::DuplexStream>) {
        let mut devices = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..n_ports {
            let (a, b) = duplex(64 * 1024);
            devices.push(a);
            peers.push(b);
        }
        let mux = Multiplexer::new(
            devices,
            PortEngineConfig::default(),
            MultiplexerConfig::default(),
            Arc::new(NoopConnectHandler),
        );
        mux.start();
        (mux, peers)
    }

    #[tokio::test]
    async fn new_channel_binds_to_least_loaded_port() {
        let config = PortEngineConfig { data_queue_capacity: 16, ..PortEngineConfig::default() };
        let (a, _pa) = duplex(4096);
        let (b, _pb) = duplex(4096);
        let mux = Multiplexer::new(
            vec![a, b],
            config,
            MultiplexerConfig::default(),
            Arc::new(NoopConnectHandler),
        );
        // No start(): senders never drain, so back_pressure differences from
        // direct enqueues stay deterministic (scenario S5).
        for _ in 0..2 {
            mux.ports[0].enqueue_out(Frame { channel_id: 99, payload: bytes::Bytes::new() }).await.expect("fill");
        }

        let channel = mux.new_channel(None).await.expect("new_channel");
        assert_eq!(mux.ports[0].back_pressure(), 2);
        assert_eq!(mux.ports[1].back_pressure(), 0);
        assert!(mux.channels.read().await.contains_key(&channel.cid()));
    }

    #[tokio::test]
    async fn channel_ids_are_unique_and_nonzero_across_many_allocations() {
        let (mux, _peers) = test_multiplexer(1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let channel = mux.new_channel(None).await.expect("new_channel");
            assert_ne!(channel.cid(), 0);
            assert!(seen.insert(channel.cid()));
        }
    }

    #[tokio::test]
    async fn establish_rpc_round_trips_against_a_hand_built_peer_reply() {
        let (mux, mut peers) = test_multiplexer(1);
        let peer = peers.remove(0);
        let (mut reader, mut writer) = tokio::io::split(peer);

        // Act as the peer: read the Establish request, hand back cid 7.
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut scanner = sertun_proto::stuffing::FrameScanner::new();
            let mut buf = [0u8; 256];
            loop {
                let n = reader.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                for body in scanner.push(&buf[..n]) {
                    let frame = Frame::unpack(&body).expect("unpack");
                    let request = ControlMessage::decode(&frame.payload).expect("decode");
                    if request.cmd().expect("cmd") == Cmd::Establish {
                        let reply = request.establish_reply(Some(7)).expect("reply");
                        let out = Frame { channel_id: 0, payload: reply.encode().expect("encode").freeze() };
                        writer.write_all(&out.pack().expect("pack")).await.expect("write");
                        writer.flush().await.expect("flush");
                        return;
                    }
                }
            }
        });

        let cancel = CancellationToken::new();
        let cid = tokio::time::timeout(Duration::from_secs(1), mux.rpc_establish(&cancel))
            .await
            .expect("no timeout")
            .expect("establish");
        assert_eq!(cid, 7);
    }

    #[tokio::test]
    async fn cancelling_an_rpc_removes_its_pending_slot() {
        let (mux, _peers) = test_multiplexer(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = mux.rpc_establish(&cancel).await.expect_err("cancelled");
        assert!(matches!(err, CoreError::RpcCancelled));
        assert!(lock_ignore_poison(&mux.pending).is_empty());
    }

    #[tokio::test]
    async fn unknown_cid_frame_is_dropped_without_panicking() {
        let (mux, mut peers) = test_multiplexer(1);
        let peer = peers.remove(0);
        let (_reader, mut writer) = tokio::io::split(peer);

        let frame = Frame { channel_id: 42, payload: bytes::Bytes::from_static(b"stray") };
        use tokio::io::AsyncWriteExt;
        writer.write_all(&frame.pack().expect("pack")).await.expect("write");
        writer.flush().await.expect("flush");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!mux.channels.read().await.contains_key(&42));
    }
}
