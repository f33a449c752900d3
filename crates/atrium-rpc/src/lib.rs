//! Tokio-based transport/runtime for the Atrium bridge protocol.
//!
//! This crate implements:
//! - u32 length-prefixed framing with strict size checks before allocation
//! - correlation-id allocation with side parity (main = even, ext = odd)
//! - multiplexed concurrent in-flight calls
//! - per-target serial dispatch, so requests on one service identifier start
//!   their handler in send order while different identifiers proceed
//!   concurrently; a suspended handler never holds up its target's queue, so
//!   re-entrant same-target call chains complete
//! - advisory cancellation frames and a `watch`-backed cancellation token
//! - structured remote errors (`atrium_proto::RemoteError`)
//!
//! Each side registers local handlers in a [`ProxyRegistry`] and talks to the
//! other side through [`Proxy`] stubs. Obtaining a proxy never checks remote
//! registration; the handler only has to exist on the remote side by the time
//! a call actually arrives there.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;
use std::sync::{Arc, RwLock};

use atrium_proto::{
    decode_message, encode_message, CallResult, CodecError, CorrelationId, ProxyId, RemoteError,
    RemoteErrorCode, RpcMessage, Value,
};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

pub mod handles;

pub use atrium_proto as proto;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Which side of the boundary we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcRole {
    Main,
    Ext,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("allocation failed: {message}")]
    AllocationFailed { message: String },

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("request cancelled")]
    Cancelled,
}

/// Cancellation origin held by the caller. Dropping it without calling
/// [`CancelSource::cancel`] leaves the request uncancelled.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Advisory cancellation signal threaded into handlers and long-running calls.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires, for locally-originated invocations.
    pub fn never() -> Self {
        static SOURCE: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = SOURCE.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested, or once the source is gone
    /// (check [`CancelToken::is_cancelled`] to tell the two apart).
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: CorrelationId,
    cancel: CancelToken,
}

impl RequestContext {
    /// Context for invocations that did not arrive over the wire
    /// (notifications, direct local calls, tests). No request id, inert
    /// cancellation.
    pub fn detached() -> Self {
        Self {
            request_id: 0,
            cancel: CancelToken::never(),
        }
    }

    pub fn request_id(&self) -> CorrelationId {
        self.request_id
    }

    pub fn cancellation(&self) -> CancelToken {
        self.cancel.clone()
    }
}

/// Local implementation servicing incoming calls for one [`ProxyId`].
///
/// Failure is reported through the returned `Result`; the engine serializes
/// it as a [`RemoteError`] reply. A handler error never tears down the
/// connection.
pub trait ServiceHandler: Send + Sync {
    fn invoke(
        &self,
        ctx: RequestContext,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<Result<Value, RemoteError>>;
}

/// Append-only `ProxyId -> handler` table, one per process.
///
/// `register` must run before a call for that identifier arrives; a request
/// for an unregistered identifier is answered with
/// `RemoteErrorCode::UnknownTarget`.
#[derive(Default)]
pub struct ProxyRegistry {
    handlers: RwLock<HashMap<ProxyId, Arc<dyn ServiceHandler>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ProxyId, handler: Arc<dyn ServiceHandler>) {
        let mut handlers = self.handlers.write().unwrap();
        debug_assert!(
            !handlers.contains_key(&id),
            "handler for {id} registered twice"
        );
        handlers.insert(id, handler);
    }

    pub fn lookup(&self, id: ProxyId) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.read().unwrap().get(&id).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub max_frame_len: u32,
    /// Per-target dispatch queue depth. Generous by default: a handler that
    /// calls back over the same connection must not be able to wedge the read
    /// loop behind a full queue in realistic traffic.
    pub dispatch_capacity: usize,
}

pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            dispatch_capacity: 1024,
        }
    }
}

/// One side of the bridge. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct RpcConnection {
    inner: Arc<Inner>,
}

impl RpcConnection {
    pub fn start<S>(stream: S, role: RpcRole) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start_with_config(stream, role, RpcConfig::default())
    }

    pub fn start_with_config<S>(stream: S, role: RpcRole, config: RpcConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel::<Bytes>(256);

        // Correlation-id parity rule:
        // - Main-initiated request ids are even.
        // - Ext-initiated request ids are odd.
        let next_request_id = match role {
            RpcRole::Main => 2,
            RpcRole::Ext => 1,
        };

        let inner = Arc::new(Inner {
            role,
            config,
            next_request_id: AtomicU64::new(next_request_id),
            request_id_step: 2,
            tx,
            shutdown_tx,
            closed: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            incoming_cancels: Mutex::new(HashMap::new()),
            registry: ProxyRegistry::new(),
            dispatch: Mutex::new(HashMap::new()),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(read_loop(read_half, inner.clone(), shutdown_rx.clone()));
        tokio::spawn(write_loop(write_half, inner.clone(), shutdown_rx, rx));

        Self { inner }
    }

    pub fn role(&self) -> RpcRole {
        self.inner.role
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.inner.registry
    }

    /// Builds a call stub for `target`. Never fails: the remote handler only
    /// has to exist when a call arrives on the other side.
    pub fn proxy(&self, target: ProxyId) -> Proxy {
        Proxy {
            conn: self.clone(),
            target,
        }
    }

    /// Sends a request and awaits the matching reply.
    pub async fn invoke(
        &self,
        target: ProxyId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let (_id, rx) = self.send_request(target, method, args).await?;
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RpcError::Transport(TransportError::ConnectionClosed)),
        }
    }

    /// Like [`RpcConnection::invoke`], but settles as `RpcError::Cancelled`
    /// the moment `token` fires. The callee is notified best-effort with a
    /// cancel frame; we do not wait for it to acknowledge.
    pub async fn invoke_with_cancel(
        &self,
        target: ProxyId,
        method: &str,
        args: Vec<Value>,
        token: CancelToken,
    ) -> Result<Value, RpcError> {
        let (id, mut rx) = self.send_request(target, method, args).await?;
        let mut token = token;
        tokio::select! {
            res = &mut rx => {
                match res {
                    Ok(res) => res,
                    Err(_) => Err(RpcError::Transport(TransportError::ConnectionClosed)),
                }
            }
            _ = token.cancelled() => {
                if !token.is_cancelled() {
                    // Source dropped without cancelling; keep waiting.
                    return match rx.await {
                        Ok(res) => res,
                        Err(_) => Err(RpcError::Transport(TransportError::ConnectionClosed)),
                    };
                }
                self.inner.pending.lock().await.remove(&id);
                let _ = send_message(&self.inner, &RpcMessage::Cancel { id }).await;
                Err(RpcError::Cancelled)
            }
        }
    }

    /// Fire-and-forget: no reply is expected and any handler result is
    /// discarded on the remote side.
    pub async fn notify(
        &self,
        target: ProxyId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), TransportError> {
        send_message(
            &self.inner,
            &RpcMessage::Notification {
                target,
                method: method.to_string(),
                args,
            },
        )
        .await
    }

    pub async fn shutdown(&self) {
        self.inner.close(TransportError::ConnectionClosed).await;
    }

    async fn send_request(
        &self,
        target: ProxyId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(CorrelationId, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        if let Some(err) = self.inner.is_closed().await {
            return Err(RpcError::Transport(err));
        }

        let id = self.inner.alloc_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let message = RpcMessage::Request {
            id,
            target,
            method: method.to_string(),
            args,
        };
        if let Err(err) = send_message(&self.inner, &message).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(RpcError::Transport(err));
        }
        Ok((id, rx))
    }
}

/// Local stub whose method calls are forwarded as requests to the other side.
#[derive(Clone)]
pub struct Proxy {
    conn: RpcConnection,
    target: ProxyId,
}

impl Proxy {
    pub fn target(&self) -> ProxyId {
        self.target
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.conn.invoke(self.target, method, args).await
    }

    pub async fn call_with_cancel(
        &self,
        method: &str,
        args: Vec<Value>,
        token: CancelToken,
    ) -> Result<Value, RpcError> {
        self.conn
            .invoke_with_cancel(self.target, method, args, token)
            .await
    }

    pub async fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.conn.notify(self.target, method, args).await
    }
}

enum Incoming {
    Request {
        id: CorrelationId,
        method: String,
        args: Vec<Value>,
        cancel: CancelToken,
    },
    Notification {
        method: String,
        args: Vec<Value>,
    },
}

struct Inner {
    role: RpcRole,
    config: RpcConfig,
    next_request_id: AtomicU64,
    request_id_step: u64,
    tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
    closed: Mutex<Option<TransportError>>,

    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<Result<Value, RpcError>>>>,
    incoming_cancels: Mutex<HashMap<CorrelationId, CancelSource>>,

    registry: ProxyRegistry,
    dispatch: Mutex<HashMap<ProxyId, mpsc::Sender<Incoming>>>,
}

impl Inner {
    fn alloc_id(&self) -> CorrelationId {
        loop {
            let current = self.next_request_id.load(Ordering::Relaxed);
            let mut next = current.wrapping_add(self.request_id_step);
            if next == 0 {
                next = next.wrapping_add(self.request_id_step);
            }
            if self
                .next_request_id
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }

    async fn close(&self, err: TransportError) {
        {
            let mut guard = self.closed.lock().await;
            if guard.is_some() {
                return;
            }
            *guard = Some(err.clone());
        }

        let _ = self.shutdown_tx.send(true);

        // Dropping the dispatch senders lets the per-target tasks drain and
        // exit.
        self.dispatch.lock().await.clear();

        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RpcError::Transport(err.clone())));
        }
    }

    async fn is_closed(&self) -> Option<TransportError> {
        self.closed.lock().await.clone()
    }
}

async fn send_message(inner: &Arc<Inner>, message: &RpcMessage) -> Result<(), TransportError> {
    if inner.is_closed().await.is_some() {
        return Err(TransportError::ConnectionClosed);
    }

    let payload = encode_message(message)?;
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| TransportError::FrameTooLarge {
            len: u32::MAX,
            max: inner.config.max_frame_len,
        })?;
    if len > inner.config.max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len,
            max: inner.config.max_frame_len,
        });
    }

    inner
        .tx
        .send(Bytes::from(payload))
        .await
        .map_err(|_| TransportError::ConnectionClosed)
}

async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
    max_frame_len: u32,
) -> Result<Vec<u8>, TransportError> {
    let len = stream.read_u32_le().await?;
    if len > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    // Reserve fallibly so allocation failure surfaces as an error instead of
    // aborting the process.
    let len_usize = len as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len_usize)
        .map_err(|err| TransportError::AllocationFailed {
            message: format!("allocate frame buffer ({len} bytes): {err}"),
        })?;
    buf.resize(len_usize, 0);
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_loop<W: AsyncWrite + Unpin + Send + 'static>(
    mut w: W,
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            bytes = rx.recv() => {
                let Some(bytes) = bytes else { break; };
                let len = bytes.len() as u32;
                if let Err(err) = w.write_u32_le(len).await {
                    inner.close(TransportError::from(err)).await;
                    break;
                }
                if let Err(err) = w.write_all(&bytes).await {
                    inner.close(TransportError::from(err)).await;
                    break;
                }
                if let Err(err) = w.flush().await {
                    inner.close(TransportError::from(err)).await;
                    break;
                }
            }
        }
    }

    let _ = w.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin + Send + 'static>(
    mut r: R,
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            res = read_frame(&mut r, inner.config.max_frame_len) => {
                let frame = match res {
                    Ok(frame) => frame,
                    Err(err) => {
                        inner.close(err).await;
                        break;
                    }
                };

                // A frame that does not decode at all is a protocol error and
                // drops the connection; errors *inside* a valid envelope are
                // answered, not fatal.
                let message = match decode_message(&frame) {
                    Ok(message) => message,
                    Err(err) => {
                        inner.close(TransportError::Codec(err)).await;
                        break;
                    }
                };

                if let Err(err) = handle_message(&inner, message).await {
                    inner.close(err).await;
                    break;
                }
            }
        }
    }
}

async fn handle_message(inner: &Arc<Inner>, message: RpcMessage) -> Result<(), TransportError> {
    match message {
        RpcMessage::Reply { id, result } => {
            let tx = inner.pending.lock().await.remove(&id);
            let Some(tx) = tx else {
                // Late reply after cancellation or timeout; expected, drop it.
                debug!(id, "dropping reply for unknown correlation id");
                return Ok(());
            };
            let mapped = match result {
                CallResult::Ok { value } => Ok(value),
                CallResult::Err { error } if error.code == RemoteErrorCode::Cancelled => {
                    Err(RpcError::Cancelled)
                }
                CallResult::Err { error } => Err(RpcError::Remote(error)),
                CallResult::Unknown => Err(RpcError::Remote(RemoteError::internal(
                    "unrecognized reply payload",
                ))),
            };
            let _ = tx.send(mapped);
            Ok(())
        }
        RpcMessage::Request {
            id,
            target,
            method,
            args,
        } => {
            let source = CancelSource::new();
            let cancel = source.token();
            inner.incoming_cancels.lock().await.insert(id, source);
            dispatch(
                inner,
                target,
                Incoming::Request {
                    id,
                    method,
                    args,
                    cancel,
                },
            )
            .await
        }
        RpcMessage::Notification {
            target,
            method,
            args,
        } => dispatch(inner, target, Incoming::Notification { method, args }).await,
        RpcMessage::Cancel { id } => {
            if let Some(source) = inner.incoming_cancels.lock().await.get(&id) {
                source.cancel();
            }
            Ok(())
        }
        RpcMessage::Unknown => {
            // Forward-compatible frame from a newer peer.
            Ok(())
        }
    }
}

/// Hands a message to the per-target serial queue, creating the queue and its
/// drain task on first use.
async fn dispatch(
    inner: &Arc<Inner>,
    target: ProxyId,
    incoming: Incoming,
) -> Result<(), TransportError> {
    let tx = {
        let mut queues = inner.dispatch.lock().await;
        match queues.get(&target) {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::channel(inner.config.dispatch_capacity);
                queues.insert(target, tx.clone());
                tokio::spawn(dispatch_loop(inner.clone(), target, rx));
                tx
            }
        }
    };
    tx.send(incoming)
        .await
        .map_err(|_| TransportError::ConnectionClosed)
}

/// Polls `fut` exactly once on the current task. `Some(output)` if it was
/// already ready, `None` if it suspended (the future is untouched and can be
/// finished elsewhere).
async fn poll_once<T>(fut: &mut BoxFuture<T>) -> Option<T> {
    std::future::poll_fn(|cx| match fut.as_mut().poll(cx) {
        Poll::Ready(output) => Poll::Ready(Some(output)),
        Poll::Pending => Poll::Ready(None),
    })
    .await
}

/// Drains one target's queue. Each handler is driven to its first suspension
/// before the next message for this target is delivered, so handlers start in
/// send order; a handler that suspends finishes on its own task. The queue
/// must not wait for completion: a suspended handler may be awaiting a call
/// back into this very target.
async fn dispatch_loop(inner: Arc<Inner>, target: ProxyId, mut rx: mpsc::Receiver<Incoming>) {
    while let Some(incoming) = rx.recv().await {
        match incoming {
            Incoming::Request {
                id,
                method,
                args,
                cancel,
            } => {
                let ctx = RequestContext {
                    request_id: id,
                    cancel,
                };
                let mut fut = match inner.registry.lookup(target) {
                    Some(handler) => handler.invoke(ctx, &method, args),
                    None => Box::pin(std::future::ready(Err(RemoteError::unknown_target(
                        target,
                    )))) as BoxFuture<_>,
                };
                match poll_once(&mut fut).await {
                    Some(result) => {
                        if !finish_request(&inner, id, result).await {
                            return;
                        }
                    }
                    None => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            let result = fut.await;
                            finish_request(&inner, id, result).await;
                        });
                    }
                }
            }
            Incoming::Notification { method, args } => {
                let Some(handler) = inner.registry.lookup(target) else {
                    debug!(%target, method, "notification for unregistered target");
                    continue;
                };
                let mut fut = handler.invoke(RequestContext::detached(), &method, args);
                match poll_once(&mut fut).await {
                    Some(result) => {
                        if let Err(error) = result {
                            warn!(%target, method, %error, "notification handler failed");
                        }
                    }
                    None => {
                        tokio::spawn(async move {
                            if let Err(error) = fut.await {
                                warn!(%target, method, %error, "notification handler failed");
                            }
                        });
                    }
                }
            }
        }
    }
}

/// Replies to one request; `false` when the connection died sending it.
async fn finish_request(
    inner: &Arc<Inner>,
    id: CorrelationId,
    result: Result<Value, RemoteError>,
) -> bool {
    inner.incoming_cancels.lock().await.remove(&id);
    let reply = RpcMessage::Reply {
        id,
        result: match result {
            Ok(value) => CallResult::Ok { value },
            Err(error) => CallResult::Err { error },
        },
    };
    if let Err(err) = send_message(inner, &reply).await {
        inner.close(err).await;
        return false;
    }
    true
}
