//! Per-connection session pipeline
//!
//! Each accepted connection runs four cooperating tasks sharing one
//! `SessionHandle`: the receiver reads and classifies frames, the
//! dispatcher routes decoded messages to registered command handlers, the
//! transmitter serializes all outbound writes, and the notifier turns
//! posted updates into push messages. The tasks communicate only through
//! bounded queues; shutdown is a cancellation token plus a sentinel pushed
//! into every queue, and session state is released only after all four
//! tasks have stopped.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crypto::{Handshake, HandshakeState, SessionCipher};
use crate::filexfer::InboundTransfer;
use crate::framing::{write_frame, Frame, FrameEvent, FrameReader};
use crate::message::Message;
use crate::notify::{Category, Update};
use crate::protocol::{command, field, rcc, MAX_FRAME_SIZE, VERSION};
use crate::waitqueue::{MessageWaitQueue, WaitHandle};

/// Command codes the dispatcher routes before login completes
pub const INIT_ALLOWED: &[u16] = &[command::LOGIN, command::GET_SERVER_INFO, command::KEEPALIVE];

static NEXT_SESSION_INDEX: AtomicU32 = AtomicU32::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Authenticated,
    ShuttingDown,
    Closed,
}

/// Which end of the connection this pipeline serves. Servers gate commands
/// on authentication; clients trust their own traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Server,
    Client,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub role: SessionRole,
    pub max_frame_size: usize,
    /// Once a cipher is established, drop cleartext non-handshake frames
    pub require_encryption: bool,
    /// Shut the session down after this much inactivity
    pub idle_timeout: Option<Duration>,
    pub queue_depth: usize,
    pub protocol_version: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            role: SessionRole::Server,
            max_frame_size: MAX_FRAME_SIZE,
            require_encryption: false,
            idle_timeout: None,
            queue_depth: 64,
            protocol_version: VERSION,
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send>>;

/// Business-logic entry point, registered per command code. Returned
/// messages are enqueued for transmission in order.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, msg: Message, session: Arc<SessionHandle>) -> HandlerFuture;

    /// Long-running handlers return true to run on their own worker task so
    /// the dispatcher loop is never blocked behind a slow external call.
    fn offload(&self) -> bool {
        false
    }
}

struct FnHandler<F> {
    func: F,
    offload: bool,
}

impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(Message, Arc<SessionHandle>) -> HandlerFuture + Send + Sync,
{
    fn handle(&self, msg: Message, session: Arc<SessionHandle>) -> HandlerFuture {
        (self.func)(msg, session)
    }

    fn offload(&self) -> bool {
        self.offload
    }
}

/// Dispatch table mapping command codes to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, code: u16, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(code, handler);
    }

    /// Register a closure-based handler; `offload` moves it to a worker
    pub fn register_fn<F>(&mut self, code: u16, offload: bool, func: F)
    where
        F: Fn(Message, Arc<SessionHandle>) -> HandlerFuture + Send + Sync + 'static,
    {
        self.register(code, Arc::new(FnHandler { func, offload }));
    }

    fn get(&self, code: u16) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&code).cloned()
    }
}

enum Outbound {
    Frame { bytes: Vec<u8>, seal: bool },
    Shutdown,
}

enum Inbound {
    Message(Message),
    Shutdown,
}

enum Push {
    Update(Update),
    Shutdown,
}

struct PendingHandshake {
    request_id: u32,
    exchange: Handshake,
    done: oneshot::Sender<bool>,
}

/// Shared state of one session, handed to command handlers and external
/// collaborators. All cross-task communication goes through here.
pub struct SessionHandle {
    index: u32,
    options: SessionOptions,
    state: Mutex<SessionState>,
    user_id: AtomicU32,
    cipher: RwLock<Option<Arc<SessionCipher>>>,
    handshake: Mutex<Option<PendingHandshake>>,
    waiters: MessageWaitQueue,
    transfer: Mutex<Option<InboundTransfer>>,
    subscriptions: Mutex<HashSet<Category>>,
    last_activity: Mutex<Instant>,
    next_request_id: AtomicU32,
    in_flight: AtomicUsize,
    stop: CancellationToken,
    out_tx: mpsc::Sender<Outbound>,
    disp_tx: mpsc::Sender<Inbound>,
    push_tx: mpsc::Sender<Push>,
}

impl SessionHandle {
    fn new(
        options: SessionOptions,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<Outbound>,
        mpsc::Receiver<Inbound>,
        mpsc::Receiver<Push>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(options.queue_depth);
        let (disp_tx, disp_rx) = mpsc::channel(options.queue_depth);
        let (push_tx, push_rx) = mpsc::channel(options.queue_depth);
        let state = match options.role {
            SessionRole::Server => SessionState::Init,
            SessionRole::Client => SessionState::Authenticated,
        };
        let handle = Arc::new(SessionHandle {
            index: NEXT_SESSION_INDEX.fetch_add(1, Ordering::Relaxed),
            options,
            state: Mutex::new(state),
            user_id: AtomicU32::new(0),
            cipher: RwLock::new(None),
            handshake: Mutex::new(None),
            waiters: MessageWaitQueue::new(),
            transfer: Mutex::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            next_request_id: AtomicU32::new(1),
            in_flight: AtomicUsize::new(0),
            stop: CancellationToken::new(),
            out_tx,
            disp_tx,
            push_tx,
        });
        (handle, out_rx, disp_rx, push_rx)
    }

    /// Process-wide-unique session index
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Transition out of the pre-login state. Only valid from Init; the
    /// login handler calls this after verifying credentials.
    pub fn set_authenticated(&self, user_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SessionState::Init {
            bail!("authentication in state {:?}", *state);
        }
        *state = SessionState::Authenticated;
        self.user_id.store(user_id, Ordering::Relaxed);
        Ok(())
    }

    pub fn user_id(&self) -> u32 {
        self.user_id.load(Ordering::Relaxed)
    }

    pub fn handshake_state(&self) -> HandshakeState {
        if self.cipher.read().is_some() {
            HandshakeState::Established
        } else if self.handshake.lock().is_some() {
            HandshakeState::KeyRequested
        } else {
            HandshakeState::None
        }
    }

    /// Allocate a request id; id 0 is reserved for unsolicited traffic
    pub fn create_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self, category: Category) {
        self.subscriptions.lock().insert(category);
    }

    pub fn unsubscribe(&self, category: Category) {
        self.subscriptions.lock().remove(&category);
    }

    pub fn is_subscribed(&self, category: Category) -> bool {
        self.subscriptions.lock().contains(&category)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Encode a message and queue it for transmission
    pub async fn send_message(&self, msg: &Message) -> Result<()> {
        self.enqueue_frame(msg.encode_version(self.options.protocol_version))
            .await
    }

    /// Queue an already-encoded frame. The seal decision is made here, at
    /// enqueue time, so frames queued before the handshake completed are
    /// never retroactively encrypted ahead of the session-key response.
    pub async fn enqueue_frame(&self, bytes: Vec<u8>) -> Result<()> {
        let code = u16::from_be_bytes([bytes[0], bytes[1]]);
        let seal = !seal_exempt(code) && self.cipher.read().is_some();
        self.out_tx
            .send(Outbound::Frame { bytes, seal })
            .await
            .map_err(|_| anyhow!("session {} transmit queue closed", self.index))
    }

    /// Register for a correlated reply without sending anything yet; used
    /// when the "request" goes out as raw frames (file transfer).
    pub fn register_waiter(&self, expect_code: u16, request_id: u32) -> Result<WaitHandle> {
        self.waiters.register(expect_code, request_id)
    }

    /// Send a request and block the calling task for the correlated reply
    pub async fn send_request(
        &self,
        msg: &Message,
        expect_code: u16,
        deadline: Duration,
    ) -> Result<Message> {
        let waiter = self.waiters.register(expect_code, msg.id)?;
        self.send_message(msg).await?;
        waiter.wait(deadline).await.map_err(anyhow::Error::new)
    }

    /// Post an update toward this session's notifier. Blocks the poster
    /// only on a full notify queue; unsubscribed updates are dropped by
    /// the notifier itself.
    pub async fn post_update(&self, update: Update) -> Result<()> {
        self.push_tx
            .send(Push::Update(update))
            .await
            .map_err(|_| anyhow!("session {} notify queue closed", self.index))
    }

    /// Arm an inbound file transfer. Fails when one is already active;
    /// the caller turns that into a resource-busy response.
    pub fn begin_file_upload(&self, transfer: InboundTransfer) -> Result<()> {
        let mut slot = self.transfer.lock();
        if slot.is_some() {
            bail!("file transfer already active on session {}", self.index);
        }
        *slot = Some(transfer);
        Ok(())
    }

    pub fn has_active_transfer(&self) -> bool {
        self.transfer.lock().is_some()
    }

    /// Request opportunistic encryption from the peer. On timeout the
    /// session stays usable in clear and the pending exchange is disarmed.
    pub async fn request_encryption(&self, deadline: Duration) -> Result<()> {
        if self.cipher.read().is_some() {
            return Ok(());
        }
        let exchange = Handshake::initiate();
        let request_id = self.create_request_id();
        let request = exchange.request_message(request_id);
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = self.handshake.lock();
            if pending.is_some() {
                bail!("session key exchange already in progress");
            }
            *pending = Some(PendingHandshake {
                request_id,
                exchange,
                done: done_tx,
            });
        }
        self.send_message(&request).await?;
        match tokio::time::timeout(deadline, done_rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => bail!("session key exchange failed"),
            Ok(Err(_)) => bail!("session closed during key exchange"),
            Err(_) => {
                self.handshake.lock().take();
                bail!("session key exchange timed out")
            }
        }
    }

    /// Begin session teardown from any context
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Abort the active inbound transfer, if any, as a failure
    fn abort_transfer(&self) {
        let taken = self.transfer.lock().take();
        if let Some(t) = taken {
            warn!(session = self.index, name = %t.name, "aborting in-flight file transfer");
            t.complete(false);
        }
    }
}

fn seal_exempt(code: u16) -> bool {
    matches!(
        code,
        command::SESSION_KEY | command::REQUEST_SESSION_KEY | command::ENCRYPTED_FRAME
    )
}

/// Process-wide arena of live sessions, keyed by session index
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u32, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: &Arc<SessionHandle>) {
        self.sessions
            .write()
            .insert(handle.index(), Arc::clone(handle));
    }

    pub fn remove(&self, index: u32) {
        self.sessions.write().remove(&index);
    }

    pub fn get(&self, index: u32) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Best-effort fan-out of one update to every live session
    pub async fn broadcast(&self, update: Update) {
        let targets: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in targets {
            if session.post_update(update.clone()).await.is_err() {
                debug!(session = session.index(), "update dropped: session closing");
            }
        }
    }
}

/// One running session pipeline
pub struct Session;

impl Session {
    /// Start the four pipeline tasks over the given stream. Returns the
    /// shared handle and a join handle that completes once the session has
    /// fully shut down and released its state.
    pub fn spawn<S>(
        stream: S,
        handlers: Arc<HandlerRegistry>,
        options: SessionOptions,
        sessions: Option<Arc<SessionRegistry>>,
    ) -> (Arc<SessionHandle>, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (handle, out_rx, disp_rx, push_rx) = SessionHandle::new(options);
        if let Some(reg) = &sessions {
            reg.insert(&handle);
        }
        let join = tokio::spawn(session_main(
            stream,
            handlers,
            Arc::clone(&handle),
            sessions,
            out_rx,
            disp_rx,
            push_rx,
        ));
        (handle, join)
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_main<S>(
    stream: S,
    handlers: Arc<HandlerRegistry>,
    handle: Arc<SessionHandle>,
    sessions: Option<Arc<SessionRegistry>>,
    out_rx: mpsc::Receiver<Outbound>,
    disp_rx: mpsc::Receiver<Inbound>,
    push_rx: mpsc::Receiver<Push>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut transmitter = tokio::spawn(transmitter_loop(wr, out_rx, Arc::clone(&handle)));
    let mut dispatcher = tokio::spawn(dispatcher_loop(disp_rx, handlers, Arc::clone(&handle)));
    let mut notifier = tokio::spawn(notifier_loop(push_rx, Arc::clone(&handle)));

    if let Err(e) = receiver_loop(rd, &handle).await {
        // Socket-fatal; everything else was already degraded to a log line
        error!(session = handle.index, error = %e, "session receiver failed");
    }

    // Ordered teardown: stop accepting work, flag every queue, join the
    // other three tasks, then release session-owned state.
    handle.set_state(SessionState::ShuttingDown);
    handle.waiters.clear();

    let _ = tokio::time::timeout(Duration::from_secs(1), handle.push_tx.send(Push::Shutdown)).await;
    join_or_cancel(&handle, &mut notifier, "notifier").await;

    let _ = tokio::time::timeout(
        Duration::from_secs(1),
        handle.disp_tx.send(Inbound::Shutdown),
    )
    .await;
    join_or_cancel(&handle, &mut dispatcher, "dispatcher").await;

    // Off-loaded workers may still be producing; wait for quiescence
    let mut waited = 0u32;
    while handle.in_flight.load(Ordering::SeqCst) > 0 && waited < 500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    if handle.in_flight.load(Ordering::SeqCst) > 0 {
        warn!(session = handle.index, "shutting down with workers still in flight");
    }

    let _ = tokio::time::timeout(
        Duration::from_secs(1),
        handle.out_tx.send(Outbound::Shutdown),
    )
    .await;
    join_or_cancel(&handle, &mut transmitter, "transmitter").await;

    handle.stop.cancel();
    handle.abort_transfer();
    handle.set_state(SessionState::Closed);
    if let Some(reg) = &sessions {
        reg.remove(handle.index);
    }
    info!(session = handle.index, "session closed");
}

/// Wait for a pipeline task; escalate to cancellation if it drags
async fn join_or_cancel(
    handle: &Arc<SessionHandle>,
    task: &mut JoinHandle<()>,
    name: &'static str,
) {
    if tokio::time::timeout(Duration::from_secs(10), &mut *task)
        .await
        .is_err()
    {
        warn!(session = handle.index, task = name, "forcing task shutdown");
        handle.stop.cancel();
        let _ = task.await;
    }
}

async fn receiver_loop<R>(mut rd: R, handle: &Arc<SessionHandle>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(handle.options.max_frame_size);
    loop {
        if handle.stop.is_cancelled() {
            return Ok(());
        }
        let cipher = handle.cipher.read().clone();
        match reader.next_frame(&mut rd, cipher.as_deref()).await? {
            FrameEvent::Idle => {
                if let Some(limit) = handle.options.idle_timeout {
                    if handle.idle_for() > limit {
                        info!(session = handle.index, "closing idle session");
                        return Ok(());
                    }
                }
            }
            FrameEvent::Eof => {
                debug!(session = handle.index, "peer closed connection");
                return Ok(());
            }
            FrameEvent::Frame(frame) => receive_frame(handle, frame).await?,
        }
    }
}

async fn receive_frame(handle: &Arc<SessionHandle>, frame: Frame) -> Result<()> {
    handle.touch();
    let code = frame.code();

    if handle.options.require_encryption
        && !frame.encrypted
        && !seal_exempt(code)
        && handle.cipher.read().is_some()
    {
        warn!(
            session = handle.index,
            code, "dropping cleartext frame on encrypted session"
        );
        return Ok(());
    }

    if frame.is_binary() {
        return receive_raw_frame(handle, frame).await;
    }

    let msg = match Message::decode(&frame.bytes, handle.options.protocol_version) {
        Ok(m) => m,
        Err(e) => {
            warn!(session = handle.index, error = %e, "undecodable frame dropped");
            return Ok(());
        }
    };

    match msg.code {
        command::KEEPALIVE => {
            handle
                .send_message(&Message::completion(msg.id, rcc::SUCCESS))
                .await
        }
        command::SESSION_KEY => {
            resolve_handshake(handle, msg);
            Ok(())
        }
        command::REQUEST_SESSION_KEY => respond_handshake(handle, msg).await,
        _ => {
            if let Some(unmatched) = handle.waiters.deliver(msg) {
                // Not a correlated reply; hand to the dispatcher
                if handle
                    .disp_tx
                    .send(Inbound::Message(unmatched))
                    .await
                    .is_err()
                {
                    debug!(session = handle.index, "dispatch queue closed");
                }
            }
            Ok(())
        }
    }
}

/// Only the receiver observes handshake completion, so cipher installation
/// is serialized here by construction.
fn resolve_handshake(handle: &Arc<SessionHandle>, msg: Message) {
    let pending = {
        let mut slot = handle.handshake.lock();
        match slot.as_ref() {
            Some(p) if p.request_id == msg.id => slot.take(),
            _ => None,
        }
    };
    let Some(pending) = pending else {
        warn!(
            session = handle.index,
            id = msg.id,
            "unexpected session key response"
        );
        return;
    };
    let outcome = match msg.get_binary(field::PUBLIC_KEY) {
        Some(peer_key) => pending.exchange.complete(peer_key),
        None => Err(anyhow!("session key response without public key")),
    };
    match outcome {
        Ok(cipher) => {
            *handle.cipher.write() = Some(Arc::new(cipher));
            info!(session = handle.index, "session encryption established");
            let _ = pending.done.send(true);
        }
        Err(e) => {
            warn!(session = handle.index, error = %e, "session key exchange failed");
            let _ = pending.done.send(false);
        }
    }
}

async fn respond_handshake(handle: &Arc<SessionHandle>, msg: Message) -> Result<()> {
    let request_id = msg.id;
    let outcome = match msg.get_binary(field::PUBLIC_KEY) {
        Some(peer_key) => Handshake::respond(peer_key, request_id),
        None => Err(anyhow!("session key request without public key")),
    };
    match outcome {
        Ok((reply, cipher)) => {
            // The reply is queued before the cipher is installed and its
            // code is seal-exempt, so it always reaches the peer in clear.
            handle.send_message(&reply).await?;
            *handle.cipher.write() = Some(Arc::new(cipher));
            info!(session = handle.index, "session encryption established");
        }
        Err(e) => {
            warn!(session = handle.index, error = %e, "rejecting session key request");
            handle
                .send_message(&Message::completion(request_id, rcc::ENCRYPTION_ERROR))
                .await?;
        }
    }
    Ok(())
}

/// Raw frames carry file-transfer traffic for the active transfer's
/// correlation id; anything else is out of state and dropped.
async fn receive_raw_frame(handle: &Arc<SessionHandle>, frame: Frame) -> Result<()> {
    let code = frame.code();
    let request_id = frame.request_id();

    if code != command::FILE_DATA && code != command::ABORT_FILE_TRANSFER {
        warn!(session = handle.index, code, "unexpected raw frame");
        return Ok(());
    }

    // Decide under the lock, send after releasing it
    enum Action {
        None,
        Finish(InboundTransfer, bool, u32),
    }

    let action = {
        let mut slot = handle.transfer.lock();
        let matched = matches!(slot.as_ref(), Some(t) if t.request_id == request_id);
        if !matched {
            debug!(
                session = handle.index,
                id = request_id,
                "raw frame outside any active transfer"
            );
            Action::None
        } else if code == command::ABORT_FILE_TRANSFER {
            match slot.take() {
                Some(t) => Action::Finish(t, false, 0),
                None => Action::None,
            }
        } else {
            let appended = match slot.as_mut() {
                Some(t) => t.append(frame.binary_payload()),
                None => Ok(()),
            };
            match appended {
                Ok(()) if frame.is_end_of_file() => match slot.take() {
                    Some(t) => Action::Finish(t, true, rcc::SUCCESS),
                    None => Action::None,
                },
                Ok(()) => Action::None,
                Err(e) => {
                    warn!(session = handle.index, error = %e, "file chunk write failed");
                    match slot.take() {
                        Some(t) => Action::Finish(t, false, rcc::IO_ERROR),
                        None => Action::None,
                    }
                }
            }
        }
    };

    match action {
        Action::None => Ok(()),
        Action::Finish(transfer, success, response) => {
            let committed = transfer.complete(success);
            if code == command::ABORT_FILE_TRANSFER {
                // Peer-initiated abort needs no acknowledgment
                return Ok(());
            }
            let final_rcc = if success && !committed {
                rcc::IO_ERROR
            } else {
                response
            };
            handle
                .send_message(&Message::completion(request_id, final_rcc))
                .await
        }
    }
}

async fn dispatcher_loop(
    mut rx: mpsc::Receiver<Inbound>,
    handlers: Arc<HandlerRegistry>,
    handle: Arc<SessionHandle>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = handle.stop.cancelled() => break,
            item = rx.recv() => item,
        };
        let msg = match item {
            Some(Inbound::Message(msg)) => msg,
            Some(Inbound::Shutdown) | None => break,
        };
        let code = msg.code;
        let id = msg.id;

        if handle.state() == SessionState::Init && !INIT_ALLOWED.contains(&code) {
            debug!(
                session = handle.index,
                code, "command rejected before login"
            );
            let _ = handle
                .send_message(&Message::completion(id, rcc::ACCESS_DENIED))
                .await;
            continue;
        }

        let Some(handler) = handlers.get(code) else {
            debug!(session = handle.index, code, "no handler registered");
            let _ = handle
                .send_message(&Message::completion(id, rcc::NOT_IMPLEMENTED))
                .await;
            continue;
        };

        if handler.offload() {
            handle.in_flight.fetch_add(1, Ordering::SeqCst);
            let worker_handle = Arc::clone(&handle);
            tokio::spawn(async move {
                run_handler(handler, msg, &worker_handle).await;
                worker_handle.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        } else {
            run_handler(handler, msg, &handle).await;
        }
    }
}

/// Invoke one handler; failures become a generic error response and never
/// take the dispatcher down.
async fn run_handler(handler: Arc<dyn CommandHandler>, msg: Message, handle: &Arc<SessionHandle>) {
    let code = msg.code;
    let id = msg.id;
    match handler.handle(msg, Arc::clone(handle)).await {
        Ok(responses) => {
            for response in responses {
                if handle.send_message(&response).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            error!(session = handle.index, code, error = %e, "command handler failed");
            let _ = handle
                .send_message(&Message::completion(id, rcc::INTERNAL_ERROR))
                .await;
        }
    }
}

async fn transmitter_loop<W>(mut wr: W, mut rx: mpsc::Receiver<Outbound>, handle: Arc<SessionHandle>)
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = handle.stop.cancelled() => break,
            item = rx.recv() => item,
        };
        let (bytes, seal) = match item {
            Some(Outbound::Frame { bytes, seal }) => (bytes, seal),
            Some(Outbound::Shutdown) | None => break,
        };
        let frame = if seal {
            let cipher = handle.cipher.read().clone();
            match cipher {
                Some(ctx) => match ctx.seal_frame(&bytes) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        error!(session = handle.index, error = %e, "frame encryption failed");
                        handle.stop.cancel();
                        break;
                    }
                },
                // Enqueue-time decision said seal; context can no longer
                // disappear once installed
                None => bytes,
            }
        } else {
            bytes
        };
        if let Err(e) = write_frame(&mut wr, &frame).await {
            error!(session = handle.index, error = %e, "socket write failed");
            handle.stop.cancel();
            break;
        }
    }
}

async fn notifier_loop(mut rx: mpsc::Receiver<Push>, handle: Arc<SessionHandle>) {
    loop {
        let item = tokio::select! {
            biased;
            _ = handle.stop.cancelled() => break,
            item = rx.recv() => item,
        };
        let update = match item {
            Some(Push::Update(update)) => update,
            Some(Push::Shutdown) | None => break,
        };
        // Push traffic is gated on login and per-session subscription
        if !handle.is_authenticated() || !handle.is_subscribed(update.category) {
            continue;
        }
        let msg = update.into_message();
        if handle.send_message(&msg).await.is_err() {
            break;
        }
    }
}

/// Convenience wrapper for storage-layer glue: arm an upload into a local
/// staging sink and answer resource-busy when one is already running.
pub fn begin_local_upload(
    handle: &Arc<SessionHandle>,
    request_id: u32,
    store_dir: &std::path::Path,
    name: &str,
    audit: Option<crate::filexfer::TransferLog>,
) -> Result<Message> {
    let sink = crate::filexfer::LocalFileSink::create(store_dir, name)
        .context("create upload staging file")?;
    let mut transfer = InboundTransfer::new(request_id, name, Box::new(sink), None);
    if let Some(log) = audit {
        transfer = transfer.with_audit(log);
    }
    match handle.begin_file_upload(transfer) {
        Ok(()) => Ok(Message::completion(request_id, rcc::SUCCESS)),
        Err(_) => Ok(Message::completion(request_id, rcc::RESOURCE_BUSY)),
    }
}
