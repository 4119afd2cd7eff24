//! Client-side connection surface over the session pipeline
//!
//! A `Connection` runs the same four-task pipeline in client role and
//! layers the synchronous call pattern on top: allocate a request id, send
//! the request, block on the pending-request table for the correlated
//! completion (or a timeout outcome). Push messages from the server are
//! routed through the same handler registry mechanism as on the server
//! side.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::filexfer;
use crate::message::Message;
use crate::notify::Category;
use crate::protocol::{command, field, rcc, timeouts, FILE_CHUNK_SIZE};
use crate::session::{HandlerRegistry, Session, SessionHandle, SessionOptions, SessionRole};
use crate::waitqueue::WaitError;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub session: SessionOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            request_timeout: Duration::from_millis(timeouts::REQUEST_MS),
            handshake_timeout: Duration::from_millis(timeouts::HANDSHAKE_MS),
            session: SessionOptions {
                role: SessionRole::Client,
                ..Default::default()
            },
        }
    }
}

pub struct Connection {
    handle: Arc<SessionHandle>,
    options: ClientOptions,
    join: JoinHandle<()>,
}

impl Connection {
    /// Connect and start the client pipeline. The registry holds handlers
    /// for server-originated push messages; pass an empty one to drop them.
    pub async fn connect(
        addr: &str,
        handlers: Arc<HandlerRegistry>,
        mut options: ClientOptions,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {}", addr))?;
        let _ = stream.set_nodelay(true);
        options.session.role = SessionRole::Client;
        let (handle, join) = Session::spawn(stream, handlers, options.session.clone(), None);
        debug!(session = handle.index(), addr, "connected");
        Ok(Connection {
            handle,
            options,
            join,
        })
    }

    pub fn session(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn create_request_id(&self) -> u32 {
        self.handle.create_request_id()
    }

    /// Send a request and wait for its generic completion message
    pub async fn request(&self, msg: &Message) -> Result<Message> {
        self.request_expect(msg, command::REQUEST_COMPLETED).await
    }

    /// Send a request and wait for a correlated reply with a specific code
    pub async fn request_expect(&self, msg: &Message, expect_code: u16) -> Result<Message> {
        self.handle
            .send_request(msg, expect_code, self.options.request_timeout)
            .await
    }

    /// Send a request and reduce the outcome to a return code; a timeout
    /// becomes the timeout code instead of an error.
    pub async fn wait_for_rcc(&self, msg: &Message) -> Result<u32> {
        match self.request(msg).await {
            Ok(reply) => Ok(reply.get_u32(field::RCC).unwrap_or(rcc::INTERNAL_ERROR)),
            Err(e) => match e.downcast_ref::<WaitError>() {
                Some(WaitError::Timeout) => Ok(rcc::TIMEOUT),
                _ => Err(e),
            },
        }
    }

    /// Authenticate this session; returns the server's return code
    pub async fn login(&self, name: &str, password: &str) -> Result<u32> {
        let mut msg = Message::new(command::LOGIN, self.create_request_id());
        msg.set_str(field::LOGIN_NAME, name);
        msg.set_str(field::PASSWORD, password);
        self.wait_for_rcc(&msg).await
    }

    /// Pre-login server identification query
    pub async fn server_info(&self) -> Result<Message> {
        let msg = Message::new(command::GET_SERVER_INFO, self.create_request_id());
        self.request(&msg).await
    }

    /// Liveness probe answered inline by the peer's receiver
    pub async fn keepalive(&self) -> Result<u32> {
        let msg = Message::new(command::KEEPALIVE, self.create_request_id());
        self.wait_for_rcc(&msg).await
    }

    /// Negotiate session encryption; on timeout the connection stays
    /// usable in clear and the error says so.
    pub async fn request_encryption(&self) -> Result<()> {
        self.handle
            .request_encryption(self.options.handshake_timeout)
            .await
    }

    /// Subscribe to a push category on the server
    pub async fn subscribe(&self, category: Category) -> Result<u32> {
        let mut msg = Message::new(command::SUBSCRIBE, self.create_request_id());
        msg.set_u32(field::NOTIFY_CATEGORY, category.as_u32());
        self.wait_for_rcc(&msg).await
    }

    /// Upload a local file: announce the transfer, stream raw chunks on
    /// the same request id, then collect the final completion.
    pub async fn upload_file(&self, local: &std::path::Path, remote_name: &str) -> Result<()> {
        let request_id = self.create_request_id();
        let size = tokio::fs::metadata(local)
            .await
            .with_context(|| format!("stat {}", local.display()))?
            .len();

        let mut announce = Message::new(command::FILE_UPLOAD, request_id);
        announce.set_str(field::FILE_NAME, remote_name);
        announce.set_u64(field::FILE_SIZE, size);
        let reply = self.request(&announce).await?;
        let code = reply.get_u32(field::RCC).unwrap_or(rcc::INTERNAL_ERROR);
        if code != rcc::SUCCESS {
            bail!("upload rejected with code {}", code);
        }

        // The server answers on the same id once the EOF chunk lands
        let waiter = self
            .handle
            .register_waiter(command::REQUEST_COMPLETED, request_id)?;
        filexfer::send_file(&self.handle, request_id, local, FILE_CHUNK_SIZE).await?;
        let done = waiter
            .wait(self.options.request_timeout)
            .await
            .map_err(anyhow::Error::new)?;
        let code = done.get_u32(field::RCC).unwrap_or(rcc::INTERNAL_ERROR);
        if code != rcc::SUCCESS {
            bail!("upload failed with code {}", code);
        }
        Ok(())
    }

    /// Tell the peer to abandon an inbound transfer we started
    pub async fn abort_upload(&self, request_id: u32) -> Result<()> {
        self.handle
            .enqueue_frame(filexfer::abort_frame(request_id))
            .await
    }

    /// Shut the session down and wait for the pipeline to finish
    pub async fn close(self) {
        self.handle.shutdown();
        let _ = self.join.await;
    }
}
