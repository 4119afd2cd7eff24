//! Server accept loop and the sample command handlers
//!
//! Business-logic modules plug their own handlers into the registry; the
//! set registered here is the thin glue a bare daemon needs to be usable:
//! login against configured accounts, server identification, push
//! subscription management and inbound file upload into the local store.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::filexfer::TransferLog;
use crate::message::Message;
use crate::notify::Category;
use crate::protocol::{command, field, rcc, VERSION};
use crate::session::{begin_local_upload, HandlerRegistry, Session, SessionRegistry};

/// Register the daemon's baseline handlers against the given configuration
pub fn build_registry(config: &Arc<DaemonConfig>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let server_id = Uuid::new_v4().to_string();

    let cfg = Arc::clone(config);
    registry.register_fn(command::LOGIN, false, move |msg, session| {
        let cfg = Arc::clone(&cfg);
        Box::pin(async move {
            let name = msg.get_str(field::LOGIN_NAME).unwrap_or("");
            let password = msg.get_str(field::PASSWORD).unwrap_or("");
            let account = cfg
                .users
                .iter()
                .find(|u| u.name == name && u.password == password);
            let code = match account {
                Some(user) => match session.set_authenticated(user.user_id) {
                    Ok(()) => {
                        info!(session = session.index(), user = %user.name, "user logged in");
                        rcc::SUCCESS
                    }
                    Err(_) => rcc::OUT_OF_STATE,
                },
                None => {
                    debug!(session = session.index(), user = name, "login rejected");
                    rcc::AUTH_FAILED
                }
            };
            Ok(vec![Message::completion(msg.id, code)])
        })
    });

    registry.register_fn(command::GET_SERVER_INFO, false, move |msg, _session| {
        let server_id = server_id.clone();
        Box::pin(async move {
            let mut reply = Message::completion(msg.id, rcc::SUCCESS);
            reply.set_str(field::SERVER_VERSION, env!("CARGO_PKG_VERSION"));
            reply.set_str(field::SERVER_ID, &server_id);
            reply.set_u16(field::PROTOCOL_VERSION, VERSION);
            Ok(vec![reply])
        })
    });

    registry.register_fn(command::SUBSCRIBE, false, |msg, session| {
        Box::pin(async move {
            let code = match msg
                .get_u32(field::NOTIFY_CATEGORY)
                .and_then(Category::from_u32)
            {
                Some(category) => {
                    session.subscribe(category);
                    rcc::SUCCESS
                }
                None => rcc::INVALID_REQUEST,
            };
            Ok(vec![Message::completion(msg.id, code)])
        })
    });

    registry.register_fn(command::UNSUBSCRIBE, false, |msg, session| {
        Box::pin(async move {
            let code = match msg
                .get_u32(field::NOTIFY_CATEGORY)
                .and_then(Category::from_u32)
            {
                Some(category) => {
                    session.unsubscribe(category);
                    rcc::SUCCESS
                }
                None => rcc::INVALID_REQUEST,
            };
            Ok(vec![Message::completion(msg.id, code)])
        })
    });

    let cfg = Arc::clone(config);
    registry.register_fn(command::FILE_UPLOAD, false, move |msg, session| {
        let cfg = Arc::clone(&cfg);
        Box::pin(async move {
            let name = msg.get_str(field::FILE_NAME).unwrap_or("");
            // Uploads land in the flat store directory; reject anything
            // that could escape it
            if name.is_empty()
                || name.starts_with('.')
                || name.contains('/')
                || name.contains('\\')
                || name.contains('\0')
            {
                return Ok(vec![Message::completion(msg.id, rcc::INVALID_REQUEST)]);
            }
            let audit = TransferLog::new(&cfg.file_store);
            let reply =
                begin_local_upload(&session, msg.id, &cfg.file_store, name, Some(audit))?;
            Ok(vec![reply])
        })
    });

    registry
}

/// Accept connections forever, spawning one session pipeline per socket
pub async fn serve(
    config: Arc<DaemonConfig>,
    handlers: Arc<HandlerRegistry>,
    sessions: Arc<SessionRegistry>,
) -> Result<()> {
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, "gridmond listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let (handle, _join) = Session::spawn(
            stream,
            Arc::clone(&handlers),
            config.session_options(),
            Some(Arc::clone(&sessions)),
        );
        info!(session = handle.index(), %peer, "connection accepted");
    }
}
