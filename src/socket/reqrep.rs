//! Request/Reply primitives (§4.2): strictly alternating single-socket RPC.
//!
//! Per the design-note decision in §9, a `Request` that times out tears
//! down and rebuilds its socket rather than trying to resynchronize the
//! strict-alternation state machine — the simpler contract the spec calls
//! for, preserved as-is rather than migrating to a dealer-based client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::message::{AnyMessage, Message, MessageRegistry};
use crate::transport::{AsyncSocket, Context};

use super::{
    open_and_configure, recv_with_timeout, send_with_timeout, SocketDetails, SocketError,
    SocketKind, SocketOptions,
};

/// A poll interval the reply loop uses between `keep_running` checks when
/// no explicit receive timeout narrower than this was configured.
const REPLY_POLL_MS: i32 = 100;

/// The request (client) half of req/rep.
pub struct Request {
    context: Context,
    options: Option<SocketOptions>,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
    registry: MessageRegistry,
}

impl Request {
    /// A not-yet-initialized request socket, decoding replies via
    /// `registry`.
    pub fn new(context: Context, registry: MessageRegistry) -> Self {
        Self {
            context,
            options: None,
            socket: None,
            details: None,
            registry,
        }
    }

    /// Connect (or bind) per `options`, remembering them so a
    /// timed-out request can rebuild the socket.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        if self.is_initialized() {
            return Err(SocketError::AlreadyInitialized);
        }
        let (socket, address) = open_and_configure(&self.context, SocketKind::Request, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::Request,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        self.options = Some(options);
        debug!("request socket initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// Send `message` and block for the reply, bounded by the configured
    /// `recv_timeout_ms`. On timeout, tears down and rebuilds the socket
    /// (see module docs) before returning [`SocketError::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized,
    /// [`SocketError::Timeout`] if the reply did not arrive in time, or a
    /// transport/decode error.
    pub async fn request<M: Message>(&mut self, message: &M) -> Result<AnyMessage, SocketError> {
        let options = self
            .options
            .clone()
            .ok_or(SocketError::NotInitialized)?;
        let payload = message.to_wire()?;
        {
            let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
            send_with_timeout(
                socket,
                &[M::TYPE_NAME.as_bytes().to_vec(), payload],
                options.send_timeout_ms,
            )
            .await?;
        }
        let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
        match recv_with_timeout(socket, options.recv_timeout_ms).await? {
            Some(frames) => {
                let reply_payload = frames
                    .get(1)
                    .ok_or_else(|| SocketError::InvalidOptions("malformed reply frame".to_string()))?;
                Ok(self.registry.get(reply_payload)?)
            }
            None => {
                warn!("request timed out; tearing down and rebuilding socket");
                self.rebuild(options)?;
                Err(SocketError::Timeout)
            }
        }
    }

    fn rebuild(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        self.socket = None;
        let (socket, address) = open_and_configure(&self.context, SocketKind::Request, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::Request,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        Ok(())
    }

    /// The connected/bound address and effective security parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&SocketDetails, SocketError> {
        self.details.as_ref().ok_or(SocketError::NotInitialized)
    }

    /// Release the transport endpoint.
    pub fn disconnect(&mut self) {
        self.socket = None;
        self.details = None;
        self.options = None;
    }
}

/// Outcome of a reply callback: either a message to send back, or a
/// description of what went wrong (turned into a [`crate::message::Failure`]
/// reply rather than propagated, per §7).
pub type CallbackResult = Result<AnyMessage, String>;

/// A `Send + Sync` callback invoked once per request: `(type_name, bytes) -> Message`.
pub trait ReplyCallback: Fn(&str, &[u8]) -> CallbackResult + Send + Sync {}
impl<T: Fn(&str, &[u8]) -> CallbackResult + Send + Sync> ReplyCallback for T {}

/// The reply (server) half of req/rep.
pub struct Reply {
    context: Context,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
    keep_running: Arc<AtomicBool>,
}

impl Reply {
    /// A not-yet-initialized reply socket.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            socket: None,
            details: None,
            keep_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind per `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        if self.is_initialized() {
            return Err(SocketError::AlreadyInitialized);
        }
        let (socket, address) = open_and_configure(&self.context, SocketKind::Reply, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::Reply,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        debug!("reply socket initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// Run the receive/dispatch/reply loop until [`Reply::stop`] is
    /// called. A callback panic is not caught (callbacks must not panic,
    /// per §9); a callback `Err` is turned into a `Failure` reply.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized, or
    /// propagates a transport error that is not a plain timeout.
    pub async fn start(&mut self, callback: impl ReplyCallback) -> Result<(), SocketError> {
        self.keep_running.store(true, Ordering::SeqCst);
        while self.keep_running.load(Ordering::SeqCst) {
            let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
            let Some(frames) = recv_with_timeout(socket, REPLY_POLL_MS).await? else {
                continue;
            };
            let type_name = frames.first().map(|f| String::from_utf8_lossy(f).into_owned()).unwrap_or_default();
            let payload = frames.get(1).cloned().unwrap_or_default();

            let reply = match callback(&type_name, &payload) {
                Ok(message) => message,
                Err(details) => {
                    warn!("reply callback failed: {details}");
                    AnyMessage::Failure(crate::message::Failure { details })
                }
            };
            let reply_bytes = reply.to_wire()?;
            let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
            socket
                .send_multipart(&[reply.type_name().as_bytes().to_vec(), reply_bytes])
                .await?;
        }
        Ok(())
    }

    /// Stop the receive loop after its current iteration.
    pub fn stop(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }

    /// The bound address and effective security parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&SocketDetails, SocketError> {
        self.details.as_ref().ok_or(SocketError::NotInitialized)
    }

    /// Release the transport endpoint.
    pub fn disconnect(&mut self) {
        self.stop();
        self.socket = None;
        self.details = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CommandRequest, CommandResponse, Message};
    use crate::socket::ConnectOrBind;
    use crate::zap::Role;

    #[tokio::test]
    async fn request_reply_round_trips_an_echoed_command() {
        let context = Context::new();
        let address = "inproc://reqrep-echo-test";

        let mut reply = Reply::new(context.clone());
        reply
            .initialize(SocketOptions::new(address, ConnectOrBind::Bind, Role::Server))
            .unwrap();

        let server = tokio::spawn(async move {
            reply
                .start(|_type_name, payload| {
                    let request = CommandRequest::from_wire(payload)
                        .map_err(|e| e.to_string())?;
                    Ok(AnyMessage::CommandResponse(CommandResponse {
                        response: request.command,
                        return_code: crate::command::CommandReturnCode::Success,
                    }))
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut request = Request::new(context, MessageRegistry::with_builtin_types());
        request
            .initialize(
                SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                    .with_timeouts(-1, 2000),
            )
            .unwrap();

        let reply_message = request
            .request(&CommandRequest {
                command: "ping".to_string(),
            })
            .await
            .unwrap();

        match reply_message {
            AnyMessage::CommandResponse(response) => assert_eq!(response.response, "ping"),
            other => panic!("unexpected reply: {other:?}"),
        }

        server.abort();
    }

    #[tokio::test]
    async fn request_times_out_and_rebuilds_when_no_reply_arrives() {
        let context = Context::new();
        let mut request = Request::new(context, MessageRegistry::with_builtin_types());
        request
            .initialize(
                SocketOptions::new(
                    "inproc://reqrep-timeout-test",
                    ConnectOrBind::Bind,
                    Role::Server,
                )
                .with_timeouts(-1, 50),
            )
            .unwrap();

        let result = request
            .request(&CommandRequest {
                command: "unanswered".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SocketError::Timeout)));
        assert!(request.is_initialized());
    }
}
