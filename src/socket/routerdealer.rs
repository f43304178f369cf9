//! Router/Dealer primitives (§4.2): many-to-one request routing with
//! preserved per-client identity framing.
//!
//! Router frames are `[client_identity, empty_delimiter, type_name,
//! payload]`; the identity and delimiter are preserved unchanged when
//! writing the reply. Dealer strips/adds the empty delimiter and
//! dispatches identically to [`super::reqrep::Reply`]'s callback contract.

use tracing::{debug, warn};

use crate::message::{AnyMessage, Message, MessageRegistry};
use crate::socket::reqrep::{CallbackResult, ReplyCallback};
use crate::transport::{AsyncSocket, Context};

use super::{
    open_and_configure, recv_with_timeout, send_with_timeout, SocketDetails, SocketError,
    SocketKind, SocketOptions,
};

const ROUTER_POLL_MS: i32 = 100;

/// The router (server) half: preserves client identity across the
/// request/reply round trip.
pub struct Router {
    context: Context,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
    keep_running: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Router {
    /// A not-yet-initialized router.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            socket: None,
            details: None,
            keep_running: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
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
        let (socket, address) = open_and_configure(&self.context, SocketKind::Router, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::Router,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        debug!("router initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// Run the receive/dispatch/reply loop until [`Router::stop`] is
    /// called, preserving `client_identity`/`empty_delimiter` framing.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized, or
    /// a transport error.
    pub async fn start(&mut self, callback: impl ReplyCallback) -> Result<(), SocketError> {
        self.keep_running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        while self.keep_running.load(std::sync::atomic::Ordering::SeqCst) {
            let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
            let Some(frames) = recv_with_timeout(socket, ROUTER_POLL_MS).await? else {
                continue;
            };
            let [identity, _delimiter, type_name, payload] = frames.as_slice() else {
                warn!("malformed router frame: expected 4 parts, got {}", frames.len());
                continue;
            };
            let type_name = String::from_utf8_lossy(type_name).into_owned();
            let reply: CallbackResult = callback(&type_name, payload);
            let reply = match reply {
                Ok(message) => message,
                Err(details) => {
                    warn!("router callback failed: {details}");
                    AnyMessage::Failure(crate::message::Failure { details })
                }
            };
            let reply_bytes = reply.to_wire()?;
            let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
            socket
                .send_multipart(&[
                    identity.clone(),
                    Vec::new(),
                    reply.type_name().as_bytes().to_vec(),
                    reply_bytes,
                ])
                .await?;
        }
        Ok(())
    }

    /// Stop the receive loop after its current iteration.
    pub fn stop(&mut self) {
        self.keep_running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// The bound address and effective security parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&SocketDetails, SocketError> {
        self.details.as_ref().ok_or(SocketError::NotInitialized)
    }

    /// Raw transport access for the proxy engine's shoveling loop.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub(crate) fn raw_socket(&mut self) -> Result<&mut AsyncSocket, SocketError> {
        self.socket.as_mut().ok_or(SocketError::NotInitialized)
    }

    /// Release the transport endpoint.
    pub fn disconnect(&mut self) {
        self.stop();
        self.socket = None;
        self.details = None;
    }
}

/// The dealer (client) half: strips/adds the empty delimiter transparently.
pub struct Dealer {
    context: Context,
    options: Option<SocketOptions>,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
    registry: MessageRegistry,
}

impl Dealer {
    /// A not-yet-initialized dealer, decoding replies via `registry`.
    pub fn new(context: Context, registry: MessageRegistry) -> Self {
        Self {
            context,
            options: None,
            socket: None,
            details: None,
            registry,
        }
    }

    /// Connect per `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        if self.is_initialized() {
            return Err(SocketError::AlreadyInitialized);
        }
        let (socket, address) = open_and_configure(&self.context, SocketKind::Dealer, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::Dealer,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        self.options = Some(options);
        debug!("dealer initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// Send `message` (with the empty delimiter the dealer pattern
    /// requires) and await the reply, bounded by `recv_timeout_ms`.
    /// Unlike [`super::reqrep::Request`], a timed-out dealer is not
    /// rebuilt: the identity-preserving pattern has no strict-alternation
    /// constraint to resynchronize (§9).
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized, or
    /// [`SocketError::Timeout`] if the reply did not arrive in time.
    pub async fn request<M: Message>(&mut self, message: &M) -> Result<AnyMessage, SocketError> {
        let options = self
            .options
            .clone()
            .ok_or(SocketError::NotInitialized)?;
        let payload = message.to_wire()?;
        let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
        send_with_timeout(
            socket,
            &[Vec::new(), M::TYPE_NAME.as_bytes().to_vec(), payload],
            options.send_timeout_ms,
        )
        .await?;
        match recv_with_timeout(socket, options.recv_timeout_ms).await? {
            Some(frames) => {
                let reply_payload = frames
                    .get(2)
                    .ok_or_else(|| SocketError::InvalidOptions("malformed dealer reply frame".to_string()))?;
                Ok(self.registry.get(reply_payload)?)
            }
            None => Err(SocketError::Timeout),
        }
    }

    /// The connected address and effective security parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&SocketDetails, SocketError> {
        self.details.as_ref().ok_or(SocketError::NotInitialized)
    }

    /// Raw transport access for the proxy engine's shoveling loop.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub(crate) fn raw_socket(&mut self) -> Result<&mut AsyncSocket, SocketError> {
        self.socket.as_mut().ok_or(SocketError::NotInitialized)
    }

    /// Release the transport endpoint.
    pub fn disconnect(&mut self) {
        self.socket = None;
        self.details = None;
        self.options = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AvailableModulesRequest, AvailableModulesResponse};
    use crate::socket::ConnectOrBind;
    use crate::zap::Role;

    #[tokio::test]
    async fn router_preserves_identity_when_replying_to_dealer() {
        let context = Context::new();
        let address = "inproc://routerdealer-test";

        let mut router = Router::new(context.clone());
        router
            .initialize(SocketOptions::new(address, ConnectOrBind::Bind, Role::Server))
            .unwrap();

        let server = tokio::spawn(async move {
            router
                .start(|_type_name, _payload| {
                    Ok(AnyMessage::AvailableModulesResponse(AvailableModulesResponse {
                        modules: Vec::new(),
                    }))
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut dealer = Dealer::new(context, MessageRegistry::with_builtin_types());
        dealer
            .initialize(
                SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                    .with_timeouts(-1, 2000),
            )
            .unwrap();

        let reply = dealer.request(&AvailableModulesRequest::default()).await.unwrap();
        assert!(matches!(reply, AnyMessage::AvailableModulesResponse(_)));

        server.abort();
    }
}
