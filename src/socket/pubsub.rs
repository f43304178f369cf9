//! Publisher/Subscriber primitives (§4.2): topic-filtered, fire-and-forget
//! broadcast. The topic frame is, by convention, the message type name, so
//! subscribers filter by type rather than an application-chosen key.

use tracing::{debug, warn};

use crate::message::{AnyMessage, Message, MessageRegistry};
use crate::transport::{AsyncSocket, Context};

use super::{
    open_and_configure, recv_with_timeout, send_with_timeout, SocketDetails, SocketError,
    SocketKind, SocketOptions,
};

/// The publishing half of a broadcast.
pub struct Publisher {
    context: Context,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
    send_timeout_ms: i32,
}

impl Publisher {
    /// A not-yet-initialized publisher on the given context.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            socket: None,
            details: None,
            send_timeout_ms: -1,
        }
    }

    /// Bind or connect per `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        if self.is_initialized() {
            return Err(SocketError::AlreadyInitialized);
        }
        let (socket, address) = open_and_configure(&self.context, SocketKind::Publisher, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::Publisher,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.send_timeout_ms = options.send_timeout_ms;
        self.socket = Some(AsyncSocket::new(socket)?);
        debug!("publisher initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// Send one message: `[type_name, type_name, payload]`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized, or
    /// [`SocketError::SendWouldBlock`] if the outbound queue stayed full
    /// past `send_timeout`.
    pub async fn send<M: Message>(&mut self, message: &M) -> Result<(), SocketError> {
        let timeout_ms = self.send_timeout_ms;
        let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
        let payload = message.to_wire()?;
        let topic = M::TYPE_NAME.as_bytes().to_vec();
        send_with_timeout(socket, &[topic.clone(), topic, payload], timeout_ms).await
    }

    /// The bound/connected address and effective security parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&SocketDetails, SocketError> {
        self.details.as_ref().ok_or(SocketError::NotInitialized)
    }

    /// Release the transport endpoint. Safe to call multiple times or
    /// after partial initialization.
    pub fn disconnect(&mut self) {
        self.socket = None;
        self.details = None;
    }
}

/// The subscribing half of a broadcast.
pub struct Subscriber {
    context: Context,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
    registry: MessageRegistry,
}

impl Subscriber {
    /// A not-yet-initialized subscriber using the given message registry
    /// to resolve wire type names to concrete types.
    pub fn new(context: Context, registry: MessageRegistry) -> Self {
        Self {
            context,
            socket: None,
            details: None,
            registry,
        }
    }

    /// Bind or connect per `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), SocketError> {
        if self.is_initialized() {
            return Err(SocketError::AlreadyInitialized);
        }
        let (socket, address) =
            open_and_configure(&self.context, SocketKind::Subscriber, &options)?;
        self.details = Some(SocketDetails {
            address,
            socket_type: SocketKind::Subscriber,
            connect_or_bind: options.connect_or_bind,
            security_level: options.zap.security_level(),
            user_privileges: options.user_privileges,
        });
        self.socket = Some(AsyncSocket::new(socket)?);
        debug!("subscriber initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// Subscribe to messages whose topic frame is a prefix match on
    /// `type_name` — in practice, an exact match, since publishers use the
    /// full type name as the topic.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn add_subscription(&mut self, type_name: &str) -> Result<(), SocketError> {
        let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
        socket.socket_mut().set_subscribe(type_name.as_bytes())?;
        Ok(())
    }

    /// Remove a previously added subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized.
    pub fn remove_subscription(&mut self, type_name: &str) -> Result<(), SocketError> {
        let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
        socket.socket_mut().set_unsubscribe(type_name.as_bytes())?;
        Ok(())
    }

    /// Receive one message, waiting up to `timeout_ms` (`< 0` waits
    /// forever, `0` polls). Returns `None` on timeout. An unknown wire
    /// type is logged and dropped (the call keeps waiting out the
    /// remainder of the deadline is NOT implemented here — callers that
    /// need that should loop; a single drop-and-return-None matches the
    /// simplest reading of §4.2).
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized, or
    /// a transport error.
    pub async fn receive(&mut self, timeout_ms: i32) -> Result<Option<AnyMessage>, SocketError> {
        let socket = self.socket.as_mut().ok_or(SocketError::NotInitialized)?;
        let Some(frames) = recv_with_timeout(socket, timeout_ms).await? else {
            return Ok(None);
        };
        let Some(payload) = frames.get(2) else {
            warn!("malformed pub/sub frame: expected 3 parts, got {}", frames.len());
            return Ok(None);
        };
        match self.registry.get(payload) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!("dropping message with unknown or malformed type: {e}");
                Ok(None)
            }
        }
    }

    /// The bound/connected address and effective security parameters.
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Heartbeat, HeartbeatStatus};
    use crate::socket::ConnectOrBind;
    use crate::zap::Role;

    #[tokio::test]
    async fn publisher_and_subscriber_exchange_heartbeats_in_order() {
        let context = Context::new();
        let address = "inproc://pubsub-order-test";

        let mut publisher = Publisher::new(context.clone());
        publisher
            .initialize(SocketOptions::new(address, ConnectOrBind::Bind, Role::Server))
            .unwrap();

        let mut subscriber = Subscriber::new(context, MessageRegistry::with_builtin_types());
        subscriber
            .initialize(SocketOptions::new(address, ConnectOrBind::Connect, Role::Client))
            .unwrap();
        subscriber.add_subscription(Heartbeat::TYPE_NAME).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        for host in ["h1", "h2", "h3"] {
            publisher
                .send(&Heartbeat {
                    status: HeartbeatStatus::Alive,
                    host: host.to_string(),
                    issued_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }

        for expected_host in ["h1", "h2", "h3"] {
            let message = subscriber.receive(500).await.unwrap().unwrap();
            match message {
                AnyMessage::Heartbeat(hb) => assert_eq!(hb.host, expected_host),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn receive_times_out_with_none_when_no_message_arrives() {
        let context = Context::new();
        let mut subscriber = Subscriber::new(context, MessageRegistry::with_builtin_types());
        subscriber
            .initialize(SocketOptions::new(
                "inproc://pubsub-timeout-test",
                ConnectOrBind::Bind,
                Role::Server,
            ))
            .unwrap();

        let result = subscriber.receive(50).await.unwrap();
        assert!(result.is_none());
    }
}
