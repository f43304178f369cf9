//! Broadcast and service composites (§4.5): a [`crate::proxy::Proxy`] paired
//! with a [`crate::auth::AuthenticationService`], started and stopped as one
//! unit.
//!
//! Grounded in `crate::proxy::Proxy`'s worker-task lifecycle, extended with
//! the start-auth-before-proxy ordering decided in SPEC_FULL §9: the
//! authentication service's readiness oneshot is awaited with a generous
//! timeout, degrading to the original design's flat 5 ms sleep (plus a
//! logged warning) if the signal never arrives.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::auth::{AuthError, Authenticator, AuthenticationService};
use crate::proxy::{Proxy, ProxyError, ProxyOptions, ProxySocketDetails};
use crate::socket::SocketKind;
use crate::transport::Context;

/// Composite-level errors.
#[derive(Error, Debug)]
pub enum CompositeError {
    /// The wrapped proxy failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// The wrapped authentication service failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// `initialize` was called twice.
    #[error("composite already initialized")]
    AlreadyInitialized,

    /// An operation requiring initialization was attempted first.
    #[error("composite not initialized")]
    NotInitialized,
}

/// How long to wait for the authentication service's readiness signal
/// before degrading to the fixed-sleep fallback (§9).
const AUTH_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// The original design's fallback delay when the readiness signal is never
/// observed (e.g. the channel was dropped without firing).
const AUTH_READY_FALLBACK_SLEEP: Duration = Duration::from_millis(5);

async fn await_auth_ready(ready_rx: tokio::sync::oneshot::Receiver<()>) {
    match tokio::time::timeout(AUTH_READY_TIMEOUT, ready_rx).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) | Err(_) => {
            warn!(
                "authentication service readiness signal not observed within {:?}, falling back to fixed delay",
                AUTH_READY_TIMEOUT
            );
            tokio::time::sleep(AUTH_READY_FALLBACK_SLEEP).await;
        }
    }
}

/// Shared machinery behind [`Broadcast`] and [`Service`]: a named proxy plus
/// its authentication plane, started/stopped as one unit.
struct ProxyComposite {
    name: String,
    context: Context,
    proxy: Proxy,
    auth: AuthenticationService,
    authenticator: Arc<dyn Authenticator>,
    initialized: bool,
}

impl ProxyComposite {
    fn new(context: Context, name: impl Into<String>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            name: name.into(),
            context: context.clone(),
            proxy: Proxy::new(context.clone()),
            auth: AuthenticationService::new(context),
            authenticator,
            initialized: false,
        }
    }

    fn initialize(&mut self, options: ProxyOptions) -> Result<(), CompositeError> {
        if self.initialized {
            return Err(CompositeError::AlreadyInitialized);
        }
        self.proxy.initialize(options)?;
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_running(&self) -> bool {
        self.proxy.is_running() || self.auth.is_running()
    }

    async fn start(&mut self) -> Result<(), CompositeError> {
        if !self.initialized {
            return Err(CompositeError::NotInitialized);
        }
        let ready_rx = self.auth.start(Arc::clone(&self.authenticator))?;
        await_auth_ready(ready_rx).await;
        self.proxy.start()?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CompositeError> {
        self.proxy.stop().await?;
        self.auth.stop().await;
        Ok(())
    }

    fn socket_details(&self) -> Result<&ProxySocketDetails, CompositeError> {
        Ok(self.proxy.socket_details()?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `(Proxy over XSub/XPub) + AuthenticationService`: a named pub/sub
/// broadcast relay.
pub struct Broadcast(ProxyComposite);

impl Broadcast {
    /// A not-yet-initialized broadcast named `name`, authenticated by
    /// `authenticator`.
    pub fn new(context: Context, name: impl Into<String>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self(ProxyComposite::new(context, name, authenticator))
    }

    /// Open the frontend (subscriber-facing xpub) and backend
    /// (publisher-facing xsub) sockets. `options`'s kinds must already be
    /// `XSubscriber`/`XPublisher`; this is enforced by
    /// [`Proxy::initialize`]'s own validation.
    ///
    /// # Errors
    ///
    /// Propagates [`ProxyError`] (including incompatible socket kinds) or
    /// [`CompositeError::AlreadyInitialized`].
    pub fn initialize(&mut self, options: ProxyOptions) -> Result<(), CompositeError> {
        debug_assert_eq!(options.frontend_kind, SocketKind::XSubscriber);
        debug_assert_eq!(options.backend_kind, SocketKind::XPublisher);
        self.0.initialize(options)
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.0.is_initialized()
    }

    /// Whether the proxy or authentication worker is currently running.
    pub fn is_running(&self) -> bool {
        self.0.is_running()
    }

    /// Start the authentication service, await its readiness, then start
    /// the proxy (§9).
    ///
    /// # Errors
    ///
    /// Propagates [`CompositeError::NotInitialized`] or any underlying
    /// proxy/auth error.
    pub async fn start(&mut self) -> Result<(), CompositeError> {
        self.0.start().await
    }

    /// Stop the proxy, then the authentication service (reverse order).
    ///
    /// # Errors
    ///
    /// Propagates any underlying proxy/auth error.
    pub async fn stop(&mut self) -> Result<(), CompositeError> {
        self.0.stop().await
    }

    /// The frontend/backend socket details.
    ///
    /// # Errors
    ///
    /// Returns [`CompositeError::NotInitialized`] if not yet initialized.
    pub fn get_connection_details(&self) -> Result<&ProxySocketDetails, CompositeError> {
        self.0.socket_details()
    }

    /// The wire advertising name used by the connection-information
    /// directory (§4.6).
    pub fn get_name(&self) -> &str {
        self.0.name()
    }
}

/// `(Proxy over Router/Dealer) + AuthenticationService`: a named req/rep
/// service relay.
pub struct Service(ProxyComposite);

impl Service {
    /// A not-yet-initialized service named `name`, authenticated by
    /// `authenticator`.
    pub fn new(context: Context, name: impl Into<String>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self(ProxyComposite::new(context, name, authenticator))
    }

    /// Open the frontend (client-facing router) and backend
    /// (worker-facing dealer) sockets.
    ///
    /// # Errors
    ///
    /// Propagates [`ProxyError`] (including incompatible socket kinds) or
    /// [`CompositeError::AlreadyInitialized`].
    pub fn initialize(&mut self, options: ProxyOptions) -> Result<(), CompositeError> {
        debug_assert_eq!(options.frontend_kind, SocketKind::Router);
        debug_assert!(matches!(
            options.backend_kind,
            SocketKind::Dealer | SocketKind::Router
        ));
        self.0.initialize(options)
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.0.is_initialized()
    }

    /// Whether the proxy or authentication worker is currently running.
    pub fn is_running(&self) -> bool {
        self.0.is_running()
    }

    /// Start the authentication service, await its readiness, then start
    /// the proxy (§9).
    ///
    /// # Errors
    ///
    /// Propagates [`CompositeError::NotInitialized`] or any underlying
    /// proxy/auth error.
    pub async fn start(&mut self) -> Result<(), CompositeError> {
        self.0.start().await
    }

    /// Stop the proxy, then the authentication service (reverse order).
    ///
    /// # Errors
    ///
    /// Propagates any underlying proxy/auth error.
    pub async fn stop(&mut self) -> Result<(), CompositeError> {
        self.0.stop().await
    }

    /// The frontend/backend socket details.
    ///
    /// # Errors
    ///
    /// Returns [`CompositeError::NotInitialized`] if not yet initialized.
    pub fn get_connection_details(&self) -> Result<&ProxySocketDetails, CompositeError> {
        self.0.socket_details()
    }

    /// The wire advertising name used by the connection-information
    /// directory (§4.6).
    pub fn get_name(&self) -> &str {
        self.0.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Grasslands;
    use crate::message::{Heartbeat, HeartbeatStatus, Message};
    use crate::socket::pubsub::{Publisher, Subscriber};
    use crate::socket::{ConnectOrBind, SocketOptions};
    use crate::zap::Role;

    #[tokio::test]
    async fn broadcast_composite_starts_auth_then_proxy_and_relays_messages() {
        let context = Context::new();
        let frontend_address = "inproc://composite-broadcast-frontend";
        let backend_address = "inproc://composite-broadcast-backend";

        let mut broadcast = Broadcast::new(context.clone(), "weatherFeed", Arc::new(Grasslands));
        broadcast
            .initialize(ProxyOptions {
                frontend_kind: SocketKind::XSubscriber,
                frontend_options: SocketOptions::new(backend_address, ConnectOrBind::Bind, Role::Server),
                backend_kind: SocketKind::XPublisher,
                backend_options: SocketOptions::new(frontend_address, ConnectOrBind::Bind, Role::Server),
            })
            .unwrap();
        broadcast.start().await.unwrap();
        assert!(broadcast.is_running());
        assert_eq!(broadcast.get_name(), "weatherFeed");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut publisher = Publisher::new(context.clone());
        publisher
            .initialize(SocketOptions::new(backend_address, ConnectOrBind::Connect, Role::Client))
            .unwrap();

        let mut subscriber = Subscriber::new(context, crate::message::MessageRegistry::with_builtin_types());
        subscriber
            .initialize(SocketOptions::new(frontend_address, ConnectOrBind::Connect, Role::Client))
            .unwrap();
        subscriber.add_subscription(Heartbeat::TYPE_NAME).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        publisher
            .send(&Heartbeat {
                status: HeartbeatStatus::Alive,
                host: "composite".to_string(),
                issued_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let received = subscriber.receive(1000).await.unwrap().unwrap();
        match received {
            crate::message::AnyMessage::Heartbeat(hb) => assert_eq!(hb.host, "composite"),
            other => panic!("unexpected message: {other:?}"),
        }

        broadcast.stop().await.unwrap();
        assert!(!broadcast.is_running());
    }

    #[tokio::test]
    async fn service_composite_reports_initialization_and_name_before_starting() {
        let context = Context::new();
        let service = Service::new(context, "echoService", Arc::new(Grasslands));
        assert!(!service.is_initialized());
        assert!(!service.is_running());
        assert_eq!(service.get_name(), "echoService");
    }
}
