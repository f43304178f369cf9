//! Proxy engine (§4.3): a bidirectional, non-interpreting frame shoveller
//! between two opposing sockets — the engine every broadcast and service is
//! built from.
//!
//! Grounded in the garage `zmq` wrapper's async recv/send loop
//! (`crate::transport`) plus `examples/jwilger-caxton`'s worker-task/
//! `JoinHandle` lifecycle pattern for owning a spawned background task.

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::socket::routerdealer::{Dealer, Router};
use crate::socket::xpubsub::{XPublisher, XSubscriber};
use crate::socket::{SocketDetails, SocketError, SocketKind, SocketOptions};
use crate::transport::{AsyncSocket, Context};

/// Proxy-engine errors.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// `initialize` was called twice.
    #[error("proxy already initialized")]
    AlreadyInitialized,

    /// An operation requiring initialization was attempted first.
    #[error("proxy not initialized")]
    NotInitialized,

    /// `start` was called on an already-running proxy.
    #[error("proxy already running")]
    AlreadyRunning,

    /// Frontend and backend addresses were identical, or the two socket
    /// kinds do not form a supported pair.
    #[error("invalid proxy options: {0}")]
    InvalidOptions(String),

    /// A socket-level error while opening or shoveling.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// One compatible frontend/backend pair (§4.3).
fn is_compatible_pair(frontend: SocketKind, backend: SocketKind) -> bool {
    matches!(
        (frontend, backend),
        (SocketKind::XSubscriber, SocketKind::XPublisher)
            | (SocketKind::Router, SocketKind::Dealer)
            | (SocketKind::Router, SocketKind::Router)
    )
}

/// Configuration for one [`Proxy`]: which socket kind/options sit on each
/// side.
#[derive(Clone)]
pub struct ProxyOptions {
    /// The frontend (client-facing) socket kind and bind/connect options.
    pub frontend_kind: SocketKind,
    /// Options `Proxy::initialize` uses to open the frontend socket.
    pub frontend_options: SocketOptions,
    /// The backend (publisher/worker-facing) socket kind.
    pub backend_kind: SocketKind,
    /// Options `Proxy::initialize` uses to open the backend socket.
    pub backend_options: SocketOptions,
}

impl ProxyOptions {
    fn validate(&self) -> Result<(), ProxyError> {
        if self.frontend_options.address == self.backend_options.address {
            return Err(ProxyError::InvalidOptions(
                "frontend and backend addresses must be distinct".to_string(),
            ));
        }
        if !is_compatible_pair(self.frontend_kind, self.backend_kind) {
            return Err(ProxyError::InvalidOptions(format!(
                "{:?}/{:?} is not a supported proxy pair",
                self.frontend_kind, self.backend_kind
            )));
        }
        Ok(())
    }
}

/// A socket this proxy can shovel frames through, erasing which concrete
/// primitive it is behind one raw-transport accessor.
enum ProxyEndpoint {
    XSubscriber(XSubscriber),
    XPublisher(XPublisher),
    Router(Router),
    Dealer(Dealer),
}

impl ProxyEndpoint {
    fn open(context: &Context, kind: SocketKind, options: SocketOptions) -> Result<(Self, SocketDetails), ProxyError> {
        let details;
        let endpoint = match kind {
            SocketKind::XSubscriber => {
                let mut s = XSubscriber::new(context.clone());
                s.initialize(options)?;
                details = s.socket_details()?.clone();
                Self::XSubscriber(s)
            }
            SocketKind::XPublisher => {
                let mut s = XPublisher::new(context.clone());
                s.initialize(options)?;
                details = s.socket_details()?.clone();
                Self::XPublisher(s)
            }
            SocketKind::Router => {
                let mut s = Router::new(context.clone());
                s.initialize(options)?;
                details = s.socket_details()?.clone();
                Self::Router(s)
            }
            SocketKind::Dealer => {
                let mut s = Dealer::new(context.clone(), crate::message::MessageRegistry::new());
                s.initialize(options)?;
                details = s.socket_details()?.clone();
                Self::Dealer(s)
            }
            other => {
                return Err(ProxyError::InvalidOptions(format!(
                    "{other:?} is not usable as a proxy endpoint"
                )))
            }
        };
        Ok((endpoint, details))
    }

    fn raw(&mut self) -> Result<&mut AsyncSocket, SocketError> {
        match self {
            Self::XSubscriber(s) => s.raw_socket(),
            Self::XPublisher(s) => s.raw_socket(),
            Self::Router(s) => s.raw_socket(),
            Self::Dealer(s) => s.raw_socket(),
        }
    }
}

/// Reports the `(frontend, backend)` socket details of a running or
/// initialized proxy.
#[derive(Debug, Clone)]
pub struct ProxySocketDetails {
    /// The frontend socket's bound/connected address and security.
    pub frontend: SocketDetails,
    /// The backend socket's bound/connected address and security.
    pub backend: SocketDetails,
}

/// A bidirectional, non-interpreting frame shoveller between two opposing
/// sockets.
pub struct Proxy {
    context: Context,
    frontend: Option<ProxyEndpoint>,
    backend: Option<ProxyEndpoint>,
    details: Option<ProxySocketDetails>,
    worker: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Proxy {
    /// A not-yet-initialized proxy on `context`.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            frontend: None,
            backend: None,
            details: None,
            worker: None,
            stop_tx: None,
        }
    }

    /// Open the frontend/backend sockets per `options`, after validating
    /// address distinctness and socket-kind compatibility.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AlreadyInitialized`] if called twice,
    /// [`ProxyError::InvalidOptions`] if validation fails, or a socket error.
    pub fn initialize(&mut self, options: ProxyOptions) -> Result<(), ProxyError> {
        if self.is_initialized() {
            return Err(ProxyError::AlreadyInitialized);
        }
        options.validate()?;
        let (frontend, frontend_details) =
            ProxyEndpoint::open(&self.context, options.frontend_kind, options.frontend_options)?;
        let (backend, backend_details) =
            ProxyEndpoint::open(&self.context, options.backend_kind, options.backend_options)?;
        self.frontend = Some(frontend);
        self.backend = Some(backend);
        self.details = Some(ProxySocketDetails {
            frontend: frontend_details,
            backend: backend_details,
        });
        debug!("proxy initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.frontend.is_some() && self.backend.is_some()
    }

    /// Whether a shoveling worker is currently running.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the bidirectional shoveling worker. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotInitialized`] if not yet initialized, or
    /// [`ProxyError::AlreadyRunning`] if a worker is already active.
    pub fn start(&mut self) -> Result<(), ProxyError> {
        if !self.is_initialized() {
            return Err(ProxyError::NotInitialized);
        }
        if self.is_running() {
            return Err(ProxyError::AlreadyRunning);
        }
        let mut frontend = self.frontend.take().ok_or(ProxyError::NotInitialized)?;
        let mut backend = self.backend.take().ok_or(ProxyError::NotInitialized)?;
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        debug!("proxy worker stopping");
                        break;
                    }
                    result = async {
                        frontend.raw().expect("frontend socket is open while the worker runs").recv_multipart().await
                    } => {
                        let frames = match result {
                            Ok(frames) => frames,
                            Err(e) => { warn!("proxy frontend recv failed, stopping: {e}"); break; }
                        };
                        let Ok(back_raw) = backend.raw() else { break };
                        if let Err(e) = back_raw.send_multipart(&frames).await {
                            warn!("proxy forward frontend->backend failed: {e}");
                            break;
                        }
                    }
                    result = async {
                        backend.raw().expect("backend socket is open while the worker runs").recv_multipart().await
                    } => {
                        let frames = match result {
                            Ok(frames) => frames,
                            Err(e) => { warn!("proxy backend recv failed, stopping: {e}"); break; }
                        };
                        let Ok(front_raw) = frontend.raw() else { break };
                        if let Err(e) = front_raw.send_multipart(&frames).await {
                            warn!("proxy forward backend->frontend failed: {e}");
                            break;
                        }
                    }
                }
            }
        });

        self.worker = Some(worker);
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Signal the worker to stop and join it. The frontend/backend sockets
    /// are dropped with the worker, closing the transport endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotInitialized`] if `start` was never called.
    pub async fn stop(&mut self) -> Result<(), ProxyError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        Ok(())
    }

    /// The `(frontend, backend)` socket details.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotInitialized`] if not yet initialized.
    pub fn socket_details(&self) -> Result<&ProxySocketDetails, ProxyError> {
        self.details.as_ref().ok_or(ProxyError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Heartbeat, HeartbeatStatus, Message};
    use crate::socket::pubsub::{Publisher, Subscriber};
    use crate::socket::ConnectOrBind;
    use crate::zap::Role;

    #[test]
    fn rejects_identical_frontend_and_backend_addresses() {
        let options = ProxyOptions {
            frontend_kind: SocketKind::XSubscriber,
            frontend_options: SocketOptions::new("tcp://*:0", ConnectOrBind::Bind, Role::Server),
            backend_kind: SocketKind::XPublisher,
            backend_options: SocketOptions::new("tcp://*:0", ConnectOrBind::Bind, Role::Server),
        };
        assert!(matches!(
            options.validate(),
            Err(ProxyError::InvalidOptions(_))
        ));
    }

    #[test]
    fn rejects_incompatible_socket_kind_pair() {
        let options = ProxyOptions {
            frontend_kind: SocketKind::Publisher,
            frontend_options: SocketOptions::new("inproc://proxy-bad-a", ConnectOrBind::Bind, Role::Server),
            backend_kind: SocketKind::Subscriber,
            backend_options: SocketOptions::new("inproc://proxy-bad-b", ConnectOrBind::Bind, Role::Server),
        };
        assert!(matches!(
            options.validate(),
            Err(ProxyError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_proxy_forwards_publisher_frames_to_subscriber() {
        let context = Context::new();
        let frontend_address = "inproc://proxy-broadcast-frontend";
        let backend_address = "inproc://proxy-broadcast-backend";

        let mut proxy = Proxy::new(context.clone());
        proxy
            .initialize(ProxyOptions {
                frontend_kind: SocketKind::XSubscriber,
                frontend_options: SocketOptions::new(backend_address, ConnectOrBind::Bind, Role::Server),
                backend_kind: SocketKind::XPublisher,
                backend_options: SocketOptions::new(frontend_address, ConnectOrBind::Bind, Role::Server),
            })
            .unwrap();
        proxy.start().unwrap();
        assert!(proxy.is_running());

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
                host: "proxied".to_string(),
                issued_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let received = subscriber.receive(1000).await.unwrap().unwrap();
        match received {
            crate::message::AnyMessage::Heartbeat(hb) => assert_eq!(hb.host, "proxied"),
            other => panic!("unexpected message: {other:?}"),
        }

        proxy.stop().await.unwrap();
        assert!(!proxy.is_running());
    }
}
