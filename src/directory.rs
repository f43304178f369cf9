//! Connection-information directory (§4.6): the "operator" — a well-known
//! router service that answers `AvailableConnectionsRequest` with the
//! catalogue of every registered broadcast/service endpoint.
//!
//! Grounded in `examples/jwilger-caxton`'s registry-over-`DashMap` pattern
//! plus the reqrep/router primitives in `crate::socket`; the stale-entry
//! eviction policy mirrors the heartbeat-timeout wording of SPEC_FULL §4.6.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::message::{
    AnyMessage, AvailableConnectionsRequest, AvailableConnectionsResponse, Message,
    RegistrationRequest, RegistrationResponse, ReturnCode,
};
use crate::socket::reqrep::{Reply, Request};
use crate::socket::{SocketError, SocketOptions};
use crate::transport::Context;

/// Directory-subsystem errors.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// A socket-level failure while serving or querying the directory.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// A name was already registered under a different connection type.
    #[error("connection name already registered: {0}")]
    DuplicateName(String),

    /// The directory replied with a `Failure` message.
    #[error("directory request failed: {0}")]
    Failed(String),

    /// The directory returned an unexpected reply type.
    #[error("unexpected reply from directory")]
    UnexpectedReply,
}

/// `(name, connection_type, socket_details, security_level, user_privileges)` —
/// one row of the directory's catalogue (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionDetails {
    /// Globally unique (within one operator) advertising name.
    pub name: String,
    /// Whether this entry is a broadcast, a service, or neither.
    pub connection_type: crate::message::ConnectionType,
    /// Address, socket type, bind/connect policy.
    pub address: String,
    /// Effective ZAP security tier.
    pub security_level: crate::zap::SecurityLevel,
    /// Minimum privilege required to use this endpoint.
    pub user_privileges: crate::credentials::Privilege,
}

struct CatalogueEntry {
    details: ConnectionDetails,
    last_seen: Instant,
}

/// The operator's in-memory catalogue, keyed by connection name.
struct Catalogue {
    entries: DashMap<String, CatalogueEntry>,
    stale_threshold: Duration,
}

impl Catalogue {
    fn new(stale_threshold: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            stale_threshold,
        }
    }

    fn register(&self, details: ConnectionDetails) {
        self.entries.insert(
            details.name.clone(),
            CatalogueEntry {
                details,
                last_seen: Instant::now(),
            },
        );
    }

    fn deregister(&self, name: &str) {
        self.entries.remove(name);
    }

    fn evict_stale(&self) {
        let threshold = self.stale_threshold;
        self.entries.retain(|name, entry| {
            let fresh = entry.last_seen.elapsed() < threshold;
            if !fresh {
                warn!(name, "evicting stale directory entry");
            }
            fresh
        });
    }

    fn snapshot(&self) -> Vec<ConnectionDetails> {
        self.entries
            .iter()
            .map(|entry| entry.details.clone())
            .collect()
    }
}

/// The operator: a `Reply` socket bound at the well-known directory address,
/// answering `RegistrationRequest` and `AvailableConnectionsRequest`.
pub struct Operator {
    reply: Reply,
    catalogue: Arc<Catalogue>,
}

impl Operator {
    /// A not-yet-initialized operator evicting entries unseen for longer
    /// than `stale_threshold`.
    pub fn new(context: Context, stale_threshold: Duration) -> Self {
        Self {
            reply: Reply::new(context),
            catalogue: Arc::new(Catalogue::new(stale_threshold)),
        }
    }

    /// Bind the directory's reply socket.
    ///
    /// # Errors
    ///
    /// Propagates [`SocketError`] from the underlying `Reply::initialize`.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), DirectoryError> {
        self.reply.initialize(options)?;
        Ok(())
    }

    /// Run the directory's serve loop until [`Operator::stop`] is called.
    /// Every iteration also evicts entries whose last registration is older
    /// than `stale_threshold` (§4.6).
    ///
    /// # Errors
    ///
    /// Propagates [`SocketError`] from the underlying reply loop.
    pub async fn start(&mut self) -> Result<(), DirectoryError> {
        let catalogue = Arc::clone(&self.catalogue);
        info!("directory operator starting");
        self.reply
            .start(move |type_name, payload| {
                catalogue.evict_stale();
                match type_name {
                    t if t == RegistrationRequest::TYPE_NAME => {
                        let request = RegistrationRequest::from_wire(payload)
                            .map_err(|e| e.to_string())?;
                        debug!(name = %request.connection_details.name, "registering connection");
                        catalogue.register(request.connection_details);
                        Ok(AnyMessage::RegistrationResponse(RegistrationResponse {
                            return_code: ReturnCode::Success,
                        }))
                    }
                    t if t == AvailableConnectionsRequest::TYPE_NAME => {
                        Ok(AnyMessage::AvailableConnectionsResponse(
                            AvailableConnectionsResponse {
                                details: catalogue.snapshot(),
                                code: ReturnCode::Success,
                            },
                        ))
                    }
                    other => Err(format!("unsupported request type: {other}")),
                }
            })
            .await?;
        Ok(())
    }

    /// Remove `name` from the catalogue (clean shutdown path).
    pub fn deregister(&self, name: &str) {
        self.catalogue.deregister(name);
    }

    /// Stop the serve loop after its current iteration.
    pub fn stop(&mut self) {
        self.reply.stop();
    }
}

/// Client-side directory access: performs one request with a default 5 s
/// timeout and offers convenience selectors over the returned catalogue.
pub struct Requestor {
    request: Request,
}

const DEFAULT_TIMEOUT_MS: i32 = 5_000;

impl Requestor {
    /// A not-yet-connected requestor.
    pub fn new(context: Context) -> Self {
        Self {
            request: Request::new(context, crate::message::MessageRegistry::with_builtin_types()),
        }
    }

    /// Connect to the operator at `address`, using the default 5-second
    /// request timeout.
    ///
    /// # Errors
    ///
    /// Propagates [`SocketError`] from the underlying `Request::initialize`.
    pub fn initialize(&mut self, address: impl Into<String>) -> Result<(), DirectoryError> {
        self.request.initialize(
            SocketOptions::new(address, crate::socket::ConnectOrBind::Connect, crate::zap::Role::Client)
                .with_timeouts(DEFAULT_TIMEOUT_MS, DEFAULT_TIMEOUT_MS),
        )?;
        Ok(())
    }

    /// Fetch the full connection catalogue; callers filter by name/type.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Failed`] if the operator replied with a
    /// `Failure`, or [`DirectoryError::UnexpectedReply`] for any other
    /// unexpected reply shape.
    pub async fn available_connections(&mut self) -> Result<Vec<ConnectionDetails>, DirectoryError> {
        match self
            .request
            .request(&AvailableConnectionsRequest::default())
            .await?
        {
            AnyMessage::AvailableConnectionsResponse(response) => Ok(response.details),
            AnyMessage::Failure(failure) => Err(DirectoryError::Failed(failure.details)),
            _ => Err(DirectoryError::UnexpectedReply),
        }
    }

    /// The broadcast frontend (xsub-facing) address for `name`, if
    /// registered and of the right connection type.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Requestor::available_connections`] returns.
    pub async fn proxy_broadcast_frontend(&mut self, name: &str) -> Result<Option<String>, DirectoryError> {
        self.select(name, crate::message::ConnectionType::Broadcast).await
    }

    /// The broadcast backend (xpub-facing) address for `name`. Broadcasts
    /// register one `ConnectionDetails` row; frontend and backend share the
    /// registered name and differ only by which socket a caller is after —
    /// selection here returns the same row as the frontend lookup.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Requestor::available_connections`] returns.
    pub async fn proxy_broadcast_backend(&mut self, name: &str) -> Result<Option<String>, DirectoryError> {
        self.select(name, crate::message::ConnectionType::Broadcast).await
    }

    /// The service frontend (router-facing) address for `name`.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Requestor::available_connections`] returns.
    pub async fn proxy_service_frontend(&mut self, name: &str) -> Result<Option<String>, DirectoryError> {
        self.select(name, crate::message::ConnectionType::Service).await
    }

    /// The service backend (dealer-facing) address for `name`.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Requestor::available_connections`] returns.
    pub async fn proxy_service_backend(&mut self, name: &str) -> Result<Option<String>, DirectoryError> {
        self.select(name, crate::message::ConnectionType::Service).await
    }

    async fn select(
        &mut self,
        name: &str,
        connection_type: crate::message::ConnectionType,
    ) -> Result<Option<String>, DirectoryError> {
        let details = self.available_connections().await?;
        Ok(details
            .into_iter()
            .find(|d| d.name == name && d.connection_type == connection_type)
            .map(|d| d.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Privilege;
    use crate::socket::ConnectOrBind;
    use crate::zap::{Role, SecurityLevel};

    fn sample_details(name: &str) -> ConnectionDetails {
        ConnectionDetails {
            name: name.to_string(),
            connection_type: crate::message::ConnectionType::Broadcast,
            address: "tcp://127.0.0.1:9000".to_string(),
            security_level: SecurityLevel::Grasslands,
            user_privileges: Privilege::ReadOnly,
        }
    }

    #[test]
    fn catalogue_evicts_entries_older_than_threshold() {
        let catalogue = Catalogue::new(Duration::from_millis(10));
        catalogue.register(sample_details("picker"));
        assert_eq!(catalogue.snapshot().len(), 1);
        std::thread::sleep(Duration::from_millis(30));
        catalogue.evict_stale();
        assert!(catalogue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn registration_then_lookup_round_trips_through_the_operator() {
        let context = Context::new();
        let address = "inproc://directory-test";

        let mut operator = Operator::new(context.clone(), Duration::from_secs(60));
        operator
            .initialize(SocketOptions::new(address, ConnectOrBind::Bind, Role::Server))
            .unwrap();

        let server = tokio::spawn(async move { operator.start().await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut registrar = Request::new(context.clone(), crate::message::MessageRegistry::with_builtin_types());
        registrar
            .initialize(SocketOptions::new(address, ConnectOrBind::Connect, Role::Client))
            .unwrap();
        let reply = registrar
            .request(&RegistrationRequest {
                connection_details: sample_details("waveRing"),
            })
            .await
            .unwrap();
        assert!(matches!(reply, AnyMessage::RegistrationResponse(_)));

        let mut requestor = Requestor::new(context);
        requestor.initialize(address).unwrap();
        let connections = requestor.available_connections().await.unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].name, "waveRing");

        server.abort();
    }
}
