//! Authentication plane (§4.4): the ZAP handler every proxy runs alongside,
//! dispatching to a pluggable [`Authenticator`].
//!
//! Grounded in `original_source/src/messaging/authentication/{user,zapOptions}.cpp`
//! for the decision inputs (IP, PLAIN credentials, CURVE public key) and in
//! `crate::transport`'s async socket wrapper for the raw ZAP wire exchange —
//! ZAP's own framing (RFC 27) does not fit the typed `Message`/`Reply`
//! abstraction, so the service speaks it directly.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::credentials::{CredentialError, UserStore};
use crate::keys::PublicKey;
use crate::transport::{AsyncSocket, Context, TransportError};

/// The well-known inproc endpoint every ZAP-enabled socket's context must
/// have a handler bound to (ZMQ RFC 27).
pub const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";

/// Authentication-plane errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// A transport-level failure talking to the ZAP endpoint.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A raw zmq call failed (binding the ZAP endpoint).
    #[error(transparent)]
    Zmq(#[from] zmq::Error),

    /// The user store backing a `Permissioned` authenticator failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// `start` was called on an already-running service.
    #[error("authentication service already running")]
    AlreadyRunning,

    /// A malformed ZAP request (wrong frame count, bad version) was received.
    #[error("malformed ZAP request: {0}")]
    MalformedRequest(String),
}

/// One parsed ZAP request (RFC 27): `[version, request_id, domain, address,
/// identity, mechanism, ...credentials]`.
#[derive(Debug, Clone)]
pub struct ZapRequest {
    /// Protocol version, always `"1.0"`.
    pub version: Vec<u8>,
    /// Opaque request id, echoed back verbatim in the reply.
    pub request_id: Vec<u8>,
    /// The `zap_domain` the socket was configured with.
    pub domain: String,
    /// The peer's transport address (e.g. an IP string for TCP).
    pub address: String,
    /// The peer's routing identity, if any.
    pub identity: Vec<u8>,
    /// `"NULL"`, `"PLAIN"`, or `"CURVE"`.
    pub mechanism: String,
    /// Mechanism-specific credential frames: empty for NULL, `[username,
    /// password]` for PLAIN, `[public_key_bytes]` for CURVE.
    pub credentials: Vec<Vec<u8>>,
}

impl ZapRequest {
    fn parse(frames: Vec<Vec<u8>>) -> Result<Self, AuthError> {
        if frames.len() < 6 {
            return Err(AuthError::MalformedRequest(format!(
                "expected at least 6 frames, got {}",
                frames.len()
            )));
        }
        let mut frames = frames.into_iter();
        let version = frames.next().unwrap();
        let request_id = frames.next().unwrap();
        let domain = String::from_utf8_lossy(&frames.next().unwrap()).into_owned();
        let address = String::from_utf8_lossy(&frames.next().unwrap()).into_owned();
        let identity = frames.next().unwrap();
        let mechanism = String::from_utf8_lossy(&frames.next().unwrap()).into_owned();
        let credentials = frames.collect();
        Ok(Self {
            version,
            request_id,
            domain,
            address,
            identity,
            mechanism,
            credentials,
        })
    }

    /// The caller's address parsed as an IP, if it is one (inproc/ipc peers
    /// have no IP and always pass allowlist checks that only apply to TCP).
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

/// The outcome of an authentication decision.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Grant access as `user_id`.
    Allow {
        /// The identity recorded for this connection going forward.
        user_id: String,
    },
    /// Refuse access. `status_code` is one of ZAP's `"300"`/`"400"`/`"500"`.
    Deny {
        /// ZAP status code.
        status_code: &'static str,
        /// Human-readable reason, echoed in the reply and logged.
        status_text: String,
    },
}

impl Decision {
    fn denied(status_text: impl Into<String>) -> Self {
        Self::Deny {
            status_code: "400",
            status_text: status_text.into(),
        }
    }
}

/// Contract for the pluggable decision callback invoked per ZAP request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Decide whether to admit `request`.
    async fn authenticate(&self, request: &ZapRequest) -> Decision;
}

/// Always allows every request, regardless of mechanism or credentials.
pub struct Grasslands;

#[async_trait]
impl Authenticator for Grasslands {
    async fn authenticate(&self, _request: &ZapRequest) -> Decision {
        Decision::Allow {
            user_id: "grasslands".to_string(),
        }
    }
}

/// IP allow/deny lists consulted ahead of any mechanism-specific check, used
/// by strawhouse/woodhouse/stonehouse alike.
#[derive(Debug, Clone, Default)]
pub struct IpPolicy {
    /// If non-empty, only these addresses are admitted.
    pub allow: Vec<IpAddr>,
    /// Always denied, checked before `allow`.
    pub deny: Vec<IpAddr>,
}

impl IpPolicy {
    fn permits(&self, address: Option<IpAddr>) -> bool {
        let Some(address) = address else {
            return true;
        };
        if self.deny.contains(&address) {
            return false;
        }
        self.allow.is_empty() || self.allow.contains(&address)
    }
}

/// Consults a [`UserStore`] for the mechanism in use (§4.4):
/// NULL → IP policy only; PLAIN → IP policy then username/password;
/// CURVE → IP policy then an authorized public key.
pub struct Permissioned {
    user_store: Arc<dyn UserStore>,
    ip_policy: IpPolicy,
}

impl Permissioned {
    /// Build a permissioned authenticator backed by `user_store`, with no IP
    /// restriction beyond what the caller configures via
    /// [`Permissioned::with_ip_policy`].
    pub fn new(user_store: Arc<dyn UserStore>) -> Self {
        Self {
            user_store,
            ip_policy: IpPolicy::default(),
        }
    }

    /// Attach an IP allow/deny list.
    #[must_use]
    pub fn with_ip_policy(mut self, ip_policy: IpPolicy) -> Self {
        self.ip_policy = ip_policy;
        self
    }
}

#[async_trait]
impl Authenticator for Permissioned {
    async fn authenticate(&self, request: &ZapRequest) -> Decision {
        if !self.ip_policy.permits(request.peer_ip()) {
            return Decision::denied(format!("address not permitted: {}", request.address));
        }
        match request.mechanism.as_str() {
            "NULL" => Decision::Allow {
                user_id: request.address.clone(),
            },
            "PLAIN" => {
                let [username, password, ..] = request.credentials.as_slice() else {
                    return Decision::denied("PLAIN mechanism requires username and password");
                };
                let username = String::from_utf8_lossy(username).into_owned();
                let password = String::from_utf8_lossy(password).into_owned();
                match self.user_store.verify_password(&username, &password).await {
                    Ok(true) => Decision::Allow { user_id: username },
                    Ok(false) => Decision::denied("invalid username or password"),
                    Err(e) => {
                        warn!("user store error during PLAIN authentication: {e}");
                        Decision::Deny {
                            status_code: "500",
                            status_text: e.to_string(),
                        }
                    }
                }
            }
            "CURVE" => {
                let [public_key_bytes, ..] = request.credentials.as_slice() else {
                    return Decision::denied("CURVE mechanism requires a public key");
                };
                let Ok(public_key) = PublicKey::from_bytes(public_key_bytes) else {
                    return Decision::denied("malformed CURVE public key");
                };
                match self.user_store.verify_public_key(&public_key).await {
                    Ok(true) => Decision::Allow {
                        user_id: public_key.to_z85(),
                    },
                    Ok(false) => Decision::denied("public key not authorized"),
                    Err(e) => {
                        warn!("user store error during CURVE authentication: {e}");
                        Decision::Deny {
                            status_code: "500",
                            status_text: e.to_string(),
                        }
                    }
                }
            }
            other => Decision::denied(format!("unsupported mechanism: {other}")),
        }
    }
}

fn build_reply(request: &ZapRequest, decision: Decision) -> Vec<Vec<u8>> {
    let (status_code, status_text, user_id) = match decision {
        Decision::Allow { user_id } => ("200".to_string(), "OK".to_string(), user_id),
        Decision::Deny {
            status_code,
            status_text,
        } => (status_code.to_string(), status_text, String::new()),
    };
    vec![
        request.version.clone(),
        request.request_id.clone(),
        status_code.into_bytes(),
        status_text.into_bytes(),
        user_id.into_bytes(),
        Vec::new(),
    ]
}

/// A single-threaded task bound to the transport's well-known ZAP inproc
/// endpoint, dispatching parsed requests to an [`Authenticator`].
pub struct AuthenticationService {
    context: Context,
    worker: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl AuthenticationService {
    /// A not-yet-started service on `context`.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            worker: None,
            stop_tx: None,
        }
    }

    /// Whether a worker is currently bound and serving.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Bind the ZAP endpoint and start dispatching to `authenticator`.
    /// Returns a [`oneshot::Receiver`] signaled once the endpoint is bound
    /// and ready to accept ZAP requests — composites (§4.5, §9) await this
    /// instead of an arbitrary sleep.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AlreadyRunning`] if called twice, or a zmq error
    /// if the endpoint cannot be bound.
    pub fn start(
        &mut self,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<oneshot::Receiver<()>, AuthError> {
        if self.is_running() {
            return Err(AuthError::AlreadyRunning);
        }
        let socket = self.context.socket(zmq::REP)?;
        socket.bind(ZAP_ENDPOINT)?;
        let mut socket = AsyncSocket::new(socket)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let worker = tokio::spawn(async move {
            let _ = ready_tx.send(());
            debug!("ZAP authentication service bound and ready");
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    result = socket.recv_multipart() => {
                        let frames = match result {
                            Ok(frames) => frames,
                            Err(e) => { warn!("ZAP recv failed: {e}"); continue; }
                        };
                        let reply = match ZapRequest::parse(frames) {
                            Ok(request) => {
                                let decision = authenticator.authenticate(&request).await;
                                build_reply(&request, decision)
                            }
                            Err(e) => {
                                warn!("malformed ZAP request: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = socket.send_multipart(&reply).await {
                            warn!("ZAP send failed, peer likely gone: {e}");
                        }
                    }
                }
            }
        });

        self.worker = Some(worker);
        self.stop_tx = Some(stop_tx);
        Ok(ready_rx)
    }

    /// Stop the service and join its worker.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grasslands_allows_any_request() {
        let request = ZapRequest {
            version: b"1.0".to_vec(),
            request_id: b"1".to_vec(),
            domain: "global".to_string(),
            address: "127.0.0.1".to_string(),
            identity: Vec::new(),
            mechanism: "NULL".to_string(),
            credentials: Vec::new(),
        };
        assert!(matches!(
            Grasslands.authenticate(&request).await,
            Decision::Allow { .. }
        ));
    }

    #[test]
    fn ip_policy_denies_addresses_not_on_the_allow_list() {
        let policy = IpPolicy {
            allow: vec!["10.0.0.1".parse().unwrap()],
            deny: Vec::new(),
        };
        assert!(policy.permits(Some("10.0.0.1".parse().unwrap())));
        assert!(!policy.permits(Some("10.0.0.2".parse().unwrap())));
    }

    #[test]
    fn ip_policy_deny_list_takes_precedence() {
        let policy = IpPolicy {
            allow: vec!["10.0.0.1".parse().unwrap()],
            deny: vec!["10.0.0.1".parse().unwrap()],
        };
        assert!(!policy.permits(Some("10.0.0.1".parse().unwrap())));
    }

    #[test]
    fn zap_request_parse_rejects_too_few_frames() {
        let frames = vec![b"1.0".to_vec(), b"1".to_vec()];
        assert!(matches!(
            ZapRequest::parse(frames),
            Err(AuthError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn plain_mechanism_allows_correct_credentials_and_denies_wrong_ones() {
        use crate::credentials::{Privilege, SqliteUserStore};
        use crate::storage::{DatabaseConfig, DatabaseConnection, DatabasePath};

        let path = DatabasePath::new(":memory:").unwrap();
        let config = DatabaseConfig::for_testing(path);
        let conn = DatabaseConnection::initialize(config).await.unwrap();
        let store = SqliteUserStore::new(conn.pool().clone());
        store
            .add_plain_user("alice", None, "correct", Privilege::ReadWrite)
            .await
            .unwrap();

        let authenticator = Permissioned::new(Arc::new(store));
        let request = ZapRequest {
            version: b"1.0".to_vec(),
            request_id: b"1".to_vec(),
            domain: "global".to_string(),
            address: "".to_string(),
            identity: Vec::new(),
            mechanism: "PLAIN".to_string(),
            credentials: vec![b"alice".to_vec(), b"correct".to_vec()],
        };
        assert!(matches!(
            authenticator.authenticate(&request).await,
            Decision::Allow { .. }
        ));

        let wrong_request = ZapRequest {
            credentials: vec![b"alice".to_vec(), b"wrong".to_vec()],
            ..request
        };
        assert!(matches!(
            authenticator.authenticate(&wrong_request).await,
            Decision::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn service_signals_ready_once_bound() {
        let context = Context::new();
        let mut service = AuthenticationService::new(context);
        let ready = service.start(Arc::new(Grasslands)).unwrap();
        ready.await.unwrap();
        assert!(service.is_running());
        service.stop().await;
        assert!(!service.is_running());
    }
}
