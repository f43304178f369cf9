//! Counter service (§4.8): a named service wrapping a persistent
//! per-item auto-incrementing counter.
//!
//! Grounded directly in `originating proxyServices/incrementer/counter`
//! (per SPEC_FULL §4.8) for the get-next-value semantics, and in
//! `crate::command::ProcessTable`'s `sqlx`-backed repository pattern for
//! the persistence shape.

use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{AnyMessage, CounterRequest, CounterResponse, Message};
use crate::socket::{
    open_and_configure, recv_with_timeout, send_with_timeout, SocketDetails, SocketError,
    SocketKind, SocketOptions,
};
use crate::transport::{AsyncSocket, Context};

/// Counter-service errors.
#[derive(Error, Debug)]
pub enum CounterError {
    /// A socket-level failure while serving counter requests.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// The counter table could not be read or written.
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// One row of the counter table (§3, §6): `(item, value, increment,
/// initial_value)`.
pub struct CounterStore {
    pool: sqlx::SqlitePool,
}

const DEFAULT_INCREMENT: i32 = 1;
const DEFAULT_INITIAL_VALUE: i64 = 0;

impl CounterStore {
    /// Wrap an already-migrated connection pool.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Compute and persist the next value for `item`, auto-creating the row
    /// at `initial_value`/`increment` (defaulting to `0`/`1`) if absent.
    /// `increment`/`initial_value` are applied only on first creation; an
    /// existing row ignores them and uses what was recorded at creation.
    ///
    /// # Errors
    ///
    /// Returns an error if the read-modify-write transaction fails.
    pub async fn get_next_value(
        &self,
        item: &str,
        increment: Option<i32>,
        initial_value: Option<i64>,
    ) -> Result<i64, CounterError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CounterError::Storage(crate::storage::StorageError::from(e)))?;

        sqlx::query(
            "INSERT INTO counter (item, value, increment, initial_value) \
             VALUES (?1, ?2, ?3, ?2) \
             ON CONFLICT(item) DO NOTHING",
        )
        .bind(item)
        .bind(initial_value.unwrap_or(DEFAULT_INITIAL_VALUE))
        .bind(increment.unwrap_or(DEFAULT_INCREMENT))
        .execute(&mut *tx)
        .await
        .map_err(|e| CounterError::Storage(crate::storage::StorageError::from(e)))?;

        sqlx::query("UPDATE counter SET value = value + increment WHERE item = ?1")
            .bind(item)
            .execute(&mut *tx)
            .await
            .map_err(|e| CounterError::Storage(crate::storage::StorageError::from(e)))?;

        let value: i64 = sqlx::query_scalar("SELECT value FROM counter WHERE item = ?1")
            .bind(item)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| CounterError::Storage(crate::storage::StorageError::from(e)))?;

        tx.commit()
            .await
            .map_err(|e| CounterError::Storage(crate::storage::StorageError::from(e)))?;

        Ok(value)
    }
}

/// Poll interval between `keep_running` checks, matching
/// `socket::reqrep::Reply`'s own poll cadence.
const POLL_MS: i32 = 100;

/// The reply-socket-backed counter service, dispatching `CounterRequest` to
/// [`CounterStore::get_next_value`] (§4.5's service composite contract).
///
/// Unlike [`crate::socket::reqrep::Reply`], this service drives its own
/// receive loop directly over [`AsyncSocket`] rather than through
/// `Reply::start`'s synchronous callback: answering a request requires an
/// `await`ed database round trip, which the generic `ReplyCallback` (a
/// plain `Fn`) has no way to perform.
pub struct CounterService {
    context: Context,
    socket: Option<AsyncSocket>,
    details: Option<SocketDetails>,
    store: CounterStore,
    keep_running: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CounterService {
    /// A not-yet-initialized counter service backed by `store`.
    pub fn new(context: Context, store: CounterStore) -> Self {
        Self {
            context,
            socket: None,
            details: None,
            store,
            keep_running: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Bind the service's reply socket.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyInitialized`] if called twice, or any
    /// error from socket construction.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), CounterError> {
        if self.socket.is_some() {
            return Err(CounterError::Socket(SocketError::AlreadyInitialized));
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
        debug!("counter service initialized");
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    /// Run the receive/increment/reply loop until [`CounterService::stop`]
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotInitialized`] if not yet initialized, or a
    /// transport error.
    pub async fn start(&mut self) -> Result<(), CounterError> {
        self.keep_running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        debug!("counter service starting");
        while self
            .keep_running
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            let socket = self
                .socket
                .as_mut()
                .ok_or(CounterError::Socket(SocketError::NotInitialized))?;
            let Some(frames) = recv_with_timeout(socket, POLL_MS).await? else {
                continue;
            };
            let type_name = frames
                .first()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .unwrap_or_default();
            let payload = frames.get(1).cloned().unwrap_or_default();

            let reply = match self.handle(&type_name, &payload).await {
                Ok(message) => message,
                Err(details) => {
                    warn!("counter service callback failed: {details}");
                    AnyMessage::Failure(crate::message::Failure { details })
                }
            };
            let reply_bytes = reply
                .to_wire()
                .map_err(|e| CounterError::Socket(SocketError::Message(e)))?;
            let socket = self
                .socket
                .as_mut()
                .ok_or(CounterError::Socket(SocketError::NotInitialized))?;
            send_with_timeout(
                socket,
                &[reply.type_name().as_bytes().to_vec(), reply_bytes],
                -1,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle(&self, type_name: &str, payload: &[u8]) -> Result<AnyMessage, String> {
        if type_name != CounterRequest::TYPE_NAME {
            return Err(format!("unsupported request type: {type_name}"));
        }
        let request = CounterRequest::from_wire(payload).map_err(|e| e.to_string())?;
        let value = self
            .store
            .get_next_value(&request.item, request.increment, request.initial_value)
            .await
            .map_err(|e| e.to_string())?;
        Ok(AnyMessage::CounterResponse(CounterResponse { value }))
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
    pub fn socket_details(&self) -> Result<&SocketDetails, CounterError> {
        self.details
            .as_ref()
            .ok_or(CounterError::Socket(SocketError::NotInitialized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::ConnectOrBind;
    use crate::storage::{DatabaseConfig, DatabaseConnection, DatabasePath};
    use crate::zap::Role;

    async fn store() -> CounterStore {
        let config = DatabaseConfig::for_testing(DatabasePath::new(":memory:").unwrap());
        let conn = DatabaseConnection::initialize(config).await.unwrap();
        CounterStore::new(conn.pool().clone())
    }

    #[tokio::test]
    async fn first_request_creates_row_at_initial_value_plus_increment() {
        let store = store().await;
        let value = store
            .get_next_value("waveRing.packets", Some(5), Some(100))
            .await
            .unwrap();
        assert_eq!(value, 105);
    }

    #[tokio::test]
    async fn second_request_ignores_overrides_and_keeps_incrementing() {
        let store = store().await;
        store.get_next_value("pickCount", Some(1), Some(0)).await.unwrap();
        let second = store
            .get_next_value("pickCount", Some(99), Some(1000))
            .await
            .unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn default_increment_and_initial_value_apply_when_absent() {
        let store = store().await;
        let value = store.get_next_value("defaultItem", None, None).await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn counter_service_round_trips_a_request_through_the_wire() {
        let config = DatabaseConfig::for_testing(DatabasePath::new(":memory:").unwrap());
        let conn = DatabaseConnection::initialize(config).await.unwrap();
        let context = Context::new();
        let address = "inproc://counter-service-test";

        let mut service = CounterService::new(context.clone(), CounterStore::new(conn.pool().clone()));
        service
            .initialize(SocketOptions::new(address, ConnectOrBind::Bind, Role::Server))
            .unwrap();

        let server = tokio::spawn(async move { service.start().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut request = crate::socket::reqrep::Request::new(
            context,
            crate::message::MessageRegistry::with_builtin_types(),
        );
        request
            .initialize(
                SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                    .with_timeouts(-1, 2000),
            )
            .unwrap();

        let reply = request
            .request(&CounterRequest {
                item: "events".to_string(),
                increment: None,
                initial_value: None,
            })
            .await
            .unwrap();
        match reply {
            AnyMessage::CounterResponse(response) => assert_eq!(response.value, 1),
            other => panic!("unexpected reply: {other:?}"),
        }

        server.abort();
    }
}
