//! Concrete end-to-end scenarios (§8): one test per named scenario, each
//! exercising a full stack slice rather than a single module in isolation.

use std::sync::Arc;
use std::time::Duration;

use umps::auth::{AuthenticationService, Grasslands, Permissioned};
use umps::command::{CommandReturnCode, LocalRequestor, LocalService, ProcessTable};
use umps::credentials::{Privilege, SqliteUserStore};
use umps::directory::{ConnectionDetails, Operator, Requestor};
use umps::keys::KeyPair;
use umps::message::{
    AnyMessage, ConnectionType, Heartbeat, HeartbeatStatus, Message, RegistrationRequest,
};
use umps::services::counter::CounterStore;
use umps::socket::pubsub::{Publisher, Subscriber};
use umps::socket::reqrep::Request;
use umps::socket::{ConnectOrBind, SocketOptions};
use umps::storage::{DatabaseConfig, DatabaseConnection, DatabasePath};
use umps::transport::Context;
use umps::zap::{Role, SecurityLevel, ZapOptions};

async fn in_memory_pool() -> sqlx::SqlitePool {
    let path = DatabasePath::new(":memory:").unwrap();
    let config = DatabaseConfig::for_testing(path);
    let conn = DatabaseConnection::initialize(config).await.unwrap();
    conn.pool().clone()
}

/// Strawhouse broadcast: publish three heartbeats in order, a strawhouse
/// subscriber with a 500ms timeout receives them in that exact order.
#[tokio::test]
async fn strawhouse_broadcast_delivers_heartbeats_in_order() {
    let context = Context::new();
    let address = "inproc://e2e-strawhouse-broadcast";
    let domain = "global";

    let mut auth = AuthenticationService::new(context.clone());
    let ready = auth.start(Arc::new(Grasslands)).unwrap();
    ready.await.unwrap();

    let mut publisher = Publisher::new(context.clone());
    publisher
        .initialize(
            SocketOptions::new(address, ConnectOrBind::Bind, Role::Server)
                .with_zap(ZapOptions::strawhouse(domain).unwrap()),
        )
        .unwrap();

    let mut subscriber = Subscriber::new(context.clone(), umps::message::MessageRegistry::with_builtin_types());
    subscriber
        .initialize(
            SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                .with_zap(ZapOptions::strawhouse(domain).unwrap()),
        )
        .unwrap();
    subscriber.add_subscription(Heartbeat::TYPE_NAME).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    for host in ["sensor-a", "sensor-b", "sensor-c"] {
        publisher
            .send(&Heartbeat {
                status: HeartbeatStatus::Alive,
                host: host.to_string(),
                issued_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    for expected in ["sensor-a", "sensor-b", "sensor-c"] {
        let message = subscriber.receive(500).await.unwrap().unwrap();
        match message {
            AnyMessage::Heartbeat(hb) => assert_eq!(hb.host, expected),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    auth.stop().await;
}

/// Stonehouse request: a client pinning the correct server public key reaches
/// the directory; a client pinning the wrong key is denied.
#[tokio::test]
async fn stonehouse_request_authenticates_by_pinned_public_key() {
    let context = Context::new();
    let address = "inproc://e2e-stonehouse-request";
    let domain = "global";

    let server_keys = KeyPair::generate().unwrap();
    let client_keys = KeyPair::generate().unwrap();
    let other_keys = KeyPair::generate().unwrap();

    let store = Arc::new(
        {
            let pool = in_memory_pool().await;
            let store = SqliteUserStore::new(pool);
            store
                .add_curve_user("picker-01", None, &client_keys.public, Privilege::ReadOnly)
                .await
                .unwrap();
            store
        },
    );

    let mut auth = AuthenticationService::new(context.clone());
    let ready = auth.start(Arc::new(Permissioned::new(store))).unwrap();
    ready.await.unwrap();

    let mut operator = Operator::new(context.clone(), Duration::from_secs(60));
    operator
        .initialize(
            SocketOptions::new(address, ConnectOrBind::Bind, Role::Server)
                .with_zap(ZapOptions::stonehouse_server(domain, server_keys.clone()).unwrap()),
        )
        .unwrap();
    let server = tokio::spawn(async move { operator.start().await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut good_request = Request::new(context.clone(), umps::message::MessageRegistry::with_builtin_types());
    good_request
        .initialize(
            SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                .with_zap(ZapOptions::stonehouse_client(domain, server_keys.public.clone(), client_keys.clone()).unwrap())
                .with_timeouts(2_000, 2_000),
        )
        .unwrap();
    let reply = good_request
        .request(&umps::message::AvailableConnectionsRequest::default())
        .await
        .unwrap();
    assert!(matches!(reply, AnyMessage::AvailableConnectionsResponse(_)));

    let mut bad_request = Request::new(context.clone(), umps::message::MessageRegistry::with_builtin_types());
    bad_request
        .initialize(
            SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                .with_zap(ZapOptions::stonehouse_client(domain, server_keys.public, other_keys).unwrap())
                .with_timeouts(500, 500),
        )
        .unwrap();
    let denied = bad_request
        .request(&umps::message::AvailableConnectionsRequest::default())
        .await;
    assert!(denied.is_err(), "a client with the wrong server key must not connect");

    server.abort();
    auth.stop().await;
}

/// Counter monotonicity: 8 concurrent callers each issuing 1000 increments
/// against the same item must together observe every value in 1..=8000
/// exactly once.
#[tokio::test]
async fn counter_increments_are_monotonic_and_gapless_under_concurrency() {
    let pool = in_memory_pool().await;
    let store = Arc::new(CounterStore::new(pool));

    const CALLERS: usize = 8;
    const PER_CALLER: usize = 1000;

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut values = Vec::with_capacity(PER_CALLER);
            for _ in 0..PER_CALLER {
                values.push(store.get_next_value("events", Some(1), Some(0)).await.unwrap());
            }
            values
        }));
    }

    let mut all_values: Vec<i64> = Vec::with_capacity(CALLERS * PER_CALLER);
    for handle in handles {
        all_values.extend(handle.await.unwrap());
    }

    all_values.sort_unstable();
    let expected: Vec<i64> = (1..=(CALLERS * PER_CALLER) as i64).collect();
    assert_eq!(all_values, expected);
}

/// Command round-trip: issue a ping, then terminate, against a running
/// `LocalService`.
#[tokio::test]
async fn command_round_trip_then_terminate() {
    let context = Context::new();
    let pool = in_memory_pool().await;
    let process_table = ProcessTable::new(pool);
    let dir = std::env::temp_dir();
    let module_name = "e2e-ping-module";
    let ipc_path = dir.join(format!("{module_name}.ipc"));
    let _ = std::fs::remove_file(&ipc_path);

    let mut service = LocalService::new(
        context.clone(),
        process_table,
        module_name,
        dir.clone(),
        "echoes commands",
    );
    service.initialize().await.unwrap();

    let server = tokio::spawn(async move {
        service
            .start(Box::new(|command| (command.to_string(), CommandReturnCode::Success)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut requestor = LocalRequestor::new(context);
    requestor.initialize(&dir, module_name).unwrap();

    let (response, code) = requestor.command("ping").await.unwrap();
    assert_eq!(response, "ping");
    assert_eq!(code, CommandReturnCode::Success);

    let terminate_code = requestor.terminate().await.unwrap();
    assert_eq!(terminate_code, CommandReturnCode::Success);

    server.abort();
    let _ = std::fs::remove_file(&ipc_path);
}

/// Directory discovery: registered names resolve, unregistered names don't.
#[tokio::test]
async fn directory_resolves_registered_names_and_rejects_unknown_ones() {
    let context = Context::new();
    let address = "inproc://e2e-directory-discovery";

    let mut operator = Operator::new(context.clone(), Duration::from_secs(60));
    operator
        .initialize(SocketOptions::new(address, ConnectOrBind::Bind, Role::Server))
        .unwrap();
    let server = tokio::spawn(async move { operator.start().await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut registrar = Request::new(context.clone(), umps::message::MessageRegistry::with_builtin_types());
    registrar
        .initialize(SocketOptions::new(address, ConnectOrBind::Connect, Role::Client))
        .unwrap();

    for (name, connection_type) in [
        ("weatherFeed", ConnectionType::Broadcast),
        ("quakeAlerts", ConnectionType::Broadcast),
        ("pickerService", ConnectionType::Service),
    ] {
        let details = ConnectionDetails {
            name: name.to_string(),
            connection_type,
            address: format!("tcp://127.0.0.1:0#{name}"),
            security_level: SecurityLevel::Grasslands,
            user_privileges: Privilege::ReadOnly,
        };
        let reply = registrar
            .request(&RegistrationRequest {
                connection_details: details,
            })
            .await
            .unwrap();
        assert!(matches!(reply, AnyMessage::RegistrationResponse(_)));
    }

    let mut requestor = Requestor::new(context);
    requestor.initialize(address).unwrap();

    assert!(requestor
        .proxy_broadcast_frontend("weatherFeed")
        .await
        .unwrap()
        .is_some());
    assert!(requestor
        .proxy_service_frontend("pickerService")
        .await
        .unwrap()
        .is_some());
    assert!(requestor
        .proxy_broadcast_frontend("Missing")
        .await
        .unwrap()
        .is_none());

    server.abort();
}

/// Auth-denied service refuses connections: a stonehouse service with an
/// empty allowlist rejects every client within one second.
#[tokio::test]
async fn auth_denied_service_refuses_all_connections() {
    let context = Context::new();
    let address = "inproc://e2e-auth-denied";
    let domain = "global";

    let server_keys = KeyPair::generate().unwrap();
    let client_keys = KeyPair::generate().unwrap();

    // Empty user store: no curve user is ever provisioned, so every client
    // is denied regardless of which key it presents.
    let pool = in_memory_pool().await;
    let store = Arc::new(SqliteUserStore::new(pool));

    let mut auth = AuthenticationService::new(context.clone());
    let ready = auth.start(Arc::new(Permissioned::new(store))).unwrap();
    ready.await.unwrap();

    let mut reply = umps::socket::reqrep::Reply::new(context.clone());
    reply
        .initialize(
            SocketOptions::new(address, ConnectOrBind::Bind, Role::Server)
                .with_zap(ZapOptions::stonehouse_server(domain, server_keys.clone()).unwrap()),
        )
        .unwrap();
    let server = tokio::spawn(async move {
        reply
            .start(|_type_name, _payload| {
                Ok(AnyMessage::Failure(umps::message::Failure {
                    details: "should never be reached".to_string(),
                }))
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut request = Request::new(context, umps::message::MessageRegistry::with_builtin_types());
    request
        .initialize(
            SocketOptions::new(address, ConnectOrBind::Connect, Role::Client)
                .with_zap(ZapOptions::stonehouse_client(domain, server_keys.public, client_keys).unwrap())
                .with_timeouts(1_000, 1_000),
        )
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        request.request(&umps::message::AvailableConnectionsRequest::default()),
    )
    .await
    .expect("must fail within one second, not hang");
    assert!(result.is_err(), "an unauthorized client must be denied");

    server.abort();
    auth.stop().await;
}
