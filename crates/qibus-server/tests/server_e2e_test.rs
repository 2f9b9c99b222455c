//! Full-stack scenarios: server, hosted directory, and client sessions
//! over a real TCP loopback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use qibus_client::{Session, SessionConfig};
use qibus_net::{dial, Endpoint};
use qibus_proto::meta::action;
use qibus_proto::service::ServiceEvent;
use qibus_proto::{ByteReader, ByteWriter, CapabilityMap, Kind, Message, Value};
use qibus_server::{
    BasicObject, ObjectBuilder, PermissiveAuthenticator, Server, UserTokenAuthenticator,
};

const PING: u32 = 0x64;
const TICK: u32 = 0x65;
const DELAY: u32 = 0x66;

fn clock_meta() -> qibus_proto::MetaObject {
    let mut meta = qibus_proto::MetaObject {
        description: "Clock".to_string(),
        ..qibus_proto::MetaObject::default()
    };
    meta.methods
        .insert(PING, qibus_proto::MetaMethod::new(PING, "ping", "(s)", "s"));
    meta.signals.insert(TICK, qibus_proto::MetaSignal::new(TICK, "tick", "(l)"));
    meta.properties
        .insert(DELAY, qibus_proto::MetaProperty::new(DELAY, "delay", "i"));
    meta
}

fn clock_object() -> BasicObject {
    ObjectBuilder::new(clock_meta())
        .method(PING, |payload: Bytes| async move {
            let mut r = ByteReader::new(&payload);
            let text = r.read_string().map_err(|e| e.to_string())?;
            let mut w = ByteWriter::new();
            w.write_string(&format!("pong: {text}"));
            Ok(w.into_bytes())
        })
        .property("delay", Value::from_i32(10))
        .on_property_change(Box::new(|_, raw| {
            let mut r = ByteReader::new(raw);
            let value = r.read_i32().map_err(|e| e.to_string())?;
            if value < 0 {
                return Err(format!("duration cannot be negative ({value})"));
            }
            Ok(())
        }))
        .build()
}

/// Poll until the session's service list contains `name`.
async fn wait_for_service(session: &Session, name: &str) {
    for _ in 0..100 {
        if session.services().iter().any(|info| info.name == name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("service {name} never appeared in the session list");
}

async fn start_directory_server() -> Arc<Server> {
    let server = Arc::new(
        Server::bind_directory("tcp://127.0.0.1:0", Arc::new(PermissiveAuthenticator))
            .await
            .unwrap(),
    );
    let acceptor = server.clone();
    tokio::spawn(async move {
        let _ = acceptor.run().await;
    });
    server
}

#[tokio::test]
async fn directory_lifecycle_with_signals() {
    let server = start_directory_server().await;
    let session = Session::connect(server.url()).await.unwrap();

    // Only the directory itself is live.
    let services = session.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "ServiceDirectory");
    assert_eq!(services[0].service_id, 1);

    // Subscribe before registering so both events are observed.
    let mut added = session.directory().subscribe("serviceAdded").await.unwrap();
    let mut removed = session.directory().subscribe("serviceRemoved").await.unwrap();

    // The directory occupies id 1; the first user service gets 2.
    let id = server.add_service("Clock", Arc::new(clock_object())).await.unwrap();
    assert_eq!(id, 2);

    let payload = tokio::time::timeout(Duration::from_secs(5), added.next())
        .await
        .unwrap()
        .unwrap();
    let mut r = ByteReader::new(&payload);
    let event = ServiceEvent::read(&mut r).unwrap();
    assert_eq!((event.service_id, event.name.as_str()), (2, "Clock"));

    // The session's own watcher updates its list shortly after the event.
    wait_for_service(&session, "Clock").await;
    let clock = session.proxy("Clock", 1).await.unwrap();
    assert_eq!(clock.service_id(), 2);

    server.remove_service(id).await;
    let payload = tokio::time::timeout(Duration::from_secs(5), removed.next())
        .await
        .unwrap()
        .unwrap();
    let mut r = ByteReader::new(&payload);
    let event = ServiceEvent::read(&mut r).unwrap();
    assert_eq!((event.service_id, event.name.as_str()), (2, "Clock"));

    added.cancel().await.unwrap();
}

#[tokio::test]
async fn duplicate_service_names_rejected() {
    let server = start_directory_server().await;
    server.add_service("Clock", Arc::new(clock_object())).await.unwrap();
    let err = server.add_service("Clock", Arc::new(clock_object())).await.unwrap_err();
    assert!(err.to_string().contains("already registered"), "{err}");
}

#[tokio::test]
async fn method_call_through_session() {
    let server = start_directory_server().await;
    server.add_service("Clock", Arc::new(clock_object())).await.unwrap();

    let session = Session::connect(server.url()).await.unwrap();
    let clock = session.proxy("Clock", 1).await.unwrap();

    let mut w = ByteWriter::new();
    w.write_string("hello");
    let response = clock.call("ping", w.into_bytes()).await.unwrap();
    let mut r = ByteReader::new(&response);
    assert_eq!(r.read_string().unwrap(), "pong: hello");
}

#[tokio::test]
async fn signals_reach_remote_subscribers_in_order() {
    let server = start_directory_server().await;
    let clock = clock_object();
    server.add_service("Clock", Arc::new(clock.clone())).await.unwrap();

    let session = Session::connect(server.url()).await.unwrap();
    let proxy = session.proxy("Clock", 1).await.unwrap();
    let mut ticks = proxy.subscribe("tick").await.unwrap();

    for tick in 0..5i64 {
        let mut w = ByteWriter::new();
        w.write_i64(tick);
        clock.emit_signal(TICK, w.into_bytes()).await.unwrap();
    }

    for expected in 0..5i64 {
        let payload = tokio::time::timeout(Duration::from_secs(5), ticks.next())
            .await
            .unwrap()
            .unwrap();
        let mut r = ByteReader::new(&payload);
        assert_eq!(r.read_i64().unwrap(), expected);
    }

    ticks.cancel().await.unwrap();
}

#[tokio::test]
async fn property_round_trip_over_the_wire() {
    let server = start_directory_server().await;
    server.add_service("Clock", Arc::new(clock_object())).await.unwrap();

    let session = Session::connect(server.url()).await.unwrap();
    let clock = session.proxy("Clock", 1).await.unwrap();

    assert_eq!(clock.property("delay").await.unwrap().to_i32().unwrap(), 10);

    // Updates notify subscribers of the property uid.
    let mut updates = clock.subscribe("delay").await.unwrap();
    clock.set_property("delay", Value::from_i32(12)).await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .unwrap()
        .unwrap();
    let mut r = ByteReader::new(&payload);
    assert_eq!(r.read_i32().unwrap(), 12);
    assert_eq!(clock.property("delay").await.unwrap().to_i32().unwrap(), 12);

    // A rejected update leaves the stored value unchanged.
    let err = clock.set_property("delay", Value::from_i32(-1)).await.unwrap_err();
    assert!(err.to_string().contains("cannot be negative"), "{err}");
    assert_eq!(clock.property("delay").await.unwrap().to_i32().unwrap(), 12);

    assert_eq!(clock.properties().await.unwrap(), vec!["delay".to_string()]);
}

#[tokio::test]
async fn unauthenticated_calls_are_refused() {
    let server = Arc::new(
        Server::bind_directory(
            "tcp://127.0.0.1:0",
            Arc::new(UserTokenAuthenticator::new(HashMap::from([(
                "nao".to_string(),
                "secret".to_string(),
            )]))),
        )
        .await
        .unwrap(),
    );
    let acceptor = server.clone();
    tokio::spawn(async move {
        let _ = acceptor.run().await;
    });

    // Wrong credentials cannot open a session.
    let err = Session::connect_with(
        server.url(),
        SessionConfig { user: "nao".to_string(), token: "wrong".to_string(), ..SessionConfig::default() },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, qibus_client::ClientError::AuthFailed(_)), "{err}");

    // The right ones can.
    let session = Session::connect_with(
        server.url(),
        SessionConfig { user: "nao".to_string(), token: "secret".to_string(), ..SessionConfig::default() },
    )
    .await
    .unwrap();
    assert_eq!(session.services().len(), 1);
}

#[tokio::test]
async fn capability_frame_cannot_bypass_token_auth() {
    let server = Arc::new(
        Server::bind_directory(
            "tcp://127.0.0.1:0",
            Arc::new(UserTokenAuthenticator::new(HashMap::from([(
                "nao".to_string(),
                "secret".to_string(),
            )]))),
        )
        .await
        .unwrap(),
    );
    let acceptor = server.clone();
    tokio::spawn(async move {
        let _ = acceptor.run().await;
    });

    let endpoint = Endpoint::new(dial(server.url()).await.unwrap());
    let mut inbound = endpoint.receive_any();

    // A bare capability frame without credentials is not acknowledged...
    let caps = CapabilityMap::preferred("", "");
    endpoint
        .send(Message::new(Kind::Capability, 2, 0, 0, 0, caps.to_payload()))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_millis(300), inbound.recv()).await;
    assert!(reply.is_err(), "capability frame must not be acknowledged without credentials");

    // ...and does not authenticate the connection: calls are still refused.
    let mut w = ByteWriter::new();
    w.write_u32(1);
    endpoint
        .send(Message::new(Kind::Call, 7, 1, 1, action::META_OBJECT, w.into_bytes()))
        .await
        .unwrap();
    let refusal = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refusal.header.kind(), Some(Kind::Error));
    let mut r = ByteReader::new(&refusal.payload);
    let detail = Value::read(&mut r).unwrap().to_str().unwrap();
    assert!(detail.contains("not authenticated"), "{detail}");
}

#[tokio::test]
async fn capability_exchange_authenticates_against_permissive_server() {
    let server = start_directory_server().await;

    let endpoint = Endpoint::new(dial(server.url()).await.unwrap());
    let mut inbound = endpoint.receive_any();

    // A permissive server grants the exchange and reflects capabilities.
    endpoint
        .send(Message::new(
            Kind::Capability,
            2,
            0,
            0,
            0,
            CapabilityMap::preferred("", "").to_payload(),
        ))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.header.kind(), Some(Kind::Capability));
    let map = CapabilityMap::from_payload(&reply.payload).unwrap();
    assert!(map.authenticated());

    // The connection is now authenticated: introspection answers.
    let mut replies = endpoint.receive_any();
    let mut w = ByteWriter::new();
    w.write_u32(1);
    endpoint
        .send(Message::new(Kind::Call, 9, 1, 1, action::META_OBJECT, w.into_bytes()))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.header.kind(), Some(Kind::Reply));
}

#[tokio::test]
async fn token_renewal_handshake_over_the_wire() {
    // A user provisioned with an empty token is issued one via Continue.
    let authenticator = Arc::new(UserTokenAuthenticator::new(HashMap::from([(
        "nao".to_string(),
        String::new(),
    )])));
    let server = Arc::new(
        Server::bind_directory("tcp://127.0.0.1:0", authenticator.clone()).await.unwrap(),
    );
    let acceptor = server.clone();
    tokio::spawn(async move {
        let _ = acceptor.run().await;
    });

    let session = Session::connect_with(
        server.url(),
        SessionConfig { user: "nao".to_string(), token: String::new(), ..SessionConfig::default() },
    )
    .await
    .unwrap();
    assert_eq!(session.services().len(), 1);

    // The authenticator persisted the issued token.
    let issued = authenticator.token_of("nao").unwrap();
    assert!(!issued.is_empty());
}

#[tokio::test]
async fn session_reuses_pooled_connections() {
    let server = start_directory_server().await;
    server.add_service("Clock", Arc::new(clock_object())).await.unwrap();

    let session = Session::connect(server.url()).await.unwrap();
    let first = session.proxy("Clock", 1).await.unwrap();
    let second = session.proxy("Clock", 1).await.unwrap();

    // Both proxies ride the directory connection (same advertised URL).
    let mut w = ByteWriter::new();
    w.write_string("a");
    first.call("ping", w.into_bytes()).await.unwrap();
    let mut w = ByteWriter::new();
    w.write_string("b");
    second.call("ping", w.into_bytes()).await.unwrap();
}
