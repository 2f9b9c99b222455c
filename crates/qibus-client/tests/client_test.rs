//! Client behavior against a scripted peer over an in-memory stream pair.

use std::time::Duration;

use bytes::Bytes;
use qibus_client::{auth, Client, ClientConfig};
use qibus_net::{consumer, pipe, Endpoint};
use qibus_proto::capability::{KEY_NEW_TOKEN, KEY_TOKEN, KEY_USER};
use qibus_proto::meta::action;
use qibus_proto::{
    AuthState, ByteReader, ByteWriter, CapabilityMap, Kind, Message, Value,
};

/// Connected (client, server endpoint) pair.
fn client_pair() -> (Client, Endpoint) {
    let (client_stream, server_stream) = pipe();
    let client = Client::with_config(
        Endpoint::new(client_stream),
        ClientConfig { call_timeout: Duration::from_secs(2), ..ClientConfig::default() },
    );
    (client, Endpoint::new(server_stream))
}

/// Register a handler answering every call through `respond`.
fn serve_calls(
    endpoint: &Endpoint,
    respond: impl Fn(&Message) -> Message + Send + Sync + 'static,
) {
    let reply_endpoint = endpoint.clone();
    let respond = std::sync::Arc::new(respond);
    endpoint.add_handler(
        Box::new(|hdr| (hdr.kind() == Some(Kind::Call), true)),
        consumer(move |msg| {
            let endpoint = reply_endpoint.clone();
            let respond = respond.clone();
            async move {
                endpoint.send(respond(&msg)).await?;
                Ok(())
            }
        }),
        Box::new(|_| {}),
    );
}

fn reply_to(msg: &Message, payload: Bytes) -> Message {
    let mut header = msg.header;
    header.set_kind(Kind::Reply);
    Message::from_parts(header, payload)
}

fn error_to(msg: &Message, detail: &str) -> Message {
    let mut header = msg.header;
    header.set_kind(Kind::Error);
    let mut w = ByteWriter::new();
    Value::from_string(detail).write(&mut w);
    Message::from_parts(header, w.into_bytes())
}

#[tokio::test]
async fn call_returns_reply_payload() {
    let (client, server) = client_pair();
    serve_calls(&server, |msg| reply_to(msg, Bytes::from_static(b"pong")));

    let response = client.call(1, 2, 0x64, Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(response, Bytes::from_static(b"pong"));
}

#[tokio::test]
async fn call_surfaces_remote_error_string() {
    let (client, server) = client_pair();
    serve_calls(&server, |msg| error_to(msg, "no such action"));

    let err = client.call(1, 2, 0x64, Bytes::new()).await.unwrap_err();
    assert_eq!(err, qibus_client::ClientError::Remote("no such action".to_string()));
}

#[tokio::test]
async fn call_times_out_without_reply() {
    let (client_stream, server_stream) = pipe();
    let client = Client::with_config(
        Endpoint::new(client_stream),
        ClientConfig { call_timeout: Duration::from_millis(100), ..ClientConfig::default() },
    );
    let _server = Endpoint::new(server_stream);

    let err = client.call(1, 2, 0x64, Bytes::new()).await.unwrap_err();
    assert_eq!(err, qibus_client::ClientError::Timeout);
}

#[tokio::test]
async fn pending_call_fails_on_disconnect() {
    let (client, server) = client_pair();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call(1, 2, 0x64, Bytes::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close().await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err, qibus_client::ClientError::Disconnected);
}

#[tokio::test]
async fn subscription_delivers_events_in_order() {
    let (client, server) = client_pair();

    // Answer registerEvent/unregisterEvent like a basic object would.
    serve_calls(&server, |msg| match msg.header.action() {
        action::REGISTER_EVENT => {
            let mut r = ByteReader::new(&msg.payload);
            let _object = r.read_u32().unwrap();
            let _signal = r.read_u32().unwrap();
            let handler = r.read_u64().unwrap();
            let mut w = ByteWriter::new();
            w.write_u64(handler);
            reply_to(msg, w.into_bytes())
        },
        action::UNREGISTER_EVENT => reply_to(msg, Bytes::new()),
        _ => error_to(msg, "unexpected call"),
    });

    let mut subscription = client.subscribe(1, 2, 0x66).await.unwrap();

    for value in 0..5i32 {
        let mut w = ByteWriter::new();
        w.write_i32(value);
        server
            .send(Message::new(Kind::Event, 0, 1, 2, 0x66, w.into_bytes()))
            .await
            .unwrap();
    }

    for expected in 0..5i32 {
        let payload = subscription.next().await.unwrap();
        let mut r = ByteReader::new(&payload);
        assert_eq!(r.read_i32().unwrap(), expected);
    }

    subscription.cancel().await.unwrap();
}

#[tokio::test]
async fn events_for_other_signals_are_not_delivered() {
    let (client, server) = client_pair();
    serve_calls(&server, |msg| match msg.header.action() {
        action::REGISTER_EVENT => reply_to(msg, {
            let mut w = ByteWriter::new();
            w.write_u64(1);
            w.into_bytes()
        }),
        _ => reply_to(msg, Bytes::new()),
    });

    let mut subscription = client.subscribe(1, 2, 0x66).await.unwrap();

    // Wrong action uid, then the right one.
    server.send(Message::new(Kind::Event, 0, 1, 2, 0x65, Bytes::from_static(b"no"))).await.unwrap();
    server.send(Message::new(Kind::Event, 0, 1, 2, 0x66, Bytes::from_static(b"yes"))).await.unwrap();

    let payload = subscription.next().await.unwrap();
    assert_eq!(payload, Bytes::from_static(b"yes"));
}

/// Scripted service-zero: authenticates per a canned policy.
fn serve_authentication(
    server: &Endpoint,
    policy: impl Fn(&CapabilityMap) -> CapabilityMap + Send + Sync + 'static,
) {
    serve_calls(server, move |msg| {
        assert_eq!(msg.header.service(), 0);
        assert_eq!(msg.header.object(), 0);
        assert_eq!(msg.header.action(), action::AUTHENTICATE);
        let request = CapabilityMap::from_payload(&msg.payload).unwrap();
        reply_to(msg, policy(&request).to_payload())
    });
}

#[tokio::test]
async fn authentication_done_path() {
    let (client, server) = client_pair();
    serve_authentication(&server, |request| {
        assert_eq!(request.get_str(KEY_USER).unwrap(), "u");
        assert_eq!(request.get_str(KEY_TOKEN).unwrap(), "t");
        assert!(request.get("ClientServerSocket").is_some());
        let mut response = CapabilityMap::new();
        response.set_state(AuthState::Done);
        response
    });

    let map = auth::authenticate(&client, "u", "t").await.unwrap();
    assert!(map.authenticated());
}

#[tokio::test]
async fn authentication_error_path() {
    let (client, server) = client_pair();
    serve_authentication(&server, |_| {
        let mut response = CapabilityMap::new();
        response.set_state(AuthState::Error);
        response
    });

    let err = auth::authenticate(&client, "u", "bad").await.unwrap_err();
    assert!(matches!(err, qibus_client::ClientError::AuthFailed(_)));
}

#[tokio::test]
async fn authentication_continue_rotates_token() {
    let (client, server) = client_pair();
    serve_authentication(&server, |request| {
        let mut response = CapabilityMap::new();
        match request.get_str(KEY_TOKEN).as_deref() {
            Some("t2") => response.set_state(AuthState::Done),
            _ => {
                response.set_state(AuthState::Continue);
                response.insert(KEY_NEW_TOKEN, Value::from_string("t2"));
            },
        }
        response
    });

    let mut preferred = CapabilityMap::preferred("u", "t");
    auth::authenticate_map(&client, &mut preferred).await.unwrap();

    // The rotated token is exposed while the original stays in place.
    assert_eq!(preferred.get_str(KEY_NEW_TOKEN).unwrap(), "t2");
    assert_eq!(preferred.get_str(KEY_TOKEN).unwrap(), "t");
}

#[tokio::test]
async fn authentication_falls_back_to_capability_exchange() {
    let (client, server) = client_pair();

    // A legacy peer: calls error out, but a capability frame is answered
    // with a capability frame.
    serve_calls(&server, |msg| error_to(msg, "unknown service"));
    let reply_endpoint = server.clone();
    server.add_handler(
        Box::new(|hdr| (hdr.kind() == Some(Kind::Capability), false)),
        consumer(move |_| {
            let endpoint = reply_endpoint.clone();
            async move {
                let caps = CapabilityMap::new();
                endpoint
                    .send(Message::new(Kind::Capability, 2, 0, 0, 0, caps.to_payload()))
                    .await?;
                Ok(())
            }
        }),
        Box::new(|_| {}),
    );

    let map = auth::authenticate(&client, "", "").await.unwrap();
    assert!(map.authenticated());
}

#[tokio::test]
async fn capability_fallback_times_out() {
    let (client_stream, server_stream) = pipe();
    let client = Client::with_config(
        Endpoint::new(client_stream),
        ClientConfig {
            call_timeout: Duration::from_millis(100),
            legacy_capability_timeout: Duration::from_millis(100),
        },
    );
    let server = Endpoint::new(server_stream);
    // Calls error out and no capability frame ever comes back.
    serve_calls(&server, |msg| error_to(msg, "unknown service"));

    let err = auth::authenticate(&client, "", "").await.unwrap_err();
    assert_eq!(err, qibus_client::ClientError::AuthTimeout);
}
