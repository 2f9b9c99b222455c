//! Loopback dispatch scenarios over an in-memory stream pair.

use bytes::Bytes;
use qibus_net::{consumer, pipe, Endpoint};
use qibus_proto::{Kind, Message};

/// A server-side echo over one endpoint pair: the client's next inbound
/// message equals what it sent, header and payload.
#[tokio::test]
async fn loopback_echo_round_trip() {
    let (client_stream, server_stream) = pipe();
    let client = Endpoint::new(client_stream);
    let server = Endpoint::new(server_stream);

    // One-shot echo handler on the server side.
    let echo_endpoint = server.clone();
    server.add_handler(
        Box::new(|_| (true, false)),
        consumer(move |msg| {
            let endpoint = echo_endpoint.clone();
            async move {
                endpoint.send(msg).await?;
                Ok(())
            }
        }),
        Box::new(|_| {}),
    );

    let mut replies = client.receive_any();

    let sent = Message::new(Kind::Call, 4, 1, 2, 3, Bytes::from_static(&[0xAB, 0xCD]));
    client.send(sent.clone()).await.unwrap();

    let echoed = replies.recv().await.expect("echo reply");
    assert_eq!(echoed.header, sent.header);
    assert_eq!(echoed.payload, sent.payload);
}

/// Events for one subscription arrive in emission order even with a slow
/// consumer in front of them.
#[tokio::test]
async fn slow_consumer_applies_backpressure_without_loss() {
    let (tx_stream, rx_stream) = pipe();
    let sender = Endpoint::new(tx_stream);
    let receiver = Endpoint::new(rx_stream);

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel(64);
    receiver.add_handler(
        Box::new(|_| (true, true)),
        consumer(move |msg| {
            let seen = seen_tx.clone();
            async move {
                // Slower than the sender: the bounded inbox must absorb or
                // stall, never drop or reorder.
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                let _ = seen.send(msg.header.id()).await;
                Ok(())
            }
        }),
        Box::new(|_| {}),
    );

    for id in 0..40u32 {
        sender
            .send(Message::new(Kind::Event, id, 1, 1, 0x64, Bytes::new()))
            .await
            .unwrap();
    }

    for expected in 0..40u32 {
        let got = tokio::time::timeout(std::time::Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed early");
        assert_eq!(got, expected);
    }
}
