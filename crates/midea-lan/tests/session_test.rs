//! End-to-end session tests against an in-process mock appliance

use midea_lan::appliance::GenericAdapter;
use midea_lan::{
    Credentials, DeviceDescriptor, DeviceSession, SessionOptions, SessionState, StatusMap,
};
use midea_proto::{
    ApplianceMessage, Frame, FrameType, InnerPacket, MessageType, TransportCodec, crypto,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn descriptor(port: u16, protocol_version: u8) -> DeviceDescriptor {
    DeviceDescriptor {
        id: 7,
        appliance_type: 0xAC,
        serial: "MOCK001".to_string(),
        ssid: "midea_ac_MOCK".to_string(),
        address: "127.0.0.1".parse().unwrap(),
        port,
        protocol_version,
    }
}

fn status_reply(request: &ApplianceMessage) -> ApplianceMessage {
    let mut reply = if request.message_type == MessageType::QueryAppliance as u8 {
        ApplianceMessage::new(0xAC, MessageType::QueryAppliance, vec![0u8; 19])
    } else {
        ApplianceMessage::new(0xAC, MessageType::Query, vec![0x10, 0x20, 0x30])
    };
    reply.protocol_version = 3;
    reply
}

/// Accept loop for a protocol-version-3 mock appliance
async fn run_v3_mock(listener: TcpListener, key: [u8; 32]) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let _ = serve_v3(stream, key).await;
        });
    }
}

async fn serve_v3(mut stream: TcpStream, key: [u8; 32]) -> anyhow::Result<()> {
    // Handshake: 6-byte header, 2-byte counter, 64-byte token
    let mut handshake = [0u8; 72];
    stream.read_exact(&mut handshake).await?;
    assert_eq!(handshake[0..2], [0x83, 0x70]);

    let secret = [0x5Au8; 32];
    let mut response = crypto::encrypt_cbc(&secret, &key).unwrap();
    response.extend_from_slice(&crypto::sha256(&secret));

    let mut codec = TransportCodec::new();
    let reply = codec.encode(&response, FrameType::HandshakeResponse).unwrap();
    stream.write_all(&reply).await?;

    let tcp_key: [u8; 32] = crypto::buffer_xor(&secret, &key).try_into().unwrap();
    codec.set_tcp_key(tcp_key);

    let mut buffer = Vec::new();
    let mut read_buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&read_buf[..n]);

        for frame in codec.decode(&mut buffer).unwrap() {
            let Frame::Message(data) = frame else {
                continue;
            };
            let packet = InnerPacket::parse(&data).unwrap();

            let reply = if packet.body.first() == Some(&0xAA) {
                let request = ApplianceMessage::parse(&packet.body).unwrap();
                InnerPacket::new(packet.device_id, status_reply(&request).encode())
            } else {
                // Heartbeat
                InnerPacket::heartbeat(packet.device_id)
            };

            let framed = codec
                .encode(&reply.encode(), FrameType::EncryptedResponse)
                .unwrap();
            stream.write_all(&framed).await?;
        }
    }
}

/// Accept loop for a protocol-version-2 mock appliance (bare inner packets)
async fn run_v2_mock(listener: TcpListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let _ = serve_v2(stream).await;
        });
    }
}

async fn serve_v2(mut stream: TcpStream) -> anyhow::Result<()> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&read_buf[..n]);

        while buffer.len() >= 6 {
            let total = u16::from_le_bytes([buffer[4], buffer[5]]) as usize;
            if buffer.len() < total {
                break;
            }
            let data: Vec<u8> = buffer.drain(..total).collect();
            let packet = InnerPacket::parse(&data).unwrap();

            let reply = if packet.body.first() == Some(&0xAA) {
                let request = ApplianceMessage::parse(&packet.body).unwrap();
                let mut message = status_reply(&request);
                message.protocol_version = 2;
                InnerPacket::new(packet.device_id, message.encode())
            } else {
                InnerPacket::heartbeat(packet.device_id)
            };
            stream.write_all(&reply.encode()).await?;
        }
    }
}

fn observed_session(
    descriptor: DeviceDescriptor,
    credentials: Option<Credentials>,
) -> (DeviceSession, mpsc::UnboundedReceiver<StatusMap>) {
    let session = DeviceSession::new(
        descriptor,
        credentials,
        Box::new(GenericAdapter::new(0xAC)),
        SessionOptions {
            name: "mock".to_string(),
            ..SessionOptions::default()
        },
    )
    .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    session.register_observer(move |status| {
        let _ = tx.send(status.clone());
    });
    (session, rx)
}

async fn next_status(rx: &mut mpsc::UnboundedReceiver<StatusMap>) -> StatusMap {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for observer update")
        .expect("observer channel closed")
}

#[tokio::test]
async fn test_v3_session_lifecycle() {
    init_logs();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = [0x42u8; 32];
    tokio::spawn(run_v3_mock(listener, key));

    let credentials = Credentials {
        token: [0x24; 64],
        key,
    };
    let (mut session, mut rx) = observed_session(descriptor(port, 3), Some(credentials));

    session.open();
    session.open(); // idempotent

    // First notification: the session came up
    let first = next_status(&mut rx).await;
    assert_eq!(first["available"], serde_json::json!(true));

    // The connect-time refresh produces a decoded status update
    let status = next_status(&mut rx).await;
    assert_eq!(status["available"], serde_json::json!(true));
    assert!(status.contains_key("raw"));

    assert_eq!(session.state(), SessionState::Ready);

    // A waited refresh resolves on the first parsed response
    timeout(WAIT, session.refresh_status(true))
        .await
        .unwrap()
        .unwrap();

    // Commands are accepted while ready
    session
        .send_command(MessageType::Set, vec![0x01, 0x02])
        .await
        .unwrap();

    session.close().await;
    session.close().await; // idempotent
    assert_eq!(session.state(), SessionState::Closed);

    // Teardown drains observers with an unavailable notice
    let mut saw_unavailable = false;
    while let Ok(status) = rx.try_recv() {
        if status["available"] == serde_json::json!(false) {
            saw_unavailable = true;
        }
    }
    assert!(saw_unavailable);

    // Closed sessions reject traffic
    assert!(session.send_command(MessageType::Query, vec![]).await.is_err());
}

#[tokio::test]
async fn test_v2_session_skips_handshake() {
    init_logs();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(run_v2_mock(listener));

    let (mut session, mut rx) = observed_session(descriptor(port, 2), None);
    session.open();

    let first = next_status(&mut rx).await;
    assert_eq!(first["available"], serde_json::json!(true));

    let status = next_status(&mut rx).await;
    assert!(status.contains_key("raw"));

    timeout(WAIT, session.refresh_status(true))
        .await
        .unwrap()
        .unwrap();

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_bad_handshake_terminates_session() {
    init_logs();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // A device that answers the handshake with garbage
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 72];
            if stream.read_exact(&mut buf).await.is_err() {
                continue;
            }
            let mut codec = TransportCodec::new();
            let junk = codec.encode(&[0u8; 64], FrameType::HandshakeResponse).unwrap();
            let _ = stream.write_all(&junk).await;
        }
    });

    let credentials = Credentials {
        token: [0x24; 64],
        key: [0x42; 32],
    };
    let (mut session, _rx) = observed_session(descriptor(port, 3), Some(credentials));
    session.open();

    // Authentication failure terminates the task; no reconnect loop
    timeout(WAIT, async {
        loop {
            if session.state() == SessionState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session did not close after auth failure");

    session.close().await;
}
