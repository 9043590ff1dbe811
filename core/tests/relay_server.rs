//! Live relay tests over real WebSockets
//!
//! Each test boots one or two relays on loopback ports and drives them
//! with raw protocol clients: registration, directory listing, public
//! chat fan-out with replay suppression, and a two-server chat hop.
//!
//! Run with: cargo test --test relay_server

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use olaf_core::client::engine::{compose_chat, extract_chat, Recipient};
use olaf_core::crypto::{fingerprint, generate_keypair, public_key_to_pem};
use olaf_core::envelope::{self, Frame, Payload};
use olaf_core::{Relay, ServerConfig};
use rsa::RsaPrivateKey;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

fn test_config(
    base: &Path,
    client_port: u16,
    server_port: u16,
    http_port: u16,
    neighbours: Vec<String>,
) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".into(),
        client_ws_port: client_port,
        server_ws_port: server_port,
        http_port,
        neighbour_addresses: neighbours,
        external_address: "127.0.0.1".into(),
        log_messages: false,
        config_dir: base.join("config"),
        neighbours_dir: base.join("neighbours"),
        clients_dir: base.join("clients"),
        files_dir: base.join("files"),
    }
}

fn spawn_relay(
    client_port: u16,
    server_port: u16,
    http_port: u16,
    neighbours: Vec<String>,
) -> (Arc<Relay>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), client_port, server_port, http_port, neighbours);
    let relay = Relay::new(config).expect("relay init");
    tokio::spawn(relay.clone().run());
    (relay, dir)
}

async fn connect_ws(port: u16) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let url = format!("ws://127.0.0.1:{port}");
    for _ in 0..50 {
        if let Ok((ws, _)) = connect_async(&url).await {
            return ws;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("relay on port {port} never came up");
}

struct TestClient {
    private: RsaPrivateKey,
    pem: String,
    fp: String,
    counter: u64,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let (private, public) = generate_keypair().expect("keygen");
        let pem = public_key_to_pem(&public).expect("pem");
        Self::connect_with_key(port, private, pem).await
    }

    /// Connect and register with an existing key pair.
    async fn connect_with_key(port: u16, private: RsaPrivateKey, pem: String) -> Self {
        let ws = connect_ws(port).await;
        let mut client = Self {
            fp: fingerprint(&pem),
            private,
            pem,
            counter: 0,
            ws,
        };
        let hello = Payload::Hello {
            public_key: client.pem.clone(),
        };
        client.send(&hello).await;
        client
    }

    async fn send(&mut self, payload: &Payload) {
        self.counter += 1;
        let frame =
            envelope::seal(payload, self.counter, &self.private).expect("seal");
        self.send_raw(frame).await;
    }

    async fn send_raw(&mut self, frame: String) {
        self.ws
            .send(Message::Text(frame))
            .await
            .expect("websocket send");
    }

    /// Next text frame within the deadline, or None.
    async fn recv(&mut self, deadline: Duration) -> Option<String> {
        let read = async {
            while let Some(item) = self.ws.next().await {
                match item {
                    Ok(Message::Text(text)) => return Some(text),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        };
        tokio::time::timeout(deadline, read).await.ok().flatten()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_register_and_client_list() {
    let (relay, _dir) = spawn_relay(21101, 21102, 21103, vec![]);

    let mut alice = TestClient::connect(21101).await;
    alice.send(&Payload::ClientListRequest).await;

    let reply = alice
        .recv(Duration::from_secs(3))
        .await
        .expect("client_list reply");
    let Frame::ClientList(list) = envelope::parse_frame(&reply).unwrap() else {
        panic!("expected client_list, got {reply}");
    };

    let local = &list.servers[0];
    assert_eq!(local.address, "127.0.0.1:21102");
    assert_eq!(local.server_fingerprint, relay.identity().fingerprint());
    assert!(local.clients.iter().any(|pem| fingerprint(pem) == alice.fp));

    // A second socket claiming the same fingerprint is rejected.
    let mut dup =
        TestClient::connect_with_key(21101, alice.private.clone(), alice.pem.clone()).await;
    assert!(
        dup.recv(Duration::from_secs(3)).await.is_none(),
        "duplicate registration must be closed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_public_chat_fanout_and_replay_drop() {
    let (_relay, _dir) = spawn_relay(21201, 21202, 21203, vec![]);

    let mut alice = TestClient::connect(21201).await;
    let mut bob = TestClient::connect(21201).await;
    // Let bob's registration land before alice broadcasts.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let wire = envelope::seal(
        &Payload::PublicChat {
            sender: alice.fp.clone(),
            message: "hi everyone".into(),
        },
        5,
        &alice.private,
    )
    .unwrap();
    alice.send_raw(wire.clone()).await;

    let delivered = bob
        .recv(Duration::from_secs(3))
        .await
        .expect("bob receives the broadcast");
    let Frame::Signed(signed) = envelope::parse_frame(&delivered).unwrap() else {
        panic!("expected signed frame");
    };
    let Payload::PublicChat { sender, message } = envelope::peek(&signed).unwrap() else {
        panic!("expected public_chat");
    };
    assert_eq!(sender, alice.fp);
    assert_eq!(message, "hi everyone");

    // The sender does not get its own copy back.
    assert!(alice.recv(Duration::from_millis(400)).await.is_none());

    // Replaying the exact bytes is dropped: the counter did not advance.
    alice.send_raw(wire).await;
    assert!(bob.recv(Duration::from_millis(400)).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_link_recovers_when_neighbour_comes_up_late() {
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let relay1 = Relay::new(test_config(
        dir1.path(),
        21501,
        21502,
        21503,
        vec!["127.0.0.1:21602".into()],
    ))
    .unwrap();
    let relay2 = Relay::new(test_config(
        dir2.path(),
        21601,
        21602,
        21603,
        vec!["127.0.0.1:21502".into()],
    ))
    .unwrap();
    std::fs::write(
        dir1.path().join("neighbours/127.0.0.1_21602_public_key.pem"),
        relay2.identity().public_key_pem(),
    )
    .unwrap();
    std::fs::write(
        dir2.path().join("neighbours/127.0.0.1_21502_public_key.pem"),
        relay1.identity().public_key_pem(),
    )
    .unwrap();

    // Server 1 runs alone and burns through several failed attempts.
    tokio::spawn(relay1.clone().run());
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Server 2 appears; within the retry cadence the link comes up and
    // the directory resyncs.
    tokio::spawn(relay2.clone().run());
    let mut bob = TestClient::connect(21601).await;
    let mut alice = TestClient::connect(21501).await;

    let mut found = false;
    for _ in 0..30 {
        alice.send(&Payload::ClientListRequest).await;
        if let Some(reply) = alice.recv(Duration::from_secs(2)).await {
            if let Ok(Frame::ClientList(list)) = envelope::parse_frame(&reply) {
                found = list.servers.iter().any(|s| {
                    s.address == "127.0.0.1:21602"
                        && s.clients.iter().any(|pem| fingerprint(pem) == bob.fp)
                });
                if found {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(found, "server2's directory never reappeared on server1");

    // The link is symmetric: server2 learns server1's client too.
    let mut found_back = false;
    for _ in 0..30 {
        bob.send(&Payload::ClientListRequest).await;
        if let Some(reply) = bob.recv(Duration::from_secs(2)).await {
            if let Ok(Frame::ClientList(list)) = envelope::parse_frame(&reply) {
                found_back = list.servers.iter().any(|s| {
                    s.clients.iter().any(|pem| fingerprint(pem) == alice.fp)
                });
                if found_back {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(found_back, "server1's client never reached server2");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_server_chat() {
    let s1_addr = "127.0.0.1:21302".to_string();
    let s2_addr = "127.0.0.1:21402".to_string();

    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let relay1 = Relay::new(test_config(
        dir1.path(),
        21301,
        21302,
        21303,
        vec![s2_addr.clone()],
    ))
    .unwrap();
    let relay2 = Relay::new(test_config(
        dir2.path(),
        21401,
        21402,
        21403,
        vec![s1_addr.clone()],
    ))
    .unwrap();

    // Exchange server keys the way an operator would: drop each PEM into
    // the other's neighbours directory before startup.
    std::fs::write(
        dir1.path().join("neighbours/127.0.0.1_21402_public_key.pem"),
        relay2.identity().public_key_pem(),
    )
    .unwrap();
    std::fs::write(
        dir2.path().join("neighbours/127.0.0.1_21302_public_key.pem"),
        relay1.identity().public_key_pem(),
    )
    .unwrap();

    tokio::spawn(relay1.clone().run());
    tokio::spawn(relay2.clone().run());

    let mut alice = TestClient::connect(21301).await;
    let mut bob = TestClient::connect(21401).await;

    // Poll server1's directory until bob has been gossipped across.
    let mut bob_home = None;
    for _ in 0..40 {
        alice.send(&Payload::ClientListRequest).await;
        if let Some(reply) = alice.recv(Duration::from_secs(2)).await {
            if let Ok(Frame::ClientList(list)) = envelope::parse_frame(&reply) {
                bob_home = list
                    .servers
                    .iter()
                    .find(|s| s.clients.iter().any(|pem| fingerprint(pem) == bob.fp))
                    .map(|s| s.address.clone());
                if bob_home.is_some() {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let bob_home = bob_home.expect("bob never appeared in server1's directory");
    assert_eq!(bob_home, s2_addr);

    // Alice sends an encrypted chat routed to bob's home server.
    let counter = alice.counter + 1;
    alice.counter = counter;
    let wire = compose_chat(
        &alice.fp,
        &alice.private,
        &[Recipient {
            fingerprint: bob.fp.clone(),
            public_key_pem: bob.pem.clone(),
            address: bob_home,
        }],
        "across the neighbourhood",
        counter,
    )
    .unwrap();
    alice.send_raw(wire).await;

    let delivered = bob
        .recv(Duration::from_secs(5))
        .await
        .expect("bob receives the forwarded chat");
    let Frame::Signed(signed) = envelope::parse_frame(&delivered).unwrap() else {
        panic!("expected signed frame");
    };
    let Payload::Chat {
        iv, symm_keys, chat, ..
    } = envelope::peek(&signed).unwrap()
    else {
        panic!("expected chat payload");
    };
    let body = extract_chat(&bob.private, &bob.fp, &iv, &symm_keys, &chat)
        .unwrap()
        .expect("bob decrypts his slot");
    assert_eq!(body.participants, vec![alice.fp.clone(), bob.fp.clone()]);
    assert_eq!(body.message, "across the neighbourhood");

    // Exactly one hop, exactly one copy: nothing else arrives at either end.
    assert!(alice.recv(Duration::from_millis(500)).await.is_none());
    assert!(bob.recv(Duration::from_millis(500)).await.is_none());
}
