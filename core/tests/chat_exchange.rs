//! End-to-end protocol flow without sockets
//!
//! Walks the full message path between two identities: key generation,
//! envelope sealing, wire parsing, signature/counter verification, and
//! multi-recipient decryption — everything except the transport.
//!
//! Run with: cargo test --test chat_exchange

use olaf_core::client::engine::{compose_chat, extract_chat, Recipient};
use olaf_core::crypto::{fingerprint, generate_keypair, public_key_from_pem, public_key_to_pem};
use olaf_core::envelope::{self, Frame, Payload};

struct Party {
    private: rsa::RsaPrivateKey,
    pem: String,
    fp: String,
}

fn party() -> Party {
    let (private, public) = generate_keypair().expect("keygen");
    let pem = public_key_to_pem(&public).expect("pem export");
    let fp = fingerprint(&pem);
    Party { private, pem, fp }
}

#[test]
fn test_two_party_chat_flow() {
    // Alice on server1, Bob on server2.
    let alice = party();
    let bob = party();

    // Step 1: Alice composes an encrypted chat addressed to Bob's home.
    let wire = compose_chat(
        &alice.fp,
        &alice.private,
        &[Recipient {
            fingerprint: bob.fp.clone(),
            public_key_pem: bob.pem.clone(),
            address: "server2:8766".into(),
        }],
        "Hello Bob, this is Alice.",
        1,
    )
    .expect("compose");

    // Step 2: the frame parses as a signed envelope with a chat payload
    // destined for exactly server2.
    let Frame::Signed(signed) = envelope::parse_frame(&wire).expect("parse") else {
        panic!("expected signed frame");
    };
    let Payload::Chat {
        destination_servers,
        iv,
        symm_keys,
        chat,
    } = envelope::peek(&signed).expect("peek")
    else {
        panic!("expected chat payload");
    };
    assert_eq!(destination_servers, vec!["server2:8766"]);
    assert_eq!(symm_keys.len(), 1);

    // Step 3: Bob verifies Alice's envelope signature from his directory
    // and decrypts his slot.
    let alice_key = public_key_from_pem(&alice.pem).expect("alice key");
    envelope::open(&signed, &alice_key, 0).expect("envelope must verify");

    let body = extract_chat(&bob.private, &bob.fp, &iv, &symm_keys, &chat)
        .expect("extract")
        .expect("bob is a participant");
    assert_eq!(body.participants, vec![alice.fp.clone(), bob.fp.clone()]);
    assert_eq!(body.message, "Hello Bob, this is Alice.");
}

#[test]
fn test_replayed_envelope_is_rejected() {
    let alice = party();
    let alice_key = public_key_from_pem(&alice.pem).unwrap();

    let wire = envelope::seal(
        &Payload::PublicChat {
            sender: alice.fp.clone(),
            message: "hi".into(),
        },
        5,
        &alice.private,
    )
    .unwrap();
    let Frame::Signed(signed) = envelope::parse_frame(&wire).unwrap() else {
        panic!("expected signed frame");
    };

    // First delivery is accepted at last_seen = 0; the exact same bytes
    // replayed after the counter advanced are not.
    envelope::open(&signed, &alice_key, 0).expect("first delivery");
    assert!(envelope::open(&signed, &alice_key, 5).is_err());
}

#[test]
fn test_fingerprints_survive_the_directory_roundtrip() {
    // A key that travels hello → client_update → client_list must map to
    // the same fingerprint at every hop.
    let alice = party();

    let gossip = envelope::client_update_frame(&[alice.pem.clone()]);
    let Frame::ClientUpdate(update) = envelope::parse_frame(&gossip).unwrap() else {
        panic!("expected client_update");
    };
    assert_eq!(fingerprint(&update.clients[0]), alice.fp);

    let listing = envelope::client_list_frame(&[envelope::ServerEntry {
        address: "server1:8766".into(),
        server_fingerprint: "unused".into(),
        clients: update.clients,
    }]);
    let Frame::ClientList(list) = envelope::parse_frame(&listing).unwrap() else {
        panic!("expected client_list");
    };
    assert_eq!(fingerprint(&list.servers[0].clients[0]), alice.fp);
}
