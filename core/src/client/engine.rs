// Client protocol engine — registration, directory cache, end-to-end
// encryption
//
// Owns the WebSocket to the home server. Outbound chats wrap a fresh
// AES key for every recipient; inbound chats are opened by trying every
// symm_keys slot and verified against the sender's directory key. A
// frame from an unknown sender triggers one directory refresh before it
// is dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use futures::StreamExt;
use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::client::store::{MessageStore, StorageError, StoredMessage};
use crate::config::ClientConfig;
use crate::crypto::{self, CryptoError};
use crate::envelope::{self, ChatBody, EnvelopeError, Frame, Payload, SignedFrame};
use crate::identity::{Identity, IdentityError};
use crate::transport::{self, FrameTx};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("not connected to the home server")]
    NotConnected,
    #[error("none of the requested recipients are known")]
    NoKnownRecipients,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Connecting,
    HelloSent,
    Ready,
    Closed,
}

/// A directory entry learned from `client_list`.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub public_key_pem: String,
    /// Home-server address.
    pub address: String,
}

/// A resolved chat recipient.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub fingerprint: String,
    pub public_key_pem: String,
    pub address: String,
}

/// Outcome of processing one inbound signed frame.
enum Handled {
    Done,
    /// The sender is not in the directory; the frame may be retried once
    /// after a refresh.
    NeedDirectory,
}

pub struct ClientEngine {
    config: ClientConfig,
    identity: Identity,
    counter: AtomicU64,
    state: Mutex<EngineState>,
    directory: Mutex<HashMap<String, DirectoryEntry>>,
    /// Per-sender replay floor for inbound envelopes.
    last_counters: Mutex<HashMap<String, u64>>,
    outbound: Mutex<Option<FrameTx>>,
    store: MessageStore,
    /// Frames parked for one retry after a directory refresh.
    pending: Mutex<Vec<String>>,
}

impl ClientEngine {
    pub fn new(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        let identity =
            Identity::load_or_generate(&config.config_dir, "private_key.pem", "public_key.pem")?;
        let store = MessageStore::open(&config.chat_data_dir, config.message_expiry)?;
        info!(fingerprint = %identity.fingerprint(), "client identity ready");
        Ok(Arc::new(Self {
            config,
            identity,
            counter: AtomicU64::new(0),
            state: Mutex::new(EngineState::Idle),
            directory: Mutex::new(HashMap::new()),
            last_counters: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            store,
            pending: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Fingerprints currently known from the directory, sorted.
    pub fn known_clients(&self) -> Vec<String> {
        let mut fps: Vec<String> = self.directory.lock().keys().cloned().collect();
        fps.sort();
        fps
    }

    /// Received messages since the last poll.
    pub fn drain_messages(&self) -> Vec<StoredMessage> {
        self.store.drain_unread()
    }

    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn send_frame(&self, frame: String) -> Result<(), ClientError> {
        let tx = self.outbound.lock().clone().ok_or(ClientError::NotConnected)?;
        tx.send(frame).await.map_err(|_| ClientError::NotConnected)
    }

    /// Ask the home server for a fresh directory.
    pub async fn request_client_list(&self) -> Result<(), ClientError> {
        let frame = envelope::seal(
            &Payload::ClientListRequest,
            self.next_counter(),
            self.identity.private_key(),
        )?;
        self.send_frame(frame).await
    }

    pub async fn send_public_chat(&self, text: &str) -> Result<(), ClientError> {
        let frame = envelope::seal(
            &Payload::PublicChat {
                sender: self.identity.fingerprint().to_string(),
                message: text.to_string(),
            },
            self.next_counter(),
            self.identity.private_key(),
        )?;
        self.send_frame(frame).await
    }

    /// Encrypt and send a private chat to a set of recipient fingerprints.
    /// Unknown fingerprints are skipped with a warning.
    pub async fn send_chat(&self, recipients: &[String], text: &str) -> Result<(), ClientError> {
        let resolved: Vec<Recipient> = {
            let directory = self.directory.lock();
            recipients
                .iter()
                .filter_map(|fp| match directory.get(fp) {
                    Some(entry) => Some(Recipient {
                        fingerprint: fp.clone(),
                        public_key_pem: entry.public_key_pem.clone(),
                        address: entry.address.clone(),
                    }),
                    None => {
                        warn!(recipient = %fp, "recipient not in directory, skipping");
                        None
                    }
                })
                .collect()
        };
        if resolved.is_empty() {
            return Err(ClientError::NoKnownRecipients);
        }
        let frame = compose_chat(
            self.identity.fingerprint(),
            self.identity.private_key(),
            &resolved,
            text,
            self.next_counter(),
        )?;
        self.send_frame(frame).await
    }

    /// Connect, register, and pump inbound frames until the connection
    /// closes. The core never reconnects on its own; a restarted engine
    /// re-registers with a fresh hello.
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        *self.state.lock() = EngineState::Connecting;
        let (ws, _) = connect_async(self.config.ws_url()).await.map_err(|e| {
            *self.state.lock() = EngineState::Closed;
            ClientError::Transport(e.to_string())
        })?;
        let (sink, mut reader) = ws.split();
        let tx = transport::spawn_writer(sink);
        *self.outbound.lock() = Some(tx);

        let hello = envelope::seal(
            &Payload::Hello {
                public_key: self.identity.public_key_pem().to_string(),
            },
            self.next_counter(),
            self.identity.private_key(),
        )?;
        self.send_frame(hello).await?;
        *self.state.lock() = EngineState::HelloSent;

        // Prime the directory so the first send has addresses to work with.
        self.request_client_list().await?;
        *self.state.lock() = EngineState::Ready;
        info!(server = %self.config.ws_url(), "registered with home server");

        while let Some(text) = transport::read_text(&mut reader).await {
            self.handle_frame(&text).await;
        }

        *self.state.lock() = EngineState::Closed;
        *self.outbound.lock() = None;
        info!("home server connection closed");
        Ok(())
    }

    async fn handle_frame(&self, text: &str) {
        match envelope::parse_frame(text) {
            Err(e) => debug!("dropping inbound frame: {e}"),
            Ok(Frame::ClientUpdate(_)) => {
                debug!("client_update is server-to-server, dropped");
            }
            Ok(Frame::ClientList(list)) => {
                self.absorb_client_list(list.servers);
                // Frames that were waiting on the directory get exactly one
                // retry; still-unknown senders are dropped.
                let parked: Vec<String> = std::mem::take(&mut *self.pending.lock());
                for raw in parked {
                    let Ok(Frame::Signed(signed)) = envelope::parse_frame(&raw) else {
                        continue;
                    };
                    match self.process_signed(&signed) {
                        Ok(Handled::Done) => {}
                        Ok(Handled::NeedDirectory) => {
                            warn!("sender still unknown after refresh, dropping frame");
                        }
                        Err(e) => warn!("dropping retried frame: {e}"),
                    }
                }
            }
            Ok(Frame::Signed(signed)) => match self.process_signed(&signed) {
                Ok(Handled::Done) => {}
                Ok(Handled::NeedDirectory) => {
                    self.pending.lock().push(text.to_string());
                    if let Err(e) = self.request_client_list().await {
                        warn!("directory refresh failed: {e}");
                    }
                }
                Err(e) => warn!("dropping inbound frame: {e}"),
            },
        }
    }

    fn absorb_client_list(&self, servers: Vec<envelope::ServerEntry>) {
        let mut directory = self.directory.lock();
        directory.clear();
        // The home server lists itself first; if a stale gossip entry still
        // claims one of its fingerprints, the first (home) claim wins.
        for server in servers {
            for pem in server.clients {
                if crypto::public_key_from_pem(&pem).is_err() {
                    warn!(address = %server.address, "bad client key in client_list, skipping");
                    continue;
                }
                let fp = crypto::fingerprint(&pem);
                directory.entry(fp).or_insert_with(|| DirectoryEntry {
                    public_key_pem: pem,
                    address: server.address.clone(),
                });
            }
        }
        debug!(known = directory.len(), "directory refreshed");
    }

    /// Verify an envelope against a directory sender and the replay floor.
    fn verify_sender(&self, sender_fp: &str, signed: &SignedFrame) -> Result<Handled, ClientError> {
        let Some(entry) = self.directory.lock().get(sender_fp).cloned() else {
            return Ok(Handled::NeedDirectory);
        };
        let key = crypto::public_key_from_pem(&entry.public_key_pem)?;
        let last = self
            .last_counters
            .lock()
            .get(sender_fp)
            .copied()
            .unwrap_or(0);
        envelope::open(signed, &key, last)?;
        self.last_counters
            .lock()
            .insert(sender_fp.to_string(), signed.counter);
        Ok(Handled::Done)
    }

    fn process_signed(&self, signed: &SignedFrame) -> Result<Handled, ClientError> {
        match envelope::peek(signed)? {
            Payload::Chat {
                iv, symm_keys, chat, ..
            } => {
                let Some(body) = extract_chat(
                    self.identity.private_key(),
                    self.identity.fingerprint(),
                    &iv,
                    &symm_keys,
                    &chat,
                )?
                else {
                    debug!("chat not addressed to us");
                    return Ok(Handled::Done);
                };
                let sender_fp = body
                    .participants
                    .first()
                    .cloned()
                    .unwrap_or_default();
                match self.verify_sender(&sender_fp, signed)? {
                    Handled::NeedDirectory => Ok(Handled::NeedDirectory),
                    Handled::Done => {
                        self.store.append(&sender_fp, &body.message)?;
                        info!(sender = %sender_fp, "chat received");
                        Ok(Handled::Done)
                    }
                }
            }
            Payload::PublicChat { sender, message } => match self.verify_sender(&sender, signed)? {
                Handled::NeedDirectory => Ok(Handled::NeedDirectory),
                Handled::Done => {
                    self.store.append(&sender, &message)?;
                    info!(sender = %sender, "public chat received");
                    Ok(Handled::Done)
                }
            },
            other => {
                debug!("unexpected payload from server dropped: {other:?}");
                Ok(Handled::Done)
            }
        }
    }
}

// ============================================================================
// CHAT COMPOSITION
// ============================================================================

/// Build a sealed `chat` frame. `destination_servers` is the sorted,
/// deduplicated set of recipient home addresses; `symm_keys` is grouped
/// by destination order with the caller's recipient order within each
/// group. Receivers try every slot, so ordering is a convention, not a
/// contract.
pub fn compose_chat(
    sender_fp: &str,
    private_key: &RsaPrivateKey,
    recipients: &[Recipient],
    text: &str,
    counter: u64,
) -> Result<String, ClientError> {
    let destination_servers: Vec<String> = recipients
        .iter()
        .map(|r| r.address.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let key = crypto::generate_aes_key();
    let iv = crypto::generate_iv();

    let mut symm_keys = Vec::with_capacity(recipients.len());
    for dest in &destination_servers {
        for recipient in recipients.iter().filter(|r| &r.address == dest) {
            let public = crypto::public_key_from_pem(&recipient.public_key_pem)?;
            symm_keys.push(B64.encode(crypto::oaep_encrypt(&public, &key)?));
        }
    }

    let mut participants = Vec::with_capacity(recipients.len() + 1);
    participants.push(sender_fp.to_string());
    participants.extend(recipients.iter().map(|r| r.fingerprint.clone()));
    let body = ChatBody {
        participants,
        message: text.to_string(),
    };
    let plaintext = serde_json::to_vec(&body)
        .map_err(|e| ClientError::Transport(format!("chat body serialization: {e}")))?;
    let sealed = crypto::gcm_encrypt(&key, &iv, &plaintext)?;

    let payload = Payload::Chat {
        destination_servers,
        iv: B64.encode(iv),
        symm_keys,
        chat: B64.encode(sealed),
    };
    Ok(envelope::seal(&payload, counter, private_key)?)
}

/// Open an inbound `chat` payload. Ok(None) when no slot is ours or our
/// fingerprint is absent from the participants; an error means a slot
/// was ours but the ciphertext failed authentication.
pub fn extract_chat(
    private_key: &RsaPrivateKey,
    own_fp: &str,
    iv_b64: &str,
    symm_keys: &[String],
    chat_b64: &str,
) -> Result<Option<ChatBody>, ClientError> {
    let iv = B64
        .decode(iv_b64)
        .map_err(|_| ClientError::Crypto(CryptoError::Cipher))?;
    let sealed = B64
        .decode(chat_b64)
        .map_err(|_| ClientError::Crypto(CryptoError::Cipher))?;

    for slot in symm_keys {
        let Ok(wrapped) = B64.decode(slot) else {
            continue;
        };
        let Ok(key) = crypto::oaep_decrypt(private_key, &wrapped) else {
            continue;
        };
        // OAEP only unwraps for the holder of the private key, so this
        // slot is ours: a GCM failure now means tampering, not mismatch.
        let plaintext = crypto::gcm_decrypt(&key, &iv, &sealed)?;
        let body: ChatBody = serde_json::from_slice(&plaintext)
            .map_err(|_| ClientError::Crypto(CryptoError::Cipher))?;
        if body.participants.iter().any(|fp| fp == own_fp) {
            return Ok(Some(body));
        }
        return Ok(None);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{fingerprint, generate_keypair, public_key_to_pem};
    use rsa::RsaPublicKey;

    struct Party {
        private: RsaPrivateKey,
        pem: String,
        fp: String,
    }

    fn party() -> Party {
        let (private, public) = generate_keypair().unwrap();
        let pem = public_key_to_pem(&public).unwrap();
        let fp = fingerprint(&pem);
        Party { private, pem, fp }
    }

    fn recipient(p: &Party, address: &str) -> Recipient {
        Recipient {
            fingerprint: p.fp.clone(),
            public_key_pem: p.pem.clone(),
            address: address.to_string(),
        }
    }

    fn chat_fields(wire: &str) -> (Vec<String>, String, Vec<String>, String, SignedFrame) {
        let Frame::Signed(signed) = envelope::parse_frame(wire).unwrap() else {
            panic!("expected signed frame");
        };
        let Payload::Chat {
            destination_servers,
            iv,
            symm_keys,
            chat,
        } = envelope::peek(&signed).unwrap()
        else {
            panic!("expected chat payload");
        };
        (destination_servers, iv, symm_keys, chat, signed)
    }

    #[test]
    fn test_compose_groups_destinations_sorted_unique() {
        let alice = party();
        let bob = party();
        let carol = party();
        let dave = party();

        // Two recipients on server B, one on server A; A sorts first.
        let wire = compose_chat(
            &alice.fp,
            &alice.private,
            &[
                recipient(&bob, "serverB:8766"),
                recipient(&carol, "serverA:8766"),
                recipient(&dave, "serverB:8766"),
            ],
            "meeting at noon",
            1,
        )
        .unwrap();

        let (destinations, _, symm_keys, _, _) = chat_fields(&wire);
        assert_eq!(destinations, vec!["serverA:8766", "serverB:8766"]);
        assert_eq!(symm_keys.len(), 3);

        // The first slot belongs to serverA's recipient (carol), the rest
        // keep the caller's order within serverB's group (bob, dave).
        let (_, iv, keys, chat, _) = chat_fields(&wire);
        let carol_body = extract_chat(&carol.private, &carol.fp, &iv, &keys[..1], &chat)
            .unwrap()
            .expect("carol owns the first slot");
        assert_eq!(carol_body.message, "meeting at noon");
    }

    #[test]
    fn test_every_recipient_decrypts_and_envelope_verifies() {
        let alice = party();
        let bob = party();
        let carol = party();

        let wire = compose_chat(
            &alice.fp,
            &alice.private,
            &[
                recipient(&bob, "serverA:8766"),
                recipient(&carol, "serverB:8766"),
            ],
            "hello both",
            7,
        )
        .unwrap();
        let (_, iv, keys, chat, signed) = chat_fields(&wire);

        for p in [&bob, &carol] {
            let body = extract_chat(&p.private, &p.fp, &iv, &keys, &chat)
                .unwrap()
                .expect("recipient slot must decrypt");
            assert_eq!(body.message, "hello both");
            assert_eq!(body.participants, vec![
                alice.fp.clone(),
                bob.fp.clone(),
                carol.fp.clone()
            ]);
        }

        // The envelope verifies against the sender's key from the directory.
        let alice_public: RsaPublicKey =
            crypto::public_key_from_pem(&alice.pem).unwrap();
        assert!(envelope::open(&signed, &alice_public, 6).is_ok());
    }

    #[test]
    fn test_non_participant_cannot_read() {
        let alice = party();
        let bob = party();
        let eve = party();

        let wire = compose_chat(
            &alice.fp,
            &alice.private,
            &[recipient(&bob, "serverA:8766")],
            "for bob only",
            1,
        )
        .unwrap();
        let (_, iv, keys, chat, _) = chat_fields(&wire);

        assert!(extract_chat(&eve.private, &eve.fp, &iv, &keys, &chat)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_tampered_ciphertext_is_an_error_not_a_miss() {
        let alice = party();
        let bob = party();

        let wire = compose_chat(
            &alice.fp,
            &alice.private,
            &[recipient(&bob, "serverA:8766")],
            "original",
            1,
        )
        .unwrap();
        let (_, iv, keys, chat, _) = chat_fields(&wire);

        // Flip one byte of the ciphertext.
        let mut sealed = B64.decode(&chat).unwrap();
        sealed[0] ^= 0x01;
        let tampered = B64.encode(sealed);

        assert!(matches!(
            extract_chat(&bob.private, &bob.fp, &iv, &keys, &tampered),
            Err(ClientError::Crypto(CryptoError::Cipher))
        ));
    }
}
