// Client-facing connection task
//
// One task per accepted client socket. The first frame must be a valid
// signed `hello`; every later frame is authenticated against the stored
// key and counter before any routing happens.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError};
use crate::envelope::{self, EnvelopeError, Frame, Payload};
use crate::relay::{LocalClient, Relay};
use crate::transport::{self, HANDSHAKE_TIMEOUT_SECS};

/// Consecutive signature failures tolerated before disconnecting.
const SIGNATURE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Error)]
enum RegisterError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("first frame must be a signed hello")]
    NotHello,
    #[error("fingerprint {0} is already connected")]
    Duplicate(String),
}

pub(crate) async fn handle(relay: Arc<Relay>, stream: TcpStream) {
    let deadline = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
    let ws = match tokio::time::timeout(deadline, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("client websocket handshake failed: {e}");
            return;
        }
        Err(_) => return,
    };
    let (sink, mut reader) = ws.split();
    let tx = transport::spawn_writer(sink);

    // Registration: exactly one valid signed hello, within the deadline.
    let Some(hello_text) = transport::read_text_deadline(&mut reader, deadline).await else {
        debug!("client closed before hello");
        return;
    };
    relay.log_frame("recv client", &hello_text);

    let fingerprint = match register(&relay, &hello_text, &tx) {
        Ok(fp) => fp,
        Err(e) => {
            warn!("client registration rejected: {e}");
            return;
        }
    };
    info!(client = %fingerprint, "client registered");
    relay.gossip_client_update();

    let mut signature_failures = 0u32;
    while let Some(text) = transport::read_text(&mut reader).await {
        relay.log_frame("recv client", &text);
        match handle_frame(&relay, &fingerprint, &text) {
            Ok(()) => signature_failures = 0,
            Err(e) => {
                warn!(client = %fingerprint, "dropping client frame: {e}");
                if matches!(
                    e,
                    EnvelopeError::Signature | EnvelopeError::BadSignatureEncoding
                ) {
                    signature_failures += 1;
                    if signature_failures >= SIGNATURE_FAILURE_LIMIT {
                        warn!(client = %fingerprint, "repeated signature failures, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    let removed = relay.state.lock().clients.remove(&fingerprint).is_some();
    if removed {
        info!(client = %fingerprint, "client disconnected");
        relay.gossip_client_update();
    }
}

/// Validate the hello frame and insert the client record. The hello is
/// self-signed: the envelope must verify against the key it carries, with
/// a counter of at least 1.
fn register(
    relay: &Relay,
    hello_text: &str,
    tx: &transport::FrameTx,
) -> Result<String, RegisterError> {
    let Frame::Signed(signed) = envelope::parse_frame(hello_text)? else {
        return Err(RegisterError::NotHello);
    };
    let Payload::Hello { public_key } = envelope::peek(&signed)? else {
        return Err(RegisterError::NotHello);
    };
    let key = crypto::public_key_from_pem(&public_key)?;
    envelope::open(&signed, &key, 0)?;

    let fingerprint = crypto::fingerprint(&public_key);
    {
        let mut st = relay.state.lock();
        if st.clients.contains_key(&fingerprint) {
            return Err(RegisterError::Duplicate(fingerprint));
        }
        st.clients.insert(
            fingerprint.clone(),
            LocalClient {
                public_key_pem: public_key.clone(),
                counter: signed.counter,
                tx: tx.clone(),
            },
        );
    }
    relay.persist_client_key(&fingerprint, &public_key);
    Ok(fingerprint)
}

/// Authenticate and dispatch one frame from a registered client.
fn handle_frame(relay: &Relay, fingerprint: &str, text: &str) -> Result<(), EnvelopeError> {
    let frame = envelope::parse_frame(text)?;
    let Frame::Signed(signed) = frame else {
        debug!(client = %fingerprint, "unsigned frame from client dropped");
        return Ok(());
    };

    let (pem, last_counter, tx) = {
        let st = relay.state.lock();
        let Some(client) = st.clients.get(fingerprint) else {
            return Ok(());
        };
        (client.public_key_pem.clone(), client.counter, client.tx.clone())
    };
    let key = crypto::public_key_from_pem(&pem)?;
    let payload = envelope::open(&signed, &key, last_counter)?;
    {
        let mut st = relay.state.lock();
        if let Some(client) = st.clients.get_mut(fingerprint) {
            if signed.counter > client.counter {
                client.counter = signed.counter;
            }
        }
    }

    match payload {
        Payload::ClientListRequest => {
            let reply = relay.build_client_list();
            relay.log_frame("send client", &reply);
            if !transport::try_queue(&tx, reply) {
                debug!(client = %fingerprint, "client_list reply not queued");
            }
        }
        Payload::Chat {
            destination_servers,
            ..
        } => {
            relay.route_chat(text, &destination_servers, fingerprint);
        }
        Payload::PublicChat { .. } => {
            relay.fan_out_local(text, Some(fingerprint));
            relay.broadcast_to_peers(text);
        }
        Payload::Hello { .. } => {
            debug!(client = %fingerprint, "duplicate hello dropped");
        }
        Payload::ClientUpdateRequest | Payload::ServerHello { .. } => {
            debug!(client = %fingerprint, "peer-only payload from client dropped");
        }
    }
    Ok(())
}
