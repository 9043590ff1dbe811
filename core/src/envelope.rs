// Wire envelope — build, parse, and authenticate signed frames
//
// Every protocol action rides in a `signed_data` envelope:
//
//   {"type":"signed_data","data":{...},"counter":N,"signature":"<b64>"}
//
// The signature is PSS over `bytes(JSON(data)) || ascii(counter)`. The
// sender serializes `data` exactly once and transmits those bytes; the
// verifier hashes the raw `data` slice as received (`RawValue`), so no
// canonicalization exists anywhere in the pipeline. `client_list` and
// `client_update` are unsigned directory hints and sit outside the
// envelope.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::crypto::{self, CryptoError};

/// Frames larger than this are dropped before any parsing.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    Oversize(usize),
    #[error("bad JSON: {0}")]
    Json(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("unknown inner type '{0}'")]
    UnknownInnerType(String),
    #[error("counter {counter} not greater than last seen {last_seen}")]
    Replay { counter: u64, last_seen: u64 },
    #[error("signature is not valid Base64")]
    BadSignatureEncoding,
    #[error("signature verification failed")]
    Signature,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Outer signed envelope. `data` keeps the exact bytes off the wire.
#[derive(Debug, Deserialize)]
pub struct SignedFrame {
    pub data: Box<RawValue>,
    pub counter: u64,
    pub signature: String,
}

/// The six payload types that may ride inside `signed_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Hello {
        public_key: String,
    },
    Chat {
        destination_servers: Vec<String>,
        iv: String,
        symm_keys: Vec<String>,
        chat: String,
    },
    PublicChat {
        sender: String,
        message: String,
    },
    ClientUpdateRequest,
    ClientListRequest,
    ServerHello {
        sender: String,
    },
}

/// One server's entry in a `client_list` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    pub server_fingerprint: String,
    /// Public key PEMs of the clients homed on this server. Fingerprints
    /// derive locally as base64(sha256(pem)).
    pub clients: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClientListFrame {
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ClientUpdateFrame {
    pub clients: Vec<String>,
}

/// A parsed top-level frame.
#[derive(Debug)]
pub enum Frame {
    Signed(SignedFrame),
    ClientList(ClientListFrame),
    ClientUpdate(ClientUpdateFrame),
}

/// Plaintext carried inside an encrypted `chat` payload. The sender's
/// fingerprint is always `participants[0]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBody {
    pub participants: Vec<String>,
    pub message: String,
}

// ============================================================================
// PARSING
// ============================================================================

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse a top-level frame, dispatching on its `type` field.
pub fn parse_frame(text: &str) -> Result<Frame, EnvelopeError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(EnvelopeError::Oversize(text.len()));
    }
    let probe: TypeProbe =
        serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    match probe.kind.as_str() {
        "signed_data" => {
            let frame = serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
            Ok(Frame::Signed(frame))
        }
        "client_list" => {
            let frame = serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
            Ok(Frame::ClientList(frame))
        }
        "client_update" => {
            let frame = serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
            Ok(Frame::ClientUpdate(frame))
        }
        other => Err(EnvelopeError::UnknownType(other.to_string())),
    }
}

/// Parse the inner payload without verifying the signature.
///
/// Used where the envelope is authenticated elsewhere — a relay passing a
/// peer-delivered chat through to its clients leaves verification to the
/// recipients, who hold the sender's key.
pub fn peek(frame: &SignedFrame) -> Result<Payload, EnvelopeError> {
    let probe: TypeProbe =
        serde_json::from_str(frame.data.get()).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    match probe.kind.as_str() {
        "hello" | "chat" | "public_chat" | "client_update_request" | "client_list_request"
        | "server_hello" => serde_json::from_str(frame.data.get())
            .map_err(|e| EnvelopeError::Json(e.to_string())),
        other => Err(EnvelopeError::UnknownInnerType(other.to_string())),
    }
}

// ============================================================================
// SEAL / OPEN
// ============================================================================

fn signing_input(data: &str, counter: u64) -> Vec<u8> {
    let mut input = Vec::with_capacity(data.len() + 20);
    input.extend_from_slice(data.as_bytes());
    input.extend_from_slice(counter.to_string().as_bytes());
    input
}

#[derive(Serialize)]
struct SignedWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a RawValue,
    counter: u64,
    signature: String,
}

/// Build an outbound envelope: serialize the payload once, sign the exact
/// bytes together with the ASCII counter, and carry those bytes through.
pub fn seal(payload: &Payload, counter: u64, key: &RsaPrivateKey) -> Result<String, EnvelopeError> {
    let data = serde_json::to_string(payload).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    let signature = B64.encode(crypto::sign_pss(key, &signing_input(&data, counter))?);
    let raw = RawValue::from_string(data).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    let wire = SignedWire {
        kind: "signed_data",
        data: &raw,
        counter,
        signature,
    };
    serde_json::to_string(&wire).map_err(|e| EnvelopeError::Json(e.to_string()))
}

/// Authenticate an inbound envelope against the sender's key and counter.
///
/// Accepts iff `counter > last_seen` and the PSS signature covers the raw
/// `data` bytes concatenated with the ASCII counter. Returns the parsed
/// payload; the caller is responsible for persisting the new counter.
pub fn open(
    frame: &SignedFrame,
    sender_key: &RsaPublicKey,
    last_seen: u64,
) -> Result<Payload, EnvelopeError> {
    if frame.counter <= last_seen {
        return Err(EnvelopeError::Replay {
            counter: frame.counter,
            last_seen,
        });
    }
    let signature = B64
        .decode(&frame.signature)
        .map_err(|_| EnvelopeError::BadSignatureEncoding)?;
    crypto::verify_pss(
        sender_key,
        &signing_input(frame.data.get(), frame.counter),
        &signature,
    )
    .map_err(|_| EnvelopeError::Signature)?;
    peek(frame)
}

// ============================================================================
// UNSIGNED FRAMES
// ============================================================================

#[derive(Serialize)]
struct ClientListWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    servers: &'a [ServerEntry],
}

pub fn client_list_frame(servers: &[ServerEntry]) -> String {
    serde_json::to_string(&ClientListWire {
        kind: "client_list",
        servers,
    })
    .expect("client_list serialization cannot fail")
}

#[derive(Serialize)]
struct ClientUpdateWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    clients: &'a [String],
}

pub fn client_update_frame(clients: &[String]) -> String {
    serde_json::to_string(&ClientUpdateWire {
        kind: "client_update",
        clients,
    })
    .expect("client_update serialization cannot fail")
}

// ============================================================================
// LOG SANITIZATION
// ============================================================================

/// Copy of a frame with key material and signatures masked, for
/// `LOG_MESSAGES` output.
pub fn sanitize_frame(text: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(text) else {
        return "[not JSON]".to_string();
    };
    if let Some(sig) = value.get_mut("signature") {
        *sig = serde_json::Value::String("[omitted]".into());
    }
    if let Some(data) = value.get_mut("data") {
        if let Some(pk) = data.get_mut("public_key") {
            *pk = serde_json::Value::String("[omitted]".into());
        }
    }
    if let Some(clients) = value.get_mut("clients").and_then(|c| c.as_array_mut()) {
        for entry in clients {
            *entry = serde_json::Value::String("[omitted]".into());
        }
    }
    value.to_string()
}
