// Neighbourhood registry — peer addresses, keys, and reconnect tasks
//
// Membership is static per process: the address list comes from the
// environment, one PEM per neighbour sits in the neighbours directory
// as `<host>_<port>_public_key.pem`. Keys are re-read on every connect
// attempt so a key dropped in via `/upload_key` is picked up without a
// restart.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::crypto::{self, CryptoError};
use crate::envelope::{self, EnvelopeError, Payload};
use crate::relay::{self, LinkState, Relay};
use crate::transport::{self, HANDSHAKE_TIMEOUT_SECS};

/// Seconds between connect attempts. Connected links do not back off.
pub const RECONNECT_INTERVAL_SECS: u64 = 2;
/// Consecutive failures before the retry loop escalates to a warning.
/// It never gives up; the cadence stays the same.
pub const FAILURE_WARN_THRESHOLD: u32 = 5;
/// How long a handshaking link waits for a first inbound frame before
/// being considered Connected anyway.
const CONNECTED_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("no public key registered for neighbour '{0}'")]
    MissingKey(String),
    #[error("connect to '{0}' failed: {1}")]
    Connect(String, String),
    #[error("link to '{0}' rejected our frames")]
    Rejected(String),
}

/// The configured neighbour set and its key directory.
pub struct Neighbourhood {
    addresses: Vec<String>,
    dir: PathBuf,
}

impl Neighbourhood {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            addresses: config.neighbour_addresses.clone(),
            dir: config.neighbours_dir.clone(),
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// `host:port` → `host_port_public_key.pem`.
    pub fn key_file_name(address: &str) -> Option<String> {
        let (host, port) = address.rsplit_once(':')?;
        Some(format!("{host}_{port}_public_key.pem"))
    }

    /// Load and validate the registered key for a neighbour. Ok(None)
    /// when no key file has been dropped in yet.
    pub fn load_key(&self, address: &str) -> Result<Option<String>, RegistryError> {
        let Some(name) = Self::key_file_name(address) else {
            return Ok(None);
        };
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let pem = fs::read_to_string(&path)?;
        crypto::public_key_from_pem(&pem)?;
        Ok(Some(pem))
    }
}

/// Own the link to one configured neighbour for the process lifetime:
/// Disconnected → Connecting → Handshaking → Connected, back to
/// Disconnected on any I/O or signature failure, retrying forever on a
/// fixed interval.
pub async fn maintain_link(relay: Arc<Relay>, address: String) {
    let mut failures = 0u32;
    loop {
        relay.set_peer_state(&address, LinkState::Connecting);
        match run_outbound(&relay, &address).await {
            Ok(()) => {
                // The link was up and has closed; reconnect promptly.
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                if failures == FAILURE_WARN_THRESHOLD {
                    warn!(peer = %address, attempts = failures, "still unreachable: {e}");
                } else {
                    debug!(peer = %address, "connect attempt failed: {e}");
                }
            }
        }
        relay.set_peer_state(&address, LinkState::Disconnected);
        tokio::time::sleep(Duration::from_secs(RECONNECT_INTERVAL_SECS)).await;
    }
}

/// One outbound connection attempt and, on success, the life of the link.
async fn run_outbound(relay: &Arc<Relay>, address: &str) -> Result<(), RegistryError> {
    let key_pem = relay
        .neighbourhood()
        .load_key(address)?
        .ok_or_else(|| RegistryError::MissingKey(address.to_string()))?;

    let url = format!("ws://{address}");
    let (ws, _) = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        connect_async(&url),
    )
    .await
    .map_err(|_| RegistryError::Connect(address.to_string(), "timed out".into()))?
    .map_err(|e| RegistryError::Connect(address.to_string(), e.to_string()))?;

    let (sink, mut reader) = ws.split();
    let tx = transport::spawn_writer(sink);

    // Handshaking: identify ourselves under our own key.
    let hello = envelope::seal(
        &Payload::ServerHello {
            sender: relay.address().to_string(),
        },
        relay.next_counter(),
        relay.identity().private_key(),
    )?;
    relay.log_frame("send peer", &hello);
    if !transport::try_queue(&tx, hello) {
        return Err(RegistryError::Rejected(address.to_string()));
    }
    let link_id = relay.register_peer_link(
        address,
        tx.clone(),
        Some(key_pem),
        LinkState::Handshaking,
        0,
    );

    // There is no explicit ack: Connected on the first inbound frame or
    // when the grace period elapses.
    let first_frame = tokio::select! {
        text = transport::read_text(&mut reader) => match text {
            Some(text) => Some(text),
            None => {
                relay.clear_peer_link(address, link_id);
                return Err(RegistryError::Connect(
                    address.to_string(),
                    "closed during handshake".into(),
                ));
            }
        },
        _ = tokio::time::sleep(CONNECTED_GRACE) => None,
    };
    relay.set_peer_state(address, LinkState::Connected);
    info!(peer = %address, "peer connected (outbound)");

    // Resync the neighbour's directory.
    let request = envelope::seal(
        &Payload::ClientUpdateRequest,
        relay.next_counter(),
        relay.identity().private_key(),
    )?;
    transport::try_queue(&tx, request);

    if let Some(text) = first_frame {
        relay.log_frame("recv peer", &text);
        if let Err(e) = relay::handle_peer_frame(relay, address, &text) {
            debug!(peer = %address, "dropping peer frame: {e}");
        }
    }
    relay::run_link(relay.clone(), address.to_string(), link_id, reader).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_file_name() {
        assert_eq!(
            Neighbourhood::key_file_name("server2:8766").unwrap(),
            "server2_8766_public_key.pem"
        );
        // IPv6-ish hosts keep everything before the last colon.
        assert_eq!(
            Neighbourhood::key_file_name("10.0.0.7:9000").unwrap(),
            "10.0.0.7_9000_public_key.pem"
        );
        assert!(Neighbourhood::key_file_name("no-port").is_none());
    }

    #[test]
    fn test_load_key_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let hood = Neighbourhood {
            addresses: vec!["server2:8766".into()],
            dir: dir.path().to_path_buf(),
        };

        assert!(hood.load_key("server2:8766").unwrap().is_none());

        std::fs::write(
            dir.path().join("server2_8766_public_key.pem"),
            "not a key",
        )
        .unwrap();
        assert!(hood.load_key("server2:8766").is_err());

        let (_, public) = crypto::generate_keypair().unwrap();
        let pem = crypto::public_key_to_pem(&public).unwrap();
        std::fs::write(dir.path().join("server2_8766_public_key.pem"), &pem).unwrap();
        assert_eq!(hood.load_key("server2:8766").unwrap().unwrap(), pem);
    }
}
