// olaf-core — Neighbourhood Messaging Spine
//
// The relay engine and client state machine behind the OLAF wire
// protocol: signed-counter envelopes, destination-routed fan-out,
// neighbourhood gossip, and bounded file storage. Users are their
// RSA fingerprints; everything else is plumbing.

pub mod client;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod files;
pub mod identity;
pub mod registry;
pub mod relay;
pub mod transport;

pub use client::{ClientEngine, ClientError, EngineState};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use crypto::CryptoError;
pub use envelope::EnvelopeError;
pub use identity::Identity;
pub use registry::Neighbourhood;
pub use relay::{Relay, RelayError};
