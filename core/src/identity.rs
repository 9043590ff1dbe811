// Persistent RSA identity — load from disk or generate on first start

use std::fs;
use std::path::Path;

use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::info;

use crate::crypto::{self, CryptoError};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// An RSA-2048 key pair plus its derived wire identity.
pub struct Identity {
    private_key: RsaPrivateKey,
    public_key_pem: String,
    fingerprint: String,
}

impl Identity {
    /// Load the key pair from `<dir>/<private_name>` / `<dir>/<public_name>`,
    /// generating and persisting a fresh one when the private key is absent.
    /// The public PEM on disk is regenerated from the private key, so a
    /// missing or stale public file heals itself.
    pub fn load_or_generate(
        dir: &Path,
        private_name: &str,
        public_name: &str,
    ) -> Result<Self, IdentityError> {
        fs::create_dir_all(dir)?;
        let private_path = dir.join(private_name);
        let public_path = dir.join(public_name);

        let private_key = if private_path.exists() {
            let pem = fs::read_to_string(&private_path)?;
            crypto::private_key_from_pem(&pem)?
        } else {
            info!(path = %private_path.display(), "generating new RSA identity");
            let (private, _) = crypto::generate_keypair()?;
            let pem = crypto::private_key_to_pem(&private)?;
            fs::write(&private_path, pem.as_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&private_path, fs::Permissions::from_mode(0o600));
            }
            private
        };

        let public_key_pem = crypto::public_key_to_pem(&rsa::RsaPublicKey::from(&private_key))?;
        fs::write(&public_path, public_key_pem.as_bytes())?;

        let fingerprint = crypto::fingerprint(&public_key_pem);
        Ok(Self {
            private_key,
            public_key_pem,
            fingerprint,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_identity_persists_across_loads() {
        let dir = tempdir().unwrap();

        let first =
            Identity::load_or_generate(dir.path(), "private_key.pem", "public_key.pem").unwrap();
        let second =
            Identity::load_or_generate(dir.path(), "private_key.pem", "public_key.pem").unwrap();

        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.public_key_pem(), second.public_key_pem());
    }

    #[test]
    fn test_public_pem_regenerated_when_deleted() {
        let dir = tempdir().unwrap();
        let identity =
            Identity::load_or_generate(dir.path(), "private_key.pem", "public_key.pem").unwrap();

        std::fs::remove_file(dir.path().join("public_key.pem")).unwrap();
        let reloaded =
            Identity::load_or_generate(dir.path(), "private_key.pem", "public_key.pem").unwrap();

        assert_eq!(identity.fingerprint(), reloaded.fingerprint());
        assert!(dir.path().join("public_key.pem").exists());
    }
}
