use std::sync::Arc;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::storage::{Artifact, CertStore};

const KEY_BITS: usize = 2048;

/// The application's RSA private key.
#[derive(Clone, PartialEq)]
pub struct PrivateKey(RsaPrivateKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl PrivateKey {
    /// RSA-2048 with public exponent 65537.
    pub fn generate() -> Result<Self> {
        let key = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, KEY_BITS)
            .map_err(|e| ProvisionError::Certificate(format!("Failed to generate RSA key: {}", e)))?;
        Ok(Self(key))
    }

    /// Parse PKCS#8 PEM, falling back to a PKCS#1 `RSA PRIVATE KEY` block.
    pub fn from_pem(pem: &str) -> Result<Self> {
        match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(key) => Ok(Self(key)),
            Err(pkcs8_err) => RsaPrivateKey::from_pkcs1_pem(pem)
                .map(Self)
                .map_err(|_| ProvisionError::KeyParse(pkcs8_err.to_string())),
        }
    }

    pub fn to_pem(&self) -> Result<String> {
        let pem = self
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ProvisionError::Certificate(format!("Failed to encode key as PEM: {}", e)))?;
        Ok(pem.to_string())
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let der = self
            .0
            .to_pkcs8_der()
            .map_err(|e| ProvisionError::Certificate(format!("Failed to encode key to PKCS8 DER: {}", e)))?;
        Ok(der.as_bytes().to_vec())
    }
}

/// Loads the private key from disk, generating and persisting it on first use.
#[derive(Debug, Clone)]
pub struct KeyStore {
    store: Arc<CertStore>,
}

impl KeyStore {
    pub fn new(store: Arc<CertStore>) -> Self {
        Self { store }
    }

    /// Never regenerates over an existing file; an unreadable key surfaces as
    /// `KeyParse` and stays on disk until an explicit reset.
    pub fn get_or_create_key(&self) -> Result<PrivateKey> {
        if let Some(key) = self.load()? {
            return Ok(key);
        }

        info!("Generating RSA-{} key pair...", KEY_BITS);
        let key = PrivateKey::generate()?;
        let pem = key.to_pem()?;

        if self.store.write_new(Artifact::PrivateKey, pem.as_bytes())? {
            info!(
                "Private key saved to {}",
                self.store.path(Artifact::PrivateKey).display()
            );
            return Ok(key);
        }

        // Someone else wrote a key between our check and our write.
        self.load()?
            .ok_or(ProvisionError::NotReady("private key vanished while being created"))
    }

    fn load(&self) -> Result<Option<PrivateKey>> {
        let path = self.store.path(Artifact::PrivateKey);
        let Some(bytes) = self.store.read(Artifact::PrivateKey)? else {
            return Ok(None);
        };
        let pem = std::str::from_utf8(&bytes).map_err(|_| {
            ProvisionError::KeyParse(format!("{} is not a PEM file", path.display()))
        })?;
        let key = PrivateKey::from_pem(pem)?;
        info!("Loaded private key from {}", path.display());
        Ok(Some(key))
    }
}
