/// Signature validation against trusted keys
use super::{map_entities, FilterContext, MetadataFilter};
use crate::{
    error::{MetadataError, MetadataResult},
    metadata::{DocumentSignature, MetadataDocument},
};
use k256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Algorithm identifier for secp256k1 ECDSA over SHA-256
pub const ES256K: &str = "ES256K";

/// Pass/fail signature check against configured trust material
pub trait SignatureTrustEngine: Send + Sync {
    fn validate(&self, signed_content: &[u8], signature: &DocumentSignature) -> bool;
}

/// Trust engine holding named secp256k1 public keys
#[derive(Debug, Clone, Default)]
pub struct K256TrustEngine {
    keys: HashMap<String, VerifyingKey>,
}

impl K256TrustEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&mut self, name: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(name.into(), key);
    }

    /// Build from `(name, hex SEC1 public key)` pairs
    pub fn from_hex_keys<I, N, K>(keys: I) -> MetadataResult<Self>
    where
        I: IntoIterator<Item = (N, K)>,
        N: Into<String>,
        K: AsRef<str>,
    {
        let mut engine = Self::new();
        for (name, key_hex) in keys {
            let name = name.into();
            let bytes = hex::decode(key_hex.as_ref().trim()).map_err(|e| {
                MetadataError::Configuration(format!("Invalid hex for trust key {}: {}", name, e))
            })?;
            let key = VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| {
                MetadataError::Configuration(format!("Invalid trust key {}: {}", name, e))
            })?;
            engine.add_key(name, key);
        }
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SignatureTrustEngine for K256TrustEngine {
    fn validate(&self, signed_content: &[u8], signature: &DocumentSignature) -> bool {
        if signature.algorithm != ES256K {
            debug!("Unsupported signature algorithm: {}", signature.algorithm);
            return false;
        }
        let Some(key) = self.keys.get(&signature.key_name) else {
            debug!("No trusted key named {}", signature.key_name);
            return false;
        };
        let Ok(bytes) = hex::decode(&signature.value) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&bytes) else {
            return false;
        };
        key.verify(signed_content, &sig).is_ok()
    }
}

/// Verifies the root signature and any signed child entities
///
/// An invalid root signature fails the document. Signed children inside a
/// group are checked individually and dropped when invalid.
#[derive(Clone)]
pub struct SignatureValidationFilter {
    engine: Arc<dyn SignatureTrustEngine>,
    require_signed_root: bool,
}

impl SignatureValidationFilter {
    pub fn new(engine: Arc<dyn SignatureTrustEngine>, require_signed_root: bool) -> Self {
        Self {
            engine,
            require_signed_root,
        }
    }
}

impl MetadataFilter for SignatureValidationFilter {
    fn name(&self) -> &str {
        "SignatureValidation"
    }

    fn filter(
        &self,
        document: MetadataDocument,
        _context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        match document.root_signature() {
            Some(signature) => {
                if !self.engine.validate(&document.signing_input(), signature) {
                    return Err(MetadataError::filter_failed(
                        self.name(),
                        format!("root signature by key '{}' did not verify", signature.key_name),
                    ));
                }
            }
            None if self.require_signed_root => {
                return Err(MetadataError::filter_failed(
                    self.name(),
                    "metadata root is not signed",
                ));
            }
            None => {}
        }

        if let MetadataDocument::Entity(_) = document {
            return Ok(Some(document));
        }

        let engine = Arc::clone(&self.engine);
        map_entities(document, &mut |entity| {
            if let Some(signature) = &entity.signature {
                if !engine.validate(&entity.signing_input(), signature) {
                    warn!(
                        "Dropping {}: signature by key '{}' did not verify",
                        entity.entity_id, signature.key_name
                    );
                    return Ok(None);
                }
            }
            Ok(Some(entity))
        })
    }
}
