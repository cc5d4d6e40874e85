use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::journal::JournalError;

/// Operator signature over a journal entry hash.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntrySignature {
    #[serde(with = "crate::journal::signing::serde_bytes")]
    pub signer: Vec<u8>,
    #[serde(with = "crate::journal::signing::serde_bytes")]
    pub signature: Vec<u8>,
}

impl EntrySignature {
    pub fn sign(key: &SigningKey, hash: &str) -> Self {
        let signature = key.sign(hash.as_bytes());
        Self {
            signer: key.verifying_key().as_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Checks the signature and, when `trusted` is given, that it was made by
    /// that key.
    pub fn verify(
        &self,
        sequence: u64,
        hash: &str,
        trusted: Option<&VerifyingKey>,
    ) -> Result<(), JournalError> {
        let signer_bytes: [u8; 32] = self
            .signer
            .as_slice()
            .try_into()
            .map_err(|_| JournalError::InvalidSignature { sequence })?;
        let signer = VerifyingKey::from_bytes(&signer_bytes)
            .map_err(|_| JournalError::InvalidSignature { sequence })?;
        if let Some(trusted) = trusted {
            if trusted != &signer {
                return Err(JournalError::UntrustedSigner {
                    sequence,
                    signer: hex::encode(signer.as_bytes()),
                });
            }
        }
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| JournalError::InvalidSignature { sequence })?;
        signer
            .verify_strict(hash.as_bytes(), &signature)
            .map_err(|_| JournalError::InvalidSignature { sequence })
    }
}

pub fn parse_signing_key(sk_hex: &str) -> Result<SigningKey, JournalError> {
    let bytes = hex::decode(sk_hex.trim())
        .map_err(|e| JournalError::InvalidKey(format!("secret key hex: {e}")))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        JournalError::InvalidKey("secret key must be 32 bytes (64 hex chars)".into())
    })?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn parse_verifying_key(pk_hex: &str) -> Result<VerifyingKey, JournalError> {
    let bytes = hex::decode(pk_hex.trim())
        .map_err(|e| JournalError::InvalidKey(format!("public key hex: {e}")))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        JournalError::InvalidKey("public key must be 32 bytes (64 hex chars)".into())
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| JournalError::InvalidKey(e.to_string()))
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}
