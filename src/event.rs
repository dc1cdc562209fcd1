use secp256k1::schnorr::Signature;
use secp256k1::{Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Well-known kind numbers the relay itself cares about.
pub mod kind {
    pub const METADATA: u32 = 0;
    pub const CONTACTS: u32 = 3;
    pub const DELETION: u32 = 5;
    pub const AUTH: u32 = 22242;
}

/// A signed, immutable Nostr event (NIP-01).
///
/// All hex fields are lowercase. `id` is the SHA-256 of the canonical
/// serialization and `sig` a BIP-340 Schnorr signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Storage class of a kind number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

/// Classify a kind per NIP-01 ranges.
///
/// With `legacy` set, only kind 0 and the addressable range count as
/// replaceable, mirroring relays that predate the broader classification.
pub fn classify(kind: u32, legacy: bool) -> EventClass {
    if legacy {
        return match kind {
            0 => EventClass::Replaceable,
            k if (20_000..30_000).contains(&k) => EventClass::Ephemeral,
            k if (30_000..40_000).contains(&k) => EventClass::Addressable,
            _ => EventClass::Regular,
        };
    }
    match kind {
        0 | 3 => EventClass::Replaceable,
        k if (10_000..20_000).contains(&k) => EventClass::Replaceable,
        k if (20_000..30_000).contains(&k) => EventClass::Ephemeral,
        k if (30_000..40_000).contains(&k) => EventClass::Addressable,
        _ => EventClass::Regular,
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl Event {
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Self = serde_json::from_str(json)?;
        event.validate()?;
        Ok(event)
    }

    pub fn as_json(&self) -> String {
        // Serialization of these field types cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Structural checks that precede any cryptography.
    pub fn validate(&self) -> Result<()> {
        if !is_hex_of_len(&self.id, 64) {
            return Err(Error::event("id is not 32 bytes of lowercase hex"));
        }
        if !is_hex_of_len(&self.pubkey, 64) {
            return Err(Error::event("pubkey is not 32 bytes of lowercase hex"));
        }
        if !is_hex_of_len(&self.sig, 128) {
            return Err(Error::event("sig is not 64 bytes of lowercase hex"));
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(Error::event("tag without a name"));
        }
        Ok(())
    }

    /// Canonical serialization hashed into the event id:
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn canonical(&self) -> String {
        json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]).to_string()
    }

    pub fn compute_id(&self) -> String {
        let hash = Sha256::digest(self.canonical().as_bytes());
        hex::encode(hash)
    }

    pub fn verify_id(&self) -> bool {
        self.compute_id() == self.id
    }

    pub fn verify_signature(&self) -> Result<()> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(&self.id, &mut digest)?;
        let message = Message::from_digest(digest);
        let signature = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pubkey = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        SECP256K1.verify_schnorr(&signature, &message, &pubkey)?;
        Ok(())
    }

    /// Full verification: shape, id hash, signature.
    pub fn verify(&self) -> Result<()> {
        self.validate()?;
        if !self.verify_id() {
            return Err(Error::event("id does not match event contents"));
        }
        self.verify_signature()
            .map_err(|_| Error::event("invalid signature"))
    }

    pub fn classification(&self, legacy: bool) -> EventClass {
        classify(self.kind, legacy)
    }

    /// Replacement address: `kind:pubkey` for replaceable kinds,
    /// `kind:pubkey:d` for addressable ones (a missing `d` tag coerces to
    /// the empty string). `None` for regular and ephemeral kinds.
    pub fn address(&self, legacy: bool) -> Option<String> {
        match self.classification(legacy) {
            EventClass::Replaceable => Some(format!("{}:{}", self.kind, self.pubkey)),
            EventClass::Addressable => {
                let d = self.tag_value("d").unwrap_or("");
                Some(format!("{}:{}:{}", self.kind, self.pubkey, d))
            }
            _ => None,
        }
    }

    /// Second element of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() > 1 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// Second elements of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.len() > 1 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.first().is_some_and(|n| n == name))
    }

    /// Replacement ordering: newer `created_at` wins, ties go to the
    /// lexicographically smaller id.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.created_at > other.created_at
            || (self.created_at == other.created_at && self.id < other.id)
    }
}
