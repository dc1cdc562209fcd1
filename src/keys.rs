use secp256k1::rand::thread_rng;
use secp256k1::{Keypair, Message, SECP256K1};

use crate::error::Result;
use crate::event::Event;

/// The relay's own identity, used to author moderation and metadata events.
#[derive(Clone)]
pub struct RelayKeys {
    keypair: Keypair,
    public_key: String,
}

impl RelayKeys {
    pub fn generate() -> Self {
        let keypair = Keypair::new(SECP256K1, &mut thread_rng());
        Self::from_keypair(keypair)
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let keypair = Keypair::from_seckey_str(SECP256K1, secret)?;
        Ok(Self::from_keypair(keypair))
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let (xonly, _) = keypair.x_only_public_key();
        Self {
            keypair,
            public_key: hex::encode(xonly.serialize()),
        }
    }

    /// x-only public key, lowercase hex.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Build and Schnorr-sign an event authored by the relay.
    pub fn sign_event(
        &self,
        created_at: i64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: &str,
    ) -> Result<Event> {
        let mut event = Event {
            id: String::new(),
            pubkey: self.public_key.clone(),
            created_at,
            kind,
            tags,
            content: content.to_string(),
            sig: String::new(),
        };
        event.id = event.compute_id();

        let mut digest = [0u8; 32];
        hex::decode_to_slice(&event.id, &mut digest)?;
        let message = Message::from_digest(digest);
        event.sig = SECP256K1.sign_schnorr(&message, &self.keypair).to_string();
        Ok(event)
    }
}
