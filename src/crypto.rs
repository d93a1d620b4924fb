//! Identity and session primitives.
//!
//! Long-term identity is an Ed25519 signing pair ([`Signer`]/[`Verfer`]) and
//! an X25519 agreement pair ([`Privateer`]/[`Pubber`]). A session is a
//! symmetric [`BoxKey`] derived from a Diffie-Hellman exchange and consumed
//! through a [`Boxer`], an XChaCha20-Poly1305 envelope with a random 24-byte
//! nonce prefix. Key material travels as lowercase hex.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const SIG_SIZE: usize = 64;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

fn key_from_hex(text: &str) -> Result<[u8; KEY_SIZE]> {
    let raw = hex::decode(text)?;
    raw.try_into()
        .map_err(|_| Error::Parse("key is not 32 bytes".into()))
}

/// Ed25519 signing half of a long-term identity.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new() -> Self {
        Signer {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_hex(seed: &str) -> Result<Self> {
        Ok(Signer {
            key: SigningKey::from_bytes(&key_from_hex(seed)?),
        })
    }

    /// Hex seed, suitable for the keep.
    pub fn key_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Hex of the matching verify key.
    pub fn ver_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    pub fn verfer(&self) -> Verfer {
        Verfer {
            key: self.key.verifying_key(),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIG_SIZE] {
        self.key.sign(msg).to_bytes()
    }
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Signer({})", &self.ver_hex()[..8])
    }
}

/// Ed25519 verify key of a peer.
#[derive(Clone)]
pub struct Verfer {
    key: VerifyingKey,
}

impl Verfer {
    pub fn from_hex(text: &str) -> Result<Self> {
        Ok(Verfer {
            key: VerifyingKey::from_bytes(&key_from_hex(text)?)
                .map_err(|_| Error::Parse("bad verify key".into()))?,
        })
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn verify(&self, sig: &[u8], msg: &[u8]) -> Result<()> {
        let sig: [u8; SIG_SIZE] = sig.try_into().map_err(|_| Error::Signature)?;
        self.key
            .verify(msg, &Signature::from_bytes(&sig))
            .map_err(|_| Error::Signature)
    }
}

impl std::fmt::Debug for Verfer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Verfer({})", &self.key_hex()[..8])
    }
}

/// X25519 secret half, long-term or ephemeral.
#[derive(Clone)]
pub struct Privateer {
    secret: StaticSecret,
}

impl Privateer {
    pub fn new() -> Self {
        Privateer {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_hex(seed: &str) -> Result<Self> {
        Ok(Privateer {
            secret: StaticSecret::from(key_from_hex(seed)?),
        })
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn pub_hex(&self) -> String {
        hex::encode(PublicKey::from(&self.secret).to_bytes())
    }

    pub fn pubber(&self) -> Pubber {
        Pubber {
            key: PublicKey::from(&self.secret),
        }
    }

    /// Derives the shared box key with a peer public key.
    pub fn shared(&self, peer: &Pubber) -> BoxKey {
        let shared = self.secret.diffie_hellman(&peer.key);
        BoxKey(blake3::derive_key("raet road session box", shared.as_bytes()))
    }
}

impl Default for Privateer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Privateer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Privateer({})", &self.pub_hex()[..8])
    }
}

/// X25519 public half of a peer.
#[derive(Clone)]
pub struct Pubber {
    key: PublicKey,
}

impl Pubber {
    pub fn from_hex(text: &str) -> Result<Self> {
        Ok(Pubber {
            key: PublicKey::from(key_from_hex(text)?),
        })
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn key_bytes(&self) -> [u8; KEY_SIZE] {
        self.key.to_bytes()
    }
}

impl std::fmt::Debug for Pubber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Pubber({})", &self.key_hex()[..8])
    }
}

/// Derived symmetric session key.
#[derive(Clone)]
pub struct BoxKey([u8; KEY_SIZE]);

impl std::fmt::Debug for BoxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BoxKey(..)")
    }
}

/// Authenticated-encryption envelope around a [`BoxKey`].
///
/// Output is `nonce ++ ciphertext ++ tag`; a failed open is a
/// [`Error::Signature`], the Poly1305 tag being the authenticator.
pub struct Boxer {
    cipher: XChaCha20Poly1305,
}

impl Boxer {
    pub fn new(key: &BoxKey) -> Self {
        Boxer {
            cipher: XChaCha20Poly1305::new((&key.0).into()),
        }
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).unwrap();
        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plain)
            .unwrap();
        let mut coat = Vec::with_capacity(NONCE_SIZE + sealed.len());
        coat.extend_from_slice(&nonce);
        coat.extend_from_slice(&sealed);
        coat
    }

    pub fn decrypt(&self, coat: &[u8]) -> Result<Vec<u8>> {
        if coat.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Signature);
        }
        self.cipher
            .decrypt(XNonce::from_slice(&coat[..NONCE_SIZE]), &coat[NONCE_SIZE..])
            .map_err(|_| Error::Signature)
    }
}

/// Length in bytes of a coat sealing `plain_len` bytes of body.
pub fn coat_size(plain_len: usize) -> usize {
    NONCE_SIZE + plain_len + TAG_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let signer = Signer::new();
        let sig = signer.sign(b"estate identity");
        signer.verfer().verify(&sig, b"estate identity").unwrap();
        assert!(signer.verfer().verify(&sig, b"other payload").is_err());

        let restored = Signer::from_hex(&signer.key_hex()).unwrap();
        assert_eq!(restored.ver_hex(), signer.ver_hex());

        let verfer = Verfer::from_hex(&signer.ver_hex()).unwrap();
        verfer.verify(&sig, b"estate identity").unwrap();
    }

    #[test]
    fn shared_box_keys_agree() {
        let ours = Privateer::new();
        let theirs = Privateer::new();

        let tx = Boxer::new(&ours.shared(&theirs.pubber()));
        let rx = Boxer::new(&theirs.shared(&ours.pubber()));

        let coat = tx.encrypt(b"cookie payload");
        assert_eq!(coat.len(), coat_size(b"cookie payload".len()));
        assert_eq!(rx.decrypt(&coat).unwrap(), b"cookie payload");
    }

    #[test]
    fn tampered_coat_fails() {
        let ours = Privateer::new();
        let theirs = Privateer::new();
        let boxer = Boxer::new(&ours.shared(&theirs.pubber()));

        let mut coat = boxer.encrypt(b"payload");
        let last = coat.len() - 1;
        coat[last] ^= 1;
        assert!(matches!(boxer.decrypt(&coat), Err(Error::Signature)));

        // a stranger's key cannot open it either
        let stranger = Boxer::new(&Privateer::new().shared(&theirs.pubber()));
        let coat = boxer.encrypt(b"payload");
        assert!(stranger.decrypt(&coat).is_err());
    }

    #[test]
    fn hex_codecs_reject_garbage() {
        assert!(Signer::from_hex("zz").is_err());
        assert!(Verfer::from_hex("abcd").is_err());
        assert!(Pubber::from_hex(&"00".repeat(31)).is_err());

        let priver = Privateer::new();
        let restored = Privateer::from_hex(&priver.key_hex()).unwrap();
        assert_eq!(restored.pub_hex(), priver.pub_hex());
    }
}
