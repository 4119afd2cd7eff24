//! Session encryption: ephemeral key exchange and per-frame AEAD sealing
//!
//! A session starts in clear. Either peer may request encryption by sending
//! a session-key request carrying an ephemeral public key; the responder
//! answers with its own public key and both sides derive a pair of
//! direction-separated ChaCha20-Poly1305 keys from the shared secret.
//! Handshake frames themselves always travel in clear. Once established,
//! every other outbound frame is wrapped in an envelope frame carrying a
//! transmitted nonce and the AEAD ciphertext of the complete inner frame.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::message::Message;
use crate::protocol::{command, field, HEADER_SIZE};

pub const KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Minimum size of a well-formed envelope frame
pub const ENVELOPE_OVERHEAD: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Handshake progression for one session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    None,
    KeyRequested,
    Established,
}

/// Which side of the exchange this peer is; determines key direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    hmac_sha256(salt, ikm)
}

fn hkdf_expand(prk: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let mut block = Vec::with_capacity(info.len() + 1);
    block.extend_from_slice(info);
    block.push(0x01);
    hmac_sha256(prk, &block)
}

/// Derive the two directional frame keys from the DH shared secret.
/// Returns (initiator-to-responder, responder-to-initiator).
fn derive_frame_keys(shared: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let prk = hkdf_extract(b"gridmon::session::salt", shared);
    (
        hkdf_expand(&prk, b"gridmon::frame::i2r"),
        hkdf_expand(&prk, b"gridmon::frame::r2i"),
    )
}

/// Established per-session cipher context. Sealing uses this side's transmit
/// key with a (random prefix, counter) nonce carried in the envelope, so the
/// receiving side stays stateless and a lost frame cannot desynchronize it.
pub struct SessionCipher {
    seal_key: ChaCha20Poly1305,
    open_key: ChaCha20Poly1305,
    nonce_prefix: [u8; 4],
    seq: AtomicU64,
}

impl SessionCipher {
    fn new(shared: &[u8; 32], role: Role) -> Self {
        let (i2r, r2i) = derive_frame_keys(shared);
        let (tx, rx) = match role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };
        let mut nonce_prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);
        SessionCipher {
            seal_key: ChaCha20Poly1305::new(Key::from_slice(&tx)),
            open_key: ChaCha20Poly1305::new(Key::from_slice(&rx)),
            nonce_prefix,
            seq: AtomicU64::new(0),
        }
    }

    /// Wrap a complete clear frame into an envelope frame
    pub fn seal_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&self.nonce_prefix);
        nonce[4..].copy_from_slice(&self.seq.fetch_add(1, Ordering::Relaxed).to_be_bytes());

        let ciphertext = self
            .seal_key
            .encrypt(Nonce::from_slice(&nonce), frame)
            .map_err(|_| anyhow!("frame encryption failed"))?;

        let total = HEADER_SIZE + NONCE_SIZE + ciphertext.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&command::ENCRYPTED_FRAME.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Unwrap an envelope frame back into the inner clear frame
    pub fn open_frame(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < ENVELOPE_OVERHEAD {
            bail!("encrypted envelope too short: {} bytes", envelope.len());
        }
        let nonce = &envelope[HEADER_SIZE..HEADER_SIZE + NONCE_SIZE];
        let ciphertext = &envelope[HEADER_SIZE + NONCE_SIZE..];
        let frame = self
            .open_key
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("frame decryption failed"))?;
        if frame.len() < HEADER_SIZE {
            bail!("decrypted frame shorter than header");
        }
        Ok(frame)
    }
}

/// In-progress key exchange held by the requesting side between sending the
/// session-key request and receiving the matching response.
pub struct Handshake {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Handshake {
    pub fn initiate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Handshake { secret, public }
    }

    /// Session-key request frame carrying our ephemeral public key
    pub fn request_message(&self, request_id: u32) -> Message {
        let mut msg = Message::new(command::REQUEST_SESSION_KEY, request_id);
        msg.set_binary(field::PUBLIC_KEY, self.public.as_bytes());
        msg
    }

    /// Finish the exchange on the initiating side using the responder's
    /// public key from the session-key response.
    pub fn complete(self, peer_public: &[u8]) -> Result<SessionCipher> {
        let shared = self.agree(peer_public)?;
        Ok(SessionCipher::new(&shared, Role::Initiator))
    }

    fn agree(self, peer_public: &[u8]) -> Result<[u8; 32]> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = peer_public
            .try_into()
            .map_err(|_| anyhow!("peer public key must be {} bytes", PUBLIC_KEY_SIZE))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        Ok(*shared.as_bytes())
    }

    /// One-shot responder side: derive the cipher from the requester's
    /// public key and produce the session-key response to send back.
    pub fn respond(peer_public: &[u8], request_id: u32) -> Result<(Message, SessionCipher)> {
        let hs = Handshake::initiate();
        let mut reply = Message::new(command::SESSION_KEY, request_id);
        reply.set_binary(field::PUBLIC_KEY, hs.public.as_bytes());
        let shared = hs.agree(peer_public)?;
        Ok((reply, SessionCipher::new(&shared, Role::Responder)))
    }
}
