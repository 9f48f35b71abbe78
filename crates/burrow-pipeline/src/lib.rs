//! Record pipeline: optional compression and encryption per connection
//!
//! Outbound frames are compressed then encrypted; inbound records are
//! decrypted then decompressed before frame decoding. The handshake always
//! runs with [`Pipeline::plaintext`]; once the bridge has accepted an agent,
//! both sides switch to the negotiated mode with a key derived from the
//! agent's verification secret and the session nonce.
//!
//! Integrity loss cannot be skipped over: a record that fails to decrypt
//! poisons the whole physical connection, because later AEAD counters would
//! no longer line up even if the corruption were confined to one record.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use thiserror::Error;

pub use burrow_proto::PipelineMode;

/// Domain separator mixed into key derivation
const KEY_CONTEXT: &[u8] = b"burrow/1";

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// AEAD integrity failure; fatal to the physical connection
    #[error("record failed to decrypt")]
    DecryptFailed,

    #[error("compression failed: {0}")]
    CompressFailed(std::io::Error),

    #[error("decompression failed: {0}")]
    DecompressFailed(std::io::Error),

    #[error("decompressed record exceeds {max} bytes")]
    DecompressedTooLarge { max: usize },

    /// Mode requires encryption but no session key was supplied
    #[error("pipeline mode requires a session key")]
    MissingKey,
}

/// Which end of the connection this pipeline writes from.
///
/// The direction byte keeps the two AEAD nonce sequences disjoint even
/// though both sides share one session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AgentToBridge = 0,
    BridgeToAgent = 1,
}

impl Direction {
    fn reverse(self) -> Direction {
        match self {
            Direction::AgentToBridge => Direction::BridgeToAgent,
            Direction::BridgeToAgent => Direction::AgentToBridge,
        }
    }
}

/// Derive the 32-byte session key from the handshake secret and nonce
pub fn derive_session_key(secret: &str, session_nonce: &[u8; 16]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(KEY_CONTEXT);
    hasher.update(session_nonce);
    hasher.finalize().into()
}

/// Derive a subkey for one logical stream.
///
/// Tunnels with their own pipeline seal stream payloads separately from the
/// connection records; giving each stream its own key keeps those AEAD nonce
/// sequences disjoint across streams.
pub fn derive_stream_key(session_key: &[u8; 32], stream_id: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(session_key);
    hasher.update(b"stream");
    hasher.update(stream_id.to_be_bytes());
    hasher.finalize().into()
}

struct CryptoState {
    cipher: Aes256Gcm,
    seal_dir: Direction,
    seal_counter: u64,
    open_counter: u64,
}

impl CryptoState {
    fn nonce(dir: Direction, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = dir as u8;
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

/// Per-connection seal/open transform applied to every record
pub struct Pipeline {
    mode: PipelineMode,
    crypto: Option<CryptoState>,
    max_plain: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("mode", &self.mode)
            .field("max_plain", &self.max_plain)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline used during the handshake: every record passes through as-is
    pub fn plaintext() -> Self {
        Self {
            mode: PipelineMode::None,
            crypto: None,
            max_plain: default_max_plain(),
        }
    }

    /// Build the negotiated pipeline for one side of a connection.
    ///
    /// `send_dir` is the direction this side writes in; the key must be the
    /// output of [`derive_session_key`] on both sides.
    pub fn negotiated(
        mode: PipelineMode,
        key: Option<&[u8; 32]>,
        send_dir: Direction,
    ) -> Result<Self, PipelineError> {
        let crypto = if mode.encrypts() {
            let key = key.ok_or(PipelineError::MissingKey)?;
            // new_from_slice only fails on bad key length, which [u8; 32] rules out
            let cipher =
                Aes256Gcm::new_from_slice(key).map_err(|_| PipelineError::MissingKey)?;
            Some(CryptoState {
                cipher,
                seal_dir: send_dir,
                seal_counter: 0,
                open_counter: 0,
            })
        } else {
            None
        };

        Ok(Self {
            mode,
            crypto,
            max_plain: default_max_plain(),
        })
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Cap on the decompressed size of one record (testing hook)
    pub fn with_max_plain(mut self, max_plain: usize) -> Self {
        self.max_plain = max_plain;
        self
    }

    /// Transform an encoded frame into a wire record
    pub fn seal(&mut self, frame: Bytes) -> Result<Bytes, PipelineError> {
        let mut data = frame;

        if self.mode.compresses() {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&data)
                .map_err(PipelineError::CompressFailed)?;
            data = Bytes::from(encoder.finish().map_err(PipelineError::CompressFailed)?);
        }

        if let Some(crypto) = &mut self.crypto {
            let nonce = CryptoState::nonce(crypto.seal_dir, crypto.seal_counter);
            crypto.seal_counter += 1;
            let ciphertext = crypto
                .cipher
                .encrypt(Nonce::from_slice(&nonce), data.as_ref())
                .map_err(|_| PipelineError::DecryptFailed)?;
            data = Bytes::from(ciphertext);
        }

        Ok(data)
    }

    /// Transform a wire record back into an encoded frame
    pub fn open(&mut self, record: Bytes) -> Result<Bytes, PipelineError> {
        let mut data = record;

        if let Some(crypto) = &mut self.crypto {
            let nonce = CryptoState::nonce(crypto.seal_dir.reverse(), crypto.open_counter);
            let plaintext = crypto
                .cipher
                .decrypt(Nonce::from_slice(&nonce), data.as_ref())
                .map_err(|_| PipelineError::DecryptFailed)?;
            // Only advance once the record authenticated
            crypto.open_counter += 1;
            data = Bytes::from(plaintext);
        }

        if self.mode.compresses() {
            let mut decoder =
                flate2::read::ZlibDecoder::new(data.as_ref()).take(self.max_plain as u64 + 1);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(PipelineError::DecompressFailed)?;
            if out.len() > self.max_plain {
                return Err(PipelineError::DecompressedTooLarge {
                    max: self.max_plain,
                });
            }
            data = Bytes::from(out);
        }

        Ok(data)
    }
}

fn default_max_plain() -> usize {
    burrow_proto::MAX_FRAME_SIZE as usize + burrow_proto::Frame::HEADER_SIZE
}
