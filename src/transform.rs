//! Reversible stream transformers
//!
//! A [`TransformerChain`] wraps container and database I/O in an ordered list
//! of stages. Writing applies the stages in configured order (typically
//! compress, then encrypt); reading undoes them in reverse. Every stage is
//! streaming, so memory use is bounded by one frame per stage regardless of
//! how much data passes through.
//!
//! ## Stages
//!
//! - [`Transformer::Lz4`]: LZ4 frame format via `lz4_flex`.
//! - [`Transformer::Aes256Gcm`]: authenticated encryption in 64 KiB frames.
//!
//! ## Encrypted stream layout
//!
//! ```text
//! magic "SFAE" | version (1) | salt (32)
//! frame*: flag (1) | length u32 BE | ciphertext + tag
//! ```
//!
//! The stream key is derived with HKDF-SHA256 from the master key and the
//! per-stream random salt. Nonces are the frame counter plus the flag byte,
//! and the last frame carries flag `1`. A stream that ends before its final
//! frame, or whose frames were reordered, fails authentication.
//!
//! ## Examples
//!
//! ```rust
//! use syncfold::transform::{MasterKey, Transformer, TransformerChain};
//!
//! let key = MasterKey::new(b"correct horse battery staple".to_vec()).unwrap();
//! let chain = TransformerChain::new(vec![Transformer::Lz4, Transformer::Aes256Gcm(key)]);
//!
//! let encoded = chain.encode(b"hello hello hello").unwrap();
//! assert_eq!(chain.decode(&encoded).unwrap(), b"hello hello hello");
//! ```

use crate::config::{TransformerConfig, TransformerKind};
use crate::error::{Result, SyncError};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use sha2::Sha256;
use std::fmt;
use std::io::{self, Read, Write};
use zeroize::{Zeroize, ZeroizeOnDrop};

const AES_MAGIC: &[u8; 4] = b"SFAE";
const AES_FORMAT_VERSION: u8 = 1;
const AES_KEY_SIZE: usize = 32;
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const FRAME_SIZE: usize = 64 * 1024;
const HKDF_INFO: &[u8] = b"syncfold stream key v1";

const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

/// Writer that must be explicitly finalized
///
/// Dropping a transformer writer without calling [`finish`](Self::finish)
/// leaves a truncated stream that will fail to decode.
pub trait FinishWrite: Write {
    /// Flush buffered data, write trailers and finalize every inner stage
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Innermost sink: finishing just flushes
struct PlainSink<W: Write>(W);

impl<W: Write> Write for PlainSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> FinishWrite for PlainSink<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

/// Master key for the encryption stage, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: Vec<u8>,
}

impl MasterKey {
    /// Wrap key material
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfiguration`] if the key is empty.
    pub fn new(key: Vec<u8>) -> Result<Self> {
        if key.is_empty() {
            return Err(SyncError::InvalidConfiguration(
                "master key cannot be empty".to_string(),
            ));
        }
        Ok(Self { key })
    }

    fn stream_cipher(&self, salt: &[u8]) -> io::Result<Aes256Gcm> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.key);
        let mut stream_key = [0u8; AES_KEY_SIZE];
        hkdf.expand(HKDF_INFO, &mut stream_key)
            .map_err(|_| io::Error::other("HKDF expansion failed"))?;
        let cipher = Aes256Gcm::new(&stream_key.into());
        stream_key.zeroize();
        Ok(cipher)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// One stage of a transformer chain
#[derive(Debug, Clone)]
pub enum Transformer {
    /// LZ4 frame compression
    Lz4,
    /// AES-256-GCM framed encryption
    Aes256Gcm(MasterKey),
}

impl Transformer {
    fn wrap_writer<'a>(&self, inner: Box<dyn FinishWrite + 'a>) -> io::Result<Box<dyn FinishWrite + 'a>> {
        Ok(match self {
            Transformer::Lz4 => Box::new(Lz4Writer(FrameEncoder::new(inner))),
            Transformer::Aes256Gcm(key) => Box::new(AesWriter::new(inner, key)?),
        })
    }

    fn wrap_reader<'a>(&self, inner: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Transformer::Lz4 => Box::new(FrameDecoder::new(inner)),
            Transformer::Aes256Gcm(key) => Box::new(AesReader::new(inner, key)?),
        })
    }
}

/// Ordered, reversible pipeline of stages
#[derive(Debug, Clone, Default)]
pub struct TransformerChain {
    stages: Vec<Transformer>,
}

impl TransformerChain {
    /// Create a chain; stages are listed in write order
    pub fn new(stages: Vec<Transformer>) -> Self {
        Self { stages }
    }

    /// Chain without any stage
    pub fn plain() -> Self {
        Self::default()
    }

    /// Build a chain from configuration
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfiguration`] if an encryption stage is
    /// configured but no key was supplied.
    pub fn from_config(config: &TransformerConfig, key: Option<&MasterKey>) -> Result<Self> {
        let mut stages = Vec::with_capacity(config.stages.len());
        for kind in &config.stages {
            stages.push(match kind {
                TransformerKind::Lz4 => Transformer::Lz4,
                TransformerKind::Aes256Gcm => {
                    let key = key.ok_or_else(|| {
                        SyncError::InvalidConfiguration(
                            "encryption stage configured without a master key".to_string(),
                        )
                    })?;
                    Transformer::Aes256Gcm(key.clone())
                }
            });
        }
        Ok(Self { stages })
    }

    /// Stages in write order
    pub fn stages(&self) -> &[Transformer] {
        &self.stages
    }

    /// Wrap an output stream; call `finish` on the result when done
    pub fn encoder<'a, W: Write + 'a>(&self, writer: W) -> Result<Box<dyn FinishWrite + 'a>> {
        let mut current: Box<dyn FinishWrite + 'a> = Box::new(PlainSink(writer));
        for stage in self.stages.iter().rev() {
            current = stage.wrap_writer(current)?;
        }
        Ok(current)
    }

    /// Wrap an input stream, undoing the stages in reverse order
    pub fn decoder<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        let mut current: Box<dyn Read + 'a> = Box::new(reader);
        for stage in self.stages.iter().rev() {
            current = stage.wrap_reader(current).map_err(decode_error)?;
        }
        Ok(current)
    }

    /// Encode a byte slice in memory
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = self.encoder(&mut out)?;
        encoder.write_all(data)?;
        encoder.finish()?;
        Ok(out)
    }

    /// Decode a byte slice in memory
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = self.decoder(data)?;
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(decode_error)?;
        Ok(out)
    }
}

/// Classify an I/O error raised while decoding
pub(crate) fn decode_error(err: io::Error) -> SyncError {
    let authentication_failed = err
        .get_ref()
        .map(|inner| inner.is::<AuthenticationFailed>())
        .unwrap_or(false);
    if authentication_failed {
        return SyncError::Decryption(err.to_string());
    }
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => SyncError::transform(err.to_string()),
        _ => SyncError::Io(err),
    }
}

#[derive(Debug)]
struct AuthenticationFailed;

impl fmt::Display for AuthenticationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("frame authentication failed (wrong key or tampered data)")
    }
}

impl std::error::Error for AuthenticationFailed {}

struct Lz4Writer<'a>(FrameEncoder<Box<dyn FinishWrite + 'a>>);

impl Write for Lz4Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for Lz4Writer<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.0.finish().map_err(io::Error::other)?;
        inner.finish()
    }
}

fn frame_nonce(counter: u64, flag: u8) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_SIZE - 1] = flag;
    nonce
}

struct AesWriter<'a> {
    inner: Box<dyn FinishWrite + 'a>,
    cipher: Aes256Gcm,
    buffer: Vec<u8>,
    counter: u64,
}

impl<'a> AesWriter<'a> {
    fn new(mut inner: Box<dyn FinishWrite + 'a>, key: &MasterKey) -> io::Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        inner.write_all(AES_MAGIC)?;
        inner.write_all(&[AES_FORMAT_VERSION])?;
        inner.write_all(&salt)?;

        Ok(Self {
            inner,
            cipher: key.stream_cipher(&salt)?,
            buffer: Vec::with_capacity(FRAME_SIZE),
            counter: 0,
        })
    }

    fn emit(&mut self, flag: u8) -> io::Result<()> {
        let nonce = frame_nonce(self.counter, flag);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), self.buffer.as_slice())
            .map_err(|_| io::Error::other("frame encryption failed"))?;

        self.inner.write_all(&[flag])?;
        self.inner.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;

        self.counter += 1;
        self.buffer.clear();
        Ok(())
    }
}

impl Write for AesWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            // Only emit a full frame once more data arrives, so the last
            // frame can always be marked final
            if self.buffer.len() == FRAME_SIZE {
                self.emit(FLAG_MORE)?;
            }
            let take = (FRAME_SIZE - self.buffer.len()).min(buf.len() - written);
            self.buffer.extend_from_slice(&buf[written..written + take]);
            written += take;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl FinishWrite for AesWriter<'_> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.emit(FLAG_FINAL)?;
        self.inner.finish()
    }
}

struct AesReader<'a> {
    inner: Box<dyn Read + 'a>,
    cipher: Aes256Gcm,
    plain: Vec<u8>,
    position: usize,
    counter: u64,
    finished: bool,
}

impl<'a> AesReader<'a> {
    fn new(mut inner: Box<dyn Read + 'a>, key: &MasterKey) -> io::Result<Self> {
        let mut header = [0u8; 5];
        inner.read_exact(&mut header)?;
        if &header[..4] != AES_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an encrypted stream"));
        }
        if header[4] != AES_FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported encrypted stream version {}", header[4]),
            ));
        }
        let mut salt = [0u8; SALT_SIZE];
        inner.read_exact(&mut salt)?;

        Ok(Self {
            inner,
            cipher: key.stream_cipher(&salt)?,
            plain: Vec::new(),
            position: 0,
            counter: 0,
            finished: false,
        })
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut head = [0u8; 5];
        self.inner.read_exact(&mut head).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::InvalidData, "encrypted stream truncated before final frame")
            } else {
                e
            }
        })?;

        let flag = head[0];
        if flag != FLAG_MORE && flag != FLAG_FINAL {
            return Err(io::Error::new(io::ErrorKind::InvalidData, AuthenticationFailed));
        }
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if len < TAG_SIZE || len > FRAME_SIZE + TAG_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid encrypted frame length {}", len),
            ));
        }

        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext)?;

        let nonce = frame_nonce(self.counter, flag);
        self.plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, AuthenticationFailed))?;
        self.position = 0;
        self.counter += 1;
        self.finished = flag == FLAG_FINAL;
        Ok(())
    }
}

impl Read for AesReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.position < self.plain.len() {
                let n = (self.plain.len() - self.position).min(out.len());
                out[..n].copy_from_slice(&self.plain[self.position..self.position + n]);
                self.position += n;
                return Ok(n);
            }
            if self.finished || out.is_empty() {
                return Ok(0);
            }
            self.next_frame()?;
        }
    }
}
