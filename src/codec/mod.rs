//! Artifact sealing: gzip compression followed by ChaCha20-Poly1305 encryption
//!
//! Sealed artifacts have the layout
//!
//! - 8 bytes: magic header `BKDR_ENC`
//! - 1 byte: format version
//! - 7 bytes: STREAM nonce prefix
//! - the gzip stream cut into 64 KiB chunks, each encrypted with the
//!   STREAM construction (big-endian 32-bit counter) and carrying its own
//!   authentication tag. The final chunk is flagged, so truncation is
//!   detected.
//!
//! Files are sealed and opened chunk by chunk on the blocking pool; memory
//! use does not grow with the dump size.

use crate::config::EncryptionKey;
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{
        generic_array::GenericArray,
        stream::{DecryptorBE32, EncryptorBE32},
        KeyInit, OsRng,
    },
    ChaCha20Poly1305,
};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const NONCE_SIZE: usize = 7;
pub const TAG_SIZE: usize = 16;
pub const SEALED_MAGIC: &[u8; 8] = b"BKDR_ENC";
const FORMAT_VERSION: u8 = 2;
const HEADER_SIZE: usize = 8 + 1 + NONCE_SIZE;

/// Plaintext bytes per encrypted chunk
pub const CHUNK_SIZE: usize = 64 * 1024;
const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// Suffix appended to a dump file when it is sealed
pub const SEALED_SUFFIX: &str = ".gz.enc";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Header, tag or gzip stream is invalid
    #[error("Corrupted artifact: {0}")]
    Corrupted(String),

    #[error("Codec task failed: {0}")]
    Task(String),
}

/// Result of sealing one dump file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedArtifact {
    pub path: PathBuf,
    /// SHA-256 of the plaintext dump
    pub plaintext_sha256: String,
    /// SHA-256 of the sealed file itself
    pub artifact_sha256: String,
    pub original_size: u64,
    /// Size of the sealed file
    pub compressed_size: u64,
}

impl SealedArtifact {
    /// compressed / original, 1.0 for empty input
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size > 0 {
            self.compressed_size as f64 / self.original_size as f64
        } else {
            1.0
        }
    }
}

/// Turns dumps into sealed artifacts and back
#[async_trait]
pub trait ArtifactCodec: Send + Sync {
    /// Seal `input` into a new file under `output_dir`
    async fn compress_and_encrypt(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<SealedArtifact, CodecError>;

    /// Open a sealed file into a new plaintext file under `output_dir`
    async fn decrypt_and_decompress(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<PathBuf, CodecError>;
}

/// Digests and counts everything read or written through it
struct Hashing<T> {
    inner: T,
    hasher: Sha256,
    bytes: u64,
}

impl<T> Hashing<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (T, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for Hashing<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.bytes += read as u64;
        Ok(read)
    }
}

impl<W: Write> Write for Hashing<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Buffers the gzip stream and writes it out as encrypted chunks. The
/// buffer is only drained while it holds more than one chunk, so the final
/// chunk (0..=CHUNK_SIZE bytes) is left for `finish`.
struct ChunkSealer<W: Write> {
    inner: W,
    encryptor: EncryptorBE32<ChaCha20Poly1305>,
    buffer: Vec<u8>,
}

impl<W: Write> ChunkSealer<W> {
    fn new(mut inner: W, key: &EncryptionKey) -> Result<Self, CodecError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        inner.write_all(SEALED_MAGIC)?;
        inner.write_all(&[FORMAT_VERSION])?;
        inner.write_all(&nonce)?;

        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
        Ok(Self {
            inner,
            encryptor: EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce)),
            buffer: Vec::with_capacity(2 * CHUNK_SIZE),
        })
    }

    fn finish(self) -> Result<W, CodecError> {
        let Self {
            mut inner,
            encryptor,
            buffer,
        } = self;
        let last = encryptor
            .encrypt_last(buffer.as_slice())
            .map_err(|e| CodecError::Encryption(format!("ChaCha20 encryption failed: {}", e)))?;
        inner.write_all(&last)?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for ChunkSealer<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() > CHUNK_SIZE {
            let chunk = self
                .encryptor
                .encrypt_next(&self.buffer[..CHUNK_SIZE])
                .map_err(|e| io::Error::other(format!("ChaCha20 encryption failed: {}", e)))?;
            self.inner.write_all(&chunk)?;
            self.buffer.drain(..CHUNK_SIZE);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Digests and sizes of one sealing pass
struct SealStats {
    plaintext_sha256: String,
    artifact_sha256: String,
    original_size: u64,
    sealed_size: u64,
}

/// Up to one sealed chunk; shorter only at end of input
fn read_block<R: Read>(input: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut block = Vec::with_capacity(size);
    input.take(size as u64).read_to_end(&mut block)?;
    Ok(block)
}

fn decryption_failed(e: chacha20poly1305::aead::Error) -> CodecError {
    CodecError::Encryption(format!(
        "ChaCha20 decryption failed (wrong key or corrupted data): {}",
        e
    ))
}

fn decompression_failed(e: io::Error) -> CodecError {
    CodecError::Corrupted(format!("Failed to decompress data: {}", e))
}

/// gzip + ChaCha20-Poly1305 codec
#[derive(Clone)]
pub struct SealingCodec {
    key: EncryptionKey,
    level: u32,
}

impl SealingCodec {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key, level: 6 }
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    fn seal_stream<R: Read, W: Write>(&self, input: R, output: W) -> Result<(W, SealStats), CodecError> {
        let mut reader = Hashing::new(input);
        let sealer = ChunkSealer::new(Hashing::new(output), &self.key)?;
        let mut encoder = GzEncoder::new(sealer, Compression::new(self.level));
        io::copy(&mut reader, &mut encoder)?;
        let sealer = encoder
            .finish()
            .map_err(|e| CodecError::Compression(format!("Failed to finalize compression: {}", e)))?;

        let (output, artifact_sha256, sealed_size) = sealer.finish()?.finish();
        let (_, plaintext_sha256, original_size) = reader.finish();
        Ok((
            output,
            SealStats {
                plaintext_sha256,
                artifact_sha256,
                original_size,
                sealed_size,
            },
        ))
    }

    fn open_stream<R: Read, W: Write>(&self, mut input: R, output: W) -> Result<W, CodecError> {
        let header = read_block(&mut input, HEADER_SIZE)?;
        if header.len() < HEADER_SIZE {
            return Err(CodecError::Corrupted("artifact too short".to_string()));
        }
        if &header[..8] != SEALED_MAGIC {
            return Err(CodecError::Corrupted("invalid artifact header".to_string()));
        }
        if header[8] != FORMAT_VERSION {
            return Err(CodecError::Corrupted(format!(
                "unsupported artifact version {}",
                header[8]
            )));
        }

        let cipher = ChaCha20Poly1305::new(self.key.as_bytes().into());
        let mut decryptor =
            DecryptorBE32::from_aead(cipher, GenericArray::from_slice(&header[9..HEADER_SIZE]));
        let mut decoder = GzDecoder::new(output);

        // A full block followed by more data is an intermediate chunk
        let mut block = read_block(&mut input, SEALED_CHUNK_SIZE)?;
        while block.len() == SEALED_CHUNK_SIZE {
            let next = read_block(&mut input, SEALED_CHUNK_SIZE)?;
            if next.is_empty() {
                break;
            }
            let plain = decryptor
                .decrypt_next(block.as_slice())
                .map_err(decryption_failed)?;
            decoder.write_all(&plain).map_err(decompression_failed)?;
            block = next;
        }

        if block.len() < TAG_SIZE {
            return Err(CodecError::Corrupted("artifact truncated".to_string()));
        }
        let plain = decryptor
            .decrypt_last(block.as_slice())
            .map_err(decryption_failed)?;
        decoder.write_all(&plain).map_err(decompression_failed)?;
        decoder.finish().map_err(decompression_failed)
    }

    /// Seal an in-memory buffer
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let (sealed, _) = self.seal_stream(plaintext, Vec::new())?;
        Ok(sealed)
    }

    /// Open a buffer produced by [`SealingCodec::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.open_stream(sealed, Vec::new())
    }

    pub fn is_sealed(data: &[u8]) -> bool {
        data.len() >= 8 && &data[..8] == SEALED_MAGIC
    }
}

#[async_trait]
impl ArtifactCodec for SealingCodec {
    async fn compress_and_encrypt(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<SealedArtifact, CodecError> {
        let codec = self.clone();
        let input = input.to_path_buf();
        let output = output_dir.join(format!("{}{}", file_name(&input), SEALED_SUFFIX));

        tokio::task::spawn_blocking(move || {
            let reader = BufReader::new(File::open(&input)?);
            let writer = BufWriter::new(File::create(&output)?);
            let (writer, stats) = codec.seal_stream(reader, writer)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

            debug!(
                input = %input.display(),
                output = %output.display(),
                original_size = stats.original_size,
                sealed_size = stats.sealed_size,
                "Artifact sealed"
            );

            Ok(SealedArtifact {
                path: output,
                plaintext_sha256: stats.plaintext_sha256,
                artifact_sha256: stats.artifact_sha256,
                original_size: stats.original_size,
                compressed_size: stats.sealed_size,
            })
        })
        .await
        .map_err(|e| CodecError::Task(e.to_string()))?
    }

    async fn decrypt_and_decompress(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<PathBuf, CodecError> {
        let codec = self.clone();
        let input = input.to_path_buf();
        let output = output_dir.join(opened_name(&input));

        tokio::task::spawn_blocking(move || {
            let reader = BufReader::new(File::open(&input)?);
            let writer = BufWriter::new(File::create(&output)?);
            let writer = codec.open_stream(reader, writer)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(output)
        })
        .await
        .map_err(|e| CodecError::Task(e.to_string()))?
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}

/// `x.dump.gz.enc` opens to `x.dump`; anything else gets `.plain` appended
fn opened_name(path: &Path) -> String {
    let name = file_name(path);
    match name.strip_suffix(SEALED_SUFFIX) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => format!("{}.plain", name),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Streaming SHA-256 of a file, on the blocking pool
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(File::open(&path)?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}
