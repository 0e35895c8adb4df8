//! Transparent stream encryption for backup artifacts.
//!
//! Wraps byte sinks and sources with AES-256-GCM so archives can be stored
//! in untrusted locations. Data is encrypted in fixed-size chunks, which
//! keeps memory usage flat no matter how large the archive is.
//!
//! # Stream Format
//!
//! ```text
//! [Magic: 4 bytes "AVSE"] [Version: 1 byte] [Nonce prefix: 8 bytes] [Frame]...
//! ```
//!
//! Every frame is the ciphertext of an up-to-64 KiB plaintext chunk plus a
//! 16-byte authentication tag. The per-frame nonce is the 8-byte random
//! prefix followed by the big-endian frame counter; the final frame is
//! simply shorter than the rest.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Magic bytes for encrypted streams
const MAGIC: &[u8; 4] = b"AVSE";

/// Current format version
const VERSION: u8 = 0x01;

/// Key size (256 bits for AES-256)
const KEY_SIZE: usize = 32;

/// Random part of the nonce; the remaining 4 bytes hold the frame counter
const NONCE_PREFIX_SIZE: usize = 8;

/// Nonce size (96 bits for AES-GCM)
const NONCE_SIZE: usize = 12;

/// Header size: magic (4) + version (1) + nonce prefix (8)
const HEADER_SIZE: usize = 13;

/// Plaintext bytes per frame
const CHUNK_SIZE: usize = 64 * 1024;

/// Authentication tag appended to every frame
const TAG_SIZE: usize = 16;

/// Ciphertext bytes per full frame
const FRAME_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// Encryption capability derived from a configured passphrase.
#[derive(Clone)]
pub struct Secret {
    key: [u8; KEY_SIZE],
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret").field("key", &"[REDACTED]").finish()
    }
}

impl Secret {
    /// Derives the AES key from an arbitrary passphrase.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.key.into())
    }

    /// Wraps a sink so that everything written to it is stored encrypted.
    ///
    /// The final partial chunk is sealed on shutdown, so callers must drive
    /// the writer to shutdown or the stream ends truncated.
    pub fn writer<W: AsyncWrite + Unpin>(&self, inner: W) -> EncryptWriter<W> {
        let mut pending = Vec::with_capacity(HEADER_SIZE);
        pending.extend_from_slice(MAGIC);
        pending.push(VERSION);

        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng.fill_bytes(&mut nonce_prefix);
        pending.extend_from_slice(&nonce_prefix);

        EncryptWriter {
            inner,
            cipher: self.cipher(),
            nonce_prefix,
            frame: 0,
            plain: Vec::with_capacity(CHUNK_SIZE),
            pending,
            pos: 0,
            finished: false,
        }
    }

    /// Wraps a plaintext source so reads yield the encrypted stream.
    ///
    /// Used by backends that consume a reader instead of exposing a writer.
    pub fn encrypt_reader<R: AsyncRead + Unpin>(&self, inner: R) -> EncryptReader<R> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);

        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng.fill_bytes(&mut nonce_prefix);
        out.extend_from_slice(&nonce_prefix);

        EncryptReader {
            inner,
            cipher: self.cipher(),
            nonce_prefix,
            frame: 0,
            plain: Vec::with_capacity(CHUNK_SIZE),
            out,
            pos: 0,
            inner_eof: false,
            finished: false,
        }
    }

    /// Wraps an encrypted source so reads yield the original plaintext.
    pub fn decrypt_reader<R: AsyncRead + Unpin>(&self, inner: R) -> DecryptReader<R> {
        DecryptReader {
            inner,
            cipher: self.cipher(),
            nonce_prefix: [0u8; NONCE_PREFIX_SIZE],
            header_done: false,
            frame: 0,
            raw: Vec::with_capacity(FRAME_SIZE),
            out: Vec::new(),
            pos: 0,
            inner_eof: false,
        }
    }
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], frame: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&frame.to_be_bytes());
    nonce
}

fn seal_frame(
    cipher: &Aes256Gcm,
    prefix: &[u8; NONCE_PREFIX_SIZE],
    frame: u32,
    plaintext: &[u8],
) -> io::Result<Vec<u8>> {
    let nonce = frame_nonce(prefix, frame);
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| io::Error::other("encryption failed"))
}

fn open_frame(
    cipher: &Aes256Gcm,
    prefix: &[u8; NONCE_PREFIX_SIZE],
    frame: u32,
    ciphertext: &[u8],
) -> io::Result<Vec<u8>> {
    let nonce = frame_nonce(prefix, frame);
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| io::Error::other("decryption failed (wrong key or corrupted data)"))
}

/// Reads as much as possible into `buf` up to `target` total length.
/// Returns true once the source reported EOF.
fn poll_fill<R: AsyncRead + Unpin>(
    inner: &mut R,
    cx: &mut Context<'_>,
    buf: &mut Vec<u8>,
    target: usize,
) -> Poll<io::Result<bool>> {
    while buf.len() < target {
        let old = buf.len();
        buf.resize(target, 0);
        let mut rb = ReadBuf::new(&mut buf[old..]);
        match Pin::new(&mut *inner).poll_read(cx, &mut rb) {
            Poll::Ready(Ok(())) => {
                let n = rb.filled().len();
                buf.truncate(old + n);
                if n == 0 {
                    return Poll::Ready(Ok(true));
                }
            }
            Poll::Ready(Err(e)) => {
                buf.truncate(old);
                return Poll::Ready(Err(e));
            }
            Poll::Pending => {
                buf.truncate(old);
                return Poll::Pending;
            }
        }
    }
    Poll::Ready(Ok(false))
}

/// `AsyncWrite` adapter producing the encrypted stream format.
pub struct EncryptWriter<W> {
    inner: W,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    frame: u32,
    plain: Vec<u8>,
    pending: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> EncryptWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink refused encrypted frame",
                )));
            }
            self.pos += n;
        }
        self.pending.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }

    fn seal_pending(&mut self) -> io::Result<()> {
        let ciphertext = seal_frame(&self.cipher, &self.nonce_prefix, self.frame, &self.plain)?;
        self.frame = self
            .frame
            .checked_add(1)
            .ok_or_else(|| io::Error::other("frame counter overflow"))?;
        self.plain.clear();
        self.pending.extend_from_slice(&ciphertext);
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for EncryptWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let space = CHUNK_SIZE - this.plain.len();
        let take = space.min(data.len());
        this.plain.extend_from_slice(&data[..take]);

        if this.plain.len() == CHUNK_SIZE {
            this.seal_pending()?;
        }

        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.finished {
            ready!(this.poll_drain(cx))?;
            if !this.plain.is_empty() {
                this.seal_pending()?;
            }
            this.finished = true;
        }
        ready!(this.poll_drain(cx))?;
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// `AsyncRead` adapter producing the encrypted stream format from a
/// plaintext source.
pub struct EncryptReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    frame: u32,
    plain: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    inner_eof: bool,
    finished: bool,
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pos < this.out.len() {
                let n = (this.out.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.out[this.pos..this.pos + n]);
                this.pos += n;
                if this.pos == this.out.len() {
                    this.out.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if this.finished {
                return Poll::Ready(Ok(()));
            }

            if !this.inner_eof {
                this.inner_eof =
                    ready!(poll_fill(&mut this.inner, cx, &mut this.plain, CHUNK_SIZE))?;
            }

            if this.plain.len() == CHUNK_SIZE || (this.inner_eof && !this.plain.is_empty()) {
                let ciphertext =
                    seal_frame(&this.cipher, &this.nonce_prefix, this.frame, &this.plain)?;
                this.frame = this
                    .frame
                    .checked_add(1)
                    .ok_or_else(|| io::Error::other("frame counter overflow"))?;
                this.plain.clear();
                this.out = ciphertext;
                this.pos = 0;
            }

            if this.inner_eof && this.plain.is_empty() {
                this.finished = true;
            }
        }
    }
}

/// `AsyncRead` adapter recovering plaintext from the encrypted stream format.
pub struct DecryptReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    header_done: bool,
    frame: u32,
    raw: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    inner_eof: bool,
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pos < this.out.len() {
                let n = (this.out.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.out[this.pos..this.pos + n]);
                this.pos += n;
                if this.pos == this.out.len() {
                    this.out.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if !this.header_done {
                let eof = ready!(poll_fill(&mut this.inner, cx, &mut this.raw, HEADER_SIZE))?;
                if eof && this.raw.len() < HEADER_SIZE {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated encryption header",
                    )));
                }
                if &this.raw[..4] != MAGIC {
                    return Poll::Ready(Err(io::Error::other("not an encrypted stream")));
                }
                if this.raw[4] != VERSION {
                    return Poll::Ready(Err(io::Error::other(format!(
                        "unsupported stream version: {}",
                        this.raw[4]
                    ))));
                }
                this.nonce_prefix.copy_from_slice(&this.raw[5..HEADER_SIZE]);
                this.header_done = true;
                this.raw.clear();
            }

            if !this.inner_eof {
                this.inner_eof = ready!(poll_fill(&mut this.inner, cx, &mut this.raw, FRAME_SIZE))?;
            }

            if this.raw.is_empty() {
                return Poll::Ready(Ok(()));
            }

            if this.raw.len() < TAG_SIZE {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated encrypted frame",
                )));
            }

            let plaintext = open_frame(&this.cipher, &this.nonce_prefix, this.frame, &this.raw)?;
            this.frame = this
                .frame
                .checked_add(1)
                .ok_or_else(|| io::Error::other("frame counter overflow"))?;
            this.raw.clear();
            this.out = plaintext;
            this.pos = 0;
        }
    }
}
