//! AES-128-CFB8 session streams
//!
//! Both halves start in plaintext. After the shared secret has been
//! exchanged, `enable` installs a cipher with key = IV = secret and every
//! subsequent byte goes through it. CFB8 is a byte-oriented stream mode, so
//! reads and writes of any size keep both sides in lockstep as long as no
//! byte is dropped or duplicated.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use openssl::symm::{Cipher, Crypter, Mode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::ProtocolError;

/// Length of the shared secret in bytes
pub const SECRET_LEN: usize = 16;

fn new_crypter(mode: Mode, secret: &[u8]) -> Result<Crypter, ProtocolError> {
    if secret.len() != SECRET_LEN {
        return Err(ProtocolError::Cipher(format!(
            "shared secret must be {} bytes, got {}",
            SECRET_LEN,
            secret.len()
        )));
    }
    Crypter::new(Cipher::aes_128_cfb8(), mode, secret, Some(secret))
        .map_err(|e| ProtocolError::Cipher(e.to_string()))
}

fn apply(crypter: &mut Crypter, scratch: &mut Vec<u8>, data: &mut [u8]) -> io::Result<()> {
    // openssl wants room for one extra block even in stream modes
    scratch.resize(data.len() + Cipher::aes_128_cfb8().block_size(), 0);
    let n = crypter
        .update(data, scratch)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if n != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("cipher produced {} bytes for {} input bytes", n, data.len()),
        ));
    }
    data.copy_from_slice(&scratch[..n]);
    Ok(())
}

/// Read half. Decrypts in place once enabled.
pub struct CipherReader<R> {
    inner: R,
    crypter: Option<Crypter>,
    scratch: Vec<u8>,
}

impl<R> CipherReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            crypter: None,
            scratch: Vec::new(),
        }
    }

    /// Switch the stream to AES-CFB8 decryption
    pub fn enable(&mut self, secret: &[u8]) -> Result<(), ProtocolError> {
        self.crypter = Some(new_crypter(Mode::Decrypt, secret)?);
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypter.is_some()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        if let Some(crypter) = this.crypter.as_mut() {
            let fresh = &mut buf.filled_mut()[before..];
            if !fresh.is_empty() {
                apply(crypter, &mut this.scratch, fresh)?;
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Write half. Whole buffers are encrypted and then written out, so a frame
/// is never half-encrypted.
pub struct CipherWriter<W> {
    inner: W,
    crypter: Option<Crypter>,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            crypter: None,
            scratch: Vec::new(),
        }
    }

    /// Switch the stream to AES-CFB8 encryption
    pub fn enable(&mut self, secret: &[u8]) -> Result<(), ProtocolError> {
        self.crypter = Some(new_crypter(Mode::Encrypt, secret)?);
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypter.is_some()
    }

    /// Encrypt (if enabled) and write the whole buffer
    pub async fn write_all(&mut self, mut data: Vec<u8>) -> io::Result<()> {
        if let Some(crypter) = self.crypter.as_mut() {
            apply(crypter, &mut self.scratch, &mut data)?;
        }
        self.inner.write_all(&data).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
