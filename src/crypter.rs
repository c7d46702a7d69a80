use std::{
    io::{self, BufReader, Read, Write},
    path::PathBuf,
    sync::Arc,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use parking_lot::RwLock;

use crate::{
    cipher::{PayloadCipher, SealingWriter},
    error::{EnvelopeError, Result},
    header::MAX_HEADER_LEN,
    keys::WrappedKey,
    wrapper::KeyWrapper,
};

/// Where the base64 wrapped key comes from.
#[derive(Clone, Debug)]
pub enum KeySource {
    /// Base64 key material given directly.
    Inline(String),
    /// File holding base64 key material.
    Path(PathBuf),
}

impl KeySource {
    fn load(&self) -> Result<WrappedKey> {
        let encoded = match self {
            KeySource::Inline(key) => key.clone(),
            KeySource::Path(path) => std::fs::read_to_string(path).map_err(|e| {
                EnvelopeError::Config(format!("can't read key file {}: {e}", path.display()))
            })?,
        };
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EnvelopeError::Config(format!("wrapped key is not valid base64: {e}")))?;
        if bytes.is_empty() {
            return Err(EnvelopeError::Config("wrapped key is empty".into()));
        }
        Ok(WrappedKey::new(bytes))
    }
}

/// Envelope encryption front end: header + KMS-unwrapped DEK + payload
/// cipher.
pub struct EnvelopeCrypter {
    wrapper: Arc<dyn KeyWrapper>,
    cipher: Arc<dyn PayloadCipher>,
    source: KeySource,
    /// Decoded once from `source`, then reused.
    wrapped_key: RwLock<Option<WrappedKey>>,
}

impl EnvelopeCrypter {
    pub fn new(source: KeySource, wrapper: Arc<dyn KeyWrapper>, cipher: Arc<dyn PayloadCipher>) -> Self {
        Self {
            wrapper,
            cipher,
            source,
            wrapped_key: RwLock::new(None),
        }
    }

    pub fn from_key(
        key: impl Into<String>,
        wrapper: Arc<dyn KeyWrapper>,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self::new(KeySource::Inline(key.into()), wrapper, cipher)
    }

    pub fn from_key_path(
        path: impl Into<PathBuf>,
        wrapper: Arc<dyn KeyWrapper>,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self::new(KeySource::Path(path.into()), wrapper, cipher)
    }

    pub fn name(&self) -> String {
        ["Enveloped", self.wrapper.name(), self.cipher.name(), "Crypter"].join("/")
    }

    /// Resolve the wrapped key from the configured source. The source is
    /// read at most once per crypter, however many threads race here.
    pub fn setup_wrapped_key(&self) -> Result<WrappedKey> {
        // Fast path.
        {
            let guard = self.wrapped_key.read();
            if let Some(key) = guard.as_ref() {
                return Ok(key.clone());
            }
        }

        // Slow path: take the write lock.
        let mut guard = self.wrapped_key.write();
        // Double-check.
        if let Some(key) = guard.as_ref() {
            return Ok(key.clone());
        }
        let key = self.source.load()?;
        log::debug!("resolved wrapped key {}", key.digest());
        *guard = Some(key.clone());
        Ok(key)
    }

    /// Wrap `writer` so that everything written to the returned adapter
    /// lands as `[header][ciphertext]`.
    ///
    /// Key resolution and unwrapping finish before this returns; on error
    /// nothing has reached `writer`.
    pub fn encrypt<'a, W: Write + 'a>(&self, writer: W) -> Result<EnvelopeWriter<'a>> {
        let wrapped = self.setup_wrapped_key()?;

        // The header must fit in the staging buffer so nothing is emitted
        // before the key is known to unwrap.
        let header = self.wrapper.serialize_wrapped_key(&wrapped);
        if header.len() > MAX_HEADER_LEN {
            return Err(EnvelopeError::HeaderTooLarge {
                len: header.len(),
                max: MAX_HEADER_LEN,
            });
        }
        let staging = HeaderStaging::new(writer, &header);

        let dek = self.wrapper.unwrap_key(&wrapped)?;
        let sealer = self.cipher.sealing_writer(&dek, Box::new(staging))?;
        Ok(EnvelopeWriter {
            sealer: Some(sealer),
        })
    }

    /// Read the header off `reader`, unwrap its key and return the
    /// plaintext stream.
    pub fn decrypt<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        let mut buffered = BufReader::with_capacity(MAX_HEADER_LEN, reader);
        let wrapped = self.wrapper.read_wrapped_key(&mut buffered)?;
        let dek = self.wrapper.unwrap_key(&wrapped)?;
        self.cipher.opening_reader(&dek, Box::new(buffered))
    }
}

/// Bounded buffer in front of the caller's writer, seeded with the header.
///
/// Unlike `BufWriter` it never writes on drop, so an encrypt call that
/// fails after staging leaves the caller's writer untouched.
struct HeaderStaging<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> HeaderStaging<W> {
    fn new(inner: W, header: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(MAX_HEADER_LEN);
        buf.extend_from_slice(header);
        Self { inner, buf }
    }

    /// Hand the staged bytes to the inner writer. The buffer is emptied
    /// even on failure, so a retry never repeats bytes that got through.
    fn drain(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = self.inner.write_all(&self.buf);
        self.buf.clear();
        result
    }
}

impl<W: Write> Write for HeaderStaging<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > MAX_HEADER_LEN {
            self.drain()?;
        }
        if data.len() > MAX_HEADER_LEN {
            return self.inner.write(data);
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()?;
        self.inner.flush()
    }
}

/// Encrypting write adapter returned by [`EnvelopeCrypter::encrypt`].
///
/// Not synchronized; one writer per stream. Call [`close`](Self::close)
/// to finish the stream and observe errors. Dropping an unclosed writer
/// abandons the stream: no final frame is written and anything still
/// staged is discarded, so the output never decrypts.
pub struct EnvelopeWriter<'a> {
    sealer: Option<Box<dyn SealingWriter<'a> + 'a>>,
}

impl EnvelopeWriter<'_> {
    /// Finish the ciphertext, then flush header and ciphertext through
    /// to the underlying writer. Later calls are no-ops.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(sealer) = self.sealer.take() else {
            return Ok(());
        };
        let mut staging = sealer.finish()?;
        staging.flush()
    }

    pub fn is_closed(&self) -> bool {
        self.sealer.is_none()
    }
}

impl Write for EnvelopeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sealer.as_mut() {
            Some(sealer) => sealer.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "envelope writer is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sealer.as_mut() {
            Some(sealer) => sealer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for EnvelopeWriter<'_> {
    fn drop(&mut self) {
        if self.sealer.take().is_some() {
            log::warn!("envelope writer dropped without close, stream left unterminated");
        }
    }
}
