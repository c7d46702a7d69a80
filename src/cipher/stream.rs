use std::io::{self, Read, Write};

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};

use super::{PayloadCipher, SealingWriter};
use crate::{
    error::{EnvelopeError, Result},
    keys::Dek,
};

const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const PREFIX_LEN: usize = 7;

const FRAME_MORE: u8 = 0;
const FRAME_LAST: u8 = 1;

/// Chunked AES-256-GCM payload engine.
///
/// Layout:
/// ```text
/// [ nonce prefix (7) | frame ... | last frame ]
/// frame = flag (1) | ciphertext len (u32 LE) | ciphertext + tag
/// ```
///
/// Each frame nonce is `prefix || counter (u32 BE) || flag`, so frames
/// cannot be reordered, dropped or truncated without failing
/// authentication.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamCipher;

impl PayloadCipher for StreamCipher {
    fn name(&self) -> &str {
        "AesGcmStream"
    }

    fn sealing_writer<'a>(
        &self,
        key: &Dek,
        mut sink: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn SealingWriter<'a> + 'a>> {
        let cipher = new_cipher(key)?;
        let mut prefix = [0u8; PREFIX_LEN];
        getrandom::getrandom(&mut prefix)
            .map_err(|e| EnvelopeError::Cipher(format!("getrandom failed: {e}")))?;
        sink.write_all(&prefix)?;
        Ok(Box::new(StreamSealer {
            cipher,
            prefix,
            counter: 0,
            pending: Vec::with_capacity(CHUNK_SIZE),
            sink,
        }))
    }

    fn opening_reader<'a>(&self, key: &Dek, mut source: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        let cipher = new_cipher(key)?;
        let mut prefix = [0u8; PREFIX_LEN];
        source
            .read_exact(&mut prefix)
            .map_err(|e| EnvelopeError::from_read(e, "payload nonce"))?;
        Ok(Box::new(StreamOpener {
            cipher,
            prefix,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
            source,
        }))
    }
}

fn new_cipher(key: &Dek) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
        EnvelopeError::Cipher(format!("payload key must be 32 bytes, got {}", key.len()))
    })
}

fn frame_nonce(prefix: &[u8; PREFIX_LEN], counter: u32, flag: u8) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[..PREFIX_LEN].copy_from_slice(prefix);
    n[PREFIX_LEN..PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    n[11] = flag;
    n
}

fn next_counter(counter: u32) -> io::Result<u32> {
    counter
        .checked_add(1)
        .ok_or_else(|| io::Error::other("payload stream too long"))
}

struct StreamSealer<'a> {
    cipher: Aes256Gcm,
    prefix: [u8; PREFIX_LEN],
    counter: u32,
    pending: Vec<u8>,
    sink: Box<dyn Write + 'a>,
}

impl StreamSealer<'_> {
    fn seal_frame(&mut self, len: usize, flag: u8) -> io::Result<()> {
        let nonce = frame_nonce(&self.prefix, self.counter, flag);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), &self.pending[..len])
            .map_err(|e| io::Error::other(format!("payload encrypt failed: {e}")))?;
        self.sink.write_all(&[flag])?;
        self.sink.write_all(&(sealed.len() as u32).to_le_bytes())?;
        self.sink.write_all(&sealed)?;
        self.pending.drain(..len);
        self.counter = next_counter(self.counter)?;
        Ok(())
    }
}

impl Write for StreamSealer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        // Keep at least one byte back so the last frame is never empty
        // unless the whole stream is.
        while self.pending.len() > CHUNK_SIZE {
            self.seal_frame(CHUNK_SIZE, FRAME_MORE)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<'a> SealingWriter<'a> for StreamSealer<'a> {
    fn finish(mut self: Box<Self>) -> io::Result<Box<dyn Write + 'a>> {
        let len = self.pending.len();
        self.seal_frame(len, FRAME_LAST)?;
        Ok(self.sink)
    }
}

struct StreamOpener<'a> {
    cipher: Aes256Gcm,
    prefix: [u8; PREFIX_LEN],
    counter: u32,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
    source: Box<dyn Read + 'a>,
}

impl StreamOpener<'_> {
    fn open_frame(&mut self) -> io::Result<()> {
        let mut head = [0u8; 5];
        self.source.read_exact(&mut head).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(e.kind(), "payload ended before the final frame")
            } else {
                e
            }
        })?;
        let flag = head[0];
        if flag != FRAME_MORE && flag != FRAME_LAST {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame flag {flag}"),
            ));
        }
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid frame length {len}"),
            ));
        }

        let mut sealed = vec![0u8; len];
        self.source.read_exact(&mut sealed)?;
        let nonce = frame_nonce(&self.prefix, self.counter, flag);
        self.plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), &sealed[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("payload decrypt failed: {e}")))?;
        self.pos = 0;
        self.counter = next_counter(self.counter)?;
        self.done = flag == FRAME_LAST;
        Ok(())
    }
}

impl Read for StreamOpener<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.open_frame()?;
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
