//! Wrapped-key header codec.
//!
//! ```text
//! [ magic | version (1) | payload len (u32 LE) | wrapped key ... ]
//! ```
//!
//! The header embeds its own length so it can sit directly in front of
//! an otherwise opaque ciphertext stream.

use std::io::{self, Read};

use nom::{
    IResult,
    Parser,
    bytes::complete::tag,
    number::complete::{le_u32, u8 as version_byte},
};

use crate::{
    error::{EnvelopeError, Result},
    keys::WrappedKey,
};

/// Upper bound on a serialized header, enforced on write and on read.
pub const MAX_HEADER_LEN: usize = 4096 * 2;

/// Magic + version pair identifying one wrapping scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scheme {
    pub magic: &'static [u8],
    pub version: u8,
}

impl Scheme {
    pub const fn new(magic: &'static [u8], version: u8) -> Self {
        Self { magic, version }
    }

    /// Bytes preceding the wrapped key: magic, version and length.
    pub const fn prefix_len(&self) -> usize {
        self.magic.len() + 1 + 4
    }

    pub fn header_len(&self, payload_len: usize) -> usize {
        self.prefix_len() + payload_len
    }

    pub fn serialize(&self, key: &WrappedKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len(key.len()));
        out.extend_from_slice(self.magic);
        out.push(self.version);
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out
    }

    /// Read one header from the front of `reader`.
    ///
    /// Consumes exactly `prefix_len() + payload len` bytes. Short reads
    /// are retried until the stream reports end-of-file. A foreign magic
    /// is a format error even when the stream ends inside it.
    pub fn read<R: Read + ?Sized>(&self, reader: &mut R) -> Result<WrappedKey> {
        let magic_len = self.magic.len();
        let mut prefix = vec![0u8; self.prefix_len()];

        let got = read_up_to(reader, &mut prefix[..magic_len])
            .map_err(|e| EnvelopeError::from_read(e, "header magic"))?;
        if prefix[..got] != self.magic[..got] {
            return Err(self.bad_magic());
        }
        if got < magic_len {
            return Err(EnvelopeError::Truncated(
                "stream ended while reading header magic".into(),
            ));
        }
        reader
            .read_exact(&mut prefix[magic_len..])
            .map_err(|e| EnvelopeError::from_read(e, "header prefix"))?;

        let (version, payload_len) = match parse_prefix(&prefix, self.magic) {
            Ok((_, (_, version, len))) => (version, len as usize),
            Err(_) => return Err(self.bad_magic()),
        };
        if version != self.version {
            return Err(EnvelopeError::Version {
                found: version,
                expected: self.version,
            });
        }

        // Validate the declared length before allocating anything for it.
        let total = self.prefix_len().saturating_add(payload_len);
        if total > MAX_HEADER_LEN {
            return Err(EnvelopeError::HeaderTooLarge {
                len: total,
                max: MAX_HEADER_LEN,
            });
        }
        if payload_len == 0 {
            return Err(EnvelopeError::Format("empty wrapped key".into()));
        }

        let mut payload = vec![0u8; payload_len];
        reader
            .read_exact(&mut payload)
            .map_err(|e| EnvelopeError::from_read(e, "wrapped key"))?;
        Ok(WrappedKey::new(payload))
    }

    fn bad_magic(&self) -> EnvelopeError {
        EnvelopeError::Format(format!(
            "expected magic {:?}",
            String::from_utf8_lossy(self.magic)
        ))
    }
}

/// Fill as much of `buf` as the stream yields before end-of-file.
fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn parse_prefix<'a>(input: &'a [u8], magic: &'static [u8]) -> IResult<&'a [u8], (&'a [u8], u8, u32)> {
    (tag(magic), version_byte, le_u32).parse(input)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use super::*;

    const SCHEME: Scheme = Scheme::new(b"envelope-yc-kms", 1);

    /// Hands out at most one byte per `read` call.
    struct Trickle<R>(R);

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(1);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn serialize_matches_layout() {
        let bytes = SCHEME.serialize(&WrappedKey::new(vec![1, 2, 3]));
        let mut expected = b"envelope-yc-kms".to_vec();
        expected.extend_from_slice(&[1, 3, 0, 0, 0, 1, 2, 3]);
        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), 23);
    }

    #[test]
    fn read_leaves_trailing_bytes() {
        let mut data = SCHEME.serialize(&WrappedKey::new(vec![1, 2, 3]));
        data.extend_from_slice(b"ciphertext");
        let mut cursor = Cursor::new(data);

        let key = SCHEME.read(&mut cursor).unwrap();
        assert_eq!(key.as_bytes(), &[1, 2, 3]);
        assert_eq!(cursor.position(), 23);

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"ciphertext");
    }

    #[test]
    fn short_reads_are_filled() {
        let data = SCHEME.serialize(&WrappedKey::new(vec![9; 40]));
        let key = SCHEME.read(&mut Trickle(Cursor::new(data))).unwrap();
        assert_eq!(key.as_bytes(), &[9; 40][..]);
    }

    #[test]
    fn wrong_magic_is_format_error() {
        let mut data = SCHEME.serialize(&WrappedKey::new(vec![1]));
        data[0] = b'E';
        let err = SCHEME.read(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, EnvelopeError::Format(_)));
    }

    #[test]
    fn short_foreign_input_is_format_error() {
        let err = SCHEME.read(&mut Cursor::new(b"PK\x03\x04zip")).unwrap_err();
        assert!(matches!(err, EnvelopeError::Format(_)));

        let err = SCHEME.read(&mut Trickle(Cursor::new(b"envX"))).unwrap_err();
        assert!(matches!(err, EnvelopeError::Format(_)));

        let err = SCHEME.read(&mut Cursor::new(b"")).unwrap_err();
        assert!(matches!(err, EnvelopeError::Truncated(_)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut data = SCHEME.serialize(&WrappedKey::new(vec![1]));
        data[15] = 2;
        let err = SCHEME.read(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Version {
                found: 2,
                expected: 1
            }
        ));
    }

    #[test]
    fn huge_length_rejected_before_allocation() {
        let mut data = b"envelope-yc-kms".to_vec();
        data.push(1);
        data.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = SCHEME.read(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, EnvelopeError::HeaderTooLarge { .. }));
    }

    #[test]
    fn truncated_payload() {
        let data = SCHEME.serialize(&WrappedKey::new(vec![7; 10]));
        let err = SCHEME.read(&mut Cursor::new(&data[..data.len() - 1])).unwrap_err();
        assert!(matches!(err, EnvelopeError::Truncated(_)));

        let err = SCHEME.read(&mut Cursor::new(&data[..4])).unwrap_err();
        assert!(matches!(err, EnvelopeError::Truncated(_)));
    }
}
