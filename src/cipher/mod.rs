pub mod stream;

use std::io::{self, Read, Write};

use crate::{error::Result, keys::Dek};

pub use stream::StreamCipher;

/// Writer half of a payload cipher.
pub trait SealingWriter<'a>: Write {
    /// Emit everything still buffered plus the end-of-stream marker and
    /// hand the sink back, unflushed.
    fn finish(self: Box<Self>) -> io::Result<Box<dyn Write + 'a>>;
}

/// Bulk payload encryption under a plaintext DEK.
pub trait PayloadCipher: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn sealing_writer<'a>(
        &self,
        key: &Dek,
        sink: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn SealingWriter<'a> + 'a>>;

    fn opening_reader<'a>(&self, key: &Dek, source: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>>;
}
