//! Append-only encoder, the write-side counterpart of [`crate::code::Parser`].

use crate::{
    code::io::{write_le, CodeIO},
    Result,
};

/// Largest value representable by the 4-byte compressed integer encoding.
pub const MAX_COMPRESSED_UINT: u32 = 0x1FFF_FFFF;

/// Growable output buffer with typed writes.
#[derive(Debug, Default)]
pub struct CodeWriter {
    out: Vec<u8>,
}

impl CodeWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Write a value of type `T` in little-endian format.
    pub fn write_le<T: CodeIO>(&mut self, value: T) {
        write_le(&mut self.out, value);
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Write a compressed unsigned integer (1, 2 or 4 bytes, ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `value` exceeds [`MAX_COMPRESSED_UINT`].
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        match value {
            0..=0x7F => self.out.push(value as u8),
            0x80..=0x3FFF => {
                let bytes = (value as u16 | 0x8000).to_be_bytes();
                self.out.extend_from_slice(&bytes);
            }
            0x4000..=MAX_COMPRESSED_UINT => {
                let bytes = (value | 0xC000_0000).to_be_bytes();
                self.out.extend_from_slice(&bytes);
            }
            _ => return Err(malformed_error!("Value {} too large to compress", value)),
        }
        Ok(())
    }

    /// Write a compressed-uint length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the string is longer than the prefix allows.
    pub fn write_prefixed_str(&mut self, value: &str) -> Result<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| malformed_error!("String of {} bytes is too long", value.len()))?;
        self.write_compressed_uint(len)?;
        self.out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Consumes the writer and returns the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Parser;

    #[test]
    fn compressed_uint_matches_parser() {
        let mut writer = CodeWriter::new();
        for value in [0, 0x7F, 0x80, 0x3FFF, 0x4000, MAX_COMPRESSED_UINT] {
            writer.write_compressed_uint(value).unwrap();
        }
        let bytes = writer.into_bytes();
        let mut parser = Parser::new(&bytes);
        for value in [0, 0x7F, 0x80, 0x3FFF, 0x4000, MAX_COMPRESSED_UINT] {
            assert_eq!(parser.read_compressed_uint().unwrap(), value);
        }
    }

    #[test]
    fn oversized_compressed_uint_is_rejected() {
        let mut writer = CodeWriter::new();
        assert!(writer.write_compressed_uint(MAX_COMPRESSED_UINT + 1).is_err());
        assert!(writer.is_empty());
    }
}
