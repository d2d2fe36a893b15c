//! Cursor-based byte parser for class images and method bodies.
//!
//! [`Parser`] maintains a position within a borrowed byte slice and offers bounds-checked
//! reads of the primitives the code-object format is built from: little-endian integers,
//! ECMA-335 style compressed unsigned integers, and length-prefixed UTF-8 strings.
//!
//! # Examples
//!
//! ```rust
//! use shadowbox::code::Parser;
//!
//! let data = [0x01, 0x02, 0x03, 0x04, 0x02, b'h', b'i'];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_le::<u32>()?, 0x0403_0201);
//! assert_eq!(parser.read_prefixed_str()?, "hi");
//! assert!(!parser.has_more_data());
//! # Ok::<(), shadowbox::Error>(())
//! ```

use crate::{
    code::io::{read_le_at, CodeIO},
    Error::OutOfBounds,
    Result,
};

/// A cursor over a byte slice with bounds-checked typed reads.
///
/// The parser never panics on truncated or hostile input; every read that would pass the
/// end of the buffer returns [`crate::Error::OutOfBounds`] and invalid encodings return
/// [`crate::Error::Malformed`].
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`Parser`] from a byte slice.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Move the current position to the specified index.
    ///
    /// Seeking to exactly `len()` is allowed and leaves the parser exhausted.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if position is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(OutOfBounds);
        }

        self.position = pos;
        Ok(())
    }

    /// Read a value of type `T` in little-endian format.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading `T` would exceed the data length.
    pub fn read_le<T: CodeIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read `len` raw bytes as a borrowed slice.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.position.checked_add(len).ok_or(OutOfBounds)?;
        if end > self.data.len() {
            return Err(OutOfBounds);
        }

        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a compressed unsigned integer (1, 2 or 4 bytes, ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
    /// [`crate::Error::Malformed`] for an invalid lead byte.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            let value = ((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte);
            return Ok(value);
        }

        // 4-byte encoding: 11xxxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            let value = ((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3;
            return Ok(value);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Read a compressed-uint length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the string runs past the end of the data or
    /// [`crate::Error::Malformed`] for invalid UTF-8.
    pub fn read_prefixed_str(&mut self) -> Result<&'a str> {
        let length = self.read_compressed_uint()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(length)?;

        std::str::from_utf8(bytes).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                start + length,
                e
            )
        })
    }

    /// Execute a closure transactionally, rolling back the position on failure.
    ///
    /// # Errors
    /// Propagates the closure's error after restoring the position.
    pub fn transactional<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let saved_position = self.position;
        let result = f(self);
        if result.is_err() {
            self.position = saved_position;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn compressed_uint_encodings() {
        let data = [0x03, 0x80, 0x80, 0xC0, 0x00, 0x40, 0x00, 0x1D];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_compressed_uint().unwrap(), 0x03);
        assert_eq!(parser.read_compressed_uint().unwrap(), 0x80);
        assert_eq!(parser.read_compressed_uint().unwrap(), 0x4000);
        assert_eq!(parser.read_compressed_uint().unwrap(), 0x1D);
        assert!(!parser.has_more_data());
    }

    #[test]
    fn invalid_compressed_lead_byte() {
        let mut parser = Parser::new(&[0xE0]);
        assert!(matches!(
            parser.read_compressed_uint(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn truncated_string() {
        let mut parser = Parser::new(&[0x05, b'a', b'b']);
        assert!(matches!(parser.read_prefixed_str(), Err(Error::OutOfBounds)));
    }

    #[test]
    fn invalid_utf8_string() {
        let mut parser = Parser::new(&[0x02, 0xC3, 0x28]);
        assert!(matches!(
            parser.read_prefixed_str(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn transactional_restores_position() {
        let data = [0x01, 0x02];
        let mut parser = Parser::new(&data);
        let result: Result<u32> = parser.transactional(|p| p.read_le());
        assert!(result.is_err());
        assert_eq!(parser.pos(), 0);
        assert_eq!(parser.read_le::<u16>().unwrap(), 0x0201);
    }

    #[test]
    fn seek_to_end_is_allowed() {
        let data = [0x01, 0x02];
        let mut parser = Parser::new(&data);
        parser.seek(2).unwrap();
        assert!(!parser.has_more_data());
        assert!(parser.seek(3).is_err());
    }
}
