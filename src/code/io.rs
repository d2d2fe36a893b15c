//! Little-endian primitive IO for code objects.
//!
//! The [`CodeIO`] trait abstracts over the fixed-width integers that appear in class images
//! and instruction operands, so that [`crate::code::Parser`] and [`crate::code::CodeWriter`]
//! share one bounds-checked implementation per direction.

use crate::{Error::OutOfBounds, Result};

/// Fixed-width integer that can be read from and written to a little-endian byte stream.
///
/// # Examples
///
/// ```rust
/// use shadowbox::code::{read_le_at, CodeIO};
///
/// let data = [0x01, 0x00, 0x02, 0x00];
/// let mut offset = 0;
/// let first: u16 = read_le_at(&data, &mut offset)?;
/// assert_eq!(first, 1);
/// assert_eq!(offset, 2);
/// # Ok::<(), shadowbox::Error>(())
/// ```
pub trait CodeIO: Sized + Copy {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_code_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CodeIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_code_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing it.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: CodeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Appends `value` in little-endian byte order to `out`.
pub fn write_le<T: CodeIO>(out: &mut Vec<u8>, value: T) {
    out.extend_from_slice(value.to_le_bytes().as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_advances_offset() {
        let data = [0xFF, 0x01, 0x02, 0x03, 0x04];
        let mut offset = 1;
        let value: u32 = read_le_at(&data, &mut offset).unwrap();
        assert_eq!(value, 0x0403_0201);
        assert_eq!(offset, 5);
    }

    #[test]
    fn read_past_end_fails_without_moving() {
        let data = [0x01, 0x02];
        let mut offset = 1;
        let result: Result<u16> = read_le_at(&data, &mut offset);
        assert!(matches!(result, Err(OutOfBounds)));
        assert_eq!(offset, 1);
    }

    #[test]
    fn write_then_read_signed() {
        let mut out = Vec::new();
        write_le(&mut out, -2_i32);
        write_le(&mut out, i64::MIN);
        let mut offset = 0;
        assert_eq!(read_le_at::<i32>(&out, &mut offset).unwrap(), -2);
        assert_eq!(read_le_at::<i64>(&out, &mut offset).unwrap(), i64::MIN);
    }
}
