//! Encoding and decoding of the primitive Wayland wire types.
//!
//! All values use the host's native byte order, as the protocol only ever
//! runs over a local socket.

use std::io::{Cursor, Write};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use paste::paste;
use thiserror::Error;

use super::{fixed::Fixed, pad_to_32_bits};

/// A unique object id.
pub type ObjectId = u32;

/// The id of an object created by the message carrying it.
pub type NewId = ObjectId;

/// The size of a type in bytes when encoded for the wire, padding included.
pub trait MessageSize {
    /// Returns the encoded size of this value in bytes.
    fn size(&self) -> usize;
}

/// A [`MessageSize`] that does not depend on the value.
pub trait CompileTimeMessageSize: MessageSize {
    /// The encoded size of this type in bytes.
    const SIZE: usize;
}

/// A type that can be decoded from the start of a byte slice.
pub trait Decode: Sized {
    /// Decodes a value and returns it together with the number of bytes it
    /// occupied on the wire, padding included.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] when `data` ends before the value
    /// does, or a type specific error for malformed contents.
    fn decode(data: &[u8]) -> Result<(Self, usize), SerdeError>;
}

/// A type that can be appended to an outgoing message.
pub trait Encode: MessageSize {
    /// Appends the wire representation of this value to `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the buffer fails.
    fn encode(&self, data: &mut Vec<u8>) -> Result<(), SerdeError>;
}

/// Returns [`SerdeError::InvalidSize`] from the enclosing function when
/// `$data` is shorter than `$needed` bytes.
#[macro_export]
macro_rules! ensure_size {
    ($data:expr, $needed:expr) => {
        if $data.len() < $needed {
            return Err($crate::wire::serde::SerdeError::InvalidSize {
                needed: $needed,
                available: $data.len(),
            });
        }
    };
}
pub use crate::ensure_size;

macro_rules! impl_serde {
    ($($type:ident),*) => {
        $(
            impl CompileTimeMessageSize for $type {
                const SIZE: usize = size_of::<$type>();
            }
            impl MessageSize for $type {
                fn size(&self) -> usize {
                    Self::SIZE
                }
            }
            impl Decode for $type {
                fn decode(data: &[u8]) -> Result<(Self, usize), SerdeError> {
                    ensure_size!(data, Self::SIZE);
                    let mut cursor = Cursor::new(data);
                    paste! {
                        Ok((cursor.[<read_ $type>]::<NativeEndian>()?, Self::SIZE))
                    }
                }
            }
            impl Encode for $type {
                fn encode(&self, data: &mut Vec<u8>) -> Result<(), SerdeError> {
                    paste! {
                        data.[<write_ $type>]::<NativeEndian>(*self)?;
                    }
                    Ok(())
                }
            }
        )*
    };
}

impl_serde!(u32, i32);

impl CompileTimeMessageSize for Fixed {
    const SIZE: usize = 4;
}
impl MessageSize for Fixed {
    fn size(&self) -> usize {
        Self::SIZE
    }
}
impl Decode for Fixed {
    fn decode(data: &[u8]) -> Result<(Self, usize), SerdeError> {
        let (raw, size) = i32::decode(data)?;
        Ok((Self::from_raw(raw), size))
    }
}
impl Encode for Fixed {
    fn encode(&self, data: &mut Vec<u8>) -> Result<(), SerdeError> {
        self.to_raw().encode(data)
    }
}

/// The header that prefixes every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// The id of the object the message is for.
    pub object_id: ObjectId,
    /// The opcode of the request or event.
    pub opcode: u16,
    /// The size of the message in bytes, including the header.
    pub size: u16,
}

impl MessageHeader {
    /// Returns the number of body bytes that follow the header.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] when the declared size cannot even
    /// hold the header itself.
    pub fn body_len(&self) -> Result<usize, SerdeError> {
        let size = usize::from(self.size);
        if size < Self::SIZE {
            return Err(SerdeError::InvalidSize {
                needed: Self::SIZE,
                available: size,
            });
        }
        Ok(size - Self::SIZE)
    }
}

impl CompileTimeMessageSize for MessageHeader {
    const SIZE: usize = 8;
}
impl MessageSize for MessageHeader {
    fn size(&self) -> usize {
        Self::SIZE
    }
}
// The second word packs the opcode into its low half and the size into its
// high half, so both are extracted from the native-order word.
impl Decode for MessageHeader {
    fn decode(data: &[u8]) -> Result<(Self, usize), SerdeError> {
        ensure_size!(data, Self::SIZE);
        let mut cursor = Cursor::new(data);
        let object_id = cursor.read_u32::<NativeEndian>()?;
        let word = cursor.read_u32::<NativeEndian>()?;
        Ok((
            Self {
                object_id,
                opcode: (word & 0xffff) as u16,
                size: (word >> 16) as u16,
            },
            Self::SIZE,
        ))
    }
}
impl Encode for MessageHeader {
    fn encode(&self, data: &mut Vec<u8>) -> Result<(), SerdeError> {
        data.write_u32::<NativeEndian>(self.object_id)?;
        data.write_u32::<NativeEndian>((u32::from(self.size) << 16) | u32::from(self.opcode))?;
        Ok(())
    }
}

/// A length prefixed, NUL terminated UTF-8 string.
///
/// The length on the wire counts the terminator. Decoding trims every trailing
/// NUL and then skips padding up to the next 32 bit boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireString(pub String);

impl MessageSize for WireString {
    fn size(&self) -> usize {
        4 + pad_to_32_bits(self.0.len() + 1)
    }
}
impl Decode for WireString {
    fn decode(data: &[u8]) -> Result<(Self, usize), SerdeError> {
        let (len, _) = u32::decode(data)?;
        let len = len as usize;
        let end = 4 + len;
        ensure_size!(data, end);

        let raw = &data[4..end];
        let trimmed = raw.len() - raw.iter().rev().take_while(|&&b| b == 0).count();
        let string = String::from_utf8(raw[..trimmed].to_vec())?;

        let padding = if len & 3 != 0 { 4 - (len & 3) } else { 0 };
        ensure_size!(data, end + padding);

        Ok((Self(string), end + padding))
    }
}
impl Encode for WireString {
    fn encode(&self, data: &mut Vec<u8>) -> Result<(), SerdeError> {
        let len = self.0.len() + 1;
        let len_u32 = u32::try_from(len).map_err(|_| SerdeError::MessageTooLarge(len))?;
        len_u32.encode(data)?;
        data.write_all(self.0.as_bytes())?;
        data.resize(data.len() + pad_to_32_bits(len) - self.0.len(), 0);
        Ok(())
    }
}
impl From<&str> for WireString {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
impl From<String> for WireString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A length prefixed array of 32 bit signed integers.
///
/// The length on the wire is in bytes. Only whole integers are read; arrays
/// are already aligned by construction, so no padding is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireArray(pub Vec<i32>);

impl MessageSize for WireArray {
    fn size(&self) -> usize {
        4 + self.0.len() * 4
    }
}
impl Decode for WireArray {
    fn decode(data: &[u8]) -> Result<(Self, usize), SerdeError> {
        let (len, _) = u32::decode(data)?;
        let count = len as usize / 4;
        let end = 4 + count * 4;
        ensure_size!(data, end);

        let mut cursor = Cursor::new(&data[4..end]);
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(cursor.read_i32::<NativeEndian>()?);
        }

        Ok((Self(values), end))
    }
}
impl Encode for WireArray {
    fn encode(&self, data: &mut Vec<u8>) -> Result<(), SerdeError> {
        let len = self.0.len() * 4;
        let len_u32 = u32::try_from(len).map_err(|_| SerdeError::MessageTooLarge(len))?;
        len_u32.encode(data)?;
        for value in &self.0 {
            value.encode(data)?;
        }
        Ok(())
    }
}

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum SerdeError {
    /// The data ended before the value being decoded did.
    #[error("message body overrun: needed {needed} bytes, {available} available")]
    InvalidSize {
        /// Bytes required from the current position.
        needed: usize,
        /// Bytes left from the current position.
        available: usize,
    },
    /// A string was not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// A file descriptor was read but none were left in the message.
    #[error("no file descriptor left in the message")]
    MissingFileDescriptor,
    /// A message or field is larger than the wire format allows.
    #[error("{0} bytes do not fit in a wire message")]
    MessageTooLarge(usize),
    /// An IO error occurred while encoding/decoding.
    #[error("IO error occurred while encoding/decoding")]
    IoError(#[from] std::io::Error),
}
