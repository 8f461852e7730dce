//! The Wayland wire format.
//!
//! [`MessageDecoder`] walks the body of a received message field by field,
//! [`MessageEncoder`] builds an outgoing message behind a header whose size is
//! filled in once the body is complete.

use std::io::Cursor;

use serde::{
    CompileTimeMessageSize, Decode, Encode, MessageHeader, ObjectId, SerdeError, WireArray,
    WireString,
};

pub mod fixed;
pub mod serde;

pub use fixed::Fixed;

/// Pads the given position to the next multiple of 4 bytes (32 bits).
#[must_use]
pub const fn pad_to_32_bits(pos: usize) -> usize {
    (pos + 3) & !3
}

/// A cursor over the body of a message.
///
/// Every read advances the cursor by exactly the wire width of the value.
/// Reading past the end of the body is an error, never a zero value.
#[derive(Debug, Clone)]
pub struct MessageDecoder<T> {
    data: Cursor<T>,
}

impl<T: AsRef<[u8]>> MessageDecoder<T> {
    /// Creates a decoder positioned at the start of `data`.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            data: Cursor::new(data),
        }
    }

    /// Reads a value of type `V` from the current position.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails. See [`Decode::decode`] for more details.
    pub fn read<V: Decode>(&mut self) -> Result<V, SerdeError> {
        let pos = self.position();
        let data = self.data.get_ref().as_ref().get(pos..).unwrap_or_default();

        let (value, used) = V::decode(data)?;
        self.data.set_position((pos + used) as u64);
        Ok(value)
    }

    /// Reads an unsigned 32 bit integer.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if fewer than 4 bytes remain.
    pub fn read_u32(&mut self) -> Result<u32, SerdeError> {
        self.read()
    }

    /// Reads a signed 32 bit integer.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if fewer than 4 bytes remain.
    pub fn read_i32(&mut self) -> Result<i32, SerdeError> {
        self.read()
    }

    /// Reads a 24.8 fixed point number.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if fewer than 4 bytes remain.
    pub fn read_fixed(&mut self) -> Result<Fixed, SerdeError> {
        self.read()
    }

    /// Reads a 24.8 fixed point number as an `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if fewer than 4 bytes remain.
    pub fn read_f32(&mut self) -> Result<f32, SerdeError> {
        self.read_fixed().map(Fixed::to_f32)
    }

    /// Reads a string and skips the padding that follows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the string or its padding runs past the body, or
    /// if it is not valid UTF-8.
    pub fn read_string(&mut self) -> Result<String, SerdeError> {
        self.read::<WireString>().map(|s| s.0)
    }

    /// Reads an array of signed 32 bit integers.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the array runs past the body.
    pub fn read_array(&mut self) -> Result<Vec<i32>, SerdeError> {
        self.read::<WireArray>().map(|a| a.0)
    }

    /// Reads an object id. Id 0 is the null object.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if fewer than 4 bytes remain.
    pub fn read_object_id(&mut self) -> Result<ObjectId, SerdeError> {
        self.read()
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data
            .get_ref()
            .as_ref()
            .len()
            .saturating_sub(self.position())
    }

    /// Sets the current position.
    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        self.data.set_position(pos as u64);
    }

    /// Returns the current position.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.data.position() as usize
    }

    /// Returns a reference to the underlying buffer.
    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> &T {
        self.data.get_ref()
    }
}

/// Builds a single outgoing message.
///
/// ```
/// use wl_core::wire::{MessageDecoder, MessageEncoder, serde::MessageHeader};
///
/// let mut encoder = MessageEncoder::new(1, 0);
/// encoder.write(&2u32).unwrap();
/// let message = encoder.finish().unwrap();
///
/// let mut decoder = MessageDecoder::new(&message);
/// let header: MessageHeader = decoder.read().unwrap();
/// assert_eq!(header.size, 12);
/// assert_eq!(decoder.read_u32().unwrap(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct MessageEncoder {
    header: MessageHeader,
    data: Vec<u8>,
}

impl MessageEncoder {
    /// Starts a message for `opcode` on the object `object_id`.
    #[must_use]
    pub fn new(object_id: ObjectId, opcode: u16) -> Self {
        Self {
            header: MessageHeader {
                object_id,
                opcode,
                size: 0,
            },
            data: vec![0; MessageHeader::SIZE],
        }
    }

    /// Appends a value to the message body.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails. See [`Encode::encode`] for more details.
    pub fn write<V: Encode>(&mut self, value: &V) -> Result<&mut Self, SerdeError> {
        value.encode(&mut self.data)?;
        Ok(self)
    }

    /// Appends a string to the message body.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is too long for the wire.
    pub fn write_str(&mut self, value: &str) -> Result<&mut Self, SerdeError> {
        self.write(&WireString::from(value))
    }

    /// Fills in the header and returns the encoded message.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::MessageTooLarge`] if the message does not fit the
    /// 16 bit size field.
    pub fn finish(mut self) -> Result<Vec<u8>, SerdeError> {
        let len = self.data.len();
        self.header.size = u16::try_from(len).map_err(|_| SerdeError::MessageTooLarge(len))?;

        let mut header = Vec::with_capacity(MessageHeader::SIZE);
        self.header.encode(&mut header)?;
        self.data[..MessageHeader::SIZE].copy_from_slice(&header);
        Ok(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::{Fixed, MessageDecoder, MessageEncoder, pad_to_32_bits, serde::*};

    #[test]
    fn padding() {
        assert_eq!(pad_to_32_bits(0), 0);
        assert_eq!(pad_to_32_bits(1), 4);
        assert_eq!(pad_to_32_bits(4), 4);
        assert_eq!(pad_to_32_bits(5), 8);
    }

    #[test]
    fn uint_body_scenario() {
        let bytes = [1, 0, 0, 0, 0, 0, 12, 0, 2, 0, 0, 0];
        if cfg!(target_endian = "little") {
            let mut decoder = MessageDecoder::new(&bytes[..]);
            let header: MessageHeader = decoder.read().unwrap();
            assert_eq!(header.object_id, 1);
            assert_eq!(header.opcode, 0);
            assert_eq!(header.size, 12);
            assert_eq!(decoder.read_u32().unwrap(), 2);
            assert_eq!(decoder.remaining(), 0);
        }
    }

    #[test]
    fn hello_string_advances_twelve_bytes() {
        let mut body = 5u32.to_ne_bytes().to_vec();
        body.extend_from_slice(b"hello\0\0\0");
        body.extend_from_slice(&9u32.to_ne_bytes());

        let mut decoder = MessageDecoder::new(body);
        assert_eq!(decoder.read_string().unwrap(), "hello");
        assert_eq!(decoder.position(), 12);
        assert_eq!(decoder.read_u32().unwrap(), 9);
    }

    #[test]
    fn overrun_fails_and_keeps_position() {
        let mut decoder = MessageDecoder::new(vec![1, 0, 0, 0, 2, 0]);
        decoder.read_u32().unwrap();
        assert!(matches!(
            decoder.read_u32(),
            Err(SerdeError::InvalidSize {
                needed: 4,
                available: 2
            })
        ));
        assert_eq!(decoder.position(), 4);

        decoder.set_position(64);
        assert!(decoder.read_i32().is_err());
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn encoder_round_trip() {
        let mut encoder = MessageEncoder::new(7, 3);
        encoder
            .write(&-8i32)
            .unwrap()
            .write(&19u32)
            .unwrap()
            .write(&Fixed::from(2.5))
            .unwrap()
            .write(&WireArray(vec![4, 5]))
            .unwrap()
            .write_str("test")
            .unwrap();
        let message = encoder.finish().unwrap();
        assert_eq!(message.len() % 4, 0);

        let mut decoder = MessageDecoder::new(message.as_slice());
        let header: MessageHeader = decoder.read().unwrap();
        assert_eq!(header.object_id, 7);
        assert_eq!(header.opcode, 3);
        assert_eq!(usize::from(header.size), message.len());
        assert_eq!(decoder.read_i32().unwrap(), -8);
        assert_eq!(decoder.read_u32().unwrap(), 19);
        assert_eq!(decoder.read_f32().unwrap(), 2.5);
        assert_eq!(decoder.read_array().unwrap(), vec![4, 5]);
        assert_eq!(decoder.read_string().unwrap(), "test");
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut encoder = MessageEncoder::new(1, 0);
        encoder.write(&WireArray(vec![0; 20_000])).unwrap();
        assert!(matches!(
            encoder.finish(),
            Err(SerdeError::MessageTooLarge(_))
        ));
    }
}
