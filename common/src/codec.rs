//! Wire codec for message payloads.
//!
//! Values are encoded onto a growable byte buffer and decoded from a fixed
//! one with a moving cursor. Scalars are written in native byte order as
//! their raw in-memory representation; strings carry an `i32` byte length
//! and no terminator; optionals carry an `i32` presence flag; sequences
//! carry an `i32` count. Every field is padded to the next 4-byte boundary,
//! and the decoder advances its cursor by the same padded amount, so the two
//! sides stay in lock-step no matter how many odd-length fields precede a
//! read.

use std::mem;
use std::ptr;
use std::slice;

use crate::error::DecodeError;

/// Rounds `n` up to the next multiple of four.
pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Marker for types whose in-memory representation may be copied onto the
/// wire byte-for-byte.
///
/// # Safety
///
/// Implementors must be fixed-layout values with no padding-dependent
/// semantics, no pointers, and no bit patterns that are invalid for the
/// type: plain scalars, or `#[repr(C)]` structs composed of them.
pub unsafe trait Plain: Copy {}

macro_rules! plain_impl {
    ($($ty:ty),*) => {
        $(
            // SAFETY: primitive scalars are fixed-layout and valid for
            // every bit pattern.
            unsafe impl Plain for $ty {}
        )*
    };
}

plain_impl!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Encodes values onto a growable byte buffer.
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder { data: Vec::new() }
    }

    /// The bytes encoded so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the encoder, returning the encoded bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn encode_i32(&mut self, value: i32) {
        self.encode_plain(value);
    }

    /// Appends the raw in-memory representation of `value`, then pads to the
    /// next 4-byte boundary.
    pub fn encode_plain<T: Plain>(&mut self, value: T) {
        let size = mem::size_of::<T>();
        // SAFETY: `Plain` guarantees `T` is a fixed-layout value without
        // pointers, so reading `size_of::<T>()` bytes from its address is
        // sound.
        let bytes = unsafe { slice::from_raw_parts(&value as *const T as *const u8, size) };
        self.data.extend_from_slice(bytes);
        self.align_end();
    }

    /// Appends an `i32` UTF-8 byte length, the raw bytes (no terminator),
    /// and alignment padding.
    pub fn encode_str(&mut self, value: &str) {
        self.encode_i32(value.len() as i32);
        self.data.extend_from_slice(value.as_bytes());
        self.align_end();
    }

    /// Appends an `i32` presence flag, then the value when present.
    pub fn encode_optional<T: Encode>(&mut self, value: &Option<T>) {
        self.encode_i32(i32::from(value.is_some()));
        if let Some(value) = value {
            value.encode(self);
        }
    }

    /// Appends an `i32` count, then each element in order.
    pub fn encode_slice<T: Encode>(&mut self, values: &[T]) {
        self.encode_i32(values.len() as i32);
        for value in values {
            value.encode(self);
        }
    }

    fn align_end(&mut self) {
        self.data.resize(align4(self.data.len()), 0);
    }
}

impl Default for Encoder {
    fn default() -> Encoder {
        Encoder::new()
    }
}

/// Decodes values from a fixed byte buffer with a moving cursor.
pub struct Decoder<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder { data, cursor: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn decode_i32(&mut self) -> Result<i32, DecodeError> {
        self.decode_plain()
    }

    pub fn decode_i64(&mut self) -> Result<i64, DecodeError> {
        self.decode_plain()
    }

    pub fn decode_f64(&mut self) -> Result<f64, DecodeError> {
        self.decode_plain()
    }

    /// Reads exactly `size_of::<T>()` bytes and reinterprets them.
    pub fn decode_plain<T: Plain>(&mut self) -> Result<T, DecodeError> {
        let size = mem::size_of::<T>();
        let bytes = self.read_bytes(size)?;
        let mut value = mem::MaybeUninit::<T>::uninit();
        // SAFETY: `read_bytes` returned at least `size` bytes, and `Plain`
        // guarantees every bit pattern is a valid `T`. An unaligned source
        // is fine for a byte-wise copy.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), value.as_mut_ptr() as *mut u8, size);
            Ok(value.assume_init())
        }
    }

    pub fn decode_str(&mut self) -> Result<String, DecodeError> {
        let size = self.decode_i32()? as usize;
        let bytes = self.read_bytes(size)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn decode_optional<T: Decode>(&mut self) -> Result<Option<T>, DecodeError> {
        if self.decode_i32()? != 0 {
            Ok(Some(T::decode(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn decode_vec<T: Decode>(&mut self) -> Result<Vec<T>, DecodeError> {
        let count = self.decode_i32()? as usize;
        let mut values = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            values.push(T::decode(self)?);
        }
        Ok(values)
    }

    /// Returns the next `size` bytes.
    ///
    /// The cursor always advances by `align4(size)`, matching the padding
    /// the encoder appended, so decode stays in lock-step with encode.
    pub fn read_bytes(&mut self, size: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if remaining < size {
            return Err(DecodeError::BufferUnderflow {
                needed: size,
                remaining,
            });
        }
        let start = self.cursor;
        self.cursor = (start + align4(size)).min(self.data.len());
        Ok(&self.data[start..start + size])
    }
}

/// A value that can be written through the wire codec.
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);
}

/// A value that can be read back through the wire codec.
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError>;
}

macro_rules! plain_codec_impl {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, encoder: &mut Encoder) {
                    encoder.encode_plain(*self);
                }
            }

            impl Decode for $ty {
                fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
                    decoder.decode_plain()
                }
            }
        )*
    };
}

plain_codec_impl!(i32, u32, i64, u64, f64);

impl Encode for String {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_str(self);
    }
}

impl Decode for String {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        decoder.decode_str()
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_slice(self);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        decoder.decode_vec()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.encode_optional(self);
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        decoder.decode_optional()
    }
}

/// Encodes a single value into a fresh buffer.
pub fn encode_value<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.encode(&mut encoder);
    encoder.into_data()
}

/// Decodes a single value from the front of `data`.
pub fn decode_value<T: Decode>(data: &[u8]) -> Result<T, DecodeError> {
    T::decode(&mut Decoder::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let mut encoder = Encoder::new();
        encoder.encode_i32(-7);
        encoder.encode_plain(0xdead_beef_u64);
        encoder.encode_plain(2.5_f64);
        encoder.encode_plain(3_u16);

        let data = encoder.into_data();
        assert_eq!(data.len() % 4, 0);

        let mut decoder = Decoder::new(&data);
        assert_eq!(decoder.decode_i32().unwrap(), -7);
        assert_eq!(decoder.decode_plain::<u64>().unwrap(), 0xdead_beef);
        assert_eq!(decoder.decode_f64().unwrap(), 2.5);
        assert_eq!(decoder.decode_plain::<u16>().unwrap(), 3);
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn strings_are_length_prefixed_and_padded() {
        let data = encode_value(&"abc".to_string());
        // 4 bytes of length, 3 bytes of text, 1 byte of padding.
        assert_eq!(data.len(), 8);
        assert_eq!(&data[..4], &3_i32.to_ne_bytes());
        assert_eq!(&data[4..7], b"abc");
        assert_eq!(data[7], 0);

        assert_eq!(decode_value::<String>(&data).unwrap(), "abc");
    }

    #[test]
    fn odd_length_fields_keep_encoder_and_decoder_in_lock_step() {
        let strings = ["a", "bc", "def", "ghij", "klmno", ""];

        let mut encoder = Encoder::new();
        for s in &strings {
            encoder.encode_str(s);
            encoder.encode_plain(0x11_u8);
        }
        let data = encoder.into_data();

        let mut decoder = Decoder::new(&data);
        for s in &strings {
            assert_eq!(decoder.decode_str().unwrap(), *s);
            assert_eq!(decoder.decode_plain::<u8>().unwrap(), 0x11);
        }
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn optionals_round_trip() {
        let present: Option<i64> = Some(42);
        let absent: Option<i64> = None;

        assert_eq!(
            decode_value::<Option<i64>>(&encode_value(&present)).unwrap(),
            Some(42)
        );
        assert_eq!(
            decode_value::<Option<i64>>(&encode_value(&absent)).unwrap(),
            None
        );
    }

    #[test]
    fn sequences_round_trip() {
        let values = vec!["one".to_string(), "two".to_string(), String::new()];
        let data = encode_value(&values);
        assert_eq!(decode_value::<Vec<String>>(&data).unwrap(), values);

        let nested = vec![vec![1_u64, 2], vec![], vec![3]];
        let data = encode_value(&nested);
        assert_eq!(decode_value::<Vec<Vec<u64>>>(&data).unwrap(), nested);
    }

    #[test]
    fn underflow_is_reported() {
        let data = encode_value(&7_i32);
        let mut decoder = Decoder::new(&data);
        assert!(decoder.decode_i32().is_ok());
        assert_eq!(
            decoder.decode_i32(),
            Err(DecodeError::BufferUnderflow {
                needed: 4,
                remaining: 0
            })
        );
    }

    #[test]
    fn truncated_string_is_an_underflow() {
        let mut encoder = Encoder::new();
        encoder.encode_i32(100);
        let data = encoder.into_data();
        assert!(matches!(
            decode_value::<String>(&data),
            Err(DecodeError::BufferUnderflow { .. })
        ));
    }
}
