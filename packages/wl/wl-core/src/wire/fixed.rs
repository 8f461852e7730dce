//! Signed 24.8 fixed point numbers as carried on the wire.

#![allow(clippy::cast_precision_loss)]

/// A signed fixed point number with 24 integer bits and 8 fractional bits.
///
/// The raw value is the real number multiplied by 256, so the resolution is
/// `1 / 256`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Fixed(i32);

impl Fixed {
    /// The smallest step representable by a [`Fixed`].
    pub const EPSILON: f64 = 1.0 / 256.0;

    /// Wraps a raw wire value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw wire value.
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        self.0
    }

    /// Converts to `f32` by dividing the raw value by 256.
    #[must_use]
    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 256.0
    }

    /// Converts to `f64` by dividing the raw value by 256.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

impl<T: num_traits::AsPrimitive<f64>> From<T> for Fixed {
    fn from(value: T) -> Self {
        Self((value.as_() * 256.0).round() as i32)
    }
}

impl From<Fixed> for f32 {
    fn from(value: Fixed) -> Self {
        value.to_f32()
    }
}

impl From<Fixed> for f64 {
    fn from(value: Fixed) -> Self {
        value.to_f64()
    }
}

/// Truncates towards zero.
impl From<Fixed> for i32 {
    fn from(value: Fixed) -> Self {
        value.0 / 256
    }
}
