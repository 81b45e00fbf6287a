//! Element type constraints
//!
//! Variables and attributes are generic over a closed set of element types.
//! Each type carries its runtime [`DataType`] tag so that a single generic
//! code path can serialize, validate and decode any of them.

use alloc::string::String;
use alloc::vec::Vec;
use bytemuck::{Pod, Zeroable};

use crate::error::{FormatError, Result};
use crate::format::DataType;
use crate::validation::validate_array_bounds;

/// Trait for types that can be stored as variable or attribute elements
///
/// Fixed-size elements are plain-old-data and are stored in host byte order.
/// `String` is variable sized and only allowed for single values.
pub trait Element: Clone + PartialEq + Default + core::fmt::Debug + Send + Sync + 'static {
    /// Runtime tag of this element type
    const DATA_TYPE: DataType;

    /// Get the DataType representation for this element type
    fn data_type() -> DataType {
        Self::DATA_TYPE
    }

    /// Size in bytes of one element, 0 when variable sized
    fn size_bytes() -> usize {
        Self::DATA_TYPE.size_bytes()
    }

    /// Append the encoded elements to `out`
    fn encode(values: &[Self], out: &mut Vec<u8>);

    /// Decode a run of elements
    fn decode(bytes: &[u8]) -> Result<Vec<Self>>;

    /// Minimum and maximum of a non-empty slice
    fn min_max(values: &[Self]) -> Option<(Self, Self)>;

    /// Raw byte view of fixed-size elements
    fn as_bytes(values: &[Self]) -> Option<&[u8]>;

    /// Mutable raw byte view of fixed-size elements
    fn as_bytes_mut(values: &mut [Self]) -> Option<&mut [u8]>;
}

/// Single-precision complex number
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Complex32 {
    pub re: f32,
    pub im: f32,
}

/// Double-precision complex number
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

impl Complex32 {
    pub const fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    /// Squared magnitude, used to order complex values
    pub fn norm_sqr(self) -> f32 {
        self.re * self.re + self.im * self.im
    }
}

impl Complex64 {
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn norm_sqr(self) -> f64 {
        self.re * self.re + self.im * self.im
    }
}

fn decode_pod<T: Pod>(bytes: &[u8]) -> Result<Vec<T>> {
    validate_array_bounds::<T>(bytes.len())?;
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

fn min_max_by<T: Copy>(values: &[T], less: impl Fn(&T, &T) -> bool) -> Option<(T, T)> {
    let (first, rest) = values.split_first()?;
    let mut lo = *first;
    let mut hi = *first;
    for v in rest {
        if less(v, &lo) {
            lo = *v;
        }
        if less(&hi, v) {
            hi = *v;
        }
    }
    Some((lo, hi))
}

macro_rules! impl_pod_element {
    ($($ty:ty => $tag:ident, $less:expr;)*) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$tag;

                fn encode(values: &[Self], out: &mut Vec<u8>) {
                    out.extend_from_slice(bytemuck::cast_slice(values));
                }

                fn decode(bytes: &[u8]) -> Result<Vec<Self>> {
                    decode_pod(bytes)
                }

                fn min_max(values: &[Self]) -> Option<(Self, Self)> {
                    min_max_by(values, $less)
                }

                fn as_bytes(values: &[Self]) -> Option<&[u8]> {
                    Some(bytemuck::cast_slice(values))
                }

                fn as_bytes_mut(values: &mut [Self]) -> Option<&mut [u8]> {
                    Some(bytemuck::cast_slice_mut(values))
                }
            }
        )*
    };
}

impl_pod_element! {
    i8 => I8, |a: &i8, b: &i8| a < b;
    i16 => I16, |a: &i16, b: &i16| a < b;
    i32 => I32, |a: &i32, b: &i32| a < b;
    i64 => I64, |a: &i64, b: &i64| a < b;
    u8 => U8, |a: &u8, b: &u8| a < b;
    u16 => U16, |a: &u16, b: &u16| a < b;
    u32 => U32, |a: &u32, b: &u32| a < b;
    u64 => U64, |a: &u64, b: &u64| a < b;
    // NaN compares false both ways and never replaces a bound
    f32 => F32, |a: &f32, b: &f32| a < b;
    f64 => F64, |a: &f64, b: &f64| a < b;
    Complex32 => Complex32, |a: &Complex32, b: &Complex32| a.norm_sqr() < b.norm_sqr();
    Complex64 => Complex64, |a: &Complex64, b: &Complex64| a.norm_sqr() < b.norm_sqr();
}

impl Element for String {
    const DATA_TYPE: DataType = DataType::String;

    fn encode(values: &[Self], out: &mut Vec<u8>) {
        for s in values {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Vec<Self>> {
        let mut reader = crate::format::ByteReader::new(bytes);
        let mut out = Vec::new();
        while !reader.is_empty() {
            let raw = reader.blob()?;
            let s = core::str::from_utf8(raw).map_err(|_| FormatError::CorruptedData)?;
            out.push(String::from(s));
        }
        Ok(out)
    }

    fn min_max(_values: &[Self]) -> Option<(Self, Self)> {
        None
    }

    fn as_bytes(_values: &[Self]) -> Option<&[u8]> {
        None
    }

    fn as_bytes_mut(_values: &mut [Self]) -> Option<&mut [u8]> {
        None
    }
}

impl core::fmt::Display for Complex32 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.re, self.im)
    }
}

impl core::fmt::Display for Complex64 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.re, self.im)
    }
}
