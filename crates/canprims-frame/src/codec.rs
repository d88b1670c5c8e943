use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Fixed-width primitive types carried in endpoint payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl PrimitiveType {
    /// Wire size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed value exchanged with a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// The primitive type this value carries.
    pub const fn ty(&self) -> PrimitiveType {
        match self {
            Self::Bool(_) => PrimitiveType::Bool,
            Self::I8(_) => PrimitiveType::Int8,
            Self::U8(_) => PrimitiveType::UInt8,
            Self::I16(_) => PrimitiveType::Int16,
            Self::U16(_) => PrimitiveType::UInt16,
            Self::I32(_) => PrimitiveType::Int32,
            Self::U32(_) => PrimitiveType::UInt32,
            Self::I64(_) => PrimitiveType::Int64,
            Self::U64(_) => PrimitiveType::UInt64,
            Self::F32(_) => PrimitiveType::Float32,
            Self::F64(_) => PrimitiveType::Float64,
        }
    }

    /// The zero value of `ty`.
    pub const fn zero(ty: PrimitiveType) -> Self {
        match ty {
            PrimitiveType::Bool => Self::Bool(false),
            PrimitiveType::Int8 => Self::I8(0),
            PrimitiveType::UInt8 => Self::U8(0),
            PrimitiveType::Int16 => Self::I16(0),
            PrimitiveType::UInt16 => Self::U16(0),
            PrimitiveType::Int32 => Self::I32(0),
            PrimitiveType::UInt32 => Self::U32(0),
            PrimitiveType::Int64 => Self::I64(0),
            PrimitiveType::UInt64 => Self::U64(0),
            PrimitiveType::Float32 => Self::F32(0.0),
            PrimitiveType::Float64 => Self::F64(0.0),
        }
    }

    /// Integer view of the value; integral floats included.
    fn as_i128(&self) -> Option<i128> {
        match *self {
            Self::Bool(_) => None,
            Self::I8(v) => Some(v.into()),
            Self::U8(v) => Some(v.into()),
            Self::I16(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::I32(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::I64(v) => Some(v.into()),
            Self::U64(v) => Some(v.into()),
            Self::F32(v) => integral(f64::from(v)),
            Self::F64(v) => integral(v),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Bool(_) => None,
            Self::F32(v) => Some(f64::from(v)),
            Self::F64(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }
}

fn integral(v: f64) -> Option<i128> {
    (v.is_finite() && v.fract() == 0.0).then_some(v as i128)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_primitive! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

/// Sum of the wire sizes of `types`.
pub fn encoded_size(types: &[PrimitiveType]) -> usize {
    types.iter().map(|ty| ty.size()).sum()
}

/// Convert `value` into `ty`, failing when it is not representable.
///
/// Integers convert between widths when in range, integral floats convert
/// to integers, integers convert to floats, and finite `float64` values
/// must lie within `float32` range to narrow. `bool` only matches `bool`.
pub fn coerce(value: &Value, ty: PrimitiveType) -> Result<Value> {
    if value.ty() == ty {
        return Ok(*value);
    }

    let converted = match ty {
        PrimitiveType::Bool => None,
        PrimitiveType::Int8 => narrow(value).map(Value::I8),
        PrimitiveType::UInt8 => narrow(value).map(Value::U8),
        PrimitiveType::Int16 => narrow(value).map(Value::I16),
        PrimitiveType::UInt16 => narrow(value).map(Value::U16),
        PrimitiveType::Int32 => narrow(value).map(Value::I32),
        PrimitiveType::UInt32 => narrow(value).map(Value::U32),
        PrimitiveType::Int64 => narrow(value).map(Value::I64),
        PrimitiveType::UInt64 => narrow(value).map(Value::U64),
        PrimitiveType::Float32 => value.as_f64().and_then(|v| {
            (!v.is_finite() || v.abs() <= f64::from(f32::MAX)).then_some(Value::F32(v as f32))
        }),
        PrimitiveType::Float64 => value.as_f64().map(Value::F64),
    };

    converted.ok_or_else(|| {
        FrameError::Encoding(format!(
            "{} value {value} is not representable as {ty}",
            value.ty()
        ))
    })
}

fn narrow<T: TryFrom<i128>>(value: &Value) -> Option<T> {
    value.as_i128().and_then(|v| T::try_from(v).ok())
}

/// Pack `values` according to `types` into `dst` (little-endian).
pub fn encode_values(values: &[Value], types: &[PrimitiveType], dst: &mut BytesMut) -> Result<()> {
    if values.len() != types.len() {
        return Err(FrameError::Encoding(format!(
            "expected {} values, got {}",
            types.len(),
            values.len()
        )));
    }

    dst.reserve(encoded_size(types));
    for (index, (value, &ty)) in values.iter().zip(types).enumerate() {
        let value = coerce(value, ty)
            .map_err(|err| FrameError::Encoding(format!("field {index}: {err}")))?;
        match value {
            Value::Bool(v) => dst.put_u8(u8::from(v)),
            Value::I8(v) => dst.put_i8(v),
            Value::U8(v) => dst.put_u8(v),
            Value::I16(v) => dst.put_i16_le(v),
            Value::U16(v) => dst.put_u16_le(v),
            Value::I32(v) => dst.put_i32_le(v),
            Value::U32(v) => dst.put_u32_le(v),
            Value::I64(v) => dst.put_i64_le(v),
            Value::U64(v) => dst.put_u64_le(v),
            Value::F32(v) => dst.put_f32_le(v),
            Value::F64(v) => dst.put_f64_le(v),
        }
    }
    Ok(())
}

/// Pack `values` according to `types`.
pub fn serialize(values: &[Value], types: &[PrimitiveType]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(encoded_size(types));
    encode_values(values, types, &mut buf)?;
    Ok(buf.freeze())
}

/// Unpack `types` from the front of `src`. Trailing bytes are ignored.
pub fn deserialize(src: &[u8], types: &[PrimitiveType]) -> Result<Vec<Value>> {
    let needed = encoded_size(types);
    if src.len() < needed {
        return Err(FrameError::Decoding {
            needed,
            available: src.len(),
        });
    }

    let mut buf = src;
    let values = types
        .iter()
        .map(|ty| match ty {
            PrimitiveType::Bool => Value::Bool(buf.get_u8() != 0),
            PrimitiveType::Int8 => Value::I8(buf.get_i8()),
            PrimitiveType::UInt8 => Value::U8(buf.get_u8()),
            PrimitiveType::Int16 => Value::I16(buf.get_i16_le()),
            PrimitiveType::UInt16 => Value::U16(buf.get_u16_le()),
            PrimitiveType::Int32 => Value::I32(buf.get_i32_le()),
            PrimitiveType::UInt32 => Value::U32(buf.get_u32_le()),
            PrimitiveType::Int64 => Value::I64(buf.get_i64_le()),
            PrimitiveType::UInt64 => Value::U64(buf.get_u64_le()),
            PrimitiveType::Float32 => Value::F32(buf.get_f32_le()),
            PrimitiveType::Float64 => Value::F64(buf.get_f64_le()),
        })
        .collect();
    Ok(values)
}
