use num_bigint::BigUint;
use std::any::Any;
use thiserror::Error;

/// Errors raised while converting a host value to or from its canonical bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The host handed over a value whose shape the codec does not know.
    #[error("Unsupported value type: {0}")]
    UnsupportedValueType(String),

    /// A fixed-width integer holds a value that does not fit its declared width.
    #[error("Value {value} does not fit in a {bits}-bit {kind} integer")]
    OutOfRange {
        value: String,
        bits: u32,
        kind: &'static str,
    },

    /// The byte buffer handed to `decode` has the wrong length for the shape.
    #[error("Expected {expected} bytes for {shape}, got {actual}")]
    LengthMismatch {
        shape: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Width of a fixed-width integer, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
    W128,
}

impl IntWidth {
    pub fn bytes(self) -> usize {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
            IntWidth::W128 => 16,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Width of the platform's pointer-sized integers.
    pub fn pointer() -> Self {
        match usize::BITS {
            16 => IntWidth::W16,
            32 => IntWidth::W32,
            _ => IntWidth::W64,
        }
    }
}

/// The closed set of value shapes the injector accepts.
///
/// Fixed-width integers keep their width as data so one codec path serves every
/// width; signed values are stored sign-extended in an `i128`, unsigned in a `u128`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unsigned { value: u128, width: IntWidth },
    Signed { value: i128, width: IntWidth },
    BigUint(BigUint),
    /// Raw text content. Held as bytes because a mutated text value need not be UTF-8.
    Text(Vec<u8>),
    Bytes(Vec<u8>),
}

/// Shape tag used to rebuild a `Value` from (possibly mutated) bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Unsigned(IntWidth),
    Signed(IntWidth),
    BigUint,
    Text,
    Bytes,
}

impl ValueKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Unsigned(_) => "unsigned integer",
            ValueKind::Signed(_) => "signed integer",
            ValueKind::BigUint => "arbitrary-precision integer",
            ValueKind::Text => "text",
            ValueKind::Bytes => "bytes",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unsigned { width, .. } => ValueKind::Unsigned(*width),
            Value::Signed { width, .. } => ValueKind::Signed(*width),
            Value::BigUint(_) => ValueKind::BigUint,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into().into_bytes())
    }

    /// Canonical big-endian encoding.
    ///
    /// Fixed-width integers produce exactly `width.bytes()` bytes (two's complement
    /// for signed values). Arbitrary-precision integers use their minimal form, so
    /// zero encodes to an empty buffer.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Value::Unsigned { value, width } => {
                if width.bits() < 128 && *value >> width.bits() != 0 {
                    return Err(CodecError::OutOfRange {
                        value: value.to_string(),
                        bits: width.bits(),
                        kind: "unsigned",
                    });
                }
                Ok(value.to_be_bytes()[16 - width.bytes()..].to_vec())
            }
            Value::Signed { value, width } => {
                let bits = width.bits();
                if bits < 128 {
                    let min = -(1i128 << (bits - 1));
                    let max = (1i128 << (bits - 1)) - 1;
                    if *value < min || *value > max {
                        return Err(CodecError::OutOfRange {
                            value: value.to_string(),
                            bits,
                            kind: "signed",
                        });
                    }
                }
                Ok((*value as u128).to_be_bytes()[16 - width.bytes()..].to_vec())
            }
            Value::BigUint(n) => {
                if n.bits() == 0 {
                    Ok(Vec::new())
                } else {
                    Ok(n.to_bytes_be())
                }
            }
            Value::Text(bytes) | Value::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// Rebuilds a value of shape `kind` from big-endian bytes.
    ///
    /// # Arguments
    /// * `bytes`: The canonical (possibly mutated) buffer produced by [`Value::encode`].
    /// * `kind`: The shape of the value that was encoded.
    ///
    /// # Returns
    /// `Result<Value, CodecError>`:
    ///   - `Ok(value)`: A value of the same shape. Fixed-width integers are
    ///     reinterpreted with two's complement or unsigned rules.
    ///   - `Err(CodecError::LengthMismatch)`: If a fixed-width buffer has the wrong length.
    pub fn decode(bytes: &[u8], kind: ValueKind) -> Result<Value, CodecError> {
        match kind {
            ValueKind::Unsigned(width) => {
                let raw = fixed_width_bits(bytes, width, kind)?;
                Ok(Value::Unsigned { value: raw, width })
            }
            ValueKind::Signed(width) => {
                let raw = fixed_width_bits(bytes, width, kind)?;
                let shift = 128 - width.bits();
                // Sign-extend from the top bit of the declared width.
                let value = ((raw << shift) as i128) >> shift;
                Ok(Value::Signed { value, width })
            }
            ValueKind::BigUint => Ok(Value::BigUint(BigUint::from_bytes_be(bytes))),
            ValueKind::Text => Ok(Value::Text(bytes.to_vec())),
            ValueKind::Bytes => Ok(Value::Bytes(bytes.to_vec())),
        }
    }

    /// Recognises a dynamically typed host value. Only shapes that
    /// [`Value::into_any`] can hand back as the same type are accepted, so
    /// platform-sized integers and `&str` are rejected.
    pub fn from_any(value: &dyn Any) -> Result<Value, CodecError> {
        macro_rules! try_downcast {
            ($($t:ty),*) => {
                $(
                    if let Some(v) = value.downcast_ref::<$t>() {
                        return Ok(v.clone().into_value());
                    }
                )*
            };
        }
        try_downcast!(
            u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, BigUint, String, Vec<u8>
        );
        Err(CodecError::UnsupportedValueType(format!(
            "{:?}",
            value.type_id()
        )))
    }

    /// Converts back into a boxed native value, the inverse of `from_any`.
    pub fn into_any(self) -> Box<dyn Any + Send> {
        match self {
            Value::Unsigned { value, width } => match width {
                IntWidth::W8 => Box::new(value as u8),
                IntWidth::W16 => Box::new(value as u16),
                IntWidth::W32 => Box::new(value as u32),
                IntWidth::W64 => Box::new(value as u64),
                IntWidth::W128 => Box::new(value),
            },
            Value::Signed { value, width } => match width {
                IntWidth::W8 => Box::new(value as i8),
                IntWidth::W16 => Box::new(value as i16),
                IntWidth::W32 => Box::new(value as i32),
                IntWidth::W64 => Box::new(value as i64),
                IntWidth::W128 => Box::new(value),
            },
            Value::BigUint(n) => Box::new(n),
            Value::Text(bytes) => Box::new(String::from_utf8_lossy(&bytes).into_owned()),
            Value::Bytes(bytes) => Box::new(bytes),
        }
    }
}

fn fixed_width_bits(bytes: &[u8], width: IntWidth, kind: ValueKind) -> Result<u128, CodecError> {
    if bytes.len() != width.bytes() {
        return Err(CodecError::LengthMismatch {
            shape: kind.name(),
            expected: width.bytes(),
            actual: bytes.len(),
        });
    }
    let mut buf = [0u8; 16];
    buf[16 - bytes.len()..].copy_from_slice(bytes);
    Ok(u128::from_be_bytes(buf))
}

/// A native type that can pass through the injector and come back as itself.
pub trait Injectable: Sized {
    fn into_value(self) -> Value;
    /// Returns `None` if `value` is not of this type's shape.
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_injectable_unsigned {
    ($($t:ty => $w:expr),* $(,)?) => {
        $(
            impl Injectable for $t {
                fn into_value(self) -> Value {
                    Value::Unsigned { value: self as u128, width: $w }
                }
                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::Unsigned { value, width } if width == $w => Some(value as $t),
                        _ => None,
                    }
                }
            }
        )*
    };
}

macro_rules! impl_injectable_signed {
    ($($t:ty => $w:expr),* $(,)?) => {
        $(
            impl Injectable for $t {
                fn into_value(self) -> Value {
                    Value::Signed { value: self as i128, width: $w }
                }
                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::Signed { value, width } if width == $w => Some(value as $t),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_injectable_unsigned!(
    u8 => IntWidth::W8,
    u16 => IntWidth::W16,
    u32 => IntWidth::W32,
    u64 => IntWidth::W64,
    u128 => IntWidth::W128,
    usize => IntWidth::pointer(),
);

impl_injectable_signed!(
    i8 => IntWidth::W8,
    i16 => IntWidth::W16,
    i32 => IntWidth::W32,
    i64 => IntWidth::W64,
    i128 => IntWidth::W128,
    isize => IntWidth::pointer(),
);

impl Injectable for BigUint {
    fn into_value(self) -> Value {
        Value::BigUint(self)
    }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::BigUint(n) => Some(n),
            _ => None,
        }
    }
}

impl Injectable for String {
    fn into_value(self) -> Value {
        Value::Text(self.into_bytes())
    }
    /// Corrupted text that is no longer UTF-8 comes back with replacement characters.
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Text(bytes) => Some(match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
            _ => None,
        }
    }
}

impl Injectable for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}
