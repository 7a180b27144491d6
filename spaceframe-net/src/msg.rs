//! Pipeline message values.
//!
//! Messages traversing the pipeline are a tagged sum instead of a
//! type-erased box: handlers match on the variant they understand and
//! forward the rest. The head's terminal writer serializes every variant
//! except [`Msg::Buffer`], which only flows inbound (it wraps the
//! session's read buffer for frame decoders).

use bytes::Bytes;
use spaceframe_core::buffer::SharedBuffer;

/// A value moving through the handler chain.
#[derive(Clone)]
pub enum Msg {
    /// Raw bytes, e.g. one decoded frame.
    Bytes(Bytes),
    /// Owned text; written out as its UTF-8 bytes.
    Str(String),
    /// A fixed-width integer. `value` holds the raw two's-complement
    /// bits; `width`/`signed` say how to put them on the wire.
    Int { width: u8, signed: bool, value: i64 },
    /// A fixed-width float.
    Float { width: u8, value: f64 },
    /// The session's read buffer, handed to decoders on the inbound path.
    Buffer(SharedBuffer),
}

impl Msg {
    /// Short variant name for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Str(_) => "str",
            Self::Int { .. } => "int",
            Self::Float { .. } => "float",
            Self::Buffer(_) => "buffer",
        }
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Int {
                width,
                signed,
                value,
            } => f
                .debug_struct("Int")
                .field("width", width)
                .field("signed", signed)
                .field("value", value)
                .finish(),
            Self::Float { width, value } => f
                .debug_struct("Float")
                .field("width", width)
                .field("value", value)
                .finish(),
            Self::Buffer(_) => f.write_str("Buffer"),
        }
    }
}

impl From<Bytes> for Msg {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for Msg {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Msg {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

impl From<String> for Msg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for Msg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

macro_rules! impl_from_int {
    ($($ty:ty => ($width:expr, $signed:expr)),* $(,)?) => {
        $(
            impl From<$ty> for Msg {
                #[allow(clippy::cast_possible_wrap)]
                fn from(value: $ty) -> Self {
                    Self::Int {
                        width: $width,
                        signed: $signed,
                        value: value as i64,
                    }
                }
            }
        )*
    };
}

impl_from_int!(
    u8 => (1, false),
    u16 => (2, false),
    u32 => (4, false),
    u64 => (8, false),
    i8 => (1, true),
    i16 => (2, true),
    i32 => (4, true),
    i64 => (8, true),
);

impl From<f32> for Msg {
    fn from(value: f32) -> Self {
        Self::Float {
            width: 4,
            value: f64::from(value),
        }
    }
}

impl From<f64> for Msg {
    fn from(value: f64) -> Self {
        Self::Float { width: 8, value }
    }
}
