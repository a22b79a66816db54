use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Type-erased handle for codec-private data carried between decode and encode.
///
/// The handle is shared, so cloning metadata for mirroring does not duplicate
/// the referenced value. Readers recover the concrete type with
/// [`OpaqueHandle::downcast_ref`].
#[derive(Clone)]
pub struct OpaqueHandle(Arc<dyn Any + Send + Sync>);

impl OpaqueHandle {
    /// Wraps a value in a new handle.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Returns the wrapped value when it has type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpaqueHandle(..)")
    }
}

/// Value stored in a metadata or mutation property bag.
#[derive(Clone, Debug)]
pub enum Value {
    /// UTF-8 string.
    String(String),
    /// Boolean flag.
    Bool(bool),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 64-bit integer.
    I64(i64),
    /// Raw bytes.
    Bytes(Bytes),
    /// Codec-private data.
    Opaque(OpaqueHandle),
}

impl Value {
    /// Returns the string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the boolean payload, if any.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value as a `u32` when it is an integer that fits.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(value) => Some(*value),
            Self::U64(value) => u32::try_from(*value).ok(),
            Self::I64(value) => u32::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Returns the value as a `u64` when it is a non-negative integer.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U32(value) => Some(u64::from(*value)),
            Self::U64(value) => Some(*value),
            Self::I64(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Returns the value as an `i64` when it is an integer that fits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::U32(value) => Some(i64::from(*value)),
            Self::U64(value) => i64::try_from(*value).ok(),
            Self::I64(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the raw bytes payload, if any.
    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the opaque handle, if any.
    #[must_use]
    pub const fn as_opaque(&self) -> Option<&OpaqueHandle> {
        match self {
            Self::Opaque(value) => Some(value),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::U32(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<OpaqueHandle> for Value {
    fn from(value: OpaqueHandle) -> Self {
        Self::Opaque(value)
    }
}
