/// Value encoding shared by every client
///
/// Scalars go on the wire in their textual form, byte strings as-is.
/// Anything else is wrapped in [`Json`] and serialized with `serde_json`.
use crate::error::CacheResult;
use bytes::Bytes;
use serde::Serialize;

/// Conversion of a command argument or stored value into wire bytes
pub trait Encode: Send + Sync {
    fn encode(&self) -> CacheResult<Bytes>;
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self) -> CacheResult<Bytes> {
        (**self).encode()
    }
}

impl Encode for str {
    fn encode(&self) -> CacheResult<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl Encode for String {
    fn encode(&self) -> CacheResult<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl Encode for [u8] {
    fn encode(&self) -> CacheResult<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl Encode for Vec<u8> {
    fn encode(&self) -> CacheResult<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl Encode for Bytes {
    fn encode(&self) -> CacheResult<Bytes> {
        Ok(self.clone())
    }
}

impl Encode for bool {
    fn encode(&self) -> CacheResult<Bytes> {
        Ok(Bytes::from_static(if *self { b"true" } else { b"false" }))
    }
}

macro_rules! encode_display {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                fn encode(&self) -> CacheResult<Bytes> {
                    Ok(Bytes::from(self.to_string()))
                }
            }
        )*
    };
}

encode_display!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

/// Serializes the wrapped value as JSON
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize + Send + Sync> Encode for Json<T> {
    fn encode(&self) -> CacheResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }
}

/// Parse a stored value back into an integer, `None` if it is not one
pub fn decode_int(data: &[u8]) -> Option<i64> {
    btoi::btoi(data).ok()
}
