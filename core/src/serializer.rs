//! Conversions between typed values and the byte payloads engines store.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{StoreError, StoreResult};
use crate::pack;

/// Turns a value into bytes and back. Engines only ever see the bytes.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, out: &mut Vec<u8>, value: &T) -> StoreResult<()>;

    fn deserialize(&self, data: &[u8]) -> StoreResult<T>;

    /// Expected encoded size, used to pre-size the output buffer.
    fn size_hint(&self, _value: &T) -> usize {
        0
    }
}

/// Raw bytes, stored as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &Vec<u8>) -> StoreResult<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn size_hint(&self, value: &Vec<u8>) -> usize {
        value.len()
    }
}

/// UTF-8 strings without a length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &String) -> StoreResult<()> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> StoreResult<String> {
        String::from_utf8(data.to_vec()).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn size_hint(&self, value: &String) -> usize {
        value.len()
    }
}

/// A single `u64` as a varint.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedU64Serializer;

impl Serializer<u64> for PackedU64Serializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &u64) -> StoreResult<()> {
        pack::pack_long(out, *value);
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> StoreResult<u64> {
        let (value, used) = pack::unpack_long(data)?;
        if used != data.len() {
            return Err(StoreError::Serialization(format!(
                "{} trailing bytes after packed u64",
                data.len() - used
            )));
        }
        Ok(value)
    }

    fn size_hint(&self, value: &u64) -> usize {
        pack::packed_long_size(*value)
    }
}

/// Any serde type, encoded with bincode.
pub struct BincodeSerializer<T>(PhantomData<fn() -> T>);

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for BincodeSerializer<T> {}

impl<T> std::fmt::Debug for BincodeSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BincodeSerializer")
    }
}

impl<T: Serialize + DeserializeOwned> Serializer<T> for BincodeSerializer<T> {
    fn serialize(&self, out: &mut Vec<u8>, value: &T) -> StoreResult<()> {
        bincode::serialize_into(out, value)?;
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> StoreResult<T> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Serialize `value` into a fresh buffer.
pub fn to_bytes<T, S: Serializer<T> + ?Sized>(serializer: &S, value: &T) -> StoreResult<Vec<u8>> {
    let mut out = Vec::with_capacity(serializer.size_hint(value));
    serializer.serialize(&mut out, value)?;
    Ok(out)
}
