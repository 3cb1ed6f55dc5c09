//! Summary: Typed values stored through serde and bincode.
//! Copyright (c) YOAB. All rights reserved.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bucket::Bucket;
use crate::error::Result;
use crate::tx::Tx;

impl Tx<'_> {
    /// Serializes `value` with bincode and stores it at `path`.
    pub fn put_encoded<K, V>(&self, path: &[K], value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize + ?Sized,
    {
        let bytes = bincode::serialize(value)?;
        self.put(path, &bytes)
    }

    /// Reads and deserializes the value at `path`.
    ///
    /// Returns `None` if it is absent and a `Codec` error if the stored
    /// bytes do not decode as `V`.
    pub fn decoded_value<K, V>(&self, path: &[K]) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
    {
        self.value(path, |bytes| Ok(bincode::deserialize(bytes)?))
    }

    /// Runs `f` with every key and decoded value of the bucket at `folders`.
    pub fn for_each_decoded<K, V, F>(&self, folders: &[K], mut f: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
        F: FnMut(&[u8], V) -> Result<()>,
    {
        self.for_each(folders, |_, key, bytes| f(key, bincode::deserialize(bytes)?))
    }
}

impl Bucket<'_> {
    /// Serializes `value` with bincode and stores it at `path` below this
    /// bucket.
    pub fn put_encoded<K, V>(&self, path: &[K], value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize + ?Sized,
    {
        let bytes = bincode::serialize(value)?;
        self.put_path(path, &bytes)
    }

    /// Reads and deserializes the value at `path` below this bucket.
    pub fn decoded_value<K, V>(&self, path: &[K]) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
    {
        self.value(path, |bytes| Ok(bincode::deserialize(bytes)?))
    }

    /// Runs `f` with every key and decoded value of the bucket at `folders`
    /// below this bucket.
    pub fn for_each_decoded<K, V, F>(&self, folders: &[K], mut f: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
        F: FnMut(&[u8], V) -> Result<()>,
    {
        self.for_each_path(folders, |key, bytes| f(key, bincode::deserialize(bytes)?))
    }
}
