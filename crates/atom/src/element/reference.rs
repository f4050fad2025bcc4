//! The reference store: expiring keyed values used to pass large artifacts
//! by handle instead of by value.

use super::Element;
use crate::config::stream_key;
use crate::messages::EntryId;
use crate::serialization::{Datum, Serialization};
use crate::{Error, Result};
use std::collections::BTreeMap;

impl Element {
    fn make_reference_key(&self) -> String {
        format!("reference:{}:{}", self.inner.name, uuid::Uuid::new_v4())
    }

    /// Cache a value under a fresh `reference:<element>:<uuid>` key with a
    /// millisecond expiry (`ttl_ms == 0` never expires). A collision on the
    /// minted key fails the operation rather than overwriting.
    pub async fn reference_create(
        &self,
        data: impl Into<Datum>,
        serialization: Serialization,
        ttl_ms: u64,
    ) -> Result<String> {
        let key = self.make_reference_key();
        let wire = data.into().to_wire(serialization)?;
        let created = self
            .inner
            .nucleus
            .value_create(&key, &wire, ttl_ms)
            .await?;
        if !created {
            return Err(Error::ReferenceExists(key));
        }
        Ok(key)
    }

    /// Turn one stream entry into references without the data leaving the
    /// nucleus: a preloaded server-side script reads the entry (the most
    /// recent one when `entry_id` is `None`) and writes one reference per
    /// field. Returns `field → reference key`.
    pub async fn reference_create_from_stream(
        &self,
        element: &str,
        stream: &str,
        entry_id: Option<EntryId>,
        ttl_ms: u64,
    ) -> Result<BTreeMap<String, String>> {
        let Some(sha) = self.inner.stream_reference_sha.as_deref() else {
            return Err(Error::ScriptNotLoaded);
        };

        let key = self.make_reference_key();
        let args = [
            stream_key(element, stream),
            entry_id.map(|id| id.to_string()).unwrap_or_default(),
            key,
            ttl_ms.to_string(),
        ];
        let reply = self.inner.nucleus.script_invoke(sha, &[], &args).await?;
        let keys: Vec<String> = redis::from_redis_value(&reply)?;

        let mut references = BTreeMap::new();
        for key in keys {
            let Some(field) = key.rsplit(':').next() else {
                return Err(Error::UnexpectedReply("reference key without a field"));
            };
            references.insert(field.to_string(), key.clone());
        }
        Ok(references)
    }

    /// Fetch one reference; `None` when it has expired or never existed.
    pub async fn reference_get(
        &self,
        key: &str,
        deserialization: Serialization,
    ) -> Result<Option<Datum>> {
        let values = self
            .inner
            .nucleus
            .value_multi_get(&[key.to_string()])
            .await?;
        values
            .into_iter()
            .next()
            .flatten()
            .map(|bytes| decode_reference(bytes, deserialization))
            .transpose()
    }

    /// Fetch many references in one pipelined round trip. Absent keys map
    /// to `None` rather than failing the batch.
    pub async fn reference_get_list(
        &self,
        keys: &[String],
        deserialization: Serialization,
    ) -> Result<BTreeMap<String, Option<Datum>>> {
        let values = self.inner.nucleus.value_multi_get(keys).await?;

        let mut references = BTreeMap::new();
        for (key, value) in keys.iter().zip(values) {
            let datum = value
                .map(|bytes| decode_reference(bytes, deserialization))
                .transpose()?;
            references.insert(key.clone(), datum);
        }
        Ok(references)
    }

    /// Unlink references; an already-absent key fails the call.
    pub async fn reference_delete(&self, keys: &[String]) -> Result<()> {
        let removed = self.inner.nucleus.value_unlink(keys).await?;
        if removed as usize != keys.len() {
            return Err(Error::ReferenceNotFound(keys.join(", ")));
        }
        Ok(())
    }

    /// Positive `ttl_ms` re-arms the expiry; zero or negative removes it.
    pub async fn reference_update_ttl(&self, key: &str, ttl_ms: i64) -> Result<()> {
        let found = if ttl_ms > 0 {
            self.inner.nucleus.value_expire_ms(key, ttl_ms).await?
        } else {
            self.inner.nucleus.value_persist(key).await?
        };
        if !found {
            return Err(Error::ReferenceNotFound(key.to_string()));
        }
        Ok(())
    }

    /// Remaining lifetime in ms, or −1 when the reference never expires.
    pub async fn reference_get_ttl(&self, key: &str) -> Result<i64> {
        let ttl = self.inner.nucleus.value_ttl_ms(key).await?;
        if ttl == -2 {
            return Err(Error::ReferenceNotFound(key.to_string()));
        }
        Ok(ttl)
    }
}

fn decode_reference(bytes: Vec<u8>, method: Serialization) -> Result<Datum> {
    match method {
        Serialization::None => Ok(Datum::Bytes(bytes.into())),
        method => Ok(Datum::Value(method.decode_value(&bytes)?)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn references_decode_strictly_when_requested() {
        let bytes = Serialization::Msgpack.encode(&json!({"w": 640})).unwrap();
        assert_eq!(
            decode_reference(bytes, Serialization::Msgpack).unwrap(),
            Datum::Value(json!({"w": 640}))
        );
        assert_eq!(
            decode_reference(b"jpeg".to_vec(), Serialization::None).unwrap(),
            Datum::Bytes(b"jpeg".to_vec().into())
        );
        // Unlike entry decoding there is no raw fallback here.
        assert!(decode_reference(vec![0xc1], Serialization::Msgpack).is_err());
    }
}
