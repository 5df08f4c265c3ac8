//! Key/value encoding layer: converts between the client's logical media
//! representation and the canonical storage representation, skipping inputs
//! that are already in storage form.

use std::sync::Arc;

use crate::utils::GridError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// A logical key or value as handled by clients and storage.
///
/// `Utf8` and `Blob` are client-side media kinds; `Wrapped` is the canonical
/// storage form produced by a `Wrapper` and is the only form kept inside the
/// data container. The wrapper predicate `is_wrapped` is true exactly for
/// `Wrapped`, which is what makes wrapping idempotent.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize,
)]
pub enum GridValue {
    /// UTF-8 text media.
    Utf8(String),
    /// Raw binary media.
    Blob(Bytes),
    /// Canonical storage bytes, marked as already encoded.
    Wrapped(Bytes),
}

impl GridValue {
    /// Convenience constructor for text values.
    pub fn text(s: impl Into<String>) -> Self {
        GridValue::Utf8(s.into())
    }

    /// Convenience constructor for binary values.
    pub fn blob(b: impl Into<Bytes>) -> Self {
        GridValue::Blob(b.into())
    }
}

/// Converts between a client-form value and canonical storage bytes.
pub trait Encoder: Send + Sync {
    /// Encode a client-form value into storage bytes. Fails if this encoder
    /// cannot represent the value's media kind.
    fn to_storage(&self, v: &GridValue) -> Result<Bytes, GridError>;

    /// Decode storage bytes back into the client form.
    fn from_storage(&self, b: &Bytes) -> Result<GridValue, GridError>;
}

/// Marks storage bytes as already encoded so that values which arrive in
/// storage form (e.g. forwarded from a replica) are never encoded twice.
pub trait Wrapper: Send + Sync {
    fn wrap(&self, b: Bytes) -> GridValue;

    fn unwrap(&self, v: &GridValue) -> Option<Bytes>;

    fn is_wrapped(&self, v: &GridValue) -> bool;
}

/// Encoder for UTF-8 text media.
pub struct Utf8Encoder;

impl Encoder for Utf8Encoder {
    fn to_storage(&self, v: &GridValue) -> Result<Bytes, GridError> {
        match v {
            GridValue::Utf8(s) => Ok(Bytes::from(s.clone().into_bytes())),
            GridValue::Blob(b) => Ok(b.clone()),
            GridValue::Wrapped(_) => Err(GridError::msg(
                "utf8 encoder got an already-wrapped value",
            )),
        }
    }

    fn from_storage(&self, b: &Bytes) -> Result<GridValue, GridError> {
        let s = String::from_utf8(b.to_vec())?;
        Ok(GridValue::Utf8(s))
    }
}

/// Pass-through encoder for binary media. Rejects text media, surfacing the
/// "encoder cannot represent this media type" failure to the caller.
pub struct IdentityEncoder;

impl Encoder for IdentityEncoder {
    fn to_storage(&self, v: &GridValue) -> Result<Bytes, GridError> {
        match v {
            GridValue::Blob(b) => Ok(b.clone()),
            GridValue::Utf8(_) => Err(GridError::msg(
                "identity encoder cannot represent utf8 media",
            )),
            GridValue::Wrapped(_) => Err(GridError::msg(
                "identity encoder got an already-wrapped value",
            )),
        }
    }

    fn from_storage(&self, b: &Bytes) -> Result<GridValue, GridError> {
        Ok(GridValue::Blob(b.clone()))
    }
}

/// The default wrapper: marks canonical bytes via the `Wrapped` media kind.
pub struct ByteArrayWrapper;

impl Wrapper for ByteArrayWrapper {
    fn wrap(&self, b: Bytes) -> GridValue {
        GridValue::Wrapped(b)
    }

    fn unwrap(&self, v: &GridValue) -> Option<Bytes> {
        match v {
            GridValue::Wrapped(b) => Some(b.clone()),
            _ => None,
        }
    }

    fn is_wrapped(&self, v: &GridValue) -> bool {
        matches!(v, GridValue::Wrapped(_))
    }
}

/// Per-cache encoder + wrapper pairs for keys and values.
#[derive(Clone)]
pub struct EntryCodec {
    key_encoder: Arc<dyn Encoder>,
    key_wrapper: Arc<dyn Wrapper>,
    value_encoder: Arc<dyn Encoder>,
    value_wrapper: Arc<dyn Wrapper>,
}

impl EntryCodec {
    pub fn new(
        key_encoder: Arc<dyn Encoder>,
        key_wrapper: Arc<dyn Wrapper>,
        value_encoder: Arc<dyn Encoder>,
        value_wrapper: Arc<dyn Wrapper>,
    ) -> Self {
        EntryCodec {
            key_encoder,
            key_wrapper,
            value_encoder,
            value_wrapper,
        }
    }

    /// Codec with UTF-8 encoders on both sides; the common configuration.
    pub fn utf8() -> Self {
        EntryCodec::new(
            Arc::new(Utf8Encoder),
            Arc::new(ByteArrayWrapper),
            Arc::new(Utf8Encoder),
            Arc::new(ByteArrayWrapper),
        )
    }

    /// Codec with identity (binary pass-through) encoders on both sides.
    pub fn identity() -> Self {
        EntryCodec::new(
            Arc::new(IdentityEncoder),
            Arc::new(ByteArrayWrapper),
            Arc::new(IdentityEncoder),
            Arc::new(ByteArrayWrapper),
        )
    }

    /// Encode a key into storage form, unless it is already wrapped.
    pub fn key_to_storage(
        &self,
        key: &GridValue,
    ) -> Result<GridValue, GridError> {
        if self.key_wrapper.is_wrapped(key) {
            return Ok(key.clone());
        }
        Ok(self.key_wrapper.wrap(self.key_encoder.to_storage(key)?))
    }

    /// Decode a storage-form key back into client form. `None` passes
    /// through unchanged.
    pub fn key_from_storage(
        &self,
        key: Option<&GridValue>,
    ) -> Result<Option<GridValue>, GridError> {
        match key {
            None => Ok(None),
            Some(k) => match self.key_wrapper.unwrap(k) {
                Some(b) => Ok(Some(self.key_encoder.from_storage(&b)?)),
                None => Ok(Some(k.clone())),
            },
        }
    }

    /// Encode a value into storage form, unless it is already wrapped.
    pub fn value_to_storage(
        &self,
        value: &GridValue,
    ) -> Result<GridValue, GridError> {
        if self.value_wrapper.is_wrapped(value) {
            return Ok(value.clone());
        }
        Ok(self
            .value_wrapper
            .wrap(self.value_encoder.to_storage(value)?))
    }

    /// Decode a storage-form value back into client form. `None` passes
    /// through unchanged.
    pub fn value_from_storage(
        &self,
        value: Option<&GridValue>,
    ) -> Result<Option<GridValue>, GridError> {
        match value {
            None => Ok(None),
            Some(v) => match self.value_wrapper.unwrap(v) {
                Some(b) => Ok(Some(self.value_encoder.from_storage(&b)?)),
                None => Ok(Some(v.clone())),
            },
        }
    }
}

#[cfg(test)]
mod encoding_tests {
    use super::*;

    #[test]
    fn utf8_round_trip() -> Result<(), GridError> {
        let codec = EntryCodec::utf8();
        let v = GridValue::text("wide-eyed raccoon");
        let stored = codec.value_to_storage(&v)?;
        assert!(matches!(stored, GridValue::Wrapped(_)));
        assert_eq!(codec.value_from_storage(Some(&stored))?, Some(v));
        Ok(())
    }

    #[test]
    fn wrapping_is_idempotent() -> Result<(), GridError> {
        let codec = EntryCodec::utf8();
        let v = GridValue::text("once");
        let once = codec.value_to_storage(&v)?;
        let twice = codec.value_to_storage(&once)?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn storage_form_survives_key_round_trip() -> Result<(), GridError> {
        let codec = EntryCodec::utf8();
        let k = codec.key_to_storage(&GridValue::text("k77"))?;
        let decoded = codec.key_from_storage(Some(&k))?.unwrap();
        assert_eq!(codec.key_to_storage(&decoded)?, k);
        Ok(())
    }

    #[test]
    fn absent_passes_through() -> Result<(), GridError> {
        let codec = EntryCodec::utf8();
        assert_eq!(codec.value_from_storage(None)?, None);
        Ok(())
    }

    #[test]
    fn identity_rejects_text_media() {
        let codec = EntryCodec::identity();
        assert!(codec.value_to_storage(&GridValue::text("nope")).is_err());
        assert!(codec
            .value_to_storage(&GridValue::blob(vec![1u8, 2, 3]))
            .is_ok());
    }
}
