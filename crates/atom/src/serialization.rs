//! Body codecs. Envelope framing is fixed (flat field maps); the codec
//! chosen here only governs how individual values are encoded.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("msgpack encoding failed")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decoding failed")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
    #[error("json codec failed")]
    Json(#[from] serde_json::Error),
    #[error("the identity codec cannot encode structured values")]
    Identity,
    #[error("unknown serialization method '{0}'")]
    Unknown(String),
}

/// The per-operation body codec choice. `Msgpack` is the default codec for
/// callers who opt into serialization; `None` passes bytes through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    None,
    Msgpack,
    Json,
}

impl Serialization {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Serialization::None => Err(CodecError::Identity),
            Serialization::Msgpack => Ok(rmp_serde::to_vec(value)?),
            Serialization::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Serialization::None => Err(CodecError::Identity),
            Serialization::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
            Serialization::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Decode into the dynamic value form used by entry and response
    /// pipelines, where the concrete type is not known up front.
    pub fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        self.decode(bytes)
    }
}

impl std::str::FromStr for Serialization {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Serialization::None),
            "msgpack" => Ok(Serialization::Msgpack),
            "json" => Ok(Serialization::Json),
            other => Err(CodecError::Unknown(other.to_string())),
        }
    }
}

/// A field value: raw bytes off the wire, or a decoded structured value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Bytes(Bytes),
    Value(serde_json::Value),
}

impl Datum {
    pub fn empty() -> Self {
        Datum::Bytes(Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Datum::Bytes(b) => b.is_empty(),
            Datum::Value(v) => v.is_null(),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Bytes(b) => Some(b),
            Datum::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Datum::Bytes(_) => None,
            Datum::Value(v) => Some(v),
        }
    }

    /// Decode into a concrete type, through the codec for raw bytes or
    /// through serde for already-decoded values.
    pub fn decode<T: DeserializeOwned>(&self, method: Serialization) -> Result<T, CodecError> {
        match self {
            Datum::Bytes(b) => method.decode(b),
            Datum::Value(v) => Ok(serde_json::from_value(v.clone())?),
        }
    }

    /// The wire form of this value. Bytes pass through verbatim; structured
    /// values are encoded with the codec, or rendered as plain text under
    /// the identity codec (strings bare, everything else as JSON text).
    pub(crate) fn to_wire(&self, method: Serialization) -> Result<Vec<u8>, CodecError> {
        match (self, method) {
            (Datum::Bytes(_), _) | (Datum::Value(_), Serialization::None) => Ok(self.raw_wire()),
            (Datum::Value(v), method) => method.encode(v),
        }
    }

    /// The identity-codec wire form; never fails.
    pub(crate) fn raw_wire(&self) -> Vec<u8> {
        match self {
            Datum::Bytes(b) => b.to_vec(),
            Datum::Value(serde_json::Value::String(s)) => s.clone().into_bytes(),
            Datum::Value(v) => v.to_string().into_bytes(),
        }
    }
}

/// Decode one wire value, falling back to the raw bytes when the codec
/// cannot make sense of them.
pub(crate) fn decode_field(bytes: Vec<u8>, method: Serialization) -> Datum {
    if method == Serialization::None {
        return Datum::Bytes(bytes.into());
    }
    match method.decode_value(&bytes) {
        Ok(value) => Datum::Value(value),
        Err(_) => Datum::Bytes(bytes.into()),
    }
}

impl From<Bytes> for Datum {
    fn from(b: Bytes) -> Self {
        Datum::Bytes(b)
    }
}

impl From<Vec<u8>> for Datum {
    fn from(b: Vec<u8>) -> Self {
        Datum::Bytes(b.into())
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::Bytes(s.into_bytes().into())
    }
}

impl From<serde_json::Value> for Datum {
    fn from(v: serde_json::Value) -> Self {
        Datum::Value(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn msgpack_round_trip() {
        let value = json!({"language": "Rust", "version": 2.0});
        let bytes = Serialization::Msgpack.encode(&value).unwrap();
        let back = Serialization::Msgpack.decode_value(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn json_round_trip() {
        let value = json!([1, 2, 3]);
        let bytes = Serialization::Json.encode(&value).unwrap();
        assert_eq!(value, Serialization::Json.decode_value(&bytes).unwrap());
    }

    #[test]
    fn identity_codec_refuses_structured_values() {
        assert!(matches!(
            Serialization::None.encode(&1u8),
            Err(CodecError::Identity)
        ));
    }

    #[test]
    fn wire_form_under_identity_codec() {
        let text: Datum = json!("hello").into();
        assert_eq!(text.to_wire(Serialization::None).unwrap(), b"hello");

        let number: Datum = json!(7).into();
        assert_eq!(number.to_wire(Serialization::None).unwrap(), b"7");

        let raw: Datum = vec![0xde, 0xad].into();
        assert_eq!(raw.to_wire(Serialization::Msgpack).unwrap(), [0xde, 0xad]);
    }

    #[test]
    fn decode_field_falls_back_to_raw() {
        // 0xc1 is never valid msgpack.
        let datum = decode_field(vec![0xc1, 0x00], Serialization::Msgpack);
        assert_eq!(datum, Datum::Bytes(vec![0xc1, 0x00].into()));

        let datum = decode_field(
            Serialization::Msgpack.encode(&json!("ok")).unwrap(),
            Serialization::Msgpack,
        );
        assert_eq!(datum, Datum::Value(json!("ok")));
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("msgpack".parse::<Serialization>().unwrap(), Serialization::Msgpack);
        assert_eq!("none".parse::<Serialization>().unwrap(), Serialization::None);
        assert!("arrow".parse::<Serialization>().is_err());
    }
}
