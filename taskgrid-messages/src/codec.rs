//! Payload codec selection.
//!
//! Headers are always encoded with the portable codec so any peer can route a
//! frame. Payloads name their codec in the header (`dumps`/`loads`); senders
//! pick the rich codec for payloads that carry task structures.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode encoding failed: {0}")]
    Bincode(#[from] bincode::Error),

    /// The frame named a codec this build does not know.
    #[error("unsupported codec")]
    Unsupported,
}

/// The closed set of payload codecs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Portable default; also the header codec.
    #[default]
    Json,

    /// Rich codec for payloads carrying arbitrary task descriptions.
    Bincode,

    /// Used by serde if the codec name on the wire is not known.
    #[serde(other)]
    Unsupported,
}

impl Codec {
    pub fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Bincode => Ok(bincode::serialize(value)?),
            Codec::Unsupported => Err(CodecError::Unsupported),
        }
    }

    pub fn decode<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Bincode => Ok(bincode::deserialize(bytes)?),
            Codec::Unsupported => Err(CodecError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Datum;
    use crate::task::Term;

    #[test]
    fn both_codecs_roundtrip_terms() -> anyhow::Result<()> {
        let term = Term::call(
            "add",
            vec![Term::key("x"), Term::literal(Datum::Int(2))],
        );
        for codec in [Codec::Json, Codec::Bincode] {
            let bytes = codec.encode(&term)?;
            let back: Term = codec.decode(&bytes)?;
            assert_eq!(back, term);
        }
        Ok(())
    }

    #[test]
    fn unknown_codec_name_is_unsupported() -> anyhow::Result<()> {
        let codec: Codec = serde_json::from_str("\"pickle\"")?;
        assert_eq!(codec, Codec::Unsupported);
        assert!(codec.encode(&1u8).is_err());
        Ok(())
    }
}
