use std::fmt::Formatter;
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::compression::CompressionHint;
use crate::error::PipelineError;
use crate::model::Delta;

/// The two interchangeable wire encodings. Both ends of a link must be configured with the
///  same format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    Json,
    #[serde(alias = "messagepack")]
    Msgpack,
}
impl SerializationFormat {
    pub fn serializer(&self) -> Arc<dyn DeltaSerializer> {
        match self {
            SerializationFormat::Json => Arc::new(JsonSerializer),
            SerializationFormat::Msgpack => Arc::new(MessagePackSerializer),
        }
    }
}

pub trait DeltaSerializer: Send + Sync {
    fn serialize(&self, batch: &[Delta]) -> Result<Vec<u8>, PipelineError>;

    fn deserialize(&self, buf: &[u8]) -> Result<Vec<Delta>, PipelineError>;

    /// The size of a single delta in this encoding, without the batch framing around it
    fn serialized_len(&self, delta: &Delta) -> Result<usize, PipelineError>;

    fn compression_hint(&self) -> CompressionHint;
}

pub struct JsonSerializer;
impl DeltaSerializer for JsonSerializer {
    fn serialize(&self, batch: &[Delta]) -> Result<Vec<u8>, PipelineError> {
        serde_json::to_vec(&BatchRef(batch))
            .map_err(|e| PipelineError::Serialization(e.into()))
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Vec<Delta>, PipelineError> {
        serde_json::from_slice::<DeltaBatch>(buf)
            .map(|b| b.0)
            .map_err(|e| PipelineError::Deserialization(e.into()))
    }

    fn serialized_len(&self, delta: &Delta) -> Result<usize, PipelineError> {
        serde_json::to_vec(delta)
            .map(|buf| buf.len())
            .map_err(|e| PipelineError::Serialization(e.into()))
    }

    fn compression_hint(&self) -> CompressionHint {
        CompressionHint::Text
    }
}

/// MessagePack with structs encoded as maps (rather than positional arrays), so both formats
///  carry the same self-describing structure
pub struct MessagePackSerializer;
impl DeltaSerializer for MessagePackSerializer {
    fn serialize(&self, batch: &[Delta]) -> Result<Vec<u8>, PipelineError> {
        rmp_serde::to_vec_named(&BatchRef(batch))
            .map_err(|e| PipelineError::Serialization(e.into()))
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Vec<Delta>, PipelineError> {
        rmp_serde::from_slice::<DeltaBatch>(buf)
            .map(|b| b.0)
            .map_err(|e| PipelineError::Deserialization(e.into()))
    }

    fn serialized_len(&self, delta: &Delta) -> Result<usize, PipelineError> {
        rmp_serde::to_vec_named(delta)
            .map(|buf| buf.len())
            .map_err(|e| PipelineError::Serialization(e.into()))
    }

    fn compression_hint(&self) -> CompressionHint {
        CompressionHint::Generic
    }
}


/// On the wire, a batch is a map keyed by the deltas' sequence numbers within the batch: `"0"`,
///  `"1"`, ...
struct BatchRef<'a>(&'a [Delta]);

impl Serialize for BatchRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (i, delta) in self.0.iter().enumerate() {
            map.serialize_entry(&i.to_string(), delta)?;
        }
        map.end()
    }
}

struct DeltaBatch(Vec<Delta>);

impl<'de> Deserialize<'de> for DeltaBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(DeltaBatchVisitor)
    }
}

struct DeltaBatchVisitor;
impl<'de> Visitor<'de> for DeltaBatchVisitor {
    type Value = DeltaBatch;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        write!(formatter, "a map of deltas keyed by sequence number")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries: Vec<(u64, Delta)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, delta)) = map.next_entry::<String, Delta>()? {
            let seq = key.parse::<u64>()
                .map_err(|_| serde::de::Error::custom(format!("batch key {:?} is not a sequence number", key)))?;
            entries.push((seq, delta));
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(DeltaBatch(entries.into_iter().map(|(_, d)| d).collect()))
    }
}
