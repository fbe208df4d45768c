use std::sync::Arc;
use tracing::trace;

use crate::codec::compression::{compress, decompress, CompressionHint};
use crate::codec::encryption::Aes256GcmEncryption;
use crate::codec::path_dictionary::PathDictionary;
use crate::codec::serializer::DeltaSerializer;
use crate::config::LinkConfig;
use crate::error::PipelineError;
use crate::model::Delta;

/// A sealed packet, ready to be handed to the transport
#[derive(Debug)]
pub struct EncodedPacket {
    pub packet: Vec<u8>,
    /// serialized size before compression and encryption
    pub raw_len: usize,
    pub delta_count: usize,
    /// serialized size of each delta, in batch order
    pub delta_lens: Vec<usize>,
}

/// The sequence of per-packet transformations, applied strictly in this order on the way out:
///  path dictionary -> serialization -> compression -> encryption. Decoding applies the inverse
///  steps in reverse order.
///
/// A pipeline is an immutable snapshot of the relevant configuration: it is rebuilt (not
///  modified) when the configuration changes.
pub struct CodecPipeline {
    dictionary: &'static PathDictionary,
    use_dictionary: bool,
    serializer: Arc<dyn DeltaSerializer>,
    compression_hint: CompressionHint,
    encryption: Aes256GcmEncryption,
}

impl CodecPipeline {
    pub fn new(config: &LinkConfig) -> anyhow::Result<CodecPipeline> {
        let serializer = config.serialization.serializer();
        Ok(CodecPipeline {
            dictionary: PathDictionary::standard(),
            use_dictionary: config.use_path_dictionary,
            compression_hint: serializer.compression_hint(),
            serializer,
            encryption: Aes256GcmEncryption::new(&config.encryption_key)?,
        })
    }

    pub fn encode_batch(&self, batch: &[Delta]) -> Result<EncodedPacket, PipelineError> {
        let dictionary_encoded;
        let batch = if self.use_dictionary {
            dictionary_encoded = batch.iter()
                .map(|d| self.dictionary.encode(d))
                .collect::<Vec<_>>();
            dictionary_encoded.as_slice()
        }
        else {
            batch
        };

        let raw = self.serializer.serialize(batch)?;
        let delta_lens = batch.iter()
            .map(|d| self.serializer.serialized_len(d))
            .collect::<Result<Vec<_>, _>>()?;

        let compressed = compress(&raw, self.compression_hint)?;
        let packet = self.encryption.seal(&compressed)?;

        trace!(deltas = batch.len(), raw = raw.len(), compressed = compressed.len(), packet = packet.len(), "encoded batch");
        Ok(EncodedPacket {
            packet,
            raw_len: raw.len(),
            delta_count: batch.len(),
            delta_lens,
        })
    }

    /// Dictionary decoding is applied regardless of the local `use_path_dictionary` setting: it
    ///  is a no-op for spelled-out paths, so it is always safe.
    pub fn decode_packet(&self, packet: &[u8]) -> Result<Vec<Delta>, PipelineError> {
        let compressed = self.encryption.open(packet)?;
        let raw = decompress(&compressed)?;
        let mut batch = self.serializer.deserialize(&raw)?;

        for delta in batch.iter_mut() {
            self.dictionary.decode_in_place(delta);
        }
        Ok(batch)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use crate::codec::encryption::ENCRYPTION_OVERHEAD;
    use crate::codec::serializer::SerializationFormat;
    use crate::model::PathRef;
    use crate::test_util::config::test_config;
    use crate::test_util::delta::{gsv_delta, nested_delta, sample_delta, unicode_delta};

    fn pipeline(format: SerializationFormat, use_path_dictionary: bool) -> CodecPipeline {
        let mut config = test_config();
        config.serialization = format;
        config.use_path_dictionary = use_path_dictionary;
        CodecPipeline::new(&config).unwrap()
    }

    #[rstest]
    #[case::json_dict(SerializationFormat::Json, true)]
    #[case::json_plain(SerializationFormat::Json, false)]
    #[case::msgpack_dict(SerializationFormat::Msgpack, true)]
    #[case::msgpack_plain(SerializationFormat::Msgpack, false)]
    fn test_round_trip(#[case] format: SerializationFormat, #[case] use_path_dictionary: bool) {
        let pipeline = pipeline(format, use_path_dictionary);
        let batch = vec![
            sample_delta(0),
            Delta::new("vessels.empty", vec![]),
            nested_delta(),
            unicode_delta(),
            gsv_delta(),
        ];

        let encoded = pipeline.encode_batch(&batch).unwrap();
        assert_eq!(encoded.delta_count, batch.len());
        assert_eq!(pipeline.decode_packet(&encoded.packet).unwrap(), batch);
    }

    #[rstest]
    #[case::json(SerializationFormat::Json)]
    #[case::msgpack(SerializationFormat::Msgpack)]
    fn test_delta_lens(#[case] format: SerializationFormat) {
        let pipeline = pipeline(format, true);
        let batch = vec![sample_delta(0), gsv_delta(), Delta::new("vessels.empty", vec![])];

        let encoded = pipeline.encode_batch(&batch).unwrap();
        let expected = batch.iter()
            .map(|d| format.serializer().serialized_len(&PathDictionary::standard().encode(d)).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(encoded.delta_lens, expected);
        assert_ne!(encoded.delta_lens[0], encoded.delta_lens[1]);
        assert!(encoded.delta_lens.iter().sum::<usize>() < encoded.raw_len);
    }

    #[test]
    fn test_dictionary_shrinks_payload() {
        let batch: Vec<Delta> = (0..10).map(sample_delta).collect();
        let with_dict = pipeline(SerializationFormat::Json, true).encode_batch(&batch).unwrap();
        let without_dict = pipeline(SerializationFormat::Json, false).encode_batch(&batch).unwrap();
        assert!(with_dict.raw_len < without_dict.raw_len);
    }

    #[test]
    fn test_receiver_decodes_dictionary_regardless_of_own_setting() {
        let sender = pipeline(SerializationFormat::Json, true);
        let receiver = pipeline(SerializationFormat::Json, false);

        let batch = vec![sample_delta(7)];
        let decoded = receiver.decode_packet(&sender.encode_batch(&batch).unwrap().packet).unwrap();
        assert_eq!(decoded, batch);
        assert!(decoded[0].values().all(|v| matches!(v.path, PathRef::Name(_))));
    }

    #[test]
    fn test_tampered_packet() {
        let pipeline = pipeline(SerializationFormat::Json, true);
        let mut packet = pipeline.encode_batch(&[sample_delta(0)]).unwrap().packet;
        let last = packet.len() - 1;
        packet[last] ^= 0x80;

        assert!(matches!(pipeline.decode_packet(&packet), Err(PipelineError::Authentication)));
    }

    #[test]
    fn test_wrong_key() {
        let sender = pipeline(SerializationFormat::Json, true);
        let mut config = test_config();
        config.encryption_key = b"zyxwvutsrqponmlkjihgfedcba987654".to_vec();
        let receiver = CodecPipeline::new(&config).unwrap();

        let packet = sender.encode_batch(&[sample_delta(0)]).unwrap().packet;
        assert!(matches!(receiver.decode_packet(&packet), Err(PipelineError::Authentication)));
    }

    #[test]
    fn test_format_mismatch_is_a_decode_error() {
        let sender = pipeline(SerializationFormat::Msgpack, true);
        let receiver = pipeline(SerializationFormat::Json, true);

        let packet = sender.encode_batch(&[sample_delta(0)]).unwrap().packet;
        assert!(matches!(receiver.decode_packet(&packet), Err(PipelineError::Deserialization(_))));
    }

    #[test]
    fn test_packet_overhead() {
        let pipeline = pipeline(SerializationFormat::Json, true);
        let encoded = pipeline.encode_batch(&[]).unwrap();
        assert!(encoded.packet.len() > ENCRYPTION_OVERHEAD);
        assert!(pipeline.decode_packet(&encoded.packet).unwrap().is_empty());
    }

    #[test]
    fn test_hundred_deltas_shrink_by_ninety_percent() {
        let pipeline = pipeline(SerializationFormat::Json, true);
        let deltas: Vec<Delta> = (0..100).map(sample_delta).collect();

        let raw_total: usize = deltas.iter()
            .map(|d| serde_json::to_vec(d).unwrap().len())
            .sum();
        assert!(raw_total >= 100 * 150);

        let wire_total: usize = deltas.chunks(50)
            .map(|chunk| pipeline.encode_batch(chunk).unwrap().packet.len())
            .sum();

        assert!(wire_total * 10 <= raw_total, "wire {} vs raw {}", wire_total, raw_total);
    }
}
