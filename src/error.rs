//! Errors for processing a single packet on its way through the codec pipeline and transport.
//!
//! Every per-packet failure is isolated to that packet: the caller logs it (with the stage
//!  that failed), counts it and carries on with the next packet. Authentication failures are
//!  reported separately from all other decoding problems since they point to a key mismatch or
//!  to active interference rather than to transient noise.

use std::io;
use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Serialize,
    Compress,
    Encrypt,
    Send,
    Decrypt,
    Decompress,
    Deserialize,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("serializing delta batch failed: {0}")]
    Serialization(#[source] BoxedError),

    #[error("parsing delta batch failed: {0}")]
    Deserialization(#[source] BoxedError),

    #[error("compression failed: {0}")]
    Compression(#[source] io::Error),

    #[error("decompression failed: {0}")]
    Decompression(#[source] io::Error),

    #[error("encryption failed")]
    Encryption,

    /// Tag verification failed: the packet was tampered with or sealed with a different key
    #[error("packet authentication failed")]
    Authentication,

    #[error("packet of {len} bytes is too short to hold nonce and tag")]
    PacketTooShort { len: usize },

    #[error("send failed with a transient error after {attempts} attempts: {source}")]
    TransientSend {
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] io::Error),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::Serialization(_) => PipelineStage::Serialize,
            PipelineError::Deserialization(_) => PipelineStage::Deserialize,
            PipelineError::Compression(_) => PipelineStage::Compress,
            PipelineError::Decompression(_) => PipelineStage::Decompress,
            PipelineError::Encryption => PipelineStage::Encrypt,
            PipelineError::Authentication | PipelineError::PacketTooShort { .. } => PipelineStage::Decrypt,
            PipelineError::TransientSend { .. } | PipelineError::Send(_) => PipelineStage::Send,
        }
    }

    /// Only transient transport errors are worth retrying - and the transport already did that
    ///  before giving up, so callers should not retry on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientSend { .. })
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, PipelineError::Authentication)
    }
}
