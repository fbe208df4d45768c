//! The per-packet transformations of a batch of deltas, and their inverse:
//!
//! ```ascii
//! deltas -> path dictionary -> serializer -> compression -> encryption -> packet
//! ```

pub mod compression;
pub mod encryption;
pub mod path_dictionary;
pub mod pipeline;
pub mod serializer;
