pub mod batch_state;
pub mod smart_batcher;
