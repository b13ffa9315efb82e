//! Checkpoint discovery and weight loading

mod host;
mod loader;
mod pickle;
mod resolve;
mod safetensors;

pub use host::HostTensor;
pub use loader::{
    CheckpointLoader, FusedSplit, LoadReport, WeightAliases, WeightSink, EMBED_TOKENS_WEIGHT,
    LM_HEAD_WEIGHT,
};
pub use resolve::{resolve_checkpoint, CheckpointSource, ShardFormat, MARLIN_CONSOLIDATED};
