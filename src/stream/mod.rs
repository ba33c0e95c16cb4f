pub mod pool;
pub mod shard;
pub mod wire;

pub use pool::{plan_shards, FatalShard, ShardPlan, StreamPool};
pub use shard::ShardConfig;
pub use wire::WireMessage;
