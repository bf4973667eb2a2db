pub mod category;
pub mod channel;

pub use category::{CategoryError, CategoryKey, CategoryRegistry};
pub use channel::{ChannelRecord, Inventory, LivenessState, ShardAssignment, StateCounts};
