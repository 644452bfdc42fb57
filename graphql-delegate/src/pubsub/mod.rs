//! Fan-out primitives: broadcast channels, topics and stream splitting.

mod channel;
mod split;
mod topic;

pub use channel::Channel;
pub use channel::Subscription;
pub use split::SplitStream;
pub use split::split;
pub use topic::PubSub;
