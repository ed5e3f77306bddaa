//! Classification and routing of feed deliveries.

pub mod classifier;
pub mod kind;
pub mod router;

pub use classifier::{classify, scan_root, MessageEnvelope, RawDelivery, RootElement};
pub use kind::MessageKind;
pub use router::{
    CompletionSink, Dispatched, Dispatcher, HandlerRegistry, MessageHandler, MessageStats,
    StatsSnapshot,
};
