//! Recovery requests against the vendor API.

pub mod api;
pub mod coordinator;
pub mod request;
pub mod store;

pub use api::{ApiReply, RecoveryApi, RecoveryCall, ReplyClass};
pub use coordinator::{FullRecoveryReport, RecoveryCoordinator, TriggerOutcome};
pub use request::{RecoveryOutcome, RecoveryRequest, RecoveryScope};
#[cfg(feature = "postgres")]
pub use store::PgRecoveryStore;
pub use store::{MemoryRecoveryStore, RecoveryStore};
