pub mod attachments;
pub mod engine;
pub mod guard;
pub mod state;

pub use engine::{SyncEngine, SyncError, SyncOutcome, SyncResult};
pub use guard::{SyncGuard, SyncSkipReason};
pub use state::SyncStateManager;
