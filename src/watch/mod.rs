//! Watch mode: workers re-run their tasks and a barrier tracks when every
//! target has finished a cycle.

pub mod barrier;
pub mod channel;
pub mod session;

pub use barrier::CompletionBarrier;
pub use channel::{WatchClient, WatchMessage, WatchServer};
pub use session::{SessionState, WatchSession};
