pub mod cache;
pub mod error;
pub mod rewards;
pub mod segment_log;
pub mod sync;
pub mod synchronizer;
pub mod traces;
pub mod traits;
pub mod transactions;
pub mod types;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use cache::*;
pub use error::*;
pub use rewards::*;
pub use sync::*;
pub use synchronizer::{Synchronizer, Task};
pub use traces::TraceOutcome;
pub use traits::*;
pub use types::*;
