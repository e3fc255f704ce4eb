//! Built-in maintenance tasks

mod history_cleanup;

pub use history_cleanup::{HistoryCleanupTask, HISTORY_CLEANUP_TYPE};
