//! CLI command implementations.
//!
//! | Module     | Commands handled      |
//! |------------|-----------------------|
//! | `scan`     | `Scan`                |
//! | `profiles` | `Profiles`            |
//! | `status`   | `Status`, `Cleanup`   |
//! | `config`   | `Config`              |

pub mod config;
pub mod profiles;
pub mod scan;
pub mod status;

pub use config::cmd_config;
pub use profiles::cmd_profiles;
pub use scan::{ScanArgs, cmd_scan};
pub use status::{cmd_cleanup, cmd_status};

use anyhow::{Context, Result};
use reconflow::config::ReconConfig;
use reconflow::store::{JournalStore, MemoryStore, TaskStore};
use std::sync::Arc;

/// Open the configured journal, or an in-memory store when `ephemeral`.
pub fn open_store(config: &ReconConfig, ephemeral: bool) -> Result<Arc<dyn TaskStore>> {
    if ephemeral {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = config.journal_path();
    let store = JournalStore::open(&path)
        .with_context(|| format!("Failed to open scan journal: {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Open the configured journal for inspection. Safe to run while a scan
/// holds the journal for writing.
pub fn open_store_read_only(config: &ReconConfig) -> Result<Arc<dyn TaskStore>> {
    let path = config.journal_path();
    let store = JournalStore::open_read_only(&path)
        .with_context(|| format!("Failed to read scan journal: {}", path.display()))?;
    Ok(Arc::new(store))
}
