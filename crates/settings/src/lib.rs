//! Administrator-supplied plugin settings: the shared store that holds them
//! and the versioned in-memory cache every request worker reads from.

mod cache;
mod pg;
mod snapshot;
mod store;

pub use cache::{ReloadObserver, ReloadOutcome, VersionedSettingsCache};
pub use pg::{PgSettingsStore, migrate};
pub use snapshot::{SettingsError, SettingsSnapshot};
pub use store::{MemorySettingsStore, SettingsStore, StoreError, StoredSettings};
