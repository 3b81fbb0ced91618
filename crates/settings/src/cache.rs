use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use tbac_policy::PolicyDecisionPoint;
use tokio::sync::Mutex;

use crate::snapshot::SettingsSnapshot;
use crate::store::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Loaded,
    /// A newer snapshot was already published by a concurrent reload.
    Superseded,
    Unset,
    Invalid,
    StoreError,
}

impl ReloadOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ReloadOutcome::Loaded => "loaded",
            ReloadOutcome::Superseded => "superseded",
            ReloadOutcome::Unset => "unset",
            ReloadOutcome::Invalid => "invalid",
            ReloadOutcome::StoreError => "store_error",
        }
    }
}

pub type ReloadObserver = Arc<dyn Fn(ReloadOutcome) + Send + Sync>;

/// Keeps the in-memory settings in step with the shared store.
///
/// Readers never take a lock: the published snapshot lives in an
/// `ArcSwapOption` and is replaced wholesale. Concurrent reloads may happen;
/// an older snapshot never replaces a newer one.
pub struct VersionedSettingsCache {
    store: Arc<dyn SettingsStore>,
    pdp: Arc<dyn PolicyDecisionPoint>,
    current: ArcSwapOption<SettingsSnapshot>,
    force_reload: AtomicBool,
    /// Version of the last bootstrap handed to the PDP. Held across `init`
    /// so that initializations run one at a time.
    init_applied: Mutex<i64>,
    observer: Option<ReloadObserver>,
}

impl VersionedSettingsCache {
    pub fn new(store: Arc<dyn SettingsStore>, pdp: Arc<dyn PolicyDecisionPoint>) -> Self {
        Self {
            store,
            pdp,
            current: ArcSwapOption::empty(),
            force_reload: AtomicBool::new(false),
            init_applied: Mutex::new(0),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ReloadObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The published snapshot, without consulting the store.
    pub fn snapshot(&self) -> Option<Arc<SettingsSnapshot>> {
        self.current.load_full()
    }

    /// Forces the next [`current`](Self::current) call to reload even if the
    /// store version did not move.
    pub fn invalidate(&self) {
        self.force_reload.store(true, Ordering::Release);
    }

    /// Returns the settings in effect, reloading first when the store holds a
    /// newer version (or nothing has been loaded yet).
    ///
    /// A missing or non-positive store version never triggers a reload; the
    /// previous snapshot keeps serving traffic.
    pub async fn current(&self) -> Option<Arc<SettingsSnapshot>> {
        let cached = self.current.load_full();
        let forced = self.force_reload.swap(false, Ordering::AcqRel);

        let stored = match self.store.read().await {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read plugin settings; previous settings are retained");
                self.rearm(forced);
                self.observe(ReloadOutcome::StoreError);
                return cached;
            }
        };

        let Some(version) = stored.version.filter(|v| *v > 0) else {
            if cached.is_some() {
                tracing::warn!("plugin settings seem to have been wiped; previous settings are retained");
            } else {
                tracing::warn!("plugin settings not set yet");
            }
            self.rearm(forced);
            self.observe(ReloadOutcome::Unset);
            return cached;
        };

        let stale = cached
            .as_ref()
            .is_none_or(|snapshot| snapshot.version < version);
        if !stale && !forced {
            return cached;
        }

        tracing::info!(version, forced, "reloading plugin settings");

        let Some(payload) = stored.payload.as_deref() else {
            tracing::warn!("plugin settings payload is missing; previous settings are retained");
            self.observe(ReloadOutcome::Invalid);
            return cached;
        };

        let snapshot = match SettingsSnapshot::parse(payload, version) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                tracing::warn!(error = %err, version, "rejected plugin settings; previous settings are retained");
                self.observe(ReloadOutcome::Invalid);
                return cached;
            }
        };

        if !self.publish(&snapshot) {
            self.observe(ReloadOutcome::Superseded);
            return self.current.load_full();
        }

        tracing::info!(
            version,
            enabled = snapshot.enabled,
            action_name = %snapshot.action_name,
            "published plugin settings"
        );

        self.init_pdp(&snapshot).await;
        self.observe(ReloadOutcome::Loaded);
        Some(snapshot)
    }

    /// Initializes the PDP with `snapshot` unless a newer bootstrap has
    /// already been applied or published in the meantime.
    async fn init_pdp(&self, snapshot: &SettingsSnapshot) {
        let mut applied = self.init_applied.lock().await;

        let superseded = self
            .current
            .load()
            .as_ref()
            .is_some_and(|published| published.version > snapshot.version);
        if *applied > snapshot.version || superseded {
            tracing::debug!(
                version = snapshot.version,
                applied = *applied,
                "skipping policy decision point init for superseded settings"
            );
            return;
        }

        match self.pdp.init(&snapshot.bootstrap_config).await {
            Ok(()) => *applied = snapshot.version,
            Err(err) => {
                tracing::error!(error = %err, version = snapshot.version, "error initializing policy decision point");
            }
        }
    }

    /// Swaps `snapshot` in unless a newer one is already published.
    fn publish(&self, snapshot: &Arc<SettingsSnapshot>) -> bool {
        let mut published = false;
        self.current.rcu(|current| match current {
            Some(existing) if existing.version > snapshot.version => {
                published = false;
                Some(existing.clone())
            }
            _ => {
                published = true;
                Some(snapshot.clone())
            }
        });
        published
    }

    fn rearm(&self, forced: bool) {
        if forced {
            self.force_reload.store(true, Ordering::Release);
        }
    }

    fn observe(&self, outcome: ReloadOutcome) {
        if let Some(observer) = self.observer.as_ref() {
            observer(outcome);
        }
    }
}
