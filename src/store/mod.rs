//! In-memory feature state with change notification.
//!
//! Two stores exist: [`EffectiveFeatureStore`] holds values the service already resolved for one
//! audience set, [`AllFeatureStore`] holds raw configurations that are resolved locally per
//! request. Both are safe to share across threads and notify listeners after releasing their
//! lock, so a listener may read the store back.
mod all;
mod effective;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    fetcher::{CachedResponse, FeatureFetcher, FetchOutcome},
    notifications::{NotificationMessage, SubscriptionMode},
    Result,
};

pub use all::{AllFeatureStore, FeatureSnapshot};
pub use effective::EffectiveFeatureStore;

/// Durable store that state is mirrored to, and seeded from on startup.
///
/// `update` is called with a full snapshot after mutations, one call at a time and in the order
/// the mutations happened. Snapshots that are superseded while an `update` is running are
/// skipped. Failures are logged and otherwise ignored.
#[async_trait]
pub trait ExternalStateStore<V>: Send + Sync {
    async fn all(&self) -> Result<HashMap<String, V>>;
    async fn update(&self, snapshot: HashMap<String, V>) -> Result<()>;
}

#[async_trait]
impl<V: Send + 'static, T: ExternalStateStore<V> + ?Sized> ExternalStateStore<V> for Arc<T> {
    async fn all(&self) -> Result<HashMap<String, V>> {
        (**self).all().await
    }

    async fn update(&self, snapshot: HashMap<String, V>) -> Result<()> {
        (**self).update(snapshot).await
    }
}

/// State that an update strategy keeps in sync with the service.
#[async_trait]
pub trait FeatureState: Send + Sync + 'static {
    /// Run one conditional fetch and apply the result.
    async fn fetch(
        &self,
        fetcher: &FeatureFetcher,
        cached: Option<CachedResponse>,
    ) -> Result<FetchOutcome>;

    /// What to subscribe to over the live transport.
    fn subscription_mode(&self) -> SubscriptionMode;

    /// Apply a pushed notification. Notifications meant for the other kind of store are ignored.
    fn apply_notification(&self, message: NotificationMessage);

    fn is_empty(&self) -> bool;

    /// Replace the contents with the external store's snapshot.
    ///
    /// Returns `Ok(false)` when no external store is configured.
    async fn initialise_from_external_store(&self) -> Result<bool>;
}

/// Called with the feature key and its new value, `None` when the feature became unavailable.
pub type FeatureUpdatedCallback<V> = Arc<dyn Fn(&str, Option<&V>) + Send + Sync>;

/// Handle to a registered listener. The listener is removed when the handle is dropped or
/// [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Subscription {
        Subscription {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription that has nothing to remove.
    pub(crate) fn noop() -> Subscription {
        Subscription { unsubscribe: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

struct ListenerList<V> {
    next_id: u64,
    entries: Vec<(u64, FeatureUpdatedCallback<V>)>,
}

pub(crate) struct Listeners<V> {
    list: Arc<Mutex<ListenerList<V>>>,
}

impl<V: 'static> Listeners<V> {
    pub(crate) fn new() -> Self {
        Listeners {
            list: Arc::new(Mutex::new(ListenerList {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub(crate) fn add(&self, callback: FeatureUpdatedCallback<V>) -> Subscription {
        let id = {
            let mut list = self
                .list
                .lock()
                .expect("thread holding listener lock should not panic");
            let id = list.next_id;
            list.next_id += 1;
            list.entries.push((id, callback));
            id
        };

        let list: Weak<Mutex<ListenerList<V>>> = Arc::downgrade(&self.list);
        Subscription::new(move || {
            if let Some(list) = list.upgrade() {
                list.lock()
                    .expect("thread holding listener lock should not panic")
                    .entries
                    .retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Invoke every listener registered at the time of the call, outside of the lock.
    pub(crate) fn notify(&self, feature_key: &str, value: Option<&V>) {
        let callbacks: Vec<FeatureUpdatedCallback<V>> = self
            .list
            .lock()
            .expect("thread holding listener lock should not panic")
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback(feature_key, value);
        }
    }
}

type SnapshotSlot<V> = Option<HashMap<String, V>>;

/// Keeps an external store in step with an in-memory one.
///
/// A single task per store applies snapshots in order. It is spawned on the first push, so a
/// store can be built outside a runtime.
pub(crate) struct ExternalMirror<V> {
    external: Arc<dyn ExternalStateStore<V>>,
    latest: watch::Sender<SnapshotSlot<V>>,
    idle: Mutex<Option<watch::Receiver<SnapshotSlot<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> ExternalMirror<V> {
    pub(crate) fn new(external: Arc<dyn ExternalStateStore<V>>) -> Self {
        let (latest, receiver) = watch::channel(None);
        ExternalMirror {
            external,
            latest,
            idle: Mutex::new(Some(receiver)),
        }
    }

    pub(crate) fn external(&self) -> &Arc<dyn ExternalStateStore<V>> {
        &self.external
    }

    /// Queue `snapshot`, replacing any snapshot not yet written. Never blocks.
    ///
    /// Callers push while holding their store lock so snapshots are queued in mutation order.
    pub(crate) fn push(&self, snapshot: HashMap<String, V>) {
        self.latest.send_replace(Some(snapshot));

        let mut idle = self
            .idle
            .lock()
            .expect("thread holding mirror lock should not panic");
        let Some(receiver) = idle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(mirror_latest(Arc::clone(&self.external), receiver));
            }
            Err(_) => {
                log::warn!(target: "featureboard", "no tokio runtime available, external state store not updated");
                *idle = Some(receiver);
            }
        }
    }
}

/// Write each new snapshot to `external` until the owning store is dropped.
async fn mirror_latest<V: Clone + Send + Sync + 'static>(
    external: Arc<dyn ExternalStateStore<V>>,
    mut latest: watch::Receiver<SnapshotSlot<V>>,
) {
    while latest.changed().await.is_ok() {
        let Some(snapshot) = latest.borrow_and_update().clone() else {
            continue;
        };
        if let Err(err) = external.update(snapshot).await {
            log::error!(target: "featureboard", "failed to update external state store: {err}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::Error;

    /// External store backed by a map, recording every update it receives.
    pub(crate) struct MemoryExternalStore<V> {
        pub(crate) initial: Option<HashMap<String, V>>,
        pub(crate) updates: Mutex<Vec<HashMap<String, V>>>,
        first_update_delay: Mutex<Option<Duration>>,
    }

    impl<V> MemoryExternalStore<V> {
        pub(crate) fn new(initial: HashMap<String, V>) -> Self {
            MemoryExternalStore {
                initial: Some(initial),
                updates: Mutex::new(Vec::new()),
                first_update_delay: Mutex::new(None),
            }
        }

        /// A store whose reads always fail.
        pub(crate) fn failing() -> Self {
            MemoryExternalStore {
                initial: None,
                ..MemoryExternalStore::new(HashMap::new())
            }
        }

        /// The first `update` takes `delay` to complete.
        pub(crate) fn with_slow_first_update(self, delay: Duration) -> Self {
            *self.first_update_delay.lock().unwrap() = Some(delay);
            self
        }

        pub(crate) fn last_update(&self) -> Option<HashMap<String, V>>
        where
            V: Clone,
        {
            self.updates.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl<V: Clone + Send + Sync + 'static> ExternalStateStore<V> for MemoryExternalStore<V> {
        async fn all(&self) -> Result<HashMap<String, V>> {
            self.initial
                .clone()
                .ok_or_else(|| Error::ExternalStateStore("unavailable".into()))
        }

        async fn update(&self, snapshot: HashMap<String, V>) -> Result<()> {
            let delay = self.first_update_delay.lock().unwrap().take();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.updates.lock().unwrap().push(snapshot);
            Ok(())
        }
    }
}
