use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use super::{ExternalMirror, ExternalStateStore, FeatureState, Listeners, Subscription};
use crate::{
    fetcher::{CachedResponse, FeatureFetcher, FetchOutcome},
    models::{same_audiences, EffectiveFeatureValue, FeatureValue},
    notifications::{NotificationMessage, SubscriptionMode},
    Error, Result,
};

struct EffectiveState {
    audiences: Vec<String>,
    /// Bumped on every audience change.
    generation: u64,
    values: HashMap<String, FeatureValue>,
}

/// Feature values resolved by the service for a single audience set.
///
/// Absent features are not stored: setting a value to `None` removes the key.
pub struct EffectiveFeatureStore {
    state: RwLock<EffectiveState>,
    listeners: Listeners<FeatureValue>,
    external: Option<ExternalMirror<FeatureValue>>,
    debug: bool,
}

impl EffectiveFeatureStore {
    pub fn new(audiences: Vec<String>, initial_values: Vec<EffectiveFeatureValue>) -> Self {
        let values = initial_values
            .into_iter()
            .map(|value| (value.feature_key, value.value))
            .collect();
        EffectiveFeatureStore {
            state: RwLock::new(EffectiveState {
                audiences,
                generation: 0,
                values,
            }),
            listeners: Listeners::new(),
            external: None,
            debug: false,
        }
    }

    pub fn with_external_state_store(
        mut self,
        external: Arc<dyn ExternalStateStore<FeatureValue>>,
    ) -> Self {
        self.external = Some(ExternalMirror::new(external));
        self
    }

    pub(crate) fn has_external_state_store(&self) -> bool {
        self.external.is_some()
    }

    /// Trace every read and write.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn audiences(&self) -> Vec<String> {
        self.state
            .read()
            .expect("thread holding store lock should not panic")
            .audiences
            .clone()
    }

    /// Switch to a new audience set.
    ///
    /// Every value held for the previous audiences is retracted and listeners are told each key
    /// became unavailable before this returns.
    pub fn set_audiences(&self, audiences: Vec<String>) {
        let previous = {
            let mut state = self
                .state
                .write()
                .expect("thread holding store lock should not panic");
            state.audiences = audiences;
            state.generation += 1;
            let previous = std::mem::take(&mut state.values);
            if !previous.is_empty() {
                self.mirror(&state.values);
            }
            previous
        };

        if self.debug {
            log::trace!(target: "featureboard", "audiences changed, clearing {} values", previous.len());
        }
        for feature_key in previous.keys() {
            self.listeners.notify(feature_key, None);
        }
    }

    /// Apply a fetched response: set every value in `values` and retract the keys it omits, in
    /// one step.
    ///
    /// Returns the retracted keys, or `None` without touching the store if the audiences are no
    /// longer `audiences`. Listeners stop being notified as soon as the audiences change.
    pub fn apply_fetched(
        &self,
        audiences: &[String],
        values: Vec<EffectiveFeatureValue>,
    ) -> Option<Vec<String>> {
        let (generation, removed) = {
            let mut state = self
                .state
                .write()
                .expect("thread holding store lock should not panic");
            if !same_audiences(&state.audiences, audiences) {
                return None;
            }

            let mut removed: HashSet<String> = state.values.keys().cloned().collect();
            for value in &values {
                removed.remove(&value.feature_key);
                state
                    .values
                    .insert(value.feature_key.clone(), value.value.clone());
            }
            for feature_key in &removed {
                state.values.remove(feature_key);
            }
            self.mirror(&state.values);
            (state.generation, removed)
        };

        let mut removed: Vec<String> = removed.into_iter().collect();
        removed.sort();
        let updates = values
            .iter()
            .map(|value| (value.feature_key.as_str(), Some(&value.value)))
            .chain(removed.iter().map(|feature_key| (feature_key.as_str(), None)));
        for (feature_key, value) in updates {
            if self.generation() != generation {
                log::debug!(target: "featureboard", "audiences changed while applying fetched values");
                break;
            }
            if self.debug {
                log::trace!(target: "featureboard", feature_key, value:serde = value; "set");
            }
            self.listeners.notify(feature_key, value);
        }
        Some(removed)
    }

    fn generation(&self) -> u64 {
        self.state
            .read()
            .expect("thread holding store lock should not panic")
            .generation
    }

    /// Snapshot of all present values.
    pub fn all(&self) -> HashMap<String, FeatureValue> {
        self.state
            .read()
            .expect("thread holding store lock should not panic")
            .values
            .clone()
    }

    pub fn get(&self, feature_key: &str) -> Option<FeatureValue> {
        let value = self
            .state
            .read()
            .expect("thread holding store lock should not panic")
            .values
            .get(feature_key)
            .cloned();
        if self.debug {
            log::trace!(target: "featureboard", feature_key, value:serde = value; "get");
        }
        value
    }

    /// Set or retract a value. Listeners are notified on every call, even if the value did not
    /// change.
    pub fn set(&self, feature_key: &str, value: Option<FeatureValue>) {
        {
            let mut state = self
                .state
                .write()
                .expect("thread holding store lock should not panic");
            match &value {
                Some(value) => {
                    state.values.insert(feature_key.to_owned(), value.clone());
                }
                None => {
                    state.values.remove(feature_key);
                }
            }
            self.mirror(&state.values);
        }

        if self.debug {
            log::trace!(target: "featureboard", feature_key, value:serde = value; "set");
        }
        self.listeners.notify(feature_key, value.as_ref());
    }

    pub fn on_feature_updated(
        &self,
        callback: impl Fn(&str, Option<&FeatureValue>) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.add(Arc::new(callback))
    }

    /// Queue `values` for the external store. Called with the write lock held.
    fn mirror(&self, values: &HashMap<String, FeatureValue>) {
        if let Some(external) = &self.external {
            external.push(values.clone());
        }
    }

    /// Replace the contents wholesale, retracting keys missing from `values`.
    fn replace_all(&self, values: impl IntoIterator<Item = (String, FeatureValue)>) {
        let mut removed = self.all();
        for (feature_key, value) in values {
            removed.remove(&feature_key);
            self.set(&feature_key, Some(value));
        }
        for feature_key in removed.keys() {
            self.set(feature_key, None);
        }
    }
}

#[async_trait]
impl FeatureState for EffectiveFeatureStore {
    async fn fetch(
        &self,
        fetcher: &FeatureFetcher,
        cached: Option<CachedResponse>,
    ) -> Result<FetchOutcome> {
        fetcher.fetch_effective_values(self, cached).await
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::EffectiveValues {
            audiences: self.audiences(),
        }
    }

    fn apply_notification(&self, message: NotificationMessage) {
        match message {
            NotificationMessage::StateOfTheWorldEffectiveValues { features } => {
                self.replace_all(
                    features
                        .into_iter()
                        .map(|feature| (feature.feature_key, feature.value)),
                );
            }
            NotificationMessage::FeatureValueUpdated(feature)
            | NotificationMessage::FeatureValueAvailable(feature) => {
                self.set(&feature.feature_key, Some(feature.value));
            }
            NotificationMessage::FeatureUnavailable { feature_key } => {
                self.set(&feature_key, None);
            }
            other => {
                log::debug!(target: "featureboard", "ignoring notification for all-values subscription: {other:?}");
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.state
            .read()
            .expect("thread holding store lock should not panic")
            .values
            .is_empty()
    }

    async fn initialise_from_external_store(&self) -> Result<bool> {
        let Some(external) = &self.external else {
            return Ok(false);
        };
        let values = external
            .external()
            .all()
            .await
            .map_err(|err| Error::ExternalStateStore(err.to_string()))?;
        log::debug!(target: "featureboard", count = values.len(); "initialising from external state store");
        self.replace_all(values);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::testing::MemoryExternalStore;

    fn store() -> EffectiveFeatureStore {
        EffectiveFeatureStore::new(
            vec!["a".into()],
            vec![EffectiveFeatureValue {
                feature_key: "x".into(),
                value: true.into(),
            }],
        )
    }

    fn record(store: &EffectiveFeatureStore) -> (Arc<Mutex<Vec<(String, Option<FeatureValue>)>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let events = Arc::clone(&events);
            store.on_feature_updated(move |key, value| {
                events.lock().unwrap().push((key.to_owned(), value.cloned()));
            })
        };
        (events, subscription)
    }

    #[test]
    fn set_notifies_even_when_unchanged() {
        let store = store();
        let (events, _subscription) = record(&store);

        store.set("x", Some(true.into()));
        store.set("x", Some(true.into()));

        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn listener_can_read_store_back() {
        let store = Arc::new(store());
        let seen = Arc::new(Mutex::new(None));
        let _subscription = {
            let reader = Arc::clone(&store);
            let seen = Arc::clone(&seen);
            store.on_feature_updated(move |key, _| {
                *seen.lock().unwrap() = reader.get(key);
            })
        };

        store.set("x", Some(false.into()));
        assert_eq!(*seen.lock().unwrap(), Some(FeatureValue::Boolean(false)));
    }

    #[test]
    fn switching_audiences_retracts_every_value() {
        let store = store();
        store.set("y", Some(1.into()));
        let (events, _subscription) = record(&store);

        store.set_audiences(vec!["b".into()]);

        assert!(store.all().is_empty());
        assert_eq!(store.audiences(), vec!["b".to_owned()]);
        let mut events = events.lock().unwrap().clone();
        events.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(events, vec![("x".to_owned(), None), ("y".to_owned(), None)]);
    }

    #[test]
    fn applies_push_notifications() {
        let store = store();
        store.apply_notification(NotificationMessage::FeatureValueAvailable(
            EffectiveFeatureValue {
                feature_key: "y".into(),
                value: "on".into(),
            },
        ));
        store.apply_notification(NotificationMessage::FeatureUnavailable {
            feature_key: "x".into(),
        });

        assert_eq!(store.get("x"), None);
        assert_eq!(store.get("y"), Some(FeatureValue::from("on")));
    }

    #[test]
    fn state_of_the_world_replaces_contents() {
        let store = store();
        store.apply_notification(NotificationMessage::StateOfTheWorldEffectiveValues {
            features: vec![EffectiveFeatureValue {
                feature_key: "z".into(),
                value: 2.into(),
            }],
        });

        assert_eq!(store.all(), HashMap::from([("z".to_owned(), 2.into())]));
    }

    #[tokio::test]
    async fn mirrors_mutations_and_seeds_from_external_store() {
        let external = Arc::new(MemoryExternalStore::new(HashMap::from([(
            "seeded".to_owned(),
            FeatureValue::from("yes"),
        )])));
        let store = EffectiveFeatureStore::new(vec![], vec![])
            .with_external_state_store(external.clone());

        assert!(store.initialise_from_external_store().await.unwrap());
        assert_eq!(store.get("seeded"), Some(FeatureValue::from("yes")));

        store.set("other", Some(1.into()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(external
            .last_update()
            .is_some_and(|snapshot| snapshot.contains_key("other")));
    }

    fn fetched(values: &[(&str, &str)]) -> Vec<EffectiveFeatureValue> {
        values
            .iter()
            .map(|(feature_key, value)| EffectiveFeatureValue {
                feature_key: (*feature_key).into(),
                value: (*value).into(),
            })
            .collect()
    }

    #[test]
    fn apply_fetched_sets_values_and_retracts_the_rest() {
        let store = store();
        store.set("y", Some(1.into()));
        let (events, _subscription) = record(&store);

        let removed = store.apply_fetched(&["a".into()], fetched(&[("y", "two"), ("z", "three")]));

        assert_eq!(removed, Some(vec!["x".to_owned()]));
        assert_eq!(store.get("x"), None);
        assert_eq!(store.get("z"), Some(FeatureValue::from("three")));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ("y".to_owned(), Some(FeatureValue::from("two"))),
                ("z".to_owned(), Some(FeatureValue::from("three"))),
                ("x".to_owned(), None),
            ]
        );
    }

    #[test]
    fn apply_fetched_for_other_audiences_is_ignored() {
        let store = store();
        let (events, _subscription) = record(&store);

        assert_eq!(store.apply_fetched(&["b".into()], fetched(&[("x", "stale")])), None);
        assert_eq!(store.get("x"), Some(FeatureValue::Boolean(true)));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn audience_change_from_a_listener_stops_the_apply() {
        let store = Arc::new(EffectiveFeatureStore::new(vec!["old".into()], vec![]));
        let (events, _recorder) = record(&store);
        let _switcher = {
            let weak = Arc::downgrade(&store);
            store.on_feature_updated(move |key, value| {
                if let (Some(store), "a", Some(_)) = (weak.upgrade(), key, value) {
                    store.set_audiences(vec!["new".into()]);
                }
            })
        };

        store.apply_fetched(&["old".into()], fetched(&[("a", "old-a"), ("b", "old-b")]));

        assert_eq!(store.audiences(), vec!["new".to_owned()]);
        assert_eq!(store.get("b"), None);
        assert!(store.all().is_empty());
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|(key, value)| key == "b" && value.is_some()));
    }

    #[tokio::test]
    async fn failing_external_store_is_reported() {
        let store = EffectiveFeatureStore::new(vec![], vec![])
            .with_external_state_store(Arc::new(MemoryExternalStore::failing()));

        assert!(matches!(
            store.initialise_from_external_store().await,
            Err(Error::ExternalStateStore(_))
        ));
        assert!(!EffectiveFeatureStore::new(vec![], vec![])
            .initialise_from_external_store()
            .await
            .unwrap());
    }
}
