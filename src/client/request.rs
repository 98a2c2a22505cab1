use std::{future::IntoFuture, sync::Arc};

use futures::{future::BoxFuture, FutureExt};

use super::FeatureBoardClient;
use crate::{
    models::{EffectiveFeatureValue, EffectiveValues, FeatureValue},
    store::{AllFeatureStore, FeatureSnapshot, Subscription},
    Error, Result,
};

/// Values for one request, resolved locally against the request's audiences.
///
/// Reads a fixed snapshot of the store, so a single request sees consistent values even while
/// updates arrive.
#[derive(Debug, Clone)]
pub struct RequestClient {
    snapshot: FeatureSnapshot,
    audience_keys: Vec<String>,
}

impl RequestClient {
    pub(crate) fn new(snapshot: FeatureSnapshot, audience_keys: Vec<String>) -> Self {
        RequestClient {
            snapshot,
            audience_keys,
        }
    }

    pub fn audience_keys(&self) -> &[String] {
        &self.audience_keys
    }

    fn resolve(&self, feature_key: &str) -> Option<&FeatureValue> {
        self.snapshot
            .get(feature_key)
            .map(|configuration| configuration.resolve(&self.audience_keys))
    }
}

impl FeatureBoardClient for RequestClient {
    fn get_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
    ) -> FeatureValue {
        match self.resolve(feature_key) {
            Some(value) => value.clone(),
            None => {
                log::debug!(target: "featureboard", feature_key; "feature not found, using default value");
                default_value.into()
            }
        }
    }

    /// Values never change for a request, so `on_value` is called exactly once.
    fn subscribe_to_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
        on_value: impl Fn(FeatureValue) + Send + Sync + 'static,
    ) -> Subscription {
        on_value(self.get_feature_value(feature_key, default_value));
        Subscription::noop()
    }

    fn get_effective_values(&self) -> EffectiveValues {
        let mut effective_values: Vec<EffectiveFeatureValue> = self
            .snapshot
            .iter()
            .map(|(feature_key, configuration)| EffectiveFeatureValue {
                feature_key: feature_key.clone(),
                value: configuration.resolve(&self.audience_keys).clone(),
            })
            .collect();
        effective_values.sort_by(|a, b| a.feature_key.cmp(&b.feature_key));
        EffectiveValues {
            audiences: self.audience_keys.clone(),
            effective_values,
        }
    }
}

enum PendingState {
    Ready(RequestClient),
    Refreshing {
        refresh: BoxFuture<'static, Result<()>>,
        store: Arc<AllFeatureStore>,
        audience_keys: Vec<String>,
    },
}

/// A [`RequestClient`] that may still be waiting on a refresh.
///
/// Await it to get the client. With update strategies other than on-request it is ready
/// immediately and can be read synchronously through [`PendingRequest::client`].
pub struct PendingRequest {
    state: PendingState,
}

impl PendingRequest {
    pub(crate) fn ready(client: RequestClient) -> Self {
        PendingRequest {
            state: PendingState::Ready(client),
        }
    }

    pub(crate) fn refreshing(
        refresh: BoxFuture<'static, Result<()>>,
        store: Arc<AllFeatureStore>,
        audience_keys: Vec<String>,
    ) -> Self {
        PendingRequest {
            state: PendingState::Refreshing {
                refresh,
                store,
                audience_keys,
            },
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, PendingState::Ready(_))
    }

    /// The client, if no refresh is outstanding.
    ///
    /// # Errors
    ///
    /// [`Error::RequestNotAwaited`] while a refresh is outstanding.
    pub fn client(&self) -> Result<&RequestClient> {
        match &self.state {
            PendingState::Ready(client) => Ok(client),
            PendingState::Refreshing { .. } => Err(Error::RequestNotAwaited),
        }
    }

    pub fn get_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
    ) -> Result<FeatureValue> {
        Ok(self.client()?.get_feature_value(feature_key, default_value))
    }

    pub fn get_effective_values(&self) -> Result<EffectiveValues> {
        Ok(self.client()?.get_effective_values())
    }
}

impl IntoFuture for PendingRequest {
    type Output = RequestClient;
    type IntoFuture = BoxFuture<'static, RequestClient>;

    /// Resolves once the refresh settles. A failed refresh is logged and the request is served
    /// from whatever the store holds.
    fn into_future(self) -> Self::IntoFuture {
        match self.state {
            PendingState::Ready(client) => futures::future::ready(client).boxed(),
            PendingState::Refreshing {
                refresh,
                store,
                audience_keys,
            } => async move {
                if let Err(err) = refresh.await {
                    log::warn!(target: "featureboard", "failed to refresh features before request: {err}");
                }
                store.request(audience_keys)
            }
            .boxed(),
        }
    }
}
