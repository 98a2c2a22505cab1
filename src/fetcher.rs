//! An HTTP client that fetches feature state from the service using conditional requests.
use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{
    header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER},
    StatusCode, Url,
};
use serde::de::DeserializeOwned;

use crate::{
    models::{EffectiveFeatureValue, FeatureConfiguration},
    store::{AllFeatureStore, EffectiveFeatureStore},
    telemetry::{add_event, traced, Telemetry},
    Error, Result,
};

const ENVIRONMENT_KEY_HEADER: &str = "x-environment-key";
const SDK_VERSION_HEADER: &str = "x-sdk-version";
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Retry-after used when a 429 response carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER: TimeDelta = TimeDelta::seconds(60);

/// Opaque validator returned by the service. Only ever compared for presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheToken {
    ETag(String),
    LastModified(String),
}

/// A cache token along with the exact URL (endpoint + audience set) it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub url: Url,
    pub token: CacheToken,
}

/// What a fetch did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A `200` response was applied. Holds the token to send with the next request.
    Updated(Option<CachedResponse>),
    /// `304`: the store is already current.
    NotModified,
    /// The store's audiences changed while the request was in flight, so the response was
    /// dropped.
    Discarded,
}

enum FetchResponse<T> {
    NotModified,
    Modified {
        body: T,
        token: Option<CacheToken>,
    },
}

/// A client that fetches feature values from the FeatureBoard HTTP API.
///
/// The fetcher holds a connection pool internally, so it's best to create one and reuse it.
pub struct FeatureFetcher {
    client: reqwest::Client,
    http_endpoint: String,
    environment_api_key: String,
    telemetry: Telemetry,
}

impl FeatureFetcher {
    pub fn new(http_endpoint: impl Into<String>, environment_api_key: impl Into<String>) -> Self {
        FeatureFetcher {
            client: reqwest::Client::new(),
            http_endpoint: http_endpoint.into(),
            environment_api_key: environment_api_key.into(),
            telemetry: Telemetry::default(),
        }
    }

    /// Wrap every fetch in a `tracing` span. On by default.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.telemetry = Telemetry::new(enabled);
        self
    }

    pub(crate) fn telemetry(&self) -> Telemetry {
        self.telemetry
    }

    fn endpoint(&self, name: &str) -> String {
        if self.http_endpoint.ends_with('/') {
            format!("{}{}", self.http_endpoint, name)
        } else {
            format!("{}/{}", self.http_endpoint, name)
        }
    }

    /// `{base}/effective?audiences=a,b`
    pub fn effective_endpoint(&self, audiences: &[String]) -> Result<Url> {
        Url::parse_with_params(
            &self.endpoint("effective"),
            &[("audiences", audiences.join(","))],
        )
        .map_err(Error::InvalidBaseUrl)
    }

    /// `{base}/all`
    pub fn all_endpoint(&self) -> Result<Url> {
        Url::parse(&self.endpoint("all")).map_err(Error::InvalidBaseUrl)
    }

    /// Fetch effective values for the store's current audiences and apply them.
    ///
    /// A 304 response leaves the store untouched. If the store's audiences change while the
    /// request is in flight, or while the response is being applied, the rest of the response is
    /// dropped.
    pub async fn fetch_effective_values(
        &self,
        store: &EffectiveFeatureStore,
        cached: Option<CachedResponse>,
    ) -> Result<FetchOutcome> {
        let audiences = store.audiences();
        let span = self.telemetry.span(|| {
            tracing::info_span!("fbsdk-fetch-effective-values", audiences = ?audiences)
        });

        traced(span.clone(), async {
            let url = self.effective_endpoint(&audiences)?;
            let (values, token) = match self
                .get::<Vec<EffectiveFeatureValue>>(&url, cached.as_ref())
                .await?
            {
                FetchResponse::NotModified => return Ok(FetchOutcome::NotModified),
                FetchResponse::Modified { body, token } => (body, token),
            };

            let Some(removed) = store.apply_fetched(&audiences, values) else {
                log::debug!(target: "featureboard",
                    audiences:serde = audiences,
                    current_audiences:serde = store.audiences();
                    "audiences changed while fetching, ignoring response");
                add_event(&span, "audiences changed while fetching, ignoring response");
                return Ok(FetchOutcome::Discarded);
            };
            log::debug!(target: "featureboard",
                audiences:serde = audiences,
                unavailable_features:serde = removed;
                "feature updates received");
            add_event(&span, "feature updates received");

            Ok(FetchOutcome::Updated(
                token.map(|token| CachedResponse { url, token }),
            ))
        })
        .await
    }

    /// Fetch raw configuration for every feature and apply it, writing only configurations
    /// that changed and retracting features the service no longer returns.
    pub async fn fetch_all_values(
        &self,
        store: &AllFeatureStore,
        cached: Option<CachedResponse>,
    ) -> Result<FetchOutcome> {
        let span = self
            .telemetry
            .span(|| tracing::info_span!("fbsdk-fetch-all-values"));

        traced(span, async {
            let url = self.all_endpoint()?;
            let (configurations, token) = match self
                .get::<Vec<FeatureConfiguration>>(&url, cached.as_ref())
                .await?
            {
                FetchResponse::NotModified => return Ok(FetchOutcome::NotModified),
                FetchResponse::Modified { body, token } => (body, token),
            };

            let existing = store.all();
            let mut removed: HashSet<&String> = existing.keys().collect();
            for configuration in configurations {
                removed.remove(&configuration.feature_key);
                let unchanged = existing
                    .get(&configuration.feature_key)
                    .is_some_and(|current| **current == configuration);
                if !unchanged {
                    let feature_key = configuration.feature_key.clone();
                    store.set(&feature_key, Some(configuration));
                }
            }
            for feature_key in removed {
                store.set(feature_key, None);
            }

            Ok(FetchOutcome::Updated(
                token.map(|token| CachedResponse { url, token }),
            ))
        })
        .await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &Url,
        cached: Option<&CachedResponse>,
    ) -> Result<FetchResponse<T>> {
        let mut request = self
            .client
            .get(url.clone())
            .header(ENVIRONMENT_KEY_HEADER, &self.environment_api_key)
            .header(SDK_VERSION_HEADER, SDK_VERSION);

        // A token is only valid for the endpoint and audience set it was issued for.
        if let Some(cached) = cached.filter(|cached| &cached.url == url) {
            request = match &cached.token {
                CacheToken::ETag(etag) => request.header(IF_NONE_MATCH, etag),
                CacheToken::LastModified(date) => request.header(IF_MODIFIED_SINCE, date),
            };
        }

        log::debug!(target: "featureboard", url = url.as_str(); "fetching updates");
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                log::debug!(target: "featureboard", "no changes");
                Ok(FetchResponse::NotModified)
            }
            StatusCode::OK => {
                let token = cache_token(response.headers());
                let bytes = response.bytes().await?;
                let body = serde_json::from_slice(&bytes)?;
                Ok(FetchResponse::Modified { body, token })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = retry_after(response.headers(), Utc::now());
                log::warn!(target: "featureboard", "rate limited by FeatureBoard until {retry_after}");
                Err(Error::TooManyRequests { retry_after })
            }
            status => {
                log::warn!(target: "featureboard", "received unexpected response while fetching updates: {status}");
                Err(Error::UnexpectedStatus {
                    status: status.as_u16(),
                    status_text: status.canonical_reason().unwrap_or_default().to_owned(),
                })
            }
        }
    }
}

fn cache_token(headers: &HeaderMap) -> Option<CacheToken> {
    let header = |name| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    header(ETAG)
        .map(CacheToken::ETag)
        .or_else(|| header(LAST_MODIFIED).map(CacheToken::LastModified))
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(value) = headers.get(RETRY_AFTER).and_then(|value| value.to_str().ok()) else {
        return now + DEFAULT_RETRY_AFTER;
    };
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return now + TimeDelta::seconds(seconds.max(0));
    }
    match DateTime::parse_from_rfc2822(value) {
        Ok(date) => date.with_timezone(&Utc),
        Err(_) => now + DEFAULT_RETRY_AFTER,
    }
}
