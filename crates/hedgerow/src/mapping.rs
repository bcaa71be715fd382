// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-request hedging config resolution.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hedgerow_transport::{ClientRequestContext, Result};

use crate::config::HedgingConfig;

type KeyFactory<Req> = Arc<dyn Fn(&ClientRequestContext, &Req) -> String + Send + Sync>;
type ConfigFactory<Req, O> =
    Arc<dyn Fn(&ClientRequestContext, &Req) -> Result<HedgingConfig<O>> + Send + Sync>;

enum MappingKind<Req, O> {
    Singleton(HedgingConfig<O>),
    Keyed {
        key_factory: KeyFactory<Req>,
        config_factory: ConfigFactory<Req, O>,
        mapping: DashMap<String, HedgingConfig<O>>,
    },
}

/// Resolves the [`HedgingConfig`] to apply to one request.
///
/// The keyed flavor derives a string key per request and gets-or-creates the
/// config for that key atomically; the factory runs at most once per key. A
/// failing factory propagates its error, which the engine surfaces as the
/// outer failure, and nothing is cached for that key.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use hedgerow::{HedgingConfig, HedgingConfigMapping, HedgingRule};
/// use hedgerow_transport::{HttpRequest, HttpResponse};
///
/// // One hedging budget per request path.
/// let mapping: HedgingConfigMapping<HttpRequest, HttpResponse> =
///     HedgingConfigMapping::<HttpRequest, HttpResponse>::by_key(
///         |_, req| req.headers().path().to_owned(),
///         |_, _| {
///             Ok(HedgingConfig::builder(
///                 HedgingRule::on_unprocessed(Duration::from_millis(50)),
///                 Duration::from_millis(50),
///             )
///             .build())
///         },
///     );
/// # let _ = mapping;
/// ```
pub struct HedgingConfigMapping<Req, O> {
    kind: MappingKind<Req, O>,
}

impl<Req, O> HedgingConfigMapping<Req, O> {
    /// Returns a mapping that resolves every request to the same config.
    #[must_use]
    pub fn of(config: HedgingConfig<O>) -> Self {
        Self {
            kind: MappingKind::Singleton(config),
        }
    }

    /// Returns a keyed mapping.
    ///
    /// `key_factory` derives the cache key for a request; `config_factory`
    /// builds the config for a key's first request.
    #[must_use]
    pub fn by_key(
        key_factory: impl Fn(&ClientRequestContext, &Req) -> String + Send + Sync + 'static,
        config_factory: impl Fn(&ClientRequestContext, &Req) -> Result<HedgingConfig<O>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            kind: MappingKind::Keyed {
                key_factory: Arc::new(key_factory),
                config_factory: Arc::new(config_factory),
                mapping: DashMap::new(),
            },
        }
    }

    /// Resolves the config for the given request.
    pub fn get(&self, ctx: &ClientRequestContext, req: &Req) -> Result<HedgingConfig<O>> {
        match &self.kind {
            MappingKind::Singleton(config) => Ok(config.clone()),
            MappingKind::Keyed {
                key_factory,
                config_factory,
                mapping,
            } => {
                let key = key_factory(ctx, req);
                match mapping.entry(key) {
                    Entry::Occupied(entry) => Ok(entry.get().clone()),
                    Entry::Vacant(entry) => {
                        let config = config_factory(ctx, req)?;
                        entry.insert(config.clone());
                        Ok(config)
                    }
                }
            }
        }
    }
}

impl<Req, O> std::fmt::Debug for HedgingConfigMapping<Req, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            MappingKind::Singleton(_) => "singleton",
            MappingKind::Keyed { .. } => "keyed",
        };
        f.debug_struct("HedgingConfigMapping")
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use hedgerow_transport::{Error, HttpRequest, HttpResponse};
    use http::Method;

    use super::*;
    use crate::rule::HedgingRule;

    fn config() -> HedgingConfig<HttpResponse> {
        HedgingConfig::builder(
            HedgingRule::on_unprocessed(Duration::from_millis(50)),
            Duration::from_millis(50),
        )
        .build()
    }

    fn ctx() -> ClientRequestContext {
        ClientRequestContext::of(HttpRequest::of(Method::GET, "/a"))
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(
            HedgingConfigMapping<HttpRequest, HttpResponse>: Send, Sync
        );
    }

    #[tokio::test]
    async fn singleton_resolves_every_request() {
        let mapping = HedgingConfigMapping::of(config().to_builder().max_total_attempts(2).build());
        let resolved = mapping
            .get(&ctx(), &HttpRequest::of(Method::GET, "/x"))
            .expect("resolved");
        assert_eq!(resolved.max_total_attempts(), 2);
    }

    #[tokio::test]
    async fn keyed_factory_runs_once_per_key() {
        let built = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&built);
        let mapping: HedgingConfigMapping<HttpRequest, HttpResponse> =
            HedgingConfigMapping::<HttpRequest, HttpResponse>::by_key(
                |_, req| req.headers().path().to_owned(),
                move |_, _| {
                    observed.fetch_add(1, Ordering::SeqCst);
                    Ok(config())
                },
            );

        let context = ctx();
        let _ = mapping.get(&context, &HttpRequest::of(Method::GET, "/a"));
        let _ = mapping.get(&context, &HttpRequest::of(Method::GET, "/a"));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let _ = mapping.get(&context, &HttpRequest::of(Method::GET, "/b"));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn factory_errors_propagate_and_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&calls);
        let mapping: HedgingConfigMapping<HttpRequest, HttpResponse> =
            HedgingConfigMapping::by_key(
                |_, _| "shared".to_owned(),
                move |_, _| {
                    if observed.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::transport("config store unavailable"))
                    } else {
                        Ok(config())
                    }
                },
            );

        let context = ctx();
        let req = HttpRequest::of(Method::GET, "/a");
        assert!(mapping.get(&context, &req).is_err());
        assert!(mapping.get(&context, &req).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
