//! Per-request orchestration for `GET /stats`.
//!
//! Admission, cache lookup, collection on a miss, cache population,
//! projection, serialization, optional gzip and header stamping all happen in
//! [`ResponsePipeline::handle`]. Locks inside the limiter and cache are only
//! held for their own bookkeeping, never across collection.

use axum::body::Body;
use axum::http::header::{
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, ETAG, RETRY_AFTER, VARY,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cache::{SYSTEM_STATS_KEY, StatCache};
use crate::collectors::{CollectorSet, SampleMode};
use crate::compression::gzip;
use crate::config::GatewayConfig;
use crate::metrics::{
    CACHE_HITS, CACHE_MISSES, CACHE_SIZE, COLLECTION_LATENCY, COLLECTIONS, RATE_LIMITED,
    REQUEST_LATENCY, REQUEST_TOTAL, TRACKED_CLIENTS,
};
use crate::models::{FailureBody, RateLimitBody};
use crate::rate_limit::{Admission, RateLimiter};
use crate::snapshot::{StatField, StatsSnapshot, StatsView};

pub const GENERATED_AT: HeaderName = HeaderName::from_static("x-generated-at");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// One `/stats` call, already decoded from HTTP.
#[derive(Debug, Clone)]
pub struct StatsRequest {
    pub client_id: String,
    pub block: bool,
    pub use_cache: bool,
    pub fields: Option<Vec<StatField>>,
    pub accepts_gzip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Cache,
    Collected,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("all {attempted} collectors failed: {details}")]
    TotalCollectionFailure { attempted: usize, details: String },

    #[error("collection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("could not serialize stats: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A fully rendered response, ready for header stamping.
#[derive(Debug)]
pub struct StatsReply {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub gzipped: bool,
    pub source: Option<ReplySource>,
    pub etag: Option<String>,
    pub retry_after: Option<u64>,
    pub cache_ttl: Duration,
    pub vary_encoding: bool,
    pub generated_at: DateTime<Utc>,
}

pub struct ResponsePipeline {
    limiter: Arc<RateLimiter>,
    cache: Arc<StatCache>,
    collectors: Arc<CollectorSet>,
    compression_enabled: bool,
    min_size_to_compress: usize,
}

impl ResponsePipeline {
    pub fn new(
        limiter: Arc<RateLimiter>,
        cache: Arc<StatCache>,
        collectors: Arc<CollectorSet>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            limiter,
            cache,
            collectors,
            compression_enabled: config.compression_enabled,
            min_size_to_compress: config.min_size_to_compress,
        }
    }

    /// Build the limiter and cache from `config` around the given collectors.
    pub fn from_config(config: &GatewayConfig, collectors: CollectorSet) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_enabled,
            config.max_requests_per_window,
            config.window,
        ));
        let cache = Arc::new(StatCache::new(config.cache_ttl));
        Self::new(limiter, cache, Arc::new(collectors), config)
    }

    pub fn cache(&self) -> &Arc<StatCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn handle(&self, req: StatsRequest) -> StatsReply {
        REQUEST_TOTAL.inc();
        let timer = REQUEST_LATENCY.start_timer();

        let reply = match self.limiter.admit(&req.client_id) {
            Admission::Rejected { retry_after } => {
                RATE_LIMITED.inc();
                debug!(client = %req.client_id, ?retry_after, "rate limited");
                self.rate_limited(retry_after)
            }
            Admission::Accepted => {
                let rendered = match self.resolve(&req).await {
                    Ok((view, source)) => self.render(&view, source, req.accepts_gzip),
                    Err(e) => Err(e),
                };
                rendered.unwrap_or_else(|e| {
                    error!(error = %e, "stats request failed");
                    self.failure(&e)
                })
            }
        };

        TRACKED_CLIENTS.set(self.limiter.tracked_clients() as f64);
        timer.observe_duration();
        reply
    }

    async fn resolve(&self, req: &StatsRequest) -> Result<(StatsView, ReplySource), PipelineError> {
        let fields = req.fields.as_deref();

        if req.use_cache {
            if let Some(view) = self.cache.get(SYSTEM_STATS_KEY, fields) {
                CACHE_HITS.inc();
                debug!("cache HIT");
                return Ok((view, ReplySource::Cache));
            }
            CACHE_MISSES.inc();
            debug!("cache MISS - collecting");
        }

        let snapshot = self.refresh(SampleMode::from_block(req.block)).await?;
        Ok((StatsView::of(snapshot, fields), ReplySource::Collected))
    }

    /// Run every collector and store the full snapshot.
    ///
    /// The work runs on its own task: if the caller goes away mid-collection
    /// the result still lands in the cache. Concurrent callers each collect.
    pub async fn refresh(&self, mode: SampleMode) -> Result<Arc<StatsSnapshot>, PipelineError> {
        let collectors = Arc::clone(&self.collectors);
        let cache = Arc::clone(&self.cache);

        tokio::spawn(async move {
            COLLECTIONS.inc();
            let timer = COLLECTION_LATENCY.start_timer();
            let collection = collectors.collect_all(mode).await;
            timer.observe_duration();

            if collection.is_total_failure() {
                return Err(PipelineError::TotalCollectionFailure {
                    attempted: collection.attempted,
                    details: collection.failure_details(),
                });
            }

            let snapshot = Arc::new(collection.snapshot);
            cache.set(SYSTEM_STATS_KEY, Arc::clone(&snapshot));
            CACHE_SIZE.set(cache.len() as f64);
            Ok(snapshot)
        })
        .await?
    }

    fn render(
        &self,
        view: &StatsView,
        source: ReplySource,
        accepts_gzip: bool,
    ) -> Result<StatsReply, PipelineError> {
        let json = serde_json::to_vec(view)?;
        let etag = format!("\"{:x}\"", Sha256::digest(&json));
        let (body, gzipped) = self.maybe_compress(json, accepts_gzip);

        Ok(StatsReply {
            status: StatusCode::OK,
            body,
            gzipped,
            source: Some(source),
            etag: Some(etag),
            retry_after: None,
            cache_ttl: self.cache.ttl(),
            vary_encoding: self.compression_enabled,
            generated_at: Utc::now(),
        })
    }

    fn maybe_compress(&self, payload: Vec<u8>, accepts_gzip: bool) -> (Vec<u8>, bool) {
        if !self.compression_enabled
            || !accepts_gzip
            || payload.len() < self.min_size_to_compress
        {
            return (payload, false);
        }

        match gzip(&payload) {
            Ok(compressed) => (compressed, true),
            Err(e) => {
                warn!(error = %e, "gzip failed, sending uncompressed");
                (payload, false)
            }
        }
    }

    fn rate_limited(&self, retry_after: Duration) -> StatsReply {
        let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
        let body = RateLimitBody {
            error: "Rate limit exceeded".to_string(),
            message: format!("Too many requests. Try again in {secs} seconds."),
        };
        self.error_reply(StatusCode::TOO_MANY_REQUESTS, &body, Some(secs))
    }

    fn failure(&self, err: &PipelineError) -> StatsReply {
        let body = FailureBody {
            error: "Failed to collect system statistics".to_string(),
            details: err.to_string(),
        };
        self.error_reply(StatusCode::INTERNAL_SERVER_ERROR, &body, None)
    }

    fn error_reply<T: serde::Serialize>(
        &self,
        status: StatusCode,
        body: &T,
        retry_after: Option<u64>,
    ) -> StatsReply {
        StatsReply {
            status,
            body: serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec()),
            gzipped: false,
            source: None,
            etag: None,
            retry_after,
            cache_ttl: self.cache.ttl(),
            vary_encoding: false,
            generated_at: Utc::now(),
        }
    }
}

impl IntoResponse for StatsReply {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let cache_control = if self.status == StatusCode::OK {
            format!("public, max-age={}", self.cache_ttl.as_secs())
        } else {
            "no-store".to_string()
        };
        if let Ok(v) = HeaderValue::from_str(&cache_control) {
            headers.insert(CACHE_CONTROL, v);
        }

        let stamp = self.generated_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(v) = HeaderValue::from_str(&stamp) {
            headers.insert(GENERATED_AT, v);
        }

        if self.gzipped {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if self.vary_encoding {
            headers.insert(VARY, HeaderValue::from_static("accept-encoding"));
        }
        if let Some(etag) = self.etag.and_then(|e| HeaderValue::from_str(&e).ok()) {
            headers.insert(ETAG, etag);
        }
        match self.source {
            Some(ReplySource::Cache) => {
                headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
            }
            Some(ReplySource::Collected) => {
                headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
            }
            None => {}
        }
        if let Some(secs) = self.retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }

        (self.status, headers, Body::from(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{CollectorError, MetricCollector};
    use crate::snapshot::FieldValue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl MetricCollector for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn fields(&self) -> &'static [StatField] {
            &[StatField::Uptime]
        }
        async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(vec![FieldValue::Uptime(n as u64)])
        }
    }

    // Counts calls and takes a second to answer
    struct Slow(Arc<AtomicUsize>);

    #[async_trait]
    impl MetricCollector for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn fields(&self) -> &'static [StatField] {
            &[StatField::Uptime]
        }
        async fn collect(&self, _mode: SampleMode) -> Result<Vec<FieldValue>, CollectorError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(vec![FieldValue::Uptime(n as u64)])
        }
    }

    fn slow_pipeline() -> (Arc<ResponsePipeline>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let collectors = CollectorSet::new(
            vec![Arc::new(Slow(Arc::clone(&calls)))],
            Duration::from_secs(5),
        );
        let pipeline = ResponsePipeline::from_config(&GatewayConfig::default(), collectors);
        (Arc::new(pipeline), calls)
    }

    fn pipeline(config: GatewayConfig) -> (ResponsePipeline, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let collectors = CollectorSet::new(
            vec![Arc::new(Counting(Arc::clone(&calls)))],
            Duration::from_secs(5),
        );
        (ResponsePipeline::from_config(&config, collectors), calls)
    }

    fn request(client: &str) -> StatsRequest {
        StatsRequest {
            client_id: client.to_string(),
            block: false,
            use_cache: true,
            fields: None,
            accepts_gzip: false,
        }
    }

    #[tokio::test]
    async fn rejected_request_touches_neither_cache_nor_collectors() {
        let (pipeline, calls) = pipeline(GatewayConfig {
            max_requests_per_window: 0,
            ..GatewayConfig::default()
        });

        let reply = pipeline.handle(request("10.0.0.9")).await;

        assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(reply.retry_after, Some(60));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(pipeline.cache().is_empty());
        assert_eq!(pipeline.limiter().window_len("10.0.0.9"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_request_still_fills_the_cache() {
        let (pipeline, calls) = slow_pipeline();

        let in_flight = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.handle(request("a")).await }
        });
        // let the request reach the collector, then drop it like a disconnect
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        in_flight.abort();
        assert!(in_flight.await.unwrap_err().is_cancelled());
        assert!(pipeline.cache().is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(pipeline.cache().get(SYSTEM_STATS_KEY, None).is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_each_collect() {
        let (pipeline, calls) = slow_pipeline();

        let (first, second) = tokio::join!(
            pipeline.handle(request("a")),
            pipeline.handle(request("b")),
        );

        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(first.source, Some(ReplySource::Collected));
        assert_eq!(second.source, Some(ReplySource::Collected));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn projected_miss_still_caches_the_full_snapshot() {
        let (pipeline, calls) = pipeline(GatewayConfig::default());
        let mut req = request("a");
        req.fields = Some(vec![StatField::Timestamp]);

        let reply = pipeline.handle(req).await;
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body.as_object().unwrap().len(), 1);
        assert_eq!(reply.source, Some(ReplySource::Collected));

        let full = pipeline.cache().get(SYSTEM_STATS_KEY, None);
        assert!(matches!(full, Some(StatsView::Full(s)) if s.uptime.is_present()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_bypass_always_collects() {
        let (pipeline, calls) = pipeline(GatewayConfig::default());
        let mut req = request("a");
        req.use_cache = false;

        pipeline.handle(req.clone()).await;
        pipeline.handle(req).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn payload_exactly_at_threshold_is_compressed() {
        let (pipeline, _) = pipeline(GatewayConfig {
            min_size_to_compress: 256,
            ..GatewayConfig::default()
        });

        let (_, gzipped) = pipeline.maybe_compress(vec![b'x'; 256], true);
        assert!(gzipped);
        let (body, gzipped) = pipeline.maybe_compress(vec![b'x'; 255], true);
        assert!(!gzipped);
        assert_eq!(body.len(), 255);
        let (_, gzipped) = pipeline.maybe_compress(vec![b'x'; 256], false);
        assert!(!gzipped);
    }

    #[tokio::test]
    async fn small_payloads_are_never_compressed() {
        let (pipeline, _) = pipeline(GatewayConfig {
            min_size_to_compress: 1 << 20,
            ..GatewayConfig::default()
        });
        let mut req = request("a");
        req.accepts_gzip = true;

        let reply = pipeline.handle(req).await;
        assert!(!reply.gzipped);
        assert!(serde_json::from_slice::<serde_json::Value>(&reply.body).is_ok());
    }
}
