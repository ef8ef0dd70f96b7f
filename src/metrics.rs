use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram,
};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("pistat_requests_total", "Total number of stats requests").unwrap();
    pub static ref RATE_LIMITED: Counter =
        register_counter!("pistat_rate_limited_total", "Requests rejected by the rate limiter").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("pistat_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("pistat_cache_misses_total", "Total cache misses").unwrap();
    pub static ref COLLECTIONS: Counter =
        register_counter!("pistat_collections_total", "Full collection rounds run").unwrap();
    pub static ref COLLECTOR_FAILURES: CounterVec = register_counter_vec!(
        "pistat_collector_failures_total",
        "Collector calls that produced no data",
        &["collector"]
    )
    .unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "pistat_request_latency_seconds",
        "Request latency in seconds"
    )
    .unwrap();
    pub static ref COLLECTION_LATENCY: Histogram = register_histogram!(
        "pistat_collection_latency_seconds",
        "Time to run every collector once"
    )
    .unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("pistat_cache_size", "Current number of items in cache").unwrap();
    pub static ref TRACKED_CLIENTS: Gauge =
        register_gauge!("pistat_rate_limit_clients", "Clients with a rate limit window").unwrap();
}

// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
