use clap::Parser;
use std::time::Duration;

// CLI argument structure; every option can also come from a PISTAT_* variable
#[derive(Parser, Debug, Clone)]
#[command(name = "pistat")]
#[command(about = "Machine metrics over HTTP, rate limited and cached")]
pub struct Args {
    /// Address to bind
    #[arg(long, env = "PISTAT_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to run the server on
    #[arg(short, long, env = "PISTAT_PORT", default_value_t = 8585)]
    pub port: u16,

    /// Cache TTL in seconds (0 disables caching)
    #[arg(short, long, env = "PISTAT_CACHE_SECONDS", default_value_t = 2)]
    pub cache_ttl: u64,

    /// Turn per-client rate limiting on or off
    #[arg(long, env = "PISTAT_RATE_LIMIT_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub rate_limit_enabled: bool,

    /// Rate limit max requests per window
    #[arg(long, env = "PISTAT_RATE_LIMIT", default_value_t = 60)]
    pub rate_limit: u32,

    /// Rate limit window in seconds
    #[arg(long, env = "PISTAT_RATE_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    /// Gzip responses for clients that accept it
    #[arg(long, env = "PISTAT_COMPRESSION_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub compression_enabled: bool,

    /// Smallest payload, in bytes, worth compressing
    #[arg(long, env = "PISTAT_MIN_COMPRESS_SIZE", default_value_t = 1024)]
    pub min_compress_size: usize,

    /// Upper bound on each collector call, in seconds
    #[arg(long, env = "PISTAT_COLLECTOR_TIMEOUT", default_value_t = 5)]
    pub collector_timeout: u64,

    /// Verbose logging
    #[arg(long, env = "PISTAT_DEBUG")]
    pub debug: bool,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            rate_limit_enabled: self.rate_limit_enabled,
            max_requests_per_window: self.rate_limit as usize,
            window: Duration::from_secs(self.rate_window),
            cache_ttl: Duration::from_secs(self.cache_ttl),
            compression_enabled: self.compression_enabled,
            min_size_to_compress: self.min_compress_size,
            collector_timeout: Duration::from_secs(self.collector_timeout),
        }
    }
}

/// Everything the admission/caching core needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub rate_limit_enabled: bool,
    pub max_requests_per_window: usize,
    pub window: Duration,
    pub cache_ttl: Duration,
    pub compression_enabled: bool,
    pub min_size_to_compress: usize,
    pub collector_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            max_requests_per_window: 60,
            window: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(2),
            compression_enabled: true,
            min_size_to_compress: 1024,
            collector_timeout: Duration::from_secs(5),
        }
    }
}
