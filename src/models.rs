use serde::{Deserialize, Serialize};
use crate::snapshot::StatField;

// Query string of GET /stats
#[derive(Debug, Default, Clone)]
pub struct StatsParams {
    pub block: Option<String>,
    pub cache: Option<String>,
    pub fields: Option<String>,
}

impl StatsParams {
    /// Build from raw query pairs. The first occurrence of a key wins and
    /// unknown keys are ignored, so no query string is ever rejected.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "block" => &mut params.block,
                "cache" => &mut params.cache,
                "fields" => &mut params.fields,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        params
    }

    pub fn block(&self) -> bool {
        flag(self.block.as_deref(), false)
    }

    pub fn use_cache(&self) -> bool {
        flag(self.cache.as_deref(), true)
    }

    // None means "every field"; an empty list after filtering is still a projection
    pub fn fields(&self) -> Option<Vec<StatField>> {
        self.fields
            .as_deref()
            .filter(|csv| !csv.trim().is_empty())
            .map(StatField::parse_list)
    }
}

// Only the literal "true" (any case) switches a flag on
fn flag(value: Option<&str>, default: bool) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

// 429 body
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RateLimitBody {
    pub error: String,
    pub message: String,
}

// 500 body
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FailureBody {
    pub error: String,
    pub details: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: u64,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(block: Option<&str>, cache: Option<&str>, fields: Option<&str>) -> StatsParams {
        StatsParams {
            block: block.map(String::from),
            cache: cache.map(String::from),
            fields: fields.map(String::from),
        }
    }

    #[test]
    fn flags_default_and_parse() {
        let p = params(None, None, None);
        assert!(!p.block());
        assert!(p.use_cache());

        let p = params(Some("TRUE"), Some("no"), None);
        assert!(p.block());
        assert!(!p.use_cache());

        // anything but "true" is false, even for a default-on flag
        assert!(!params(None, Some("1"), None).use_cache());
    }

    #[test]
    fn repeated_keys_keep_the_first_value() {
        let pairs = vec![
            ("block".to_string(), "true".to_string()),
            ("block".to_string(), "false".to_string()),
            ("fields".to_string(), "uptime".to_string()),
            ("other".to_string(), "x".to_string()),
            ("fields".to_string(), "memory".to_string()),
        ];
        let p = StatsParams::from_pairs(pairs);
        assert!(p.block());
        assert!(p.use_cache());
        assert_eq!(p.fields(), Some(vec![StatField::Uptime]));
    }

    #[test]
    fn empty_fields_means_everything() {
        assert_eq!(params(None, None, Some("")).fields(), None);
        assert_eq!(params(None, None, Some("  ")).fields(), None);
        assert_eq!(
            params(None, None, Some("cpu_temp,zzz")).fields(),
            Some(vec![StatField::CpuTemp])
        );
        assert_eq!(params(None, None, Some("zzz")).fields(), Some(vec![]));
    }
}
