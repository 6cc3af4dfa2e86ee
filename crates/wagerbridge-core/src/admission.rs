//! Request-admission layer (spec.md §4.C): API-key authentication, IP
//! whitelisting, rate limiting, permission checks, and audit-log
//! redaction. Every request not on `exempt_paths` traverses stages 1-3
//! before reaching a handler; stage 4 runs inside the handler against the
//! [`RequestScope`] the pipeline produced.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::CacheLayer;
use crate::config::AdmissionConfig;
use crate::error::{CoreError, CoreResult};
use crate::permissions::PermissionSet;
use crate::repository::ApiKeyRepository;
use crate::security;
use crate::types::RequestScope;

const SENSITIVE_FIELD_NAMES: &[&str] = &[
    "password",
    "api_key",
    "secret",
    "token",
    "authorization",
    "credit_card",
    "ssn",
];

pub struct RateLimitDecision {
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
    pub retry_after_secs: Option<u64>,
}

pub struct AdmissionPipeline {
    cache: Arc<CacheLayer>,
    api_keys: Arc<ApiKeyRepository>,
    config: AdmissionConfig,
}

impl AdmissionPipeline {
    pub fn new(cache: Arc<CacheLayer>, api_keys: Arc<ApiKeyRepository>, config: AdmissionConfig) -> Self {
        Self {
            cache,
            api_keys,
            config,
        }
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config.exempt_paths.iter().any(|p| p == path)
    }

    /// Stage 1. `raw_key` is `<key_prefix>.<secret>`. A cache hit is
    /// trusted for up to `api_key_cache_ttl_secs` without re-verifying the
    /// secret; the TTL bounds the exposure window of a cached, already
    /// validated key.
    pub async fn authenticate(&self, raw_key: &str, client_ip: &str) -> CoreResult<RequestScope> {
        let (key_prefix, secret) = raw_key
            .split_once('.')
            .ok_or_else(|| CoreError::Authentication("malformed API key".to_string()))?;

        let cache_key = format!("apikey:{}", security::sha256_hex(raw_key.as_bytes()));
        let ttl = Duration::from_secs(self.config.api_key_cache_ttl_secs);

        let cached = self
            .cache
            .get_or_compute(&cache_key, &[], ttl, || async {
                let record = self
                    .api_keys
                    .find_by_prefix(key_prefix)
                    .await?
                    .ok_or_else(|| CoreError::Authentication("invalid API key".to_string()))?;

                let verified = security::verify_password(secret, &record.secret_hash)
                    .map_err(|err| CoreError::Internal(err.to_string()))?;
                if !verified {
                    return Err(CoreError::Authentication("invalid API key".to_string()));
                }
                Ok(record)
            })
            .await?;

        let api_key = cached.value;
        let now = Utc::now();
        if !api_key.is_usable(now) {
            return Err(CoreError::Authentication("API key inactive or expired".to_string()));
        }

        let api_keys = Arc::clone(&self.api_keys);
        let key_id = api_key.id;
        let ip = client_ip.to_string();
        tokio::spawn(async move {
            let _ = api_keys.touch_usage(key_id, &ip).await;
        });

        Ok(RequestScope {
            request_id: Uuid::new_v4(),
            partner_id: api_key.partner_id,
            api_key_id: api_key.id,
            permissions: PermissionSet::parse(&api_key.permissions),
            client_ip: client_ip.to_string(),
        })
    }

    /// Stage 2. Resolves the client IP from `X-Forwarded-For[0]` if
    /// present, else the peer address (the caller passes whichever it has
    /// already resolved).
    pub async fn check_ip_whitelist(&self, partner_id: Uuid, client_ip: &str) -> CoreResult<()> {
        if !self.config.whitelist_enabled {
            return Ok(());
        }
        let Ok(candidate) = client_ip.parse::<IpAddr>() else {
            return Err(CoreError::Authorization("unresolvable client IP".to_string()));
        };
        let allowed = self.api_keys.find_allowed_ips(partner_id).await?;
        let is_member = allowed
            .iter()
            .any(|entry| cidr_contains(&entry.cidr, candidate));
        if is_member {
            Ok(())
        } else {
            Err(CoreError::Authorization("client IP not whitelisted".to_string()))
        }
    }

    /// Stage 3. Fixed-window counter keyed by `(partner_id, normalized_path)`.
    pub async fn check_rate_limit(&self, partner_id: Uuid, path: &str) -> CoreResult<RateLimitDecision> {
        let rule = self
            .config
            .path_rate_limits
            .iter()
            .find(|(pattern, _)| path_matches(pattern, path))
            .map(|(_, rule)| *rule)
            .unwrap_or(self.config.default_rate_limit);

        let window_start = Utc::now().timestamp() / rule.window_secs as i64;
        let key = format!("rl:{partner_id}:{path}:{window_start}");
        let count = self
            .cache
            .incr_with_window(&key, Duration::from_secs(rule.window_secs))
            .await?;

        let reset_secs = rule.window_secs - (Utc::now().timestamp() as u64 % rule.window_secs);

        if count as u32 > rule.limit {
            let block_key = format!("rl:block:{partner_id}:{path}");
            self.cache
                .set_raw(&block_key, b"1", Duration::from_secs(rule.block_secs))
                .await
                .ok();
            return Ok(RateLimitDecision {
                limit: rule.limit,
                remaining: 0,
                reset_secs,
                retry_after_secs: Some(rule.block_secs),
            });
        }

        Ok(RateLimitDecision {
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(count as u32),
            reset_secs,
            retry_after_secs: None,
        })
    }

    /// Stage 4, invoked from inside handlers once a [`RequestScope`] exists.
    pub fn check_permission(&self, scope: &RequestScope, resource: &str, action: &str) -> CoreResult<()> {
        if scope.permissions.is_granted(resource, action) {
            Ok(())
        } else {
            Err(CoreError::Authorization(format!(
                "missing permission {resource}:{action}"
            )))
        }
    }
}

fn path_matches(pattern: &str, path: &str) -> bool {
    regex_lite_match(pattern, path)
}

/// Minimal glob-style matcher (`*` = any run of characters) so per-endpoint
/// rate-limit overrides can be configured without pulling in a full regex
/// engine for what is, in practice, a handful of path prefixes.
fn regex_lite_match(pattern: &str, path: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return pattern == path;
    };
    if !path.starts_with(first) {
        return false;
    }
    let mut rest = &path[first.len()..];
    for part in parts {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

fn cidr_contains(cidr: &str, candidate: IpAddr) -> bool {
    let Some((network, prefix_len)) = cidr.split_once('/') else {
        return cidr.parse::<IpAddr>().map(|ip| ip == candidate).unwrap_or(false);
    };
    let Ok(network_ip) = network.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix_len) = prefix_len.parse::<u32>() else {
        return false;
    };

    match (network_ip, candidate) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len.min(32))
            };
            u32::from(net) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = if prefix_len == 0 {
                0u128
            } else {
                u128::MAX << (128 - prefix_len.min(128))
            };
            u128::from(net) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

/// Redacts any JSON object field whose name matches the sensitive-name
/// list, keeping the first 3 and last 3 characters (spec.md §4.C).
pub fn redact_sensitive_fields(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, val) in map {
                let lowered = key.to_lowercase();
                if SENSITIVE_FIELD_NAMES.iter().any(|name| lowered.contains(name)) {
                    redacted.insert(key.clone(), Value::String(redact_string(val)));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_fields(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_fields).collect()),
        other => other.clone(),
    }
}

fn redact_string(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.chars().count() <= 6 {
        return "*".repeat(raw.chars().count());
    }
    let chars: Vec<char> = raw.chars().collect();
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cidr_v4_match() {
        let ip = "10.0.5.12".parse().unwrap();
        assert!(cidr_contains("10.0.0.0/8", ip));
        assert!(!cidr_contains("10.1.0.0/16", ip));
    }

    #[test]
    fn path_pattern_wildcard_match() {
        assert!(path_matches("/wallet/*/bet", "/wallet/abc-123/bet"));
        assert!(!path_matches("/wallet/*/bet", "/wallet/abc-123/win"));
    }

    #[test]
    fn redaction_keeps_head_and_tail() {
        let body = json!({"password": "supersecretvalue", "player_id": "p-1"});
        let redacted = redact_sensitive_fields(&body);
        assert_eq!(redacted["password"], json!("sup***lue"));
        assert_eq!(redacted["player_id"], json!("p-1"));
    }

    #[test]
    fn redaction_masks_short_secrets_fully() {
        let body = json!({"token": "abc"});
        let redacted = redact_sensitive_fields(&body);
        assert_eq!(redacted["token"], json!("***"));
    }
}
