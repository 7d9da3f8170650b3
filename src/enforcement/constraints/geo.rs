//! Geographic admission control.
//!
//! Maps the client IP to a country through a configurable table, then checks
//! allow/deny lists or region membership. Lookups are cached per IP.

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::enforcement::{Directive, EnforcementError};
use crate::models::DecisionContext;

use super::{ConstraintProcessor, ProcessorKind};

/// What to do when the request carries no client IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingIpAction {
    Allow,
    #[default]
    Deny,
}

/// Geo lookup configuration
#[derive(Debug, Clone)]
pub struct GeoConfig {
    /// Exact IPs or prefixes (trailing `.`) mapped to ISO country codes
    pub table: HashMap<String, String>,
    /// Region label -> member country codes
    pub regions: HashMap<String, Vec<String>>,
    pub missing_ip_action: MissingIpAction,
}

impl Default for GeoConfig {
    fn default() -> Self {
        let mut regions = HashMap::new();
        regions.insert(
            "EU".to_string(),
            [
                "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU",
                "IE", "IT", "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES",
                "SE",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        );
        regions.insert(
            "APAC".to_string(),
            ["JP", "KR", "SG", "AU", "NZ", "IN"].iter().map(|c| c.to_string()).collect(),
        );
        Self {
            table: HashMap::new(),
            regions,
            missing_ip_action: MissingIpAction::Deny,
        }
    }
}

/// Country-based admission processor
pub struct GeoRestrictor {
    config: GeoConfig,
    /// Per-IP lookup cache
    cache: Cache<String, Option<String>>,
}

impl GeoRestrictor {
    pub fn new(config: GeoConfig) -> Self {
        Self {
            config,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(3600))
                .build(),
        }
    }

    async fn country_for(&self, ip: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(ip).await {
            return cached;
        }
        let resolved = self.lookup(ip);
        self.cache.insert(ip.to_string(), resolved.clone()).await;
        resolved
    }

    /// Exact entry first, then the longest matching prefix entry
    fn lookup(&self, ip: &str) -> Option<String> {
        if let Some(country) = self.config.table.get(ip) {
            return Some(country.clone());
        }
        self.config
            .table
            .iter()
            .filter(|(prefix, _)| prefix.ends_with('.') && ip.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, country)| country.clone())
    }

    fn countries_in(&self, spec: &str) -> Vec<String> {
        spec.split(',')
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect()
    }

    fn region_members(&self, region: &str) -> Vec<String> {
        self.config
            .regions
            .get(&region.trim().to_uppercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConstraintProcessor for GeoRestrictor {
    fn name(&self) -> &'static str {
        "geo-restrictor"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Admission
    }

    fn matches(&self, directive: &Directive) -> bool {
        directive.keyword() == "geoRestriction"
    }

    async fn apply(
        &self,
        directive: &Directive,
        _payload: Value,
        context: &DecisionContext,
    ) -> std::result::Result<Value, EnforcementError> {
        let Some(argument) = directive.argument() else {
            return Err(EnforcementError::Rejected {
                processor: "geo-restrictor".to_string(),
                message: "geoRestriction directive needs allow:/deny:/region: argument".to_string(),
            });
        };

        let country = match context.client_ip() {
            Some(ip) => self.country_for(ip).await,
            None => match self.config.missing_ip_action {
                MissingIpAction::Allow => return Ok(Value::Null),
                MissingIpAction::Deny => {
                    return Err(EnforcementError::GeoBlocked {
                        country: "unknown".to_string(),
                        client_ip: None,
                    })
                }
            },
        };

        let country = match country {
            Some(c) => c,
            None => match self.config.missing_ip_action {
                MissingIpAction::Allow => return Ok(Value::Null),
                MissingIpAction::Deny => {
                    return Err(EnforcementError::GeoBlocked {
                        country: "unresolved".to_string(),
                        client_ip: context.client_ip().map(|s| s.to_string()),
                    })
                }
            },
        };

        let permitted = match argument.split_once(':') {
            Some(("allow", list)) => self.countries_in(list).contains(&country),
            Some(("deny", list)) => !self.countries_in(list).contains(&country),
            Some(("region", region)) => self.region_members(region).contains(&country),
            _ => {
                return Err(EnforcementError::Rejected {
                    processor: "geo-restrictor".to_string(),
                    message: format!("malformed geoRestriction argument '{}'", argument),
                })
            }
        };

        if permitted {
            Ok(Value::Null)
        } else {
            Err(EnforcementError::GeoBlocked {
                country,
                client_ip: context.client_ip().map(|s| s.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;
    use serde_json::json;

    fn restrictor() -> GeoRestrictor {
        let mut table = HashMap::new();
        table.insert("203.0.113.7".to_string(), "JP".to_string());
        table.insert("198.51.100.".to_string(), "DE".to_string());
        table.insert("192.0.2.".to_string(), "KP".to_string());
        GeoRestrictor::new(GeoConfig {
            table,
            ..Default::default()
        })
    }

    fn context_with_ip(ip: Option<&str>) -> DecisionContext {
        let ctx = DecisionContext::new("a", AgentType::External, "tool:call", "tool:x");
        match ip {
            Some(ip) => ctx.with_env("clientIP", json!(ip)),
            None => ctx,
        }
    }

    #[tokio::test]
    async fn test_allow_list() {
        let geo = restrictor();
        let directive = Directive::parse("geoRestriction:allow:JP,US");

        geo.apply(&directive, Value::Null, &context_with_ip(Some("203.0.113.7")))
            .await
            .expect("JP is allowed");

        let err = geo
            .apply(&directive, Value::Null, &context_with_ip(Some("198.51.100.9")))
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::GeoBlocked { ref country, .. } if country == "DE"));
    }

    #[tokio::test]
    async fn test_deny_list() {
        let geo = restrictor();
        let directive = Directive::parse("geoRestriction:deny:KP");

        geo.apply(&directive, Value::Null, &context_with_ip(Some("203.0.113.7")))
            .await
            .expect("JP not on deny list");
        assert!(geo
            .apply(&directive, Value::Null, &context_with_ip(Some("192.0.2.44")))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_region_membership() {
        let geo = restrictor();
        let directive = Directive::parse("geoRestriction:region:EU");

        geo.apply(&directive, Value::Null, &context_with_ip(Some("198.51.100.1")))
            .await
            .expect("DE is in the EU region");
        assert!(geo
            .apply(&directive, Value::Null, &context_with_ip(Some("203.0.113.7")))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_ip_default_denies() {
        let geo = restrictor();
        let directive = Directive::parse("geoRestriction:allow:JP");
        assert!(geo
            .apply(&directive, Value::Null, &context_with_ip(None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_ip_configurable_allow() {
        let geo = GeoRestrictor::new(GeoConfig {
            missing_ip_action: MissingIpAction::Allow,
            ..Default::default()
        });
        let directive = Directive::parse("geoRestriction:allow:JP");
        geo.apply(&directive, Value::Null, &context_with_ip(None))
            .await
            .expect("missing IP allowed by configuration");
    }

    #[tokio::test]
    async fn test_prefix_lookup_prefers_longest_match() {
        let mut table = HashMap::new();
        table.insert("10.".to_string(), "US".to_string());
        table.insert("10.1.".to_string(), "CA".to_string());
        let geo = GeoRestrictor::new(GeoConfig {
            table,
            ..Default::default()
        });
        assert_eq!(geo.lookup("10.1.2.3"), Some("CA".to_string()));
        assert_eq!(geo.lookup("10.9.2.3"), Some("US".to_string()));
    }
}
