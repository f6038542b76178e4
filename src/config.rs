use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// Default countries whose residents are never submitted for verification.
pub const DEFAULT_BANNED_COUNTRIES: &[&str] = &["CN", "US", "TW", "HK"];

/// Don't submit IDs to the identity provider after this many are verified.
pub const DEFAULT_VERIFIED_IDS_CAP: i64 = 25_000;

pub const DEFAULT_IDM_URL: &str = "https://edna.identitymind.com/im/account/consumer";
pub const DEFAULT_ONFIDO_BASE_URL: &str = "https://api.onfido.com";
pub const DEFAULT_CUSTOMER_IO_URL: &str = "https://track.customer.io/api/v1/customers";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres URL; the in-memory store is used when absent.
    pub database_url: Option<String>,
    pub port: u16,
    pub idm_url: String,
    pub idm_username: Option<String>,
    pub idm_password: Option<String>,
    pub idm_webhook_username: String,
    pub idm_webhook_password: String,
    pub onfido_base_url: String,
    pub onfido_token: Option<String>,
    pub onfido_webhook_token: String,
    /// Key for signing user tokens.
    pub token_secret: String,
    pub customer_io_url: String,
    pub customer_io_site_id: Option<String>,
    pub customer_io_api_key: Option<String>,
    pub documents_dir: PathBuf,
    pub policy: VerificationPolicy,
}

/// Business toggles injected into the orchestrator and the user service.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationPolicy {
    pub banned_countries: HashSet<String>,
    /// Ceiling on users in `id_verified` before ID requests stop.
    pub verified_ids_cap: i64,
    pub whitelist_closed: bool,
    pub whitelist_open_at: Option<DateTime<Utc>>,
    /// Existing users are still served, new ones are refused.
    pub new_users_closed: bool,
    /// Bound on observers re-entering `transition` for the same dispatch.
    pub max_transition_depth: usize,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            banned_countries: DEFAULT_BANNED_COUNTRIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            verified_ids_cap: DEFAULT_VERIFIED_IDS_CAP,
            whitelist_closed: false,
            whitelist_open_at: None,
            new_users_closed: false,
            max_transition_depth: 8,
        }
    }
}

impl VerificationPolicy {
    pub fn is_banned(&self, country_code: &str) -> bool {
        self.banned_countries
            .contains(&country_code.trim().to_ascii_uppercase())
    }

    /// Ok when registration is open at `now`, else the error describing why not.
    pub fn check_open(&self, now: DateTime<Utc>) -> Result<(), crate::errors::AppError> {
        if self.whitelist_closed {
            return Err(crate::errors::AppError::WhitelistClosed(None));
        }
        if let Some(open_at) = self.whitelist_open_at {
            if open_at > now {
                return Err(crate::errors::AppError::WhitelistClosed(Some(
                    open_at.timestamp(),
                )));
            }
        }
        Ok(())
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn required_var(name: &str) -> anyhow::Result<String> {
    optional_var(name)
        .ok_or_else(|| anyhow::anyhow!("{} environment variable required", name))
}

fn flag_var(name: &str) -> bool {
    optional_var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "1" | "y" | "t"))
        .unwrap_or(false)
}

fn url_var(name: &str, default: &str) -> anyhow::Result<String> {
    let url = optional_var(name).unwrap_or_else(|| default.to_string());
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url.trim_end_matches('/').to_string())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let policy = VerificationPolicy {
            banned_countries: optional_var("BANNED_COUNTRIES")
                .map(|raw| {
                    raw.split(',')
                        .map(|c| c.trim().to_ascii_uppercase())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| VerificationPolicy::default().banned_countries),
            verified_ids_cap: optional_var("VERIFIED_IDS_CAP")
                .map(|v| v.parse::<i64>())
                .transpose()
                .map_err(|_| anyhow::anyhow!("VERIFIED_IDS_CAP must be an integer"))?
                .unwrap_or(DEFAULT_VERIFIED_IDS_CAP),
            whitelist_closed: flag_var("WHITELIST_CLOSED"),
            // An unparseable opening timestamp is ignored rather than fatal.
            whitelist_open_at: optional_var("WHITELIST_OPEN_TS")
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            new_users_closed: flag_var("NEW_USERS_CLOSED"),
            max_transition_depth: optional_var("MAX_TRANSITION_DEPTH")
                .map(|v| v.parse::<usize>())
                .transpose()
                .map_err(|_| anyhow::anyhow!("MAX_TRANSITION_DEPTH must be a positive integer"))?
                .unwrap_or(8),
        };

        let config = Self {
            database_url: optional_var("DB_URL")
                .or_else(|| optional_var("DATABASE_URL"))
                .map(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })
                .transpose()?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            idm_url: url_var("IDM_URL", DEFAULT_IDM_URL)?,
            idm_username: optional_var("IDM_USERNAME"),
            idm_password: optional_var("IDM_PASSWORD"),
            idm_webhook_username: required_var("IDM_WEBHOOK_USERNAME")?,
            idm_webhook_password: required_var("IDM_WEBHOOK_PASSWORD")?,
            onfido_base_url: url_var("ONFIDO_BASE_URL", DEFAULT_ONFIDO_BASE_URL)?,
            onfido_token: optional_var("ONFIDO_TOKEN"),
            onfido_webhook_token: required_var("ONFIDO_WEBHOOK_TOKEN").and_then(|token| {
                if token.len() < 16 {
                    anyhow::bail!("ONFIDO_WEBHOOK_TOKEN must be at least 16 characters");
                }
                Ok(token)
            })?,
            token_secret: required_var("TOKEN_SECRET").and_then(|secret| {
                if secret.len() < 16 {
                    anyhow::bail!("TOKEN_SECRET must be at least 16 characters");
                }
                Ok(secret)
            })?,
            customer_io_url: url_var("CUSTOMER_IO_URL", DEFAULT_CUSTOMER_IO_URL)?,
            customer_io_site_id: optional_var("CUSTOMER_IO_SITE_ID"),
            customer_io_api_key: optional_var("CUSTOMER_IO_API_KEY"),
            documents_dir: optional_var("DOCUMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./documents")),
            policy,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database: {}",
            if config.database_url.is_some() {
                "postgres"
            } else {
                "in-memory"
            }
        );
        tracing::debug!("Identity provider URL: {}", config.idm_url);
        if config.idm_username.is_none() {
            tracing::warn!("IDM_USERNAME not set; verification requests will be skipped");
        }
        tracing::debug!("Document provider URL: {}", config.onfido_base_url);
        tracing::debug!(
            "Banned countries: {:?}, verified IDs cap: {}",
            config.policy.banned_countries,
            config.policy.verified_ids_cap
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_default_policy_bans() {
        let policy = VerificationPolicy::default();
        assert!(policy.is_banned("US"));
        assert!(policy.is_banned(" cn "));
        assert!(!policy.is_banned("AU"));
    }

    #[test]
    fn test_check_open() {
        let now = Utc::now();
        let mut policy = VerificationPolicy::default();
        assert!(policy.check_open(now).is_ok());

        policy.whitelist_open_at = Some(now + Duration::hours(1));
        match policy.check_open(now) {
            Err(crate::errors::AppError::WhitelistClosed(Some(ts))) => {
                assert_eq!(ts, (now + Duration::hours(1)).timestamp())
            }
            other => panic!("expected closed with timestamp, got {:?}", other),
        }

        policy.whitelist_open_at = Some(now - Duration::hours(1));
        assert!(policy.check_open(now).is_ok());

        policy.whitelist_closed = true;
        assert!(policy.check_open(now).is_err());
    }
}
