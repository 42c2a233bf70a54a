use chrono::FixedOffset;
use secrecy::Secret;
use serde::Deserialize;

const DEFAULT_AUTO_CHECKOUT_CRON: &str = "0 */15 * * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres connection string; records are kept in memory when unset
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,

    // QR check-in
    pub qr_signing_key: Secret<String>,
    pub qr_token_ttl_secs: i64,

    /// Facility-local day boundary, minutes east of UTC
    pub facility_utc_offset_minutes: i32,

    // Auto-checkout sweep
    pub auto_checkout_cron: String,
    pub auto_checkout_batch_size: i64,

    pub cors_allow_any: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let parsed = Self {
            database_url: config.get("database_url").ok(),
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port").unwrap_or(8080),

            qr_signing_key: Secret::new(config.get("qr_signing_key")?),
            qr_token_ttl_secs: config.get("qr_token_ttl_secs").unwrap_or(300),

            facility_utc_offset_minutes: config.get("facility_utc_offset_minutes").unwrap_or(0),

            auto_checkout_cron: config
                .get("auto_checkout_cron")
                .unwrap_or_else(|_| DEFAULT_AUTO_CHECKOUT_CRON.to_string()),
            auto_checkout_batch_size: config.get("auto_checkout_batch_size").unwrap_or(500),

            cors_allow_any: config.get("cors_allow_any").unwrap_or(false),
        };

        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.facility_offset().is_none() {
            return Err(config::ConfigError::Message(format!(
                "facility_utc_offset_minutes out of range: {}",
                self.facility_utc_offset_minutes
            )));
        }
        if self.qr_token_ttl_secs <= 0 {
            return Err(config::ConfigError::Message(
                "qr_token_ttl_secs must be positive".to_string(),
            ));
        }
        if self.auto_checkout_batch_size <= 0 {
            return Err(config::ConfigError::Message(
                "auto_checkout_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Offset of the facility-local calendar used for "today" and day cutoffs
    pub fn facility_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.facility_utc_offset_minutes.checked_mul(60)?)
    }
}
