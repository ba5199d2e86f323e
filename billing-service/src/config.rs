//! Environment-driven configuration.

use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use secrecy::Secret;
use std::env;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub common: service_core::config::Config,
    pub database: DatabaseConfig,
    pub billing: BillingSettingsConfig,
    pub mpesa: MpesaConfig,
    pub routeros: RouterOsConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BillingSettingsConfig {
    /// Seconds between scheduled billing passes.
    pub pass_interval_secs: u64,
    /// Days between invoice generation and its due date.
    pub due_days: i64,
    /// Attempt immediate settlement of auto-renew subscriptions.
    pub auto_charge: bool,
    /// Concurrent subscriptions in flight during a pass.
    pub worker_count: usize,
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub shortcode: String,
    pub passkey: Secret<String>,
    pub consumer_key: Secret<String>,
    pub consumer_secret: Secret<String>,
    pub callback_url: String,
}

#[derive(Debug, Clone)]
pub struct RouterOsConfig {
    pub api_url: String,
    pub username: String,
    pub password: Secret<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl BillingConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let port: u16 = env_or("BILLING_HTTP_PORT", "8080").parse()?;

        let database_url = env::var("BILLING_DATABASE_URL")
            .map_err(|_| anyhow!("BILLING_DATABASE_URL must be set"))?;
        let max_connections: u32 = env_or("BILLING_DB_MAX_CONNECTIONS", "10").parse()?;
        let min_connections: u32 = env_or("BILLING_DB_MIN_CONNECTIONS", "1").parse()?;

        let pass_interval_secs: u64 = env_or("BILLING_PASS_INTERVAL_SECS", "3600").parse()?;
        let due_days: i64 = env_or("BILLING_DUE_DAYS", "3").parse()?;
        let auto_charge: bool = env_or("BILLING_AUTO_CHARGE", "false").parse().unwrap_or(false);
        let worker_count: usize = env_or("BILLING_WORKER_COUNT", "8").parse()?;

        let mpesa = MpesaConfig {
            base_url: env_or("MPESA_BASE_URL", "https://sandbox.safaricom.co.ke"),
            shortcode: env_or("MPESA_SHORTCODE", "174379"),
            passkey: Secret::new(env_or("MPESA_PASSKEY", "")),
            consumer_key: Secret::new(env_or("MPESA_CONSUMER_KEY", "")),
            consumer_secret: Secret::new(env_or("MPESA_CONSUMER_SECRET", "")),
            callback_url: env_or("MPESA_CALLBACK_URL", ""),
        };

        let routeros = RouterOsConfig {
            api_url: env_or("ROUTEROS_API_URL", "http://192.168.88.1/rest"),
            username: env_or("ROUTEROS_USERNAME", "admin"),
            password: Secret::new(env_or("ROUTEROS_PASSWORD", "")),
        };

        Ok(Self {
            service_name: "billing-service".to_string(),
            log_level: env_or("BILLING_LOG_LEVEL", "info"),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            common: service_core::config::Config { port },
            database: DatabaseConfig {
                url: database_url,
                max_connections,
                min_connections,
            },
            billing: BillingSettingsConfig {
                pass_interval_secs,
                due_days,
                auto_charge,
                worker_count,
            },
            mpesa,
            routeros,
        })
    }
}
