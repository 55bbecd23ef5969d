use crate::payments::money::Currency;
use crate::payments::providers::paypal::{LIVE_BASE_URL, SANDBOX_BASE_URL};
use crate::payments::providers::{PayPalConfig, StripeConfig};
use crate::payments::service::ServiceConfig;
use crate::payments::types::Provider;
use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const MIN_GATEWAY_TIMEOUT_SECS: u64 = 10;
const MAX_GATEWAY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub stripe: Option<StripeSettings>,
    pub paypal: Option<PayPalSettings>,
    pub payments: PaymentsConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

impl ServerConfig {
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: SecretString,
    pub webhook_secret: Option<SecretString>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub webhook_tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct PayPalSettings {
    pub client_id: String,
    pub client_secret: SecretString,
    pub base_url: String,
    pub webhook_id: Option<String>,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub default_provider: Provider,
    pub retry_backoff_ms: u64,
    pub gateway_timeout_secs: u64,
    pub trust_unverified_webhooks: bool,
    pub supported_currencies: Vec<Currency>,
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow!("{} must be valid: {}", name, e)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .context("PORT not set")?
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").context("DATABASE_URL not set")?,
            max_connections: parsed("DATABASE_MAX_CONNECTIONS", 20)?,
        };

        let redis = optional("REDIS_URL").map(|url| RedisConfig { url });

        let stripe = match optional("STRIPE_SECRET_KEY") {
            Some(secret_key) => Some(StripeSettings {
                secret_key: SecretString::from(secret_key),
                webhook_secret: optional("STRIPE_WEBHOOK_SECRET").map(SecretString::from),
                base_url: optional("STRIPE_BASE_URL"),
                timeout_secs: parsed("STRIPE_TIMEOUT_SECS", 30)?,
                webhook_tolerance_secs: parsed("STRIPE_WEBHOOK_TOLERANCE_SECS", 300)?,
            }),
            None => None,
        };

        let paypal = match (optional("PAYPAL_CLIENT_ID"), optional("PAYPAL_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => {
                let base_url = match optional("PAYPAL_BASE_URL") {
                    Some(url) => url,
                    None => {
                        let mode = optional("PAYPAL_MODE").unwrap_or_else(|| "sandbox".to_string());
                        PayPalConfig::base_url_for_mode(&mode)
                            .ok_or_else(|| {
                                anyhow!("PAYPAL_MODE must be 'sandbox' or 'live', got {}", mode)
                            })?
                            .to_string()
                    }
                };
                Some(PayPalSettings {
                    client_id,
                    client_secret: SecretString::from(client_secret),
                    base_url,
                    webhook_id: optional("PAYPAL_WEBHOOK_ID"),
                    return_url: optional("PAYPAL_RETURN_URL"),
                    cancel_url: optional("PAYPAL_CANCEL_URL"),
                    timeout_secs: parsed("PAYPAL_TIMEOUT_SECS", 30)?,
                })
            }
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "PAYPAL_CLIENT_ID and PAYPAL_CLIENT_SECRET must be set together"
                ))
            }
        };

        let supported_currencies = match optional("PAYMENTS_SUPPORTED_CURRENCIES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|code| {
                    Currency::from_code(code)
                        .ok_or_else(|| anyhow!("unsupported currency in PAYMENTS_SUPPORTED_CURRENCIES: {}", code))
                })
                .collect::<Result<Vec<_>>>()?,
            None => ServiceConfig::default().supported_currencies,
        };

        let default_provider = match optional("PAYMENTS_DEFAULT_PROVIDER") {
            Some(value) => value
                .parse()
                .map_err(|e| anyhow!("PAYMENTS_DEFAULT_PROVIDER: {}", e))?,
            None if stripe.is_none() && paypal.is_some() => Provider::PayPal,
            None => Provider::Stripe,
        };

        let payments = PaymentsConfig {
            default_provider,
            retry_backoff_ms: parsed("PAYMENTS_RETRY_BACKOFF_MS", 250)?,
            gateway_timeout_secs: parsed("PAYMENTS_GATEWAY_TIMEOUT_SECS", 20u64)?
                .clamp(MIN_GATEWAY_TIMEOUT_SECS, MAX_GATEWAY_TIMEOUT_SECS),
            trust_unverified_webhooks: parsed("PAYMENTS_TRUST_UNVERIFIED_WEBHOOKS", false)?,
            supported_currencies,
        };

        let config = Config {
            server,
            database,
            redis,
            stripe,
            paypal,
            payments,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        if self.stripe.is_none() && self.paypal.is_none() {
            return Err(anyhow!(
                "At least one payment provider must be configured (STRIPE_SECRET_KEY or PAYPAL_CLIENT_ID)"
            ));
        }

        if let Some(stripe) = &self.stripe {
            if stripe.secret_key.expose_secret().trim().is_empty() {
                return Err(anyhow!("STRIPE_SECRET_KEY cannot be empty"));
            }
        }

        let default_configured = match self.payments.default_provider {
            Provider::Stripe => self.stripe.is_some(),
            Provider::PayPal => self.paypal.is_some(),
        };
        if !default_configured {
            return Err(anyhow!(
                "PAYMENTS_DEFAULT_PROVIDER is {} but that provider is not configured",
                self.payments.default_provider
            ));
        }

        if self.payments.supported_currencies.is_empty() {
            return Err(anyhow!("PAYMENTS_SUPPORTED_CURRENCIES cannot be empty"));
        }

        Ok(())
    }

    pub fn stripe_gateway_config(&self) -> Option<StripeConfig> {
        self.stripe.as_ref().map(|s| {
            let mut config = StripeConfig::new(s.secret_key.expose_secret());
            if let Some(secret) = &s.webhook_secret {
                config = config.with_webhook_secret(secret.expose_secret());
            }
            if let Some(url) = &s.base_url {
                config = config.with_base_url(url.as_str());
            }
            config.timeout_secs = s.timeout_secs;
            config.webhook_tolerance_secs = s.webhook_tolerance_secs;
            config
        })
    }

    pub fn paypal_gateway_config(&self) -> Option<PayPalConfig> {
        self.paypal.as_ref().map(|p| {
            let mut config = PayPalConfig::new(p.client_id.as_str(), p.client_secret.expose_secret())
                .with_base_url(p.base_url.as_str());
            config.webhook_id = p.webhook_id.clone();
            config.return_url = p.return_url.clone();
            config.cancel_url = p.cancel_url.clone();
            config.timeout_secs = p.timeout_secs;
            config
        })
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            default_provider: self.payments.default_provider,
            retry_backoff: Duration::from_millis(self.payments.retry_backoff_ms),
            gateway_timeout: Duration::from_secs(self.payments.gateway_timeout_secs),
            supported_currencies: self.payments.supported_currencies.clone(),
        }
    }

    /// Human-readable name of the PayPal environment, for startup logs
    pub fn paypal_mode(&self) -> Option<&'static str> {
        self.paypal.as_ref().map(|p| match p.base_url.as_str() {
            LIVE_BASE_URL => "live",
            SANDBOX_BASE_URL => "sandbox",
            _ => "custom",
        })
    }
}
