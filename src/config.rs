//! Runtime configuration read from the environment.
//!
//! `main` calls `dotenvy::dotenv()` first, so a local `.env` file works the
//! same as exported variables. Every setting except the provider key has a
//! default suitable for local development.

use std::time::Duration;

use tracing::warn;

pub const DEFAULT_SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";
pub const DEFAULT_FROM_EMAIL: &str = "emails@kinguniforms.net";
pub const DEFAULT_FROM_NAME: &str = "King Uniforms";

/// Settings for the HTTP server, storage and the send pipeline.
#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub email: EmailConfig,
    pub limits: SizeLimits,
    pub render_timeout: Duration,
    pub client_overrides_path: Option<String>,
}

/// Transactional email provider settings.
#[derive(Clone)]
pub struct EmailConfig {
    pub sendgrid_api_key: Option<String>,
    pub sendgrid_api_url: String,
    pub from_email: String,
    pub from_name: String,
    pub timeout: Duration,
}

/// Size ceilings measured on the base64-encoded attachment.
#[derive(Debug, Clone, Copy)]
pub struct SizeLimits {
    /// Largest attachment sent as-is on the first attempt.
    pub attachment_ceiling: usize,
    /// Provider's hard limit; anything above is never attached.
    pub provider_hard_limit: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            attachment_ceiling: 5_000_000,
            provider_hard_limit: 10_000_000,
        }
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("sendgrid_api_key", &self.sendgrid_api_key.as_ref().map(|_| "<redacted>"))
            .field("sendgrid_api_url", &self.sendgrid_api_url)
            .field("from_email", &self.from_email)
            .field("from_name", &self.from_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sendgrid_api_key: None,
            sendgrid_api_url: DEFAULT_SENDGRID_URL.to_string(),
            from_email: DEFAULT_FROM_EMAIL.to_string(),
            from_name: DEFAULT_FROM_NAME.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            database_url: None,
            email: EmailConfig::default(),
            limits: SizeLimits::default(),
            render_timeout: Duration::from_secs(15),
            client_overrides_path: None,
        }
    }
}

impl AppConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        if std::env::var("EMAIL_USER").is_ok() || std::env::var("EMAIL_PASSWORD").is_ok() {
            warn!("EMAIL_USER/EMAIL_PASSWORD are set but SMTP delivery is not supported; using SendGrid");
        }

        Self {
            bind_addr: env_or("BIND_ADDR", defaults.bind_addr),
            database_url: env_opt("APP_DATABASE_URL"),
            email: EmailConfig {
                sendgrid_api_key: env_opt("SENDGRID_API_KEY"),
                sendgrid_api_url: env_or("SENDGRID_API_URL", defaults.email.sendgrid_api_url),
                from_email: env_or("EMAIL_FROM", defaults.email.from_email),
                from_name: env_or("EMAIL_FROM_NAME", defaults.email.from_name),
                timeout: Duration::from_secs(env_parse("DISPATCH_TIMEOUT_SECS", 30)),
            },
            limits: SizeLimits {
                attachment_ceiling: env_parse(
                    "ATTACHMENT_CEILING_BYTES",
                    defaults.limits.attachment_ceiling,
                ),
                provider_hard_limit: env_parse(
                    "PROVIDER_HARD_LIMIT_BYTES",
                    defaults.limits.provider_hard_limit,
                ),
            },
            render_timeout: Duration::from_secs(env_parse("RENDER_TIMEOUT_SECS", 15)),
            client_overrides_path: env_opt("CLIENT_OVERRIDES_PATH"),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(key: &str, default: String) -> String {
    env_opt(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.limits.attachment_ceiling, 5_000_000);
        assert_eq!(cfg.limits.provider_hard_limit, 10_000_000);
        assert_eq!(cfg.render_timeout, Duration::from_secs(15));
        assert_eq!(cfg.email.timeout, Duration::from_secs(30));
        assert_eq!(cfg.email.from_email, DEFAULT_FROM_EMAIL);
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let email = EmailConfig {
            sendgrid_api_key: Some("SG.secret".into()),
            ..Default::default()
        };
        let rendered = format!("{:?}", email);
        assert!(!rendered.contains("SG.secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
