//! Configuration types, built from environment variables.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default AI backend / identity service base URL.
pub const DEFAULT_CAPABILITIES_URL: &str = "http://localhost:3000";

/// Default mail provider base URL (Resend-compatible API).
pub const DEFAULT_MAIL_API_URL: &str = "https://api.resend.com";

/// Default header carrying the webhook shared secret.
pub const DEFAULT_SECRET_HEADER: &str = "x-webhook-secret";

/// Default maximum reply subject length.
pub const DEFAULT_MAX_SUBJECT_LEN: usize = 100;

/// Upper bound on the thread staleness window (one year).
pub const MAX_STALE_HOURS: i64 = 24 * 366;

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub backend: BackendConfig,
    pub identity: IdentityConfig,
    pub mail: MailConfig,
    pub store: StoreConfig,
    pub threading: ThreadingConfig,
    /// Timeout applied to every outbound HTTP call.
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// `None` puts the authenticator in permissive mode.
    pub secret: Option<SecretString>,
    pub header_name: String,
}

/// Which AI backend endpoint to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendApi {
    /// `POST /api/chat` with the native request shape.
    #[default]
    Chat,
    /// `POST /api/v1/chat/completions`, OpenAI-compatible.
    Completions,
}

impl FromStr for BackendApi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "completions" | "chat_completions" | "openai" => Ok(Self::Completions),
            other => Err(format!("unknown backend api '{other}' (expected chat|completions)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub secret: Option<SecretString>,
    pub api: BackendApi,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub base_url: String,
    pub secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: SecretString,
    pub from_address: String,
    pub max_subject_len: usize,
    /// Send a "could not process" notice to the sender on terminal failures.
    pub notify_on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: String,
}

/// How the thread signal is derived from an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalStrategy {
    /// `"Re: "` subject prefix gates the `In-Reply-To` value.
    #[default]
    Subject,
    /// `In-Reply-To` / `References` headers regardless of subject.
    Headers,
}

impl FromStr for SignalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subject" => Ok(Self::Subject),
            "headers" => Ok(Self::Headers),
            other => Err(format!("unknown thread signal '{other}' (expected subject|headers)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadingConfig {
    pub strategy: SignalStrategy,
    pub stale_window: chrono::Duration,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            strategy: SignalStrategy::Subject,
            stale_window: chrono::Duration::hours(24),
        }
    }
}

impl Config {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let server = ServerConfig {
            host: env.string("MAILBRIDGE_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.parse("PORT", 3000)?,
            body_limit_bytes: env.parse("MAILBRIDGE_BODY_LIMIT", 10 * 1024 * 1024)?,
        };

        let webhook = WebhookConfig {
            secret: env.secret("WEBHOOK_AUTH_SECRET"),
            header_name: env
                .string("WEBHOOK_AUTH_HEADER")
                .unwrap_or_else(|| DEFAULT_SECRET_HEADER.to_string())
                .to_ascii_lowercase(),
        };

        let capabilities_url = env
            .string("CAPABILITIES_URL")
            .unwrap_or_else(|| DEFAULT_CAPABILITIES_URL.to_string());
        let capabilities_secret = env.string("CAPABILITIES_SECRET");

        let backend = BackendConfig {
            base_url: trim_base(&capabilities_url),
            secret: capabilities_secret.clone().map(SecretString::from),
            api: env.parse("CAPABILITIES_API", BackendApi::Chat)?,
        };

        let identity = IdentityConfig {
            base_url: trim_base(&env.string("IDENTITY_URL").unwrap_or(capabilities_url)),
            secret: env
                .string("IDENTITY_SECRET")
                .or(capabilities_secret)
                .map(SecretString::from),
        };

        let mail = MailConfig {
            api_url: trim_base(
                &env.string("MAIL_API_URL")
                    .unwrap_or_else(|| DEFAULT_MAIL_API_URL.to_string()),
            ),
            api_key: env
                .secret("MAIL_API_KEY")
                .ok_or_else(|| ConfigError::MissingEnvVar("MAIL_API_KEY".to_string()))?,
            from_address: env
                .string("FROM_EMAIL")
                .unwrap_or_else(|| "assistant@localhost".to_string()),
            max_subject_len: env.parse("MAX_SUBJECT_LENGTH", DEFAULT_MAX_SUBJECT_LEN)?,
            notify_on_failure: env.parse("NOTIFY_ON_FAILURE", true)?,
        };

        let store = StoreConfig {
            db_path: env
                .string("MAILBRIDGE_DB_PATH")
                .unwrap_or_else(|| "./data/mailbridge.db".to_string()),
        };

        let stale_hours: i64 = env.parse("THREAD_STALE_HOURS", 24)?;
        let stale_window = (1..=MAX_STALE_HOURS)
            .contains(&stale_hours)
            .then(|| chrono::Duration::try_hours(stale_hours))
            .flatten()
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "THREAD_STALE_HOURS".to_string(),
                message: format!("must be between 1 and {MAX_STALE_HOURS}"),
            })?;
        let threading = ThreadingConfig {
            strategy: env.parse("THREAD_SIGNAL", SignalStrategy::Subject)?,
            stale_window,
        };

        let http_timeout = Duration::from_secs(env.parse("HTTP_TIMEOUT_SECS", 30)?);

        Ok(Self {
            server,
            webhook,
            backend,
            identity,
            mail,
            store,
            threading,
            http_timeout,
        })
    }

    /// Build the shared HTTP client used by every outbound integration.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .timeout(self.http_timeout)
            .user_agent(concat!("mailbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.string(key).map(SecretString::from)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
