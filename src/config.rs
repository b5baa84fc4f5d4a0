use std::{env, fmt, str::FromStr, time::Duration};

use crate::error::Error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns the value of the env var `name`, or `default` if it is not set.
pub fn get_env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Deployment environment. Selects the log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Single-line JSON logs.
    Production,
    /// Human-readable logs.
    #[default]
    Development,
}

impl Environment {
    /// Reads `ENV`, falling back to `GO_ENV`.
    pub fn from_env() -> Self {
        env::var("ENV")
            .or_else(|_| env::var("GO_ENV"))
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    /// `production` (any case) is production, everything else is development.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => f.write_str("production"),
            Environment::Development => f.write_str("development"),
        }
    }
}

/// Server configuration.
///
/// Usually built with [`Config::from_env`] and then adjusted with the
/// `with_*` methods.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub port: u16,
    pub env: Environment,
    pub with_tracing: bool,
    pub otlp_endpoint: String,
    /// Upper bound for draining in-flight requests on shutdown.
    pub drain_timeout: Duration,
}

impl Config {
    pub fn new(app_name: impl Into<String>) -> Self {
        Config {
            app_name: app_name.into(),
            port: DEFAULT_PORT,
            env: Environment::default(),
            with_tracing: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Reads the configuration from the environment.
    ///
    /// | var | default |
    /// |---|---|
    /// | `SERVICE_NAME` | the cargo package name |
    /// | `PORT` | `8080` |
    /// | `ENV` / `GO_ENV` | development |
    /// | `WITH_TRACING` | `false` |
    /// | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317` |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `5` |
    pub fn from_env() -> Result<Self, Error> {
        let app_name = get_env_or("SERVICE_NAME", env!("CARGO_PKG_NAME"));
        let port = parse_var("PORT", DEFAULT_PORT)?;
        let drain_secs = parse_var("SHUTDOWN_TIMEOUT_SECS", DEFAULT_DRAIN_TIMEOUT.as_secs())?;
        let with_tracing = match env::var("WITH_TRACING") {
            Ok(value) => parse_flag(&value).ok_or(Error::Config {
                var: "WITH_TRACING",
                value,
            })?,
            Err(_) => false,
        };

        Ok(Config {
            app_name,
            port,
            env: Environment::from_env(),
            with_tracing,
            otlp_endpoint: get_env_or("OTEL_EXPORTER_OTLP_ENDPOINT", DEFAULT_OTLP_ENDPOINT),
            drain_timeout: Duration::from_secs(drain_secs),
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.with_tracing = enabled;
        self
    }

    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// The app name as a Prometheus label value.
    pub fn service_label(&self) -> String {
        self.app_name.replace('-', "_")
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, Error> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Config { var, value }),
        Err(_) => Ok(default),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
