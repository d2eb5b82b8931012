use serde::Deserialize;
use std::{env, time::Duration};

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
	pub database_url: String,
	pub hostname: String,
	pub smtp: SmtpConfig,
	pub worker: WorkerConfig,
	pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SmtpConfig {
	pub host: String,
	pub port: u16,
	pub user: Option<String>,
	pub pass: Option<String>,
	pub tls: TlsMode,
	pub allow_invalid_certs: bool,
	pub timeout: Duration,
	pub max_connections: usize,
	pub from_default: String,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
	Required,
	Opportunistic,
	None,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WorkerConfig {
	pub concurrency: usize,
	pub max_retries: u32,
	pub retry_delay: Duration,
	pub poll_interval: Duration,
	pub max_webhook_retries: u32,
	pub visibility_timeout: Duration,
	pub shutdown_grace: Duration,
	pub dkim_cache_ttl: Duration,
	pub debug: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
	pub enabled: bool,
	pub otlp_endpoint: String,
	pub service_name: String,
	pub sample_ratio: f64,
	pub console_logs: bool,
}

impl Config {
	pub fn from_env() -> Result<Self, ConfigError> {
		let database_url = env::var("DATABASE_URL")
			.ok()
			.filter(|v| !v.trim().is_empty())
			.ok_or(ConfigError::Missing("DATABASE_URL"))?;

		let smtp = SmtpConfig {
			host: env_var("SMTP_HOST", "localhost"),
			port: env_parse("SMTP_PORT", 587u16),
			user: env::var("SMTP_USER").ok().filter(|v| !v.is_empty()),
			pass: env::var("SMTP_PASS").ok().filter(|v| !v.is_empty()),
			tls: parse_tls_mode(&env_var("SMTP_TLS", "opportunistic"))?,
			allow_invalid_certs: env_parse_bool("SMTP_ALLOW_INVALID_CERTS", false),
			timeout: Duration::from_secs(env_parse("SMTP_TIMEOUT_SECS", 30u64)),
			max_connections: env_parse("SMTP_MAX_CONNECTIONS", 8usize).clamp(1, 64),
			from_default: env_var("SMTP_FROM_DEFAULT", "no-reply@localhost"),
		};

		let poll_interval_ms = env_parse("POLL_INTERVAL_MS", 5_000u64).max(1_000);
		let worker = WorkerConfig {
			concurrency: env_parse("WORKER_CONCURRENCY", 10usize).clamp(1, 100),
			max_retries: env_parse("MAX_RETRIES", 3u32).min(10),
			retry_delay: Duration::from_millis(env_parse("RETRY_DELAY_MS", 5_000u64).max(1_000)),
			poll_interval: Duration::from_millis(poll_interval_ms),
			max_webhook_retries: env_parse("MAX_WEBHOOK_RETRIES", 5u32),
			visibility_timeout: Duration::from_millis(
				env_parse("VISIBILITY_TIMEOUT_MS", poll_interval_ms).max(1_000),
			),
			shutdown_grace: Duration::from_millis(env_parse("SHUTDOWN_GRACE_MS", 30_000u64)),
			dkim_cache_ttl: Duration::from_secs(env_parse("DKIM_CACHE_TTL_SECS", 300u64).min(300)),
			debug: env_parse_bool("DEBUG", false),
		};

		let telemetry = TelemetryConfig {
			enabled: env_parse_bool("TELEMETRY_ENABLED", false),
			otlp_endpoint: env_var("TELEMETRY_OTLP_ENDPOINT", "http://localhost:4318/v1/traces"),
			service_name: env_var("TELEMETRY_SERVICE_NAME", "courier"),
			sample_ratio: env_parse("TELEMETRY_SAMPLE_RATIO", 1.0f64),
			console_logs: env_parse_bool("TELEMETRY_CONSOLE_LOGS", true),
		};

		Ok(Self {
			database_url,
			hostname: env_var("COURIER_HOSTNAME", "courier.localhost"),
			smtp,
			worker,
			telemetry,
		})
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("missing required environment variable {0}")]
	Missing(&'static str),

	#[error("invalid value for {key}: {value}")]
	Invalid { key: &'static str, value: String },
}

fn parse_tls_mode(value: &str) -> Result<TlsMode, ConfigError> {
	match value.trim().to_ascii_lowercase().as_str() {
		"required" | "starttls" => Ok(TlsMode::Required),
		"opportunistic" => Ok(TlsMode::Opportunistic),
		"none" | "off" | "plain" => Ok(TlsMode::None),
		other => Err(ConfigError::Invalid {
			key: "SMTP_TLS",
			value: other.to_string(),
		}),
	}
}

fn env_var(key: &str, fallback: &str) -> String {
	env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
	env::var(key)
		.ok()
		.and_then(|v| v.parse::<T>().ok())
		.unwrap_or(fallback)
}

fn env_parse_bool(key: &str, fallback: bool) -> bool {
	env::var(key)
		.ok()
		.map(|v| {
			matches!(
				v.trim().to_ascii_lowercase().as_str(),
				"1" | "true" | "yes" | "on"
			)
		})
		.unwrap_or(fallback)
}
