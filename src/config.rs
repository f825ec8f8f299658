use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

/// Minimum length of `SESSION_SECRET`, needed to derive the cookie signing key.
pub const MIN_SESSION_SECRET_LEN: usize = 32;

/// Application configuration loaded from environment variables
#[derive(Clone)]
pub struct Config {
    /// Address the HTTP server binds to. Default: 127.0.0.1
    pub host: String,

    /// Default: 3000
    pub port: u16,

    /// Public origin used to build the OAuth callback URL.
    /// When unset it is derived from each request's scheme and host.
    pub base_url: Option<String>,

    /// Cookie signing secret. A random key is generated per process when unset.
    pub session_secret: Option<String>,

    /// Send the session cookie only over HTTPS. Default: false
    pub cookie_secure: bool,

    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,

    /// Upload jobs running at the same time. Default: 2
    pub max_concurrent_uploads: usize,

    /// Items accepted in one submission. Default: 25
    pub max_bulk_items: usize,

    /// Jobs returned by the status listing. Default: 100
    pub job_status_limit: usize,

    /// Cap on jobs kept in memory. Unbounded when unset.
    pub max_retained_jobs: Option<usize>,

    /// Where downloads are staged before upload. Default: tmp
    pub staging_dir: PathBuf,

    /// Browser assets. Default: public
    pub static_dir: PathBuf,

    /// Per-job download limit. Default: 1 hour, `0` disables.
    pub fetch_timeout: Option<Duration>,

    /// Per-job upload limit. Default: 2 hours, `0` disables.
    pub publish_timeout: Option<Duration>,

    /// How long shutdown waits for running uploads. Default: 30 seconds
    pub shutdown_grace: Duration,

    /// Default: logs
    pub log_dir: String,

    /// Maximum JSON body size in bytes. Default: 2MB (2 * 1024 * 1024)
    pub max_payload_size: usize,
}

fn text(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    var(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    text(var, key)
        .map(|value| {
            value
                .parse()
                .map_err(|e| format!("{} has an invalid value {:?}: {}", key, value, e))
        })
        .transpose()
}

fn flag(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, String> {
    match text(var, key).map(|value| value.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(format!("{} must be true or false, got {:?}", key, other)),
    }
}

fn seconds(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Option<Duration>, String> {
    let secs = parse::<u64>(var, key)?.unwrap_or(default);
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// A `.env` file is read first when present. Every variable is optional;
    /// see the field docs for defaults. Values are parsed but not cross-checked,
    /// call [`Config::validate`] once command-line overrides are applied.
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists
        dotenv::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup.
    pub fn from_source(var: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = &var;
        Ok(Config {
            host: text(var, "HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse(var, "PORT")?.unwrap_or(3000),
            base_url: text(var, "BASE_URL").map(|url| url.trim_end_matches('/').to_string()),
            session_secret: text(var, "SESSION_SECRET"),
            cookie_secure: flag(var, "COOKIE_SECURE", false)?,
            google_client_id: text(var, "GOOGLE_CLIENT_ID"),
            google_client_secret: text(var, "GOOGLE_CLIENT_SECRET"),
            max_concurrent_uploads: parse(var, "MAX_CONCURRENT_UPLOADS")?.unwrap_or(2),
            max_bulk_items: parse(var, "MAX_BULK_ITEMS")?.unwrap_or(25),
            job_status_limit: parse(var, "JOB_STATUS_LIMIT")?.unwrap_or(100),
            max_retained_jobs: parse(var, "MAX_RETAINED_JOBS")?,
            staging_dir: text(var, "STAGING_DIR").unwrap_or_else(|| "tmp".to_string()).into(),
            static_dir: text(var, "STATIC_DIR").unwrap_or_else(|| "public".to_string()).into(),
            fetch_timeout: seconds(var, "FETCH_TIMEOUT_SECS", 60 * 60)?,
            publish_timeout: seconds(var, "PUBLISH_TIMEOUT_SECS", 2 * 60 * 60)?,
            shutdown_grace: Duration::from_secs(parse(var, "SHUTDOWN_GRACE_SECS")?.unwrap_or(30)),
            log_dir: text(var, "LOG_DIR").unwrap_or_else(|| "logs".to_string()),
            max_payload_size: parse(var, "MAX_PAYLOAD_SIZE")?.unwrap_or(2 * 1024 * 1024),
        })
    }

    /// Check limits and cross-field rules.
    pub fn validate(&self) -> Result<(), String> {
        for (key, value) in [
            ("MAX_CONCURRENT_UPLOADS", self.max_concurrent_uploads),
            ("MAX_BULK_ITEMS", self.max_bulk_items),
            ("JOB_STATUS_LIMIT", self.job_status_limit),
            ("MAX_PAYLOAD_SIZE", self.max_payload_size),
        ] {
            if value == 0 {
                return Err(format!("{} must be at least 1", key));
            }
        }

        if self.max_retained_jobs == Some(0) {
            return Err("MAX_RETAINED_JOBS must be at least 1 when set".to_string());
        }

        if let Some(secret) = &self.session_secret {
            if secret.len() < MIN_SESSION_SECRET_LEN {
                return Err(format!(
                    "SESSION_SECRET must be at least {} bytes long",
                    MIN_SESSION_SECRET_LEN
                ));
            }
        }

        if let Some(base_url) = &self.base_url {
            let parsed = Url::parse(base_url).map_err(|e| format!("BASE_URL is not a valid URL: {}", e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err("BASE_URL must use http or https".to_string());
            }
        }

        Ok(())
    }
}
