use crate::services::{
    queue_client::QueueSettings, transport::TransportPolicy, validation::ValidationPolicy,
};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};
use thiserror::Error;

const ENV_PREFIX: &str = "FILE_INGEST_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: String, value: String },
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub queue_database_url: String,

    pub region: String,
    pub bucket: String,
    pub queue_name: String,
    pub max_filesize_kb: u64,
    pub allowed_extensions: Vec<String>,
    pub retry_attempts: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,

    pub expected_subtype: String,
    pub content_sniff: bool,
    pub allowed_mime_types: Vec<String>,
    pub visibility_timeout: Duration,
    pub delivery_delay: Duration,
    pub worker_poll_interval: Duration,
}

/// Command-line + environment configuration. Every flag falls back to the
/// `FILE_INGEST_<FLAG>` environment variable.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Document ingestion service")]
pub struct Args {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Directory holding the object store buckets
    #[arg(long)]
    pub storage_dir: Option<String>,
    /// Metadata database URL
    #[arg(long)]
    pub database_url: Option<String>,
    /// Queue database URL
    #[arg(long)]
    pub queue_database_url: Option<String>,

    #[arg(long)]
    pub region: Option<String>,
    #[arg(long)]
    pub bucket: Option<String>,
    #[arg(long)]
    pub queue_name: Option<String>,
    #[arg(long)]
    pub max_filesize_kb: Option<u64>,
    /// Comma separated, e.g. `pdf,docx`
    #[arg(long)]
    pub allowed_extensions: Option<String>,
    #[arg(long)]
    pub retry_attempts: Option<u32>,
    /// Seconds
    #[arg(long)]
    pub connect_timeout: Option<f64>,
    /// Seconds
    #[arg(long)]
    pub read_timeout: Option<f64>,

    #[arg(long)]
    pub expected_subtype: Option<String>,
    #[arg(long)]
    pub content_sniff: Option<bool>,
    #[arg(long)]
    pub allowed_mime_types: Option<String>,
    #[arg(long)]
    pub visibility_timeout: Option<f64>,
    #[arg(long)]
    pub delivery_delay: Option<f64>,
    #[arg(long)]
    pub worker_poll_interval: Option<f64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_key(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.to_ascii_uppercase())
}

/// Resolves each key from the CLI first, then the environment.
struct Source<L> {
    lookup: L,
    missing: Vec<String>,
}

impl<L> Source<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str, cli: Option<String>) -> Option<String> {
        cli.or_else(|| (self.lookup)(&env_key(key)))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, value: String) -> Result<T, ConfigError> {
        value.parse::<T>().map_err(|_| ConfigError::Invalid {
            key: env_key(key),
            value,
        })
    }

    fn optional<T: FromStr>(
        &self,
        key: &str,
        cli: Option<T>,
        default: T,
    ) -> Result<T, ConfigError> {
        if let Some(value) = cli {
            return Ok(value);
        }
        match self.raw(key, None) {
            Some(value) => self.parse(key, value),
            None => Ok(default),
        }
    }

    /// Records the key as missing and yields `None` when absent.
    fn required<T: FromStr>(&mut self, key: &str, cli: Option<T>) -> Result<Option<T>, ConfigError> {
        if cli.is_some() {
            return Ok(cli);
        }
        match self.raw(key, None) {
            Some(value) => self.parse(key, value).map(Some),
            None => {
                self.missing.push(env_key(key));
                Ok(None)
            }
        }
    }

    fn seconds(&self, key: &str, value: f64, allow_zero: bool) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(value)
            .ok()
            .filter(|d| allow_zero || !d.is_zero())
            .ok_or_else(|| ConfigError::Invalid {
                key: env_key(key),
                value: value.to_string(),
            })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool), ConfigError> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over the variables reachable through `lookup`.
    ///
    /// All missing required keys are collected into one error.
    pub fn resolve<L>(args: Args, lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut src = Source {
            lookup,
            missing: Vec::new(),
        };

        let region = src.required::<String>("region", args.region)?;
        let bucket = src.required::<String>("bucket", args.bucket)?;
        let queue_name = src.required::<String>("queue_name", args.queue_name)?;
        let max_filesize_kb = src.required::<u64>("max_filesize_kb", args.max_filesize_kb)?;
        let allowed_extensions =
            src.required::<String>("allowed_extensions", args.allowed_extensions)?;
        let retry_attempts = src.required::<u32>("retry_attempts", args.retry_attempts)?;
        let connect_timeout = src.required::<f64>("connect_timeout", args.connect_timeout)?;
        let read_timeout = src.required::<f64>("read_timeout", args.read_timeout)?;

        let (
            Some(region),
            Some(bucket),
            Some(queue_name),
            Some(max_filesize_kb),
            Some(allowed_extensions),
            Some(retry_attempts),
            Some(connect_timeout),
            Some(read_timeout),
        ) = (
            region,
            bucket,
            queue_name,
            max_filesize_kb,
            allowed_extensions,
            retry_attempts,
            connect_timeout,
            read_timeout,
        )
        else {
            return Err(ConfigError::Missing(src.missing));
        };

        let allowed_extensions = split_list(&allowed_extensions);
        if allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid {
                key: env_key("allowed_extensions"),
                value: String::new(),
            });
        }
        if retry_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: env_key("retry_attempts"),
                value: "0".into(),
            });
        }

        let allowed_mime_types = match src.raw("allowed_mime_types", args.allowed_mime_types) {
            Some(raw) => split_list(&raw),
            None => vec!["application/pdf".to_string()],
        };

        Ok(Self {
            host: src
                .raw("host", args.host)
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: src.optional("port", args.port, 3000)?,
            storage_dir: src
                .raw("storage_dir", args.storage_dir)
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: src
                .raw("database_url", args.database_url)
                .unwrap_or_else(|| "sqlite://./data/meta/file_ingest.db".into()),
            queue_database_url: src
                .raw("queue_database_url", args.queue_database_url)
                .unwrap_or_else(|| "sqlite://./data/queue/queue.db".into()),
            region,
            bucket,
            queue_name,
            max_filesize_kb,
            allowed_extensions,
            retry_attempts,
            connect_timeout: src.seconds("connect_timeout", connect_timeout, false)?,
            read_timeout: src.seconds("read_timeout", read_timeout, false)?,
            expected_subtype: src
                .raw("expected_subtype", args.expected_subtype)
                .unwrap_or_else(|| "pdf".into()),
            content_sniff: src.optional("content_sniff", args.content_sniff, true)?,
            allowed_mime_types,
            visibility_timeout: {
                let secs = src.optional("visibility_timeout", args.visibility_timeout, 30.0)?;
                src.seconds("visibility_timeout", secs, false)?
            },
            delivery_delay: {
                let secs = src.optional("delivery_delay", args.delivery_delay, 3.0)?;
                src.seconds("delivery_delay", secs, true)?
            },
            worker_poll_interval: {
                let secs = src.optional("worker_poll_interval", args.worker_poll_interval, 1.0)?;
                src.seconds("worker_poll_interval", secs, false)?
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transport_policy(&self) -> TransportPolicy {
        TransportPolicy::new(self.retry_attempts, self.connect_timeout, self.read_timeout)
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy::new(
            self.max_filesize_kb,
            &self.allowed_extensions,
            &self.expected_subtype,
        )
        .with_content_sniff(self.content_sniff, self.allowed_mime_types.clone())
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout: self.visibility_timeout,
            delivery_delay: self.delivery_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("FILE_INGEST_REGION", "eu-central-1"),
        ("FILE_INGEST_BUCKET", "documents"),
        ("FILE_INGEST_QUEUE_NAME", "file-processing"),
        ("FILE_INGEST_MAX_FILESIZE_KB", "1024"),
        ("FILE_INGEST_ALLOWED_EXTENSIONS", "pdf, DOCX"),
        ("FILE_INGEST_RETRY_ATTEMPTS", "3"),
        ("FILE_INGEST_CONNECT_TIMEOUT", "5"),
        ("FILE_INGEST_READ_TIMEOUT", "10"),
    ];

    #[test]
    fn resolves_required_keys_and_defaults() {
        let cfg = AppConfig::resolve(Args::default(), env(REQUIRED)).unwrap();
        assert_eq!(cfg.bucket, "documents");
        assert_eq!(cfg.allowed_extensions, vec!["pdf", "DOCX"]);
        assert_eq!(cfg.read_timeout, Duration::from_secs(10));
        assert_eq!(cfg.port, 3000);
        assert!(cfg.content_sniff);
        assert_eq!(cfg.delivery_delay, Duration::from_secs(3));
        assert_eq!(
            cfg.validation_policy().allowed_extensions,
            vec!["pdf", "docx"]
        );
    }

    #[test]
    fn cli_wins_over_environment() {
        let args = Args {
            bucket: Some("override".into()),
            port: Some(8080),
            ..Args::default()
        };
        let cfg = AppConfig::resolve(args, env(REQUIRED)).unwrap();
        assert_eq!(cfg.bucket, "override");
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn every_missing_key_is_reported() {
        let partial: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| !k.ends_with("BUCKET") && !k.ends_with("READ_TIMEOUT"))
            .collect();
        let err = AppConfig::resolve(Args::default(), env(&partial)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec![
                "FILE_INGEST_BUCKET".into(),
                "FILE_INGEST_READ_TIMEOUT".into()
            ])
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.retain(|(k, _)| *k != "FILE_INGEST_RETRY_ATTEMPTS");
        vars.push(("FILE_INGEST_RETRY_ATTEMPTS", "many"));
        let err = AppConfig::resolve(Args::default(), env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "FILE_INGEST_RETRY_ATTEMPTS"));
    }
}
