use crate::services::{
    error::{StoreError, StoreResult},
    part_size::PartSizeLimits,
    reconciler::DEFAULT_ORPHAN_GRACE,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Layout and limits of an upload store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prefix state records are written under.
    pub state_prefix: String,
    /// Prefix assembled objects are written under.
    pub object_prefix: String,
    pub part_limits: PartSizeLimits,
    /// Expiration given to new uploads. `None` keeps them forever.
    pub default_ttl: Option<Duration>,
    /// Minimum age before an unreferenced multipart handle is aborted.
    /// `Duration::ZERO` aborts every unreferenced handle on the next pass.
    pub orphan_grace: Duration,
    /// Keys requested per listing page.
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_prefix: "uploads/info/".into(),
            object_prefix: "uploads/files/".into(),
            part_limits: PartSizeLimits::default(),
            default_ttl: None,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
            page_size: crate::backend::DEFAULT_PAGE_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> StoreResult<()> {
        if self.state_prefix == self.object_prefix {
            return Err(StoreError::InvalidConfig(format!(
                "state and object prefix must differ (both `{}`)",
                self.state_prefix
            )));
        }
        if self.page_size == 0 {
            return Err(StoreError::InvalidConfig("page size must be positive".into()));
        }
        self.part_limits.validate().map_err(StoreError::InvalidConfig)
    }

    /// One prefix contains the other. Accepted, but listings of the outer
    /// namespace will walk the inner one too.
    pub fn prefixes_nested(&self) -> bool {
        self.state_prefix.starts_with(&self.object_prefix)
            || self.object_prefix.starts_with(&self.state_prefix)
    }
}

/// Daemon configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub sweep_interval: Duration,
    pub store: StoreConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable upload store over multipart object storage")]
pub struct Args {
    /// Host to bind to (overrides TUS_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TUS_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides TUS_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TUS_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Prefix for upload state records (overrides TUS_STORE_STATE_PREFIX)
    #[arg(long)]
    pub state_prefix: Option<String>,

    /// Prefix for assembled uploads (overrides TUS_STORE_OBJECT_PREFIX)
    #[arg(long)]
    pub object_prefix: Option<String>,

    /// Preferred part size in bytes (overrides TUS_STORE_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<u64>,

    /// Seconds until a new upload expires, 0 for never (overrides TUS_STORE_TTL_SECS)
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    /// Seconds between expiration sweeps (overrides TUS_STORE_SWEEP_SECS)
    #[arg(long)]
    pub sweep_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over the variables `lookup` resolves.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = args
            .host
            .or_else(|| lookup("TUS_STORE_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&lookup, "TUS_STORE_PORT")?.unwrap_or(3000),
        };
        let storage_dir = args
            .storage_dir
            .or_else(|| lookup("TUS_STORE_STORAGE_DIR"))
            .unwrap_or_else(|| "./data/uploads".into());
        let database_url = args
            .database_url
            .or_else(|| lookup("TUS_STORE_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/uploads.db".into());

        let mut store = StoreConfig::default();
        if let Some(prefix) = args.state_prefix.or_else(|| lookup("TUS_STORE_STATE_PREFIX")) {
            store.state_prefix = prefix;
        }
        if let Some(prefix) = args.object_prefix.or_else(|| lookup("TUS_STORE_OBJECT_PREFIX")) {
            store.object_prefix = prefix;
        }
        let part_size = match args.part_size {
            Some(size) => Some(size),
            None => parse_var(&lookup, "TUS_STORE_PART_SIZE")?,
        };
        if let Some(size) = part_size {
            store.part_limits.preferred_part_size = size;
        }
        let ttl_secs = match args.ttl_secs {
            Some(secs) => Some(secs),
            None => parse_var(&lookup, "TUS_STORE_TTL_SECS")?,
        };
        store.default_ttl = ttl_secs.filter(|s| *s > 0).map(Duration::from_secs);

        let sweep_secs = match args.sweep_secs {
            Some(secs) => secs,
            None => parse_var(&lookup, "TUS_STORE_SWEEP_SECS")?.unwrap_or(300),
        };
        if sweep_secs == 0 {
            anyhow::bail!("sweep interval must be positive");
        }

        store.validate().context("validating store configuration")?;

        Ok(Self {
            host,
            port,
            storage_dir,
            database_url,
            sweep_interval: Duration::from_secs(sweep_secs),
            store,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}
