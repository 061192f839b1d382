use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{
    Backend, DEFAULT_CONFIG_FILENAME, MigrateConfig, SiteSection, load_config,
};
use crate::error::MigrateError;
use crate::fetch::{HttpClientConfig, HttpFetcher};
use crate::rest::{WpRestClient, WpRestConfig};
use crate::sqlite::{WpSqliteConfig, WpSqliteStore};
use crate::store::WordPressSite;

pub const CONFIG_ENV_VAR: &str = "WPMIGRATE_CONFIG";
pub const APP_PASSWORD_ENV_VAR: &str = "WP_APP_PASSWORD";
pub const DEFAULT_SITE_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

/// Loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct MigrateRuntime {
    pub config: MigrateConfig,
    pub config_path: PathBuf,
    pub config_source: ValueSource,
    app_password: Option<String>,
}

impl MigrateRuntime {
    pub fn load(context: &ResolutionContext, config_flag: Option<&Path>) -> Result<Self> {
        Self::load_with_lookup(context, config_flag, |key| env::var(key).ok())
    }

    fn load_with_lookup<F>(
        context: &ResolutionContext,
        config_flag: Option<&Path>,
        lookup_env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config_path, config_source) = resolve_config_path(context, config_flag, &lookup_env);
        if config_source != ValueSource::Default && !config_path.exists() {
            anyhow::bail!("config file not found: {}", normalize_for_display(&config_path));
        }
        let mut config = load_config(&config_path)?;
        config.apply_env_overrides(&lookup_env)?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", normalize_for_display(&config_path)))?;
        let app_password = lookup_env(APP_PASSWORD_ENV_VAR)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(Self {
            config,
            config_path,
            config_source,
            app_password,
        })
    }

    pub fn diagnostics(&self) -> String {
        let site = &self.config.site;
        format!(
            "config_path={} ({})\nbackend={}\nsite_url={}\ndatabase={}\ntable_prefix={}\nmultisite={}\nusername={}\napp_password={}\nuser_agent={}\nimage_base_url={}\ncategory_rules={}",
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            site.backend.as_str(),
            site.url.as_deref().unwrap_or("<unset>"),
            site.database.as_deref().unwrap_or("<unset>"),
            site.table_prefix,
            site.multisite,
            site.username.as_deref().unwrap_or("<unset>"),
            if self.app_password.is_some() { "set" } else { "<unset>" },
            site.user_agent(),
            self.config.images.base_url,
            self.config.categories.rules.len(),
        )
    }

    /// Open the configured backend for `site_id`.
    pub fn open_site(&self, site_id: u64) -> Result<Box<dyn WordPressSite>> {
        match self.config.site.backend {
            Backend::Rest => {
                let rest = WpRestConfig::from_config(&self.config, site_id, self.app_password.clone())?;
                Ok(Box::new(WpRestClient::new(rest)?))
            }
            Backend::Sqlite => {
                let sqlite = WpSqliteConfig::from_config(&self.config, site_id)?;
                Ok(Box::new(WpSqliteStore::open(sqlite)?))
            }
        }
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig::from_config(&self.config))
    }
}

/// `--config` wins over `WPMIGRATE_CONFIG`, which wins over `./wpmigrate.toml`.
pub fn resolve_config_path<F>(
    context: &ResolutionContext,
    config_flag: Option<&Path>,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = config_flag {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env(CONFIG_ENV_VAR)
        && !value.trim().is_empty()
    {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }
    (
        context.cwd.join(DEFAULT_CONFIG_FILENAME),
        ValueSource::Default,
    )
}

/// Pick the target site. A multisite network demands an explicit id when
/// `require_explicit` is set; otherwise site 1 is assumed.
pub fn select_site(
    site: &SiteSection,
    requested: Option<u64>,
    require_explicit: bool,
) -> crate::error::Result<u64> {
    match requested {
        Some(0) => Err(MigrateError::precondition("site id must be a positive integer")),
        Some(id) => {
            if !site.multisite && id != DEFAULT_SITE_ID {
                return Err(MigrateError::precondition(format!(
                    "site {id} requested but [site] multisite is false"
                )));
            }
            Ok(id)
        }
        None if site.multisite && require_explicit => Err(MigrateError::precondition(
            "this is a multisite network; pass the site id to operate on",
        )),
        None => Ok(DEFAULT_SITE_ID),
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
