use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::dedupe::RewriteStrategy;
use crate::record::StatusFilter;

pub const DEFAULT_USER_AGENT: &str = "wpmigrate/0.1";
pub const DEFAULT_CONFIG_FILENAME: &str = "wpmigrate.toml";
pub const DEFAULT_TABLE_PREFIX: &str = "wp_";
pub const DEFAULT_IMAGE_BASE_URL: &str = "https://example.com/";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub query: QuerySection,
    #[serde(default)]
    pub images: ImagesSection,
    #[serde(default)]
    pub categories: CategoriesSection,
    #[serde(default)]
    pub cleaner: CleanerConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Rest,
    Sqlite,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SiteSection {
    pub backend: Backend,
    pub url: Option<String>,
    pub username: Option<String>,
    pub database: Option<String>,
    pub uploads_dir: Option<String>,
    pub uploads_url: Option<String>,
    pub table_prefix: String,
    pub multisite: bool,
    pub user_agent: Option<String>,
    pub sites: Vec<SiteEntry>,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            backend: Backend::Rest,
            url: None,
            username: None,
            database: None,
            uploads_dir: None,
            uploads_url: None,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            multisite: false,
            user_agent: None,
            sites: Vec::new(),
        }
    }
}

impl SiteSection {
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Per-site URL on a REST multisite network, falling back to `url`.
    pub fn url_for_site(&self, site_id: u64) -> Option<String> {
        self.sites
            .iter()
            .find(|entry| entry.id == site_id)
            .map(|entry| entry.url.clone())
            .or_else(|| self.url.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SiteEntry {
    pub id: u64,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub rate_limit_ms: u64,
    pub max_download_bytes: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 2,
            retry_delay_ms: 500,
            rate_limit_ms: 0,
            max_download_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuerySection {
    pub post_types: Vec<String>,
    pub status: StatusFilter,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            post_types: vec!["post".to_string(), "page".to_string()],
            status: StatusFilter::Any,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImagesSection {
    pub base_url: String,
    pub patterns: Vec<PatternEntry>,
}

impl Default for ImagesSection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_IMAGE_BASE_URL.to_string(),
            patterns: vec![
                PatternEntry {
                    regex: r"(\.\./)".to_string(),
                    strategy: RewriteStrategy::ReplaceMatch,
                },
                PatternEntry {
                    regex: r"^(/images/)".to_string(),
                    strategy: RewriteStrategy::PrefixBase,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PatternEntry {
    pub regex: String,
    pub strategy: RewriteStrategy,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CategoriesSection {
    pub taxonomy: String,
    /// Keep existing terms instead of replacing them.
    pub append: bool,
    pub rules: Vec<CategoryRuleEntry>,
}

impl Default for CategoriesSection {
    fn default() -> Self {
        Self {
            taxonomy: "category".to_string(),
            append: false,
            rules: vec![
                CategoryRuleEntry {
                    name: "NFL".to_string(),
                    parent: Some(840),
                    patterns: vec![r"/\b(nfl)\b/i".to_string()],
                },
                CategoryRuleEntry {
                    name: "NBA".to_string(),
                    parent: Some(840),
                    patterns: vec![r"/\b(nba)\b/i".to_string()],
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CategoryRuleEntry {
    pub name: String,
    pub parent: Option<u64>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanerConfig {
    pub post_types: Vec<String>,
    pub status: StatusFilter,
    pub strip_attributes: Vec<String>,
    pub strip_elements: Vec<String>,
    pub smart_quotes: bool,
    pub repair_markup: bool,
    pub prune_empty: bool,
    /// Refuse markup with parse errors instead of rewriting it.
    pub strict_markup: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            post_types: vec!["post".to_string()],
            status: StatusFilter::Publish,
            strip_attributes: vec!["style".to_string()],
            strip_elements: vec!["script".to_string()],
            smart_quotes: true,
            repair_markup: true,
            prune_empty: false,
            strict_markup: false,
        }
    }
}

impl MigrateConfig {
    /// Apply `WP_*` environment overrides on top of file values.
    pub fn apply_env_overrides<F>(&mut self, lookup_env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = lookup("WP_URL") {
            self.site.url = Some(value);
        }
        if let Some(value) = lookup("WP_USERNAME") {
            self.site.username = Some(value);
        }
        if let Some(value) = lookup("WP_USER_AGENT") {
            self.site.user_agent = Some(value);
        }
        if let Some(value) = lookup("WP_DATABASE") {
            self.site.database = Some(value);
            self.site.backend = Backend::Sqlite;
        }
        if let Some(value) = lookup("WP_HTTP_TIMEOUT_MS") {
            self.http.timeout_ms = value
                .parse()
                .with_context(|| format!("WP_HTTP_TIMEOUT_MS must be an integer, got {value}"))?;
        }
        if let Some(value) = lookup("WP_HTTP_RETRIES") {
            self.http.retries = value
                .parse()
                .with_context(|| format!("WP_HTTP_RETRIES must be an integer, got {value}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.timeout_ms == 0 {
            bail!("[http] timeout_ms must be greater than zero");
        }
        if self.categories.taxonomy.trim().is_empty() {
            bail!("[categories] taxonomy cannot be empty");
        }
        for rule in &self.categories.rules {
            if rule.name.trim().is_empty() {
                bail!("[[categories.rules]] name cannot be empty");
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.site.sites {
            if !seen.insert(entry.id) {
                bail!("[[site.sites]] lists site id {} more than once", entry.id);
            }
        }
        Ok(())
    }
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
