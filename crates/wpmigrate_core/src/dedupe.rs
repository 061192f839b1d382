//! Per-run memo of external resource imports.
//!
//! A source URL is normalized first, and the normalized form is the cache key.
//! Two spellings of the same asset (`../a.jpg` and `../../a.jpg`) therefore share
//! one download. Failures are never cached, so a later reference retries.

use std::collections::HashMap;

use log::{debug, info};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::ImagesSection;
use crate::error::{MigrateError, Result};
use crate::record::RecordId;
use crate::store::{MediaLibrary, RemoteFetcher, ResourceId};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpe", "jpeg", "gif", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteStrategy {
    /// Drop every match and join the remainder onto the base URL.
    ReplaceMatch,
    /// Prepend the base URL (without its trailing slash) to the whole src.
    PrefixBase,
}

#[derive(Debug, Clone)]
pub struct ExternalPattern {
    pub regex: Regex,
    pub strategy: RewriteStrategy,
}

#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    base_url: String,
    patterns: Vec<ExternalPattern>,
}

impl UrlNormalizer {
    pub fn new(base_url: impl Into<String>, patterns: Vec<ExternalPattern>) -> Self {
        Self {
            base_url: base_url.into(),
            patterns,
        }
    }

    pub fn from_config(images: &ImagesSection) -> Result<Self> {
        let mut patterns = Vec::with_capacity(images.patterns.len());
        for entry in &images.patterns {
            let regex = Regex::new(&entry.regex).map_err(|error| {
                MigrateError::precondition(format!(
                    "invalid image pattern {}: {error}",
                    entry.regex
                ))
            })?;
            patterns.push(ExternalPattern {
                regex,
                strategy: entry.strategy,
            });
        }
        if Url::parse(&images.base_url).is_err() {
            return Err(MigrateError::precondition(format!(
                "images base_url is not an absolute URL: {}",
                images.base_url
            )));
        }
        Ok(Self::new(images.base_url.clone(), patterns))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_external(&self, src: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.regex.is_match(src))
    }

    /// `Ok(None)` for srcs no pattern claims.
    pub fn normalize(&self, src: &str) -> Result<Option<String>> {
        let Some(pattern) = self
            .patterns
            .iter()
            .find(|pattern| pattern.regex.is_match(src))
        else {
            return Ok(None);
        };

        let joined = match pattern.strategy {
            RewriteStrategy::ReplaceMatch => {
                let remainder = pattern.regex.replace_all(src, "");
                format!(
                    "{}/{}",
                    self.base_url.trim_end_matches('/'),
                    remainder.trim_start_matches('/')
                )
            }
            RewriteStrategy::PrefixBase => {
                format!("{}{}", self.base_url.trim_end_matches('/'), src)
            }
        };

        match Url::parse(&joined) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Some(url.to_string())),
            Ok(url) => Err(MigrateError::fetch(
                joined.clone(),
                format!("unsupported scheme {}", url.scheme()),
            )),
            Err(error) => Err(MigrateError::fetch(joined, error)),
        }
    }
}

/// File name for the media library, or `None` when the URL is not a supported image.
pub fn image_filename(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, extension) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    let extension = extension.to_ascii_lowercase();
    IMAGE_EXTENSIONS
        .contains(&extension.as_str())
        .then(|| name.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedResource {
    pub id: ResourceId,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupeStats {
    pub fetched: usize,
    pub cache_hits: usize,
    pub failures: usize,
}

pub struct ResourceDeduper<F> {
    normalizer: UrlNormalizer,
    fetcher: F,
    cache: HashMap<String, ImportedResource>,
    stats: DedupeStats,
}

impl<F: RemoteFetcher> ResourceDeduper<F> {
    pub fn new(normalizer: UrlNormalizer, fetcher: F) -> Self {
        Self {
            normalizer,
            fetcher,
            cache: HashMap::new(),
            stats: DedupeStats::default(),
        }
    }

    pub fn normalizer(&self) -> &UrlNormalizer {
        &self.normalizer
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn stats(&self) -> DedupeStats {
        self.stats
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Import `src` once per run and return the media library's copy.
    pub fn resolve<M: MediaLibrary + ?Sized>(
        &mut self,
        media: &mut M,
        src: &str,
        attach_to: RecordId,
    ) -> Result<ImportedResource> {
        let url = match self.normalizer.normalize(src) {
            Ok(Some(url)) => url,
            Ok(None) => return Err(MigrateError::fetch(src, "not an external resource")),
            Err(error) => {
                self.stats.failures += 1;
                return Err(error);
            }
        };

        if let Some(hit) = self.cache.get(&url) {
            debug!("cache hit for {url} -> resource {}", hit.id);
            self.stats.cache_hits += 1;
            return Ok(hit.clone());
        }

        match self.import(media, &url, attach_to) {
            Ok(resource) => {
                info!("imported {url} as resource {}", resource.id);
                self.stats.fetched += 1;
                self.cache.insert(url, resource.clone());
                Ok(resource)
            }
            Err(error) => {
                self.stats.failures += 1;
                Err(error)
            }
        }
    }

    fn import<M: MediaLibrary + ?Sized>(
        &mut self,
        media: &mut M,
        url: &str,
        attach_to: RecordId,
    ) -> Result<ImportedResource> {
        let filename = image_filename(url)
            .ok_or_else(|| MigrateError::register(url, "unsupported image format"))?;
        let file = self.fetcher.download(url)?;
        let id = media.sideload(&file, &filename, attach_to)?;
        let public_url = media.resource_url(id)?;
        if public_url.trim().is_empty() {
            return Err(MigrateError::register(
                filename,
                format!("resource {id} has no public URL"),
            ));
        }
        Ok(ImportedResource {
            id,
            url: public_url,
        })
    }
}
