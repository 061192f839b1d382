use log::warn;
use scraper::Selector;

use crate::batch::{Migration, Transformed};
use crate::dedupe::{DedupeStats, ResourceDeduper};
use crate::error::{MigrateError, Result};
use crate::html;
use crate::record::Record;
use crate::store::{MediaLibrary, RemoteFetcher};

/// Finds external `<img src>` references and swaps them for imported copies.
pub struct ImageRewriter {
    selector: Selector,
}

impl ImageRewriter {
    pub fn new() -> Result<Self> {
        let selector = Selector::parse("img[src]").map_err(|error| {
            MigrateError::precondition(format!("invalid image selector: {error:?}"))
        })?;
        Ok(Self { selector })
    }

    /// Distinct `src` values in document order.
    pub fn image_sources(&self, content: &str) -> Vec<String> {
        let document = html::parse_fragment(content);
        let mut sources: Vec<String> = Vec::new();
        for element in document.select(&self.selector) {
            if let Some(src) = element.value().attr("src")
                && !sources.iter().any(|seen| seen == src)
            {
                sources.push(src.to_string());
            }
        }
        sources
    }

    /// Content with every external image replaced. All or nothing per record.
    pub fn rewrite<F, M>(
        &self,
        deduper: &mut ResourceDeduper<F>,
        media: &mut M,
        record: &Record,
    ) -> Result<String>
    where
        F: RemoteFetcher,
        M: MediaLibrary + ?Sized,
    {
        let mut replacements = Vec::new();
        let mut first_error = None;
        for src in self.image_sources(&record.content) {
            if !deduper.normalizer().is_external(&src) {
                continue;
            }
            match deduper.resolve(media, &src, record.id) {
                Ok(resource) => replacements.push((src, resource.url)),
                Err(error) => {
                    warn!("image {src} in record {} failed: {error}", record.id);
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        // Longest first so `../a.jpg` never clobbers part of `../../a.jpg`.
        replacements.sort_by(|left, right| right.0.len().cmp(&left.0.len()));
        let mut content = record.content.clone();
        for (src, url) in &replacements {
            content = content.replace(src.as_str(), url);
            let escaped = src.replace('&', "&amp;");
            if escaped != *src {
                content = content.replace(escaped.as_str(), url);
            }
        }
        Ok(content)
    }
}

pub struct ImageMigration<F> {
    rewriter: ImageRewriter,
    deduper: ResourceDeduper<F>,
}

impl<F: RemoteFetcher> ImageMigration<F> {
    pub fn new(deduper: ResourceDeduper<F>) -> Result<Self> {
        Ok(Self {
            rewriter: ImageRewriter::new()?,
            deduper,
        })
    }

    pub fn stats(&self) -> DedupeStats {
        self.deduper.stats()
    }

    pub fn imported(&self) -> usize {
        self.deduper.cached()
    }
}

impl<F, S> Migration<S> for ImageMigration<F>
where
    F: RemoteFetcher,
    S: MediaLibrary + ?Sized,
{
    fn label(&self) -> &str {
        "migrate images"
    }

    fn transform(&mut self, site: &mut S, record: &Record) -> Result<Transformed> {
        if record.content.trim().is_empty() {
            return Ok(Transformed::Unchanged);
        }
        let content = self.rewriter.rewrite(&mut self.deduper, site, record)?;
        if content == record.content {
            Ok(Transformed::Unchanged)
        } else {
            Ok(Transformed::Content(content))
        }
    }
}
