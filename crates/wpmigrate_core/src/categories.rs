use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use regex::Regex;

use crate::batch::{Migration, Transformed};
use crate::config::CategoriesSection;
use crate::error::{MigrateError, Result};
use crate::record::Record;
use crate::store::{CategoryId, TaxonomyStore, TermAssignment};

const PATTERN_DELIMITERS: &str = "/#~@!%|+;";

/// Compile a title pattern. Accepts PHP-style `/body/flags` or a bare regex.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    let source = match split_delimited(pattern) {
        Some((body, flags)) => {
            let mut inline = String::new();
            for flag in flags.chars() {
                match flag {
                    'i' | 'm' | 's' | 'x' | 'U' => {
                        if !inline.contains(flag) {
                            inline.push(flag);
                        }
                    }
                    'u' => {}
                    other => {
                        return Err(MigrateError::precondition(format!(
                            "unsupported modifier '{other}' in pattern {pattern}"
                        )));
                    }
                }
            }
            if inline.is_empty() {
                body.to_string()
            } else {
                format!("(?{inline}){body}")
            }
        }
        None => pattern.to_string(),
    };
    Regex::new(&source).map_err(|error| {
        MigrateError::precondition(format!("invalid pattern {pattern}: {error}"))
    })
}

fn split_delimited(pattern: &str) -> Option<(&str, &str)> {
    let delimiter = pattern.chars().next()?;
    if !PATTERN_DELIMITERS.contains(delimiter) {
        return None;
    }
    let rest = &pattern[delimiter.len_utf8()..];
    let end = rest.rfind(delimiter)?;
    let flags = &rest[end + delimiter.len_utf8()..];
    if !flags.chars().all(|flag| flag.is_ascii_alphabetic()) {
        return None;
    }
    Some((&rest[..end], flags))
}

#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub name: String,
    pub parent: Option<CategoryId>,
    pub patterns: Vec<Regex>,
}

/// Static table of categories and the title patterns that select them.
#[derive(Debug, Clone, Default)]
pub struct CategoryMatcher {
    rules: Vec<CategoryRule>,
}

impl CategoryMatcher {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(section: &CategoriesSection) -> Result<Self> {
        let mut rules = Vec::with_capacity(section.rules.len());
        for entry in &section.rules {
            let patterns = entry
                .patterns
                .iter()
                .map(|pattern| compile_pattern(pattern))
                .collect::<Result<Vec<_>>>()?;
            rules.push(CategoryRule {
                name: entry.name.clone(),
                parent: entry.parent.map(CategoryId),
                patterns,
            });
        }
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    /// Every category with at least one matching pattern.
    pub fn classify(&self, title: &str) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|rule| rule.patterns.iter().any(|pattern| pattern.is_match(title)))
            .map(|rule| rule.name.clone())
            .collect()
    }
}

/// Look up `name` under `parent`, creating it when missing.
pub fn ensure_category<S: TaxonomyStore + ?Sized>(
    store: &mut S,
    taxonomy: &str,
    name: &str,
    parent: Option<CategoryId>,
) -> Result<CategoryId> {
    let qualified = format!("{taxonomy}:{name}");
    if store
        .category_exists(taxonomy, name, parent)
        .map_err(|error| taxonomy_error(&qualified, error))?
    {
        return store
            .get_category_by_name(taxonomy, name)
            .map_err(|error| taxonomy_error(&qualified, error))?
            .ok_or_else(|| MigrateError::taxonomy(qualified, "reported as existing but not found"));
    }
    let id = store
        .create_category(taxonomy, name, parent)
        .map_err(|error| taxonomy_error(&qualified, error))?;
    info!("created {qualified} as term {id}");
    Ok(id)
}

fn taxonomy_error(name: &str, error: MigrateError) -> MigrateError {
    match error {
        MigrateError::Taxonomy { .. } => error,
        other => MigrateError::taxonomy(name, other),
    }
}

pub struct CategoryMigration {
    matcher: CategoryMatcher,
    taxonomy: String,
    append: bool,
    term_ids: BTreeMap<String, CategoryId>,
}

impl CategoryMigration {
    pub fn new(matcher: CategoryMatcher, taxonomy: impl Into<String>, append: bool) -> Self {
        Self {
            matcher,
            taxonomy: taxonomy.into(),
            append,
            term_ids: BTreeMap::new(),
        }
    }

    pub fn from_config(section: &CategoriesSection) -> Result<Self> {
        Ok(Self::new(
            CategoryMatcher::from_config(section)?,
            section.taxonomy.clone(),
            section.append,
        ))
    }

    pub fn term_ids(&self) -> &BTreeMap<String, CategoryId> {
        &self.term_ids
    }
}

impl<S: TaxonomyStore + ?Sized> Migration<S> for CategoryMigration {
    fn label(&self) -> &str {
        "migrate categories"
    }

    fn prepare(&mut self, site: &mut S) -> Result<()> {
        if self.matcher.rules().is_empty() {
            return Err(MigrateError::precondition("no category rules configured"));
        }
        for rule in self.matcher.rules() {
            let id = ensure_category(site, &self.taxonomy, &rule.name, rule.parent).map_err(
                |error| {
                    MigrateError::precondition(format!(
                        "could not ensure category {}: {error}",
                        rule.name
                    ))
                },
            )?;
            self.term_ids.insert(rule.name.clone(), id);
        }
        Ok(())
    }

    fn transform(&mut self, _site: &mut S, record: &Record) -> Result<Transformed> {
        let matched = self.matcher.classify(&record.title);
        if matched.is_empty() {
            return Ok(Transformed::Unchanged);
        }
        let mut term_ids = Vec::with_capacity(matched.len());
        for name in &matched {
            let id = self.term_ids.get(name).copied().ok_or_else(|| {
                MigrateError::taxonomy(name.clone(), "category was not prepared")
            })?;
            term_ids.push(id);
        }
        term_ids.sort();
        term_ids.dedup();
        debug!(
            "record {} matched {}",
            record.id,
            matched.into_iter().collect::<Vec<_>>().join(",")
        );
        Ok(Transformed::Terms(TermAssignment {
            taxonomy: self.taxonomy.clone(),
            term_ids,
            append: self.append,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{CategoryMatcher, CategoryMigration, compile_pattern, ensure_category};
    use crate::batch::tests::{MemorySite, post, term_key};
    use crate::batch::{BatchRunner, CancelToken, NoProgress};
    use crate::config::{CategoriesSection, CategoryRuleEntry};
    use crate::error::MigrateError;
    use crate::record::{QueryFilter, RecordId};
    use crate::store::CategoryId;

    #[test]
    fn php_delimited_patterns_compile_with_flags() {
        let regex = compile_pattern(r"/\b(nfl)\b/i").expect("compile");
        assert!(regex.is_match("Giants win NFL opener"));
        let bare = compile_pattern(r"(?i)\bnba\b").expect("compile");
        assert!(bare.is_match("NBA finals"));
        let hashed = compile_pattern(r"#^draft:#").expect("compile");
        assert!(hashed.is_match("draft: picks"));
        assert!(!hashed.is_match("Draft: picks"));
    }

    #[test]
    fn invalid_patterns_are_preconditions() {
        let error = compile_pattern("/(unclosed/i").expect_err("must fail");
        assert!(matches!(error, MigrateError::Precondition(_)));
        let error = compile_pattern("/nfl/e").expect_err("must fail");
        assert!(error.to_string().contains("unsupported modifier"));
    }

    #[test]
    fn classify_matches_word_boundaries() {
        let matcher =
            CategoryMatcher::from_config(&CategoriesSection::default()).expect("default rules");
        let matched = matcher.classify("Giants win NFL opener");
        assert!(matched.contains("NFL"));
        assert_eq!(matched.len(), 1);
        assert!(matcher.classify("Football news").is_empty());
        assert!(matcher.classify("NFLX stock climbs").is_empty());
        assert_eq!(matcher.classify("NFL and NBA ratings").len(), 2);
    }

    #[test]
    fn ensure_category_reuses_existing_terms() {
        let mut site = MemorySite::default();
        let created =
            ensure_category(&mut site, "category", "NFL", Some(CategoryId(840))).expect("create");
        let again =
            ensure_category(&mut site, "category", "NFL", Some(CategoryId(840))).expect("reuse");
        assert_eq!(created, again);
        assert_eq!(site.categories.len(), 1);

        let tag = ensure_category(&mut site, "post_tag", "NFL", None).expect("tag");
        assert_ne!(tag, created);
        assert!(site.categories.contains_key(&term_key("post_tag", "NFL")));
    }

    #[test]
    fn migration_assigns_union_of_matches_in_one_write() {
        let mut site = MemorySite::with_records(vec![
            post(1, "NFL and NBA crossover", ""),
            post(2, "Gardening tips", ""),
            post(3, "nba draft recap", ""),
        ]);
        let mut migration =
            CategoryMigration::from_config(&CategoriesSection::default()).expect("migration");
        let mut progress = NoProgress;
        let result = BatchRunner::new(&mut progress, CancelToken::new())
            .run(&mut site, &QueryFilter::default(), &mut migration)
            .expect("batch run");

        assert_eq!(result.updated, 2);
        assert_eq!(result.skipped, 1);
        let nfl = migration.term_ids()["NFL"];
        let nba = migration.term_ids()["NBA"];
        assert_eq!(site.term_writes.len(), 2);
        let (record_id, ids, taxonomy, append) = &site.term_writes[0];
        assert_eq!(*record_id, RecordId(1));
        let mut expected = vec![nfl, nba];
        expected.sort();
        assert_eq!(ids, &expected);
        assert_eq!(taxonomy, "category");
        assert!(!append);
        assert_eq!(site.term_writes[1].1, vec![nba]);
    }

    #[test]
    fn prepare_fails_without_rules() {
        let section = CategoriesSection {
            rules: Vec::new(),
            ..CategoriesSection::default()
        };
        let mut site = MemorySite::with_records(vec![post(1, "NFL", "")]);
        let mut migration = CategoryMigration::from_config(&section).expect("migration");
        let mut progress = NoProgress;
        let error = BatchRunner::new(&mut progress, CancelToken::new())
            .run(&mut site, &QueryFilter::default(), &mut migration)
            .expect_err("must abort");
        assert!(error.is_fatal());
        assert!(site.term_writes.is_empty());
    }

    #[test]
    fn config_rules_without_parent_compile() {
        let section = CategoriesSection {
            rules: vec![CategoryRuleEntry {
                name: "MLB".to_string(),
                parent: None,
                patterns: vec!["(?i)baseball".to_string(), r"/\bmlb\b/i".to_string()],
            }],
            ..CategoriesSection::default()
        };
        let matcher = CategoryMatcher::from_config(&section).expect("matcher");
        assert_eq!(matcher.rules()[0].patterns.len(), 2);
        assert!(matcher.classify("Baseball returns").contains("MLB"));
    }
}
