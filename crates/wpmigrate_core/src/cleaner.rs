use crate::batch::{Migration, Transformed};
use crate::config::CleanerConfig;
use crate::error::Result;
use crate::record::{QueryFilter, Record};
use crate::rules::{
    CharacterSubstitution, PruneEmptyElements, RepairMarkup, RuleChain, StripAttribute,
    StripElement,
};

/// Attributes, then elements, then quotes, then optional pruning, then repair.
pub fn build_clean_chain(config: &CleanerConfig) -> RuleChain {
    let mut chain = RuleChain::default();
    for attribute in &config.strip_attributes {
        chain.push(Box::new(
            StripAttribute::new(attribute.as_str()).strict(config.strict_markup),
        ));
    }
    for element in &config.strip_elements {
        chain.push(Box::new(
            StripElement::new(element.as_str()).strict(config.strict_markup),
        ));
    }
    if config.smart_quotes {
        chain.push(Box::new(CharacterSubstitution::smart_quotes()));
    }
    if config.prune_empty {
        chain.push(Box::new(
            PruneEmptyElements::new().strict(config.strict_markup),
        ));
    }
    if config.repair_markup {
        chain.push(Box::new(RepairMarkup));
    }
    chain
}

pub fn clean_filter(config: &CleanerConfig) -> QueryFilter {
    QueryFilter::for_kinds(&config.post_types, config.status)
}

pub struct CleanMigration {
    chain: RuleChain,
}

impl CleanMigration {
    pub fn new(chain: RuleChain) -> Self {
        Self { chain }
    }

    pub fn from_config(config: &CleanerConfig) -> Self {
        Self::new(build_clean_chain(config))
    }

    pub fn chain(&self) -> &RuleChain {
        &self.chain
    }
}

impl<S: ?Sized> Migration<S> for CleanMigration {
    fn label(&self) -> &str {
        "cleaner clean-posts"
    }

    fn transform(&mut self, _site: &mut S, record: &Record) -> Result<Transformed> {
        if record.content.is_empty() {
            return Ok(Transformed::Unchanged);
        }
        Ok(Transformed::Content(self.chain.apply(&record.content)))
    }
}

#[cfg(test)]
mod tests {
    use super::{CleanMigration, build_clean_chain, clean_filter};
    use crate::batch::tests::{MemorySite, post};
    use crate::batch::{BatchRunner, CancelToken, NoProgress};
    use crate::config::CleanerConfig;
    use crate::record::{Record, RecordId, StatusFilter};

    #[test]
    fn default_chain_order() {
        let chain = build_clean_chain(&CleanerConfig::default());
        assert_eq!(
            chain.rule_names(),
            vec![
                "strip-attribute[style]",
                "strip-element[script]",
                "character-substitution",
                "repair-markup",
            ]
        );
        let with_prune = build_clean_chain(&CleanerConfig {
            prune_empty: true,
            ..CleanerConfig::default()
        });
        assert_eq!(with_prune.rule_names()[3], "prune-empty");
    }

    #[test]
    fn default_chain_cleans_a_dirty_post() {
        let chain = build_clean_chain(&CleanerConfig::default());
        let cleaned = chain.apply(
            "<p style=\"font-weight:bold\">\u{201c}Quoted\u{201d}<script>track()</script> <b>open",
        );
        assert_eq!(cleaned, "<p>\"Quoted\" <b>open</b></p>");
    }

    #[test]
    fn default_chain_keeps_curly_quoted_alt_text_intact() {
        let chain = build_clean_chain(&CleanerConfig::default());
        let cleaned = chain.apply("<p><img alt=\"\u{201c}Go\u{201d} team\" src=\"a.png\"></p>");
        assert_eq!(
            cleaned,
            "<p><img alt=\"&quot;Go&quot; team\" src=\"a.png\"></p>"
        );
        assert_eq!(chain.apply(&cleaned), cleaned);
    }

    #[test]
    fn default_chain_keeps_svg_link_prefixes() {
        let chain = build_clean_chain(&CleanerConfig::default());
        assert_eq!(
            chain.apply("<p style=\"x\">a</p><svg><use xlink:href=\"#icon\"></use></svg>"),
            "<p>a</p><svg><use xlink:href=\"#icon\"></use></svg>"
        );
    }

    #[test]
    fn clean_posts_is_idempotent() {
        let mut site = MemorySite::with_records(vec![
            post(1, "dirty", "<div style=\"color:red\">it\u{2019}s</div>"),
            post(2, "clean", "<p>fine</p>"),
        ]);
        let filter = clean_filter(&CleanerConfig::default());
        let mut migration = CleanMigration::from_config(&CleanerConfig::default());
        let mut progress = NoProgress;

        let first = BatchRunner::new(&mut progress, CancelToken::new())
            .run(&mut site, &filter, &mut migration)
            .expect("first run");
        assert_eq!(first.updated, 1);
        assert_eq!(first.skipped, 1);
        assert_eq!(site.updates[0].content, "<div>it's</div>");

        let mut rerun_site = MemorySite::with_records(site.updates.clone());
        let second = BatchRunner::new(&mut progress, CancelToken::new())
            .run(&mut rerun_site, &filter, &mut migration)
            .expect("second run");
        assert_eq!(second.updated, 0);
        assert!(rerun_site.updates.is_empty());
    }

    #[test]
    fn clean_filter_defaults_to_published_posts() {
        let filter = clean_filter(&CleanerConfig::default());
        assert_eq!(filter.record_kinds, vec!["post"]);
        assert_eq!(filter.status, StatusFilter::Publish);

        let mut site = MemorySite::with_records(vec![Record {
            id: RecordId(9),
            kind: "page".to_string(),
            status: "publish".to_string(),
            title: "About".to_string(),
            content: "<p style=\"x\">page</p>".to_string(),
        }]);
        let mut migration = CleanMigration::from_config(&CleanerConfig::default());
        let mut progress = NoProgress;
        let result = BatchRunner::new(&mut progress, CancelToken::new())
            .run(&mut site, &filter, &mut migration)
            .expect("batch run");
        assert_eq!(result.processed, 0);
    }
}
