//! WordPress REST API backend (`/wp-json/wp/v2`).
//!
//! Authenticates with an application password over basic auth. The request
//! loop paces calls, retries transient failures with backoff and counts every
//! request it sends.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use anyhow::{Context, Result as AnyResult, bail};
use log::debug;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, USER_AGENT};
use serde_json::{Value, json};

use crate::config::MigrateConfig;
use crate::error::{MigrateError, Result};
use crate::fetch::{HttpClientConfig, Throttle, is_retryable_error, is_retryable_status};
use crate::record::{QueryFilter, Record, RecordId};
use crate::store::{
    CategoryId, DownloadedFile, MediaLibrary, RecordStore, ResourceId, TaxonomyStore,
    WordPressSite, mime_type_for,
};

const PER_PAGE: u32 = 100;
const TOTAL_PAGES_HEADER: &str = "x-wp-totalpages";

#[derive(Debug, Clone)]
pub struct WpRestConfig {
    pub site_url: String,
    pub username: Option<String>,
    pub app_password: Option<String>,
    pub http: HttpClientConfig,
    pub max_write_retries: usize,
}

impl WpRestConfig {
    pub fn from_config(
        config: &MigrateConfig,
        site_id: u64,
        app_password: Option<String>,
    ) -> AnyResult<Self> {
        let Some(site_url) = config.site.url_for_site(site_id) else {
            bail!("site URL is not configured; set [site] url or WP_URL");
        };
        Url::parse(&site_url).with_context(|| format!("invalid site URL: {site_url}"))?;
        Ok(Self {
            site_url,
            username: config.site.username.clone(),
            app_password,
            http: HttpClientConfig::from_config(config),
            max_write_retries: 1,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RestFailure {
    code: Option<String>,
    message: String,
    data: Value,
}

impl RestFailure {
    fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            data: Value::Null,
        }
    }

    fn from_body(status: reqwest::StatusCode, body: &Value) -> Self {
        let code = body.get("code").and_then(Value::as_str).map(str::to_string);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}"));
        Self {
            code,
            message,
            data: body.get("data").cloned().unwrap_or(Value::Null),
        }
    }
}

impl fmt::Display for RestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

struct RestResponse {
    body: Value,
    total_pages: Option<u32>,
}

pub struct WpRestClient {
    client: Client,
    config: WpRestConfig,
    api_base: Url,
    throttle: Throttle,
    record_bases: HashMap<RecordId, String>,
    media_urls: HashMap<ResourceId, String>,
}

impl WpRestClient {
    pub fn new(config: WpRestConfig) -> AnyResult<Self> {
        let client = config.http.build_client()?;
        let api_base = api_base_url(&config.site_url)?;
        Ok(Self {
            client,
            throttle: Throttle::new(&config.http),
            api_base,
            config,
            record_bases: HashMap::new(),
            media_urls: HashMap::new(),
        })
    }

    pub fn request_count(&self) -> usize {
        self.throttle.request_count()
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, RestFailure> {
        self.api_base
            .join(path)
            .map_err(|error| RestFailure::message(format!("invalid endpoint {path}: {error}")))
    }

    fn execute<B>(&mut self, is_write: bool, build: B) -> std::result::Result<RestResponse, RestFailure>
    where
        B: Fn(&Client) -> RequestBuilder,
    {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.http.max_retries
        };

        for attempt in 0..=max_retries {
            self.throttle.apply_rate_limit();
            let mut request =
                build(&self.client).header(USER_AGENT, self.config.http.user_agent.clone());
            if let Some(username) = &self.config.username
                && let Some(password) = &self.config.app_password
            {
                request = request.basic_auth(username, Some(password));
            }

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    let total_pages = response
                        .headers()
                        .get(TOTAL_PAGES_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.trim().parse::<u32>().ok());
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.throttle.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        let body = response.json::<Value>().unwrap_or(Value::Null);
                        return Err(RestFailure::from_body(status, &body));
                    }
                    let body = response.json::<Value>().map_err(|error| {
                        RestFailure::message(format!("failed to decode REST response: {error}"))
                    })?;
                    return Ok(RestResponse { body, total_pages });
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.throttle.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(RestFailure::message(format!(
                        "failed to call WordPress REST API: {error}"
                    )));
                }
            }
        }

        Err(RestFailure::message("REST request exhausted retry budget"))
    }

    fn get(
        &mut self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<RestResponse, RestFailure> {
        let url = self.endpoint(path)?;
        let pairs = query
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect::<Vec<_>>();
        self.execute(false, |client| client.get(url.clone()).query(&pairs))
    }

    fn post_json(&mut self, path: &str, body: &Value) -> std::result::Result<RestResponse, RestFailure> {
        let url = self.endpoint(path)?;
        self.execute(true, |client| client.post(url.clone()).json(body))
    }

    fn record_base(&self, id: RecordId) -> String {
        self.record_bases
            .get(&id)
            .cloned()
            .unwrap_or_else(|| "posts".to_string())
    }

    fn find_category(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> std::result::Result<Option<CategoryId>, RestFailure> {
        let mut query = vec![
            ("search", name.to_string()),
            ("per_page", PER_PAGE.to_string()),
            ("hide_empty", "false".to_string()),
        ];
        if let Some(parent) = parent {
            query.push(("parent", parent.0.to_string()));
        }
        let response = self.get(&term_field_for(taxonomy), &query)?;
        Ok(find_term_by_name(&response.body, name))
    }
}

impl RecordStore for WpRestClient {
    fn fetch_records(&mut self, filter: &QueryFilter) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for kind in &filter.record_kinds {
            let base = rest_base_for(kind);
            let mut page = 1u32;
            loop {
                let response = self
                    .get(
                        &base,
                        &[
                            ("context", "edit".to_string()),
                            ("per_page", PER_PAGE.to_string()),
                            ("page", page.to_string()),
                            ("status", filter.status.as_str().to_string()),
                            ("orderby", "id".to_string()),
                            ("order", "asc".to_string()),
                        ],
                    )
                    .map_err(|failure| {
                        MigrateError::query(format!("GET {base} page {page}: {failure}"))
                    })?;
                let items = response.body.as_array().cloned().unwrap_or_default();
                if items.is_empty() {
                    break;
                }
                for item in &items {
                    let record = parse_record(item, kind).ok_or_else(|| {
                        MigrateError::query(format!("malformed {base} item on page {page}"))
                    })?;
                    if !filter.status.accepts(&record.status) {
                        continue;
                    }
                    self.record_bases.insert(record.id, base.clone());
                    records.push(record);
                }
                let total_pages = response.total_pages.unwrap_or(page);
                if page >= total_pages {
                    break;
                }
                page += 1;
            }
            debug!("fetched {} {base} item(s) so far", records.len());
        }
        Ok(records)
    }

    fn update_record(&mut self, record: &Record) -> Result<()> {
        let path = format!("{}/{}", self.record_base(record.id), record.id);
        self.post_json(&path, &json!({ "content": record.content }))
            .map_err(|failure| MigrateError::persist(record.id, failure))?;
        Ok(())
    }
}

impl TaxonomyStore for WpRestClient {
    fn category_exists(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> Result<bool> {
        let found = self
            .find_category(taxonomy, name, parent)
            .map_err(|failure| MigrateError::taxonomy(name, failure))?;
        Ok(found.is_some())
    }

    fn create_category(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> Result<CategoryId> {
        let mut body = json!({ "name": name });
        if let Some(parent) = parent {
            body["parent"] = json!(parent.0);
        }
        match self.post_json(&term_field_for(taxonomy), &body) {
            Ok(response) => response
                .body
                .get("id")
                .and_then(Value::as_u64)
                .map(CategoryId)
                .ok_or_else(|| MigrateError::taxonomy(name, "create response has no id")),
            Err(failure) => match existing_term_id(&failure) {
                Some(id) => Ok(id),
                None => Err(MigrateError::taxonomy(name, failure)),
            },
        }
    }

    fn get_category_by_name(&mut self, taxonomy: &str, name: &str) -> Result<Option<CategoryId>> {
        self.find_category(taxonomy, name, None)
            .map_err(|failure| MigrateError::taxonomy(name, failure))
    }

    fn set_record_terms(
        &mut self,
        record_id: RecordId,
        term_ids: &[CategoryId],
        taxonomy: &str,
        append: bool,
    ) -> Result<()> {
        let field = term_field_for(taxonomy);
        let path = format!("{}/{}", self.record_base(record_id), record_id);
        let mut ids = term_ids.iter().map(|id| id.0).collect::<BTreeSet<_>>();
        if append {
            let current = self
                .get(
                    &path,
                    &[("context", "edit".to_string()), ("_fields", field.clone())],
                )
                .map_err(|failure| MigrateError::persist(record_id, failure))?;
            ids.extend(
                current
                    .body
                    .get(&field)
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_u64),
            );
        }
        let mut body = serde_json::Map::new();
        body.insert(field, json!(ids.into_iter().collect::<Vec<_>>()));
        self.post_json(&path, &Value::Object(body))
            .map_err(|failure| MigrateError::persist(record_id, failure))?;
        Ok(())
    }
}

impl MediaLibrary for WpRestClient {
    fn sideload(
        &mut self,
        file: &DownloadedFile,
        filename: &str,
        attach_to: RecordId,
    ) -> Result<ResourceId> {
        let bytes = file
            .read_bytes()
            .map_err(|error| MigrateError::register(filename, error))?;
        let content_type = file
            .content_type
            .clone()
            .filter(|value| value.starts_with("image/"))
            .unwrap_or_else(|| mime_type_for(filename).to_string());
        let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
        let mut url = self
            .endpoint("media")
            .map_err(|failure| MigrateError::register(filename, failure))?;
        url.query_pairs_mut()
            .append_pair("post", &attach_to.0.to_string());

        let response = self
            .execute(true, |client| {
                client
                    .post(url.clone())
                    .header(CONTENT_TYPE, content_type.clone())
                    .header(CONTENT_DISPOSITION, disposition.clone())
                    .body(bytes.clone())
            })
            .map_err(|failure| MigrateError::register(filename, failure))?;
        let id = response
            .body
            .get("id")
            .and_then(Value::as_u64)
            .map(ResourceId)
            .ok_or_else(|| MigrateError::register(filename, "upload response has no id"))?;
        if let Some(source_url) = response.body.get("source_url").and_then(Value::as_str) {
            self.media_urls.insert(id, source_url.to_string());
        }
        Ok(id)
    }

    fn resource_url(&mut self, id: ResourceId) -> Result<String> {
        if let Some(url) = self.media_urls.get(&id) {
            return Ok(url.clone());
        }
        let response = self
            .get(&format!("media/{id}"), &[("_fields", "source_url".to_string())])
            .map_err(|failure| MigrateError::register(format!("media {id}"), failure))?;
        let url = response
            .body
            .get("source_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MigrateError::register(format!("media {id}"), "no source_url"))?;
        self.media_urls.insert(id, url.clone());
        Ok(url)
    }
}

impl WordPressSite for WpRestClient {
    fn describe(&self) -> String {
        format!("rest {}", self.config.site_url)
    }
}

fn api_base_url(site_url: &str) -> AnyResult<Url> {
    let trimmed = site_url.trim().trim_end_matches('/');
    let base = format!("{trimmed}/wp-json/wp/v2/");
    Url::parse(&base).with_context(|| format!("invalid site URL: {site_url}"))
}

fn rest_base_for(kind: &str) -> String {
    match kind {
        "post" => "posts".to_string(),
        "page" => "pages".to_string(),
        other => other.to_string(),
    }
}

fn term_field_for(taxonomy: &str) -> String {
    match taxonomy {
        "category" => "categories".to_string(),
        "post_tag" => "tags".to_string(),
        other => other.to_string(),
    }
}

/// `raw` under `context=edit`, `rendered` otherwise.
fn text_field(item: &Value, key: &str) -> String {
    let value = &item[key];
    value
        .get("raw")
        .or_else(|| value.get("rendered"))
        .and_then(Value::as_str)
        .or_else(|| value.as_str())
        .unwrap_or_default()
        .to_string()
}

fn parse_record(item: &Value, kind: &str) -> Option<Record> {
    let id = item.get("id").and_then(Value::as_u64)?;
    Some(Record {
        id: RecordId(id),
        kind: item
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(kind)
            .to_string(),
        status: item
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("publish")
            .to_string(),
        title: text_field(item, "title"),
        content: text_field(item, "content"),
    })
}

fn find_term_by_name(body: &Value, name: &str) -> Option<CategoryId> {
    let wanted = name.trim().to_lowercase();
    body.as_array()?
        .iter()
        .find(|term| {
            term.get("name")
                .and_then(Value::as_str)
                .is_some_and(|candidate| candidate.replace("&amp;", "&").to_lowercase() == wanted)
        })
        .and_then(|term| term.get("id").and_then(Value::as_u64))
        .map(CategoryId)
}

fn existing_term_id(failure: &RestFailure) -> Option<CategoryId> {
    if failure.code.as_deref() != Some("term_exists") {
        return None;
    }
    failure
        .data
        .get("term_id")
        .and_then(Value::as_u64)
        .map(CategoryId)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        RestFailure, WpRestConfig, api_base_url, existing_term_id, find_term_by_name,
        parse_record, rest_base_for, term_field_for,
    };
    use crate::config::{MigrateConfig, SiteEntry};
    use crate::record::RecordId;
    use crate::store::CategoryId;

    #[test]
    fn api_base_is_under_wp_json() {
        let base = api_base_url("https://news.example.org/").expect("base");
        assert_eq!(base.as_str(), "https://news.example.org/wp-json/wp/v2/");
        assert_eq!(
            base.join("posts/12").expect("join").as_str(),
            "https://news.example.org/wp-json/wp/v2/posts/12"
        );
    }

    #[test]
    fn kinds_and_taxonomies_map_to_rest_names() {
        assert_eq!(rest_base_for("post"), "posts");
        assert_eq!(rest_base_for("page"), "pages");
        assert_eq!(rest_base_for("recipe"), "recipe");
        assert_eq!(term_field_for("category"), "categories");
        assert_eq!(term_field_for("post_tag"), "tags");
        assert_eq!(term_field_for("league"), "league");
    }

    #[test]
    fn parse_record_prefers_raw_fields() {
        let item = json!({
            "id": 12,
            "type": "post",
            "status": "draft",
            "title": { "raw": "Giants &amp; Jets", "rendered": "Giants &#038; Jets" },
            "content": { "raw": "<p>body</p>", "rendered": "<p>body</p>\n" }
        });
        let record = parse_record(&item, "post").expect("record");
        assert_eq!(record.id, RecordId(12));
        assert_eq!(record.status, "draft");
        assert_eq!(record.title, "Giants &amp; Jets");
        assert_eq!(record.content, "<p>body</p>");
        assert!(parse_record(&json!({ "title": "x" }), "post").is_none());
    }

    #[test]
    fn term_lookup_is_case_insensitive_and_decodes_ampersands() {
        let body = json!([
            { "id": 3, "name": "NFL Draft" },
            { "id": 9, "name": "Sports &amp; Games" },
        ]);
        assert_eq!(find_term_by_name(&body, "nfl draft"), Some(CategoryId(3)));
        assert_eq!(find_term_by_name(&body, "Sports & Games"), Some(CategoryId(9)));
        assert_eq!(find_term_by_name(&body, "NFL"), None);
    }

    #[test]
    fn term_exists_failure_yields_existing_id() {
        let failure = RestFailure::from_body(
            StatusCode::BAD_REQUEST,
            &json!({
                "code": "term_exists",
                "message": "A term with the name provided already exists.",
                "data": { "status": 400, "term_id": 841 }
            }),
        );
        assert_eq!(existing_term_id(&failure), Some(CategoryId(841)));
        assert!(failure.to_string().starts_with("[term_exists]"));
        assert_eq!(existing_term_id(&RestFailure::message("boom")), None);
    }

    #[test]
    fn rest_config_uses_per_site_url() {
        let mut config = MigrateConfig::default();
        assert!(WpRestConfig::from_config(&config, 1, None).is_err());
        config.site.url = Some("https://main.example.org".to_string());
        config.site.sites = vec![SiteEntry {
            id: 3,
            url: "https://three.example.org".to_string(),
        }];
        let main = WpRestConfig::from_config(&config, 1, None).expect("main");
        let third = WpRestConfig::from_config(&config, 3, Some("secret".to_string()))
            .expect("third");
        assert_eq!(main.site_url, "https://main.example.org");
        assert_eq!(third.site_url, "https://three.example.org");
        assert_eq!(third.app_password.as_deref(), Some("secret"));
    }
}
