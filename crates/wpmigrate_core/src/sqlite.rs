//! WordPress backend over a SQLite database, as laid out by the WordPress
//! SQLite integration. Table names follow `{prefix}posts` and friends; on a
//! multisite network every site other than 1 uses `{prefix}{site_id}_`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result as AnyResult, bail};
use log::{debug, info, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use sha2::{Digest, Sha256};

use crate::config::MigrateConfig;
use crate::error::{MigrateError, Result};
use crate::record::{QueryFilter, Record, RecordId, StatusFilter};
use crate::store::{
    CategoryId, DownloadedFile, MediaLibrary, RecordStore, ResourceId, TaxonomyStore,
    WordPressSite, mime_type_for,
};

const CONTENT_HASH_META_KEY: &str = "_wpmigrate_sha256";
const ATTACHED_FILE_META_KEY: &str = "_wp_attached_file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpSqliteConfig {
    pub database: PathBuf,
    pub table_prefix: String,
    pub site_id: u64,
    pub multisite: bool,
    pub uploads_dir: PathBuf,
    pub uploads_url: Option<String>,
}

impl WpSqliteConfig {
    pub fn from_config(config: &MigrateConfig, site_id: u64) -> AnyResult<Self> {
        let Some(database) = config.site.database.as_deref() else {
            bail!("sqlite backend needs [site] database or WP_DATABASE");
        };
        let database = PathBuf::from(database);
        let uploads_dir = match config.site.uploads_dir.as_deref() {
            Some(dir) => PathBuf::from(dir),
            None => database
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("wp-content")
                .join("uploads"),
        };
        let uploads_url = config.site.uploads_url.clone().or_else(|| {
            config
                .site
                .url_for_site(site_id)
                .map(|url| format!("{}/wp-content/uploads", url.trim_end_matches('/')))
        });
        Ok(Self {
            database,
            table_prefix: config.site.table_prefix.clone(),
            site_id,
            multisite: config.site.multisite,
            uploads_dir,
            uploads_url,
        })
    }

    fn site_prefix(&self) -> String {
        if self.multisite && self.site_id > 1 {
            format!("{}{}_", self.table_prefix, self.site_id)
        } else {
            self.table_prefix.clone()
        }
    }

    fn site_uploads(&self) -> (PathBuf, Option<String>) {
        if self.multisite && self.site_id > 1 {
            let suffix = format!("sites/{}", self.site_id);
            (
                self.uploads_dir.join("sites").join(self.site_id.to_string()),
                self.uploads_url
                    .as_deref()
                    .map(|url| format!("{}/{suffix}", url.trim_end_matches('/'))),
            )
        } else {
            (self.uploads_dir.clone(), self.uploads_url.clone())
        }
    }
}

#[derive(Debug, Clone)]
struct Tables {
    posts: String,
    postmeta: String,
    terms: String,
    term_taxonomy: String,
    term_relationships: String,
}

impl Tables {
    fn with_prefix(prefix: &str) -> Self {
        Self {
            posts: format!("{prefix}posts"),
            postmeta: format!("{prefix}postmeta"),
            terms: format!("{prefix}terms"),
            term_taxonomy: format!("{prefix}term_taxonomy"),
            term_relationships: format!("{prefix}term_relationships"),
        }
    }
}

pub struct WpSqliteStore {
    connection: Connection,
    config: WpSqliteConfig,
    tables: Tables,
}

impl WpSqliteStore {
    pub fn open(config: WpSqliteConfig) -> AnyResult<Self> {
        validate_prefix(&config.table_prefix)?;
        if !config.database.exists() {
            bail!("WordPress database not found: {}", config.database.display());
        }
        let connection = open_connection(&config.database)?;
        let tables = Tables::with_prefix(&config.site_prefix());
        for table in [
            &tables.posts,
            &tables.postmeta,
            &tables.terms,
            &tables.term_taxonomy,
            &tables.term_relationships,
        ] {
            if !table_exists(&connection, table)? {
                bail!(
                    "table {table} is missing from {}; check table_prefix and site id",
                    config.database.display()
                );
            }
        }
        Ok(Self {
            connection,
            config,
            tables,
        })
    }

    fn load_records(&self, filter: &QueryFilter) -> AnyResult<Vec<Record>> {
        let mut values = filter
            .record_kinds
            .iter()
            .map(|kind| SqlValue::Text(kind.clone()))
            .collect::<Vec<_>>();
        let kind_slots = vec!["?"; values.len()].join(", ");
        let status_clause = match filter.status {
            StatusFilter::Any => "post_status NOT IN ('trash', 'auto-draft')".to_string(),
            other => {
                values.push(SqlValue::Text(other.as_str().to_string()));
                "post_status = ?".to_string()
            }
        };
        let sql = format!(
            "SELECT ID, post_type, post_status, post_title, post_content
             FROM {posts}
             WHERE post_type IN ({kind_slots}) AND {status_clause}
             ORDER BY ID",
            posts = self.tables.posts
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .with_context(|| format!("failed to prepare query on {}", self.tables.posts))?;
        let rows = statement
            .query_map(params_from_iter(values), |row| {
                Ok(Record {
                    id: RecordId(row.get::<_, i64>(0)?.max(0) as u64),
                    kind: row.get(1)?,
                    status: row.get(2)?,
                    title: row.get(3)?,
                    content: row.get(4)?,
                })
            })
            .with_context(|| format!("failed to query {}", self.tables.posts))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.with_context(|| format!("failed to decode {} row", self.tables.posts))?);
        }
        Ok(records)
    }

    fn find_term(
        &self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> AnyResult<Option<CategoryId>> {
        let sql = format!(
            "SELECT t.term_id
             FROM {terms} t
             JOIN {term_taxonomy} tt ON tt.term_id = t.term_id
             WHERE tt.taxonomy = ?1 AND lower(t.name) = lower(?2)
               AND (?3 IS NULL OR tt.parent = ?3)
             ORDER BY t.term_id
             LIMIT 1",
            terms = self.tables.terms,
            term_taxonomy = self.tables.term_taxonomy
        );
        let parent = parent.map(|id| sql_id(id.0));
        let found = self
            .connection
            .query_row(&sql, params![taxonomy, name.trim(), parent], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .with_context(|| format!("failed to look up {taxonomy} term {name}"))?;
        Ok(found.map(|id| CategoryId(id.max(0) as u64)))
    }

    fn insert_term(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> AnyResult<CategoryId> {
        let base_slug = slugify(name);
        let savepoint = self
            .connection
            .savepoint()
            .context("failed to start term savepoint")?;
        let slug_sql = format!(
            "SELECT EXISTS(
                 SELECT 1 FROM {terms} t
                 JOIN {term_taxonomy} tt ON tt.term_id = t.term_id
                 WHERE t.slug = ?1 AND tt.taxonomy = ?2
             )",
            terms = self.tables.terms,
            term_taxonomy = self.tables.term_taxonomy
        );
        let mut slug = base_slug.clone();
        let mut suffix = 2;
        while savepoint
            .query_row(&slug_sql, params![slug, taxonomy], |row| row.get::<_, i64>(0))
            .context("failed to check term slug")?
            == 1
        {
            slug = format!("{base_slug}-{suffix}");
            suffix += 1;
        }
        savepoint
            .execute(
                &format!(
                    "INSERT INTO {} (name, slug, term_group) VALUES (?1, ?2, 0)",
                    self.tables.terms
                ),
                params![name.trim(), slug],
            )
            .context("failed to insert term")?;
        let term_id = savepoint.last_insert_rowid();
        savepoint
            .execute(
                &format!(
                    "INSERT INTO {} (term_id, taxonomy, description, parent, count)
                     VALUES (?1, ?2, '', ?3, 0)",
                    self.tables.term_taxonomy
                ),
                params![term_id, taxonomy, parent.map_or(0, |id| sql_id(id.0))],
            )
            .context("failed to insert term taxonomy")?;
        savepoint.commit().context("failed to commit term")?;
        Ok(CategoryId(term_id.max(0) as u64))
    }

    fn write_terms(
        &mut self,
        record_id: RecordId,
        term_ids: &[CategoryId],
        taxonomy: &str,
        append: bool,
    ) -> AnyResult<()> {
        let tables = self.tables.clone();
        let object_id = sql_id(record_id.0);
        let savepoint = self
            .connection
            .savepoint()
            .context("failed to start term savepoint")?;

        let mut taxonomy_ids = Vec::with_capacity(term_ids.len());
        for term_id in term_ids {
            let found = savepoint
                .query_row(
                    &format!(
                        "SELECT term_taxonomy_id FROM {} WHERE term_id = ?1 AND taxonomy = ?2",
                        tables.term_taxonomy
                    ),
                    params![sql_id(term_id.0), taxonomy],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .context("failed to resolve term taxonomy id")?;
            let Some(found) = found else {
                bail!("term {term_id} does not exist in taxonomy {taxonomy}");
            };
            taxonomy_ids.push(found);
        }

        let mut touched = taxonomy_ids.clone();
        if !append {
            let mut statement = savepoint
                .prepare(&format!(
                    "SELECT tr.term_taxonomy_id
                     FROM {tr} tr
                     JOIN {tt} tt ON tt.term_taxonomy_id = tr.term_taxonomy_id
                     WHERE tr.object_id = ?1 AND tt.taxonomy = ?2",
                    tr = tables.term_relationships,
                    tt = tables.term_taxonomy
                ))
                .context("failed to prepare existing term query")?;
            let existing = statement
                .query_map(params![object_id, taxonomy], |row| row.get::<_, i64>(0))
                .context("failed to query existing terms")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to decode existing terms")?;
            drop(statement);
            for id in existing {
                if !taxonomy_ids.contains(&id) {
                    savepoint
                        .execute(
                            &format!(
                                "DELETE FROM {} WHERE object_id = ?1 AND term_taxonomy_id = ?2",
                                tables.term_relationships
                            ),
                            params![object_id, id],
                        )
                        .context("failed to remove stale term relationship")?;
                    touched.push(id);
                }
            }
        }

        for id in &taxonomy_ids {
            savepoint
                .execute(
                    &format!(
                        "INSERT OR IGNORE INTO {} (object_id, term_taxonomy_id, term_order)
                         VALUES (?1, ?2, 0)",
                        tables.term_relationships
                    ),
                    params![object_id, id],
                )
                .context("failed to insert term relationship")?;
        }

        touched.sort_unstable();
        touched.dedup();
        for id in touched {
            savepoint
                .execute(
                    &format!(
                        "UPDATE {tt} SET count = (
                             SELECT COUNT(*) FROM {tr} WHERE term_taxonomy_id = ?1
                         ) WHERE term_taxonomy_id = ?1",
                        tt = tables.term_taxonomy,
                        tr = tables.term_relationships
                    ),
                    params![id],
                )
                .context("failed to recount term")?;
        }

        savepoint.commit().context("failed to commit term assignment")?;
        Ok(())
    }

    fn attachment_by_hash(&self, hash: &str) -> AnyResult<Option<ResourceId>> {
        let sql = format!(
            "SELECT p.ID
             FROM {postmeta} m
             JOIN {posts} p ON p.ID = m.post_id
             WHERE m.meta_key = ?1 AND m.meta_value = ?2 AND p.post_type = 'attachment'
             ORDER BY p.ID
             LIMIT 1",
            postmeta = self.tables.postmeta,
            posts = self.tables.posts
        );
        let found = self
            .connection
            .query_row(&sql, params![CONTENT_HASH_META_KEY, hash], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .context("failed to look up attachment hash")?;
        Ok(found.map(|id| ResourceId(id.max(0) as u64)))
    }

    fn store_attachment(
        &mut self,
        file: &DownloadedFile,
        filename: &str,
        attach_to: RecordId,
    ) -> AnyResult<ResourceId> {
        let bytes = file
            .read_bytes()
            .with_context(|| format!("failed to read download {}", file.path().display()))?;
        let hash = content_hash(&bytes);
        if let Some(existing) = self.attachment_by_hash(&hash)? {
            debug!("{filename} already stored as attachment {existing}");
            return Ok(existing);
        }

        let (uploads_dir, uploads_url) = self.config.site_uploads();
        let Some(uploads_url) = uploads_url else {
            bail!("uploads_url is not configured; set [site] uploads_url or [site] url");
        };
        let now = WpTimestamp::now();
        let subdir = format!("{:04}/{:02}", now.year, now.month);
        let target_dir = uploads_dir.join(&subdir);
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("failed to create {}", target_dir.display()))?;
        let stored_name = unique_filename(&target_dir, &sanitize_filename(filename));
        let target = target_dir.join(&stored_name);
        fs::write(&target, &bytes).with_context(|| format!("failed to write {}", target.display()))?;

        let relative = format!("{subdir}/{stored_name}");
        let guid = format!("{}/{relative}", uploads_url.trim_end_matches('/'));
        match self.insert_attachment(&stored_name, &relative, &guid, &hash, attach_to, &now) {
            Ok(id) => {
                info!("stored {filename} as attachment {id} ({relative})");
                Ok(id)
            }
            Err(error) => {
                if let Err(cleanup) = fs::remove_file(&target) {
                    warn!(
                        "could not remove orphaned upload {}: {cleanup}",
                        target.display()
                    );
                }
                Err(error)
            }
        }
    }

    fn insert_attachment(
        &mut self,
        stored_name: &str,
        relative: &str,
        guid: &str,
        hash: &str,
        attach_to: RecordId,
        now: &WpTimestamp,
    ) -> AnyResult<ResourceId> {
        let title = stored_name
            .rsplit_once('.')
            .map_or(stored_name, |(stem, _)| stem);
        let tables = self.tables.clone();
        let savepoint = self
            .connection
            .savepoint()
            .context("failed to start attachment savepoint")?;
        savepoint
            .execute(
                &format!(
                    "INSERT INTO {} (
                        post_author, post_date, post_date_gmt, post_content, post_title,
                        post_excerpt, post_status, comment_status, ping_status, post_password,
                        post_name, to_ping, pinged, post_modified, post_modified_gmt,
                        post_content_filtered, post_parent, guid, menu_order, post_type,
                        post_mime_type, comment_count
                    ) VALUES (
                        0, ?1, ?1, '', ?2,
                        '', 'inherit', 'open', 'closed', '',
                        ?3, '', '', ?1, ?1,
                        '', ?4, ?5, 0, 'attachment',
                        ?6, 0
                    )",
                    tables.posts
                ),
                params![
                    now.text,
                    title,
                    slugify(title),
                    sql_id(attach_to.0),
                    guid,
                    mime_type_for(stored_name)
                ],
            )
            .context("failed to insert attachment post")?;
        let id = savepoint.last_insert_rowid();
        let meta_sql = format!(
            "INSERT INTO {} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
            tables.postmeta
        );
        savepoint
            .execute(&meta_sql, params![id, ATTACHED_FILE_META_KEY, relative])
            .context("failed to insert attachment file meta")?;
        savepoint
            .execute(&meta_sql, params![id, CONTENT_HASH_META_KEY, hash])
            .context("failed to insert attachment hash meta")?;
        savepoint.commit().context("failed to commit attachment")?;
        Ok(ResourceId(id.max(0) as u64))
    }
}

impl RecordStore for WpSqliteStore {
    fn fetch_records(&mut self, filter: &QueryFilter) -> Result<Vec<Record>> {
        self.load_records(filter)
            .map_err(|error| MigrateError::query(format!("{error:#}")))
    }

    fn update_record(&mut self, record: &Record) -> Result<()> {
        let now = WpTimestamp::now();
        let changed = self
            .connection
            .execute(
                &format!(
                    "UPDATE {} SET post_content = ?1, post_modified = ?2, post_modified_gmt = ?2
                     WHERE ID = ?3",
                    self.tables.posts
                ),
                params![record.content, now.text, sql_id(record.id.0)],
            )
            .map_err(|error| MigrateError::persist(record.id, error))?;
        if changed == 0 {
            return Err(MigrateError::persist(record.id, "no such record"));
        }
        Ok(())
    }
}

impl TaxonomyStore for WpSqliteStore {
    fn category_exists(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> Result<bool> {
        let found = self
            .find_term(taxonomy, name, parent)
            .map_err(|error| MigrateError::taxonomy(name, format!("{error:#}")))?;
        Ok(found.is_some())
    }

    fn create_category(
        &mut self,
        taxonomy: &str,
        name: &str,
        parent: Option<CategoryId>,
    ) -> Result<CategoryId> {
        self.insert_term(taxonomy, name, parent)
            .map_err(|error| MigrateError::taxonomy(name, format!("{error:#}")))
    }

    fn get_category_by_name(&mut self, taxonomy: &str, name: &str) -> Result<Option<CategoryId>> {
        self.find_term(taxonomy, name, None)
            .map_err(|error| MigrateError::taxonomy(name, format!("{error:#}")))
    }

    fn set_record_terms(
        &mut self,
        record_id: RecordId,
        term_ids: &[CategoryId],
        taxonomy: &str,
        append: bool,
    ) -> Result<()> {
        self.write_terms(record_id, term_ids, taxonomy, append)
            .map_err(|error| MigrateError::persist(record_id, format!("{error:#}")))
    }
}

impl MediaLibrary for WpSqliteStore {
    fn sideload(
        &mut self,
        file: &DownloadedFile,
        filename: &str,
        attach_to: RecordId,
    ) -> Result<ResourceId> {
        self.store_attachment(file, filename, attach_to)
            .map_err(|error| MigrateError::register(filename, format!("{error:#}")))
    }

    fn resource_url(&mut self, id: ResourceId) -> Result<String> {
        let guid = self
            .connection
            .query_row(
                &format!(
                    "SELECT guid FROM {} WHERE ID = ?1 AND post_type = 'attachment'",
                    self.tables.posts
                ),
                params![sql_id(id.0)],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|error| MigrateError::register(format!("attachment {id}"), error))?;
        guid.filter(|url| !url.is_empty())
            .ok_or_else(|| MigrateError::register(format!("attachment {id}"), "no guid"))
    }
}

impl WordPressSite for WpSqliteStore {
    fn describe(&self) -> String {
        format!(
            "sqlite {} (tables {}*)",
            self.config.database.display(),
            self.config.site_prefix()
        )
    }
}

fn open_connection(db_path: &Path) -> AnyResult<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    Ok(connection)
}

fn table_exists(connection: &Connection, table_name: &str) -> AnyResult<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn validate_prefix(prefix: &str) -> AnyResult<()> {
    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        bail!("invalid table_prefix {prefix:?}: only letters, digits and underscores are allowed");
    }
    Ok(())
}

fn sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for ch in value.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "term".to_string()
    } else {
        slug
    }
}

fn sanitize_filename(filename: &str) -> String {
    let cleaned = filename
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '-'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_matches(|ch| ch == '-' || ch == '.').to_string();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

/// `name.ext`, then `name-1.ext`, `name-2.ext`, ... until unused.
fn unique_filename(dir: &Path, filename: &str) -> String {
    if !dir.join(filename).exists() {
        return filename.to_string();
    }
    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, extension)) => (stem, format!(".{extension}")),
        None => (filename, String::new()),
    };
    let mut counter = 1u32;
    loop {
        let candidate = format!("{stem}-{counter}{extension}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WpTimestamp {
    year: i64,
    month: u32,
    text: String,
}

impl WpTimestamp {
    fn now() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0);
        Self::from_unix(seconds)
    }

    fn from_unix(seconds: u64) -> Self {
        let days = i64::try_from(seconds / 86_400).unwrap_or(0);
        let rem = seconds % 86_400;
        let (year, month, day) = civil_from_days(days);
        Self {
            year,
            month,
            text: format!(
                "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}",
                rem / 3_600,
                (rem % 3_600) / 60,
                rem % 60
            ),
        }
    }
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use rusqlite::{Connection, params};
    use tempfile::tempdir;

    use super::{
        WpSqliteConfig, WpSqliteStore, WpTimestamp, civil_from_days, sanitize_filename, slugify,
        unique_filename,
    };
    use crate::batch::{BatchRunner, CancelToken, NoProgress};
    use crate::categories::CategoryMigration;
    use crate::config::{CategoriesSection, CategoryRuleEntry, MigrateConfig};
    use crate::record::{QueryFilter, Record, RecordId, StatusFilter};
    use crate::store::{
        CategoryId, DownloadedFile, MediaLibrary, RecordStore, TaxonomyStore, WordPressSite,
    };

    fn create_schema(connection: &Connection, prefix: &str) {
        connection
            .execute_batch(&format!(
                "CREATE TABLE {prefix}posts (
                    ID INTEGER PRIMARY KEY AUTOINCREMENT,
                    post_author INTEGER NOT NULL DEFAULT 0,
                    post_date TEXT NOT NULL DEFAULT '0000-00-00 00:00:00',
                    post_date_gmt TEXT NOT NULL DEFAULT '0000-00-00 00:00:00',
                    post_content TEXT NOT NULL,
                    post_title TEXT NOT NULL,
                    post_excerpt TEXT NOT NULL,
                    post_status TEXT NOT NULL DEFAULT 'publish',
                    comment_status TEXT NOT NULL DEFAULT 'open',
                    ping_status TEXT NOT NULL DEFAULT 'open',
                    post_password TEXT NOT NULL DEFAULT '',
                    post_name TEXT NOT NULL DEFAULT '',
                    to_ping TEXT NOT NULL,
                    pinged TEXT NOT NULL,
                    post_modified TEXT NOT NULL DEFAULT '0000-00-00 00:00:00',
                    post_modified_gmt TEXT NOT NULL DEFAULT '0000-00-00 00:00:00',
                    post_content_filtered TEXT NOT NULL,
                    post_parent INTEGER NOT NULL DEFAULT 0,
                    guid TEXT NOT NULL DEFAULT '',
                    menu_order INTEGER NOT NULL DEFAULT 0,
                    post_type TEXT NOT NULL DEFAULT 'post',
                    post_mime_type TEXT NOT NULL DEFAULT '',
                    comment_count INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE {prefix}postmeta (
                    meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    post_id INTEGER NOT NULL DEFAULT 0,
                    meta_key TEXT,
                    meta_value TEXT
                );
                CREATE TABLE {prefix}terms (
                    term_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL DEFAULT '',
                    slug TEXT NOT NULL DEFAULT '',
                    term_group INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE {prefix}term_taxonomy (
                    term_taxonomy_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    term_id INTEGER NOT NULL DEFAULT 0,
                    taxonomy TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL,
                    parent INTEGER NOT NULL DEFAULT 0,
                    count INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE {prefix}term_relationships (
                    object_id INTEGER NOT NULL DEFAULT 0,
                    term_taxonomy_id INTEGER NOT NULL DEFAULT 0,
                    term_order INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (object_id, term_taxonomy_id)
                );"
            ))
            .expect("create schema");
    }

    fn insert_post(connection: &Connection, prefix: &str, kind: &str, status: &str, title: &str) {
        connection
            .execute(
                &format!(
                    "INSERT INTO {prefix}posts (post_content, post_title, post_excerpt, post_status,
                        to_ping, pinged, post_content_filtered, post_type)
                     VALUES ('<p>body</p>', ?1, '', ?2, '', '', '', ?3)"
                ),
                params![title, status, kind],
            )
            .expect("insert post");
    }

    fn fixture(root: &Path) -> WpSqliteConfig {
        let database = root.join("wordpress.db");
        let connection = Connection::open(&database).expect("open fixture");
        create_schema(&connection, "wp_");
        insert_post(&connection, "wp_", "post", "publish", "NFL opener");
        insert_post(&connection, "wp_", "page", "draft", "About");
        insert_post(&connection, "wp_", "post", "trash", "Old news");
        insert_post(&connection, "wp_", "attachment", "inherit", "logo");
        WpSqliteConfig {
            database,
            table_prefix: "wp_".to_string(),
            site_id: 1,
            multisite: false,
            uploads_dir: root.join("uploads"),
            uploads_url: Some("https://news.example.org/wp-content/uploads".to_string()),
        }
    }

    #[test]
    fn fetch_records_filters_kind_and_status() {
        let temp = tempdir().expect("tempdir");
        let mut store = WpSqliteStore::open(fixture(temp.path())).expect("open store");

        let any = store
            .fetch_records(&QueryFilter::default())
            .expect("fetch any");
        let titles = any.iter().map(|record| record.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["NFL opener", "About"]);

        let published = store
            .fetch_records(&QueryFilter::for_kinds(
                &["post".to_string()],
                StatusFilter::Publish,
            ))
            .expect("fetch publish");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, RecordId(1));
    }

    #[test]
    fn update_record_writes_content() {
        let temp = tempdir().expect("tempdir");
        let config = fixture(temp.path());
        let database = config.database.clone();
        let mut store = WpSqliteStore::open(config).expect("open store");
        let record = Record {
            id: RecordId(1),
            kind: "post".to_string(),
            status: "publish".to_string(),
            title: "NFL opener".to_string(),
            content: "<p>clean</p>".to_string(),
        };
        store.update_record(&record).expect("update");
        store.update_record(&record).expect("repeat update");
        assert!(
            store
                .update_record(&Record {
                    id: RecordId(99),
                    ..record.clone()
                })
                .is_err()
        );

        let connection = Connection::open(database).expect("reopen");
        let content: String = connection
            .query_row("SELECT post_content FROM wp_posts WHERE ID = 1", [], |row| {
                row.get(0)
            })
            .expect("content");
        assert_eq!(content, "<p>clean</p>");
    }

    #[test]
    fn categories_are_created_once_with_unique_slugs() {
        let temp = tempdir().expect("tempdir");
        let mut store = WpSqliteStore::open(fixture(temp.path())).expect("open store");
        let parent = store.create_category("category", "Sports", None).expect("parent");
        assert!(!store.category_exists("category", "NFL", Some(parent)).expect("exists"));
        let nfl = store.create_category("category", "NFL", Some(parent)).expect("create");
        assert!(store.category_exists("category", "nfl", Some(parent)).expect("exists"));
        assert!(!store.category_exists("category", "NFL", Some(CategoryId(12345))).expect("exists"));
        assert_eq!(store.get_category_by_name("category", "NFL").expect("get"), Some(nfl));

        let duplicate = store.create_category("category", "N.F.L.", None).expect("create");
        assert_ne!(duplicate, nfl);
        let slug: String = store
            .connection
            .query_row(
                "SELECT slug FROM wp_terms WHERE term_id = ?1",
                params![duplicate.0 as i64],
                |row| row.get(0),
            )
            .expect("slug");
        assert_eq!(slug, "n-f-l");
    }

    #[test]
    fn category_migration_writes_into_the_configured_taxonomy() {
        let temp = tempdir().expect("tempdir");
        let mut store = WpSqliteStore::open(fixture(temp.path())).expect("open store");
        let existing = store
            .create_category("category", "NFL", None)
            .expect("category term");
        let section = CategoriesSection {
            taxonomy: "post_tag".to_string(),
            rules: vec![CategoryRuleEntry {
                name: "NFL".to_string(),
                parent: None,
                patterns: vec![r"/\bnfl\b/i".to_string()],
            }],
            ..CategoriesSection::default()
        };
        let mut migration = CategoryMigration::from_config(&section).expect("migration");
        let mut progress = NoProgress;
        let result = BatchRunner::new(&mut progress, CancelToken::new())
            .run(&mut store, &QueryFilter::default(), &mut migration)
            .expect("batch run");

        assert_eq!(result.failed, 0, "{:?}", result.failures);
        assert_eq!(result.updated, 1);
        let tag = migration.term_ids()["NFL"];
        assert_ne!(tag, existing);
        let (taxonomy, count, slug): (String, i64, String) = store
            .connection
            .query_row(
                "SELECT tt.taxonomy, tt.count, t.slug
                 FROM wp_term_taxonomy tt JOIN wp_terms t ON t.term_id = tt.term_id
                 WHERE tt.term_id = ?1",
                params![tag.0 as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("tag row");
        assert_eq!(taxonomy, "post_tag");
        assert_eq!(count, 1);
        assert_eq!(slug, "nfl");
        assert_eq!(
            store.get_category_by_name("category", "NFL").expect("get"),
            Some(existing)
        );
    }

    #[test]
    fn set_record_terms_replaces_or_appends_and_recounts() {
        let temp = tempdir().expect("tempdir");
        let mut store = WpSqliteStore::open(fixture(temp.path())).expect("open store");
        let nfl = store.create_category("category", "NFL", None).expect("nfl");
        let nba = store.create_category("category", "NBA", None).expect("nba");
        let post = RecordId(1);

        store
            .set_record_terms(post, &[nfl], "category", false)
            .expect("assign nfl");
        store
            .set_record_terms(post, &[nba], "category", true)
            .expect("append nba");
        let count = |store: &WpSqliteStore| -> i64 {
            store
                .connection
                .query_row(
                    "SELECT COUNT(*) FROM wp_term_relationships WHERE object_id = 1",
                    [],
                    |row| row.get(0),
                )
                .expect("count")
        };
        assert_eq!(count(&store), 2);

        store
            .set_record_terms(post, &[nba], "category", false)
            .expect("replace with nba");
        assert_eq!(count(&store), 1);
        let nfl_count: i64 = store
            .connection
            .query_row(
                "SELECT count FROM wp_term_taxonomy WHERE term_id = ?1",
                params![nfl.0 as i64],
                |row| row.get(0),
            )
            .expect("nfl count");
        assert_eq!(nfl_count, 0);

        assert!(
            store
                .set_record_terms(post, &[CategoryId(999)], "category", false)
                .is_err()
        );
    }

    #[test]
    fn sideload_stores_file_once_per_content_hash() {
        let temp = tempdir().expect("tempdir");
        let config = fixture(temp.path());
        let uploads = config.uploads_dir.clone();
        let mut store = WpSqliteStore::open(config).expect("open store");

        let first = DownloadedFile::from_bytes("https://example.com/a.jpg", None, b"jpeg-one")
            .expect("download");
        let id = store.sideload(&first, "a.jpg", RecordId(1)).expect("sideload");
        let url = store.resource_url(id).expect("url");
        assert!(url.starts_with("https://news.example.org/wp-content/uploads/"));
        assert!(url.ends_with("/a.jpg"));

        let again = store
            .sideload(&first, "a.jpg", RecordId(2))
            .expect("sideload again");
        assert_eq!(again, id);

        let other = DownloadedFile::from_bytes("https://example.com/x/a.jpg", None, b"jpeg-two")
            .expect("download");
        let other_id = store.sideload(&other, "a.jpg", RecordId(1)).expect("sideload");
        assert_ne!(other_id, id);
        assert!(store.resource_url(other_id).expect("url").ends_with("/a-1.jpg"));

        let stored = fs::read_dir(&uploads)
            .expect("uploads")
            .flat_map(|year| fs::read_dir(year.expect("year").path()).expect("months"))
            .flat_map(|month| fs::read_dir(month.expect("month").path()).expect("files"))
            .count();
        assert_eq!(stored, 2);
        assert!(store.resource_url(crate::store::ResourceId(1)).is_err());
    }

    #[test]
    fn failed_attachment_insert_removes_the_copied_file() {
        let temp = tempdir().expect("tempdir");
        let config = fixture(temp.path());
        let uploads = config.uploads_dir.clone();
        let mut store = WpSqliteStore::open(config).expect("open store");
        store
            .connection
            .execute_batch(
                "CREATE TRIGGER reject_posts BEFORE INSERT ON wp_posts
                 BEGIN SELECT RAISE(ABORT, 'posts are read only'); END;",
            )
            .expect("trigger");

        let file = DownloadedFile::from_bytes("https://example.com/b.png", None, b"png")
            .expect("download");
        let error = store
            .sideload(&file, "b.png", RecordId(1))
            .expect_err("insert must fail");
        assert!(matches!(error, crate::error::MigrateError::Register { .. }));

        let mut pending = vec![uploads];
        let mut files = 0;
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries {
                let path = entry.expect("entry").path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    files += 1;
                }
            }
        }
        assert_eq!(files, 0);
    }

    #[test]
    fn multisite_sites_use_numbered_prefix() {
        let temp = tempdir().expect("tempdir");
        let mut config = fixture(temp.path());
        let connection = Connection::open(&config.database).expect("open");
        create_schema(&connection, "wp_3_");
        insert_post(&connection, "wp_3_", "post", "publish", "Site three post");
        drop(connection);

        config.multisite = true;
        config.site_id = 3;
        let mut store = WpSqliteStore::open(config).expect("open store");
        let records = store
            .fetch_records(&QueryFilter::default())
            .expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Site three post");
        assert!(store.describe().contains("wp_3_"));

        let other_root = temp.path().join("other");
        fs::create_dir_all(&other_root).expect("other root");
        let mut missing = fixture(&other_root);
        missing.multisite = true;
        missing.site_id = 4;
        assert!(WpSqliteStore::open(missing).is_err());
    }

    #[test]
    fn config_requires_database_and_valid_prefix() {
        let mut config = MigrateConfig::default();
        assert!(WpSqliteConfig::from_config(&config, 1).is_err());
        config.site.database = Some("/srv/wp/wordpress.db".to_string());
        config.site.url = Some("https://news.example.org/".to_string());
        let sqlite = WpSqliteConfig::from_config(&config, 1).expect("config");
        assert_eq!(
            sqlite.uploads_url.as_deref(),
            Some("https://news.example.org/wp-content/uploads")
        );

        let temp = tempdir().expect("tempdir");
        let mut bad = fixture(temp.path());
        bad.table_prefix = "wp_; DROP TABLE".to_string();
        assert!(WpSqliteStore::open(bad).is_err());
    }

    #[test]
    fn helpers_format_wordpress_values() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
        let stamp = WpTimestamp::from_unix(1_704_067_200 + 3_661);
        assert_eq!(stamp.text, "2024-01-01 01:01:01");
        assert_eq!(stamp.month, 1);
        assert_eq!(slugify("  Sports & Games "), "sports-games");
        assert_eq!(slugify("!!!"), "term");
        assert_eq!(sanitize_filename("my photo (1).JPG"), "my-photo--1-.JPG");
    }

    #[test]
    fn unique_filename_appends_counter() {
        let temp = tempdir().expect("tempdir");
        assert_eq!(unique_filename(temp.path(), "a.png"), "a.png");
        fs::write(temp.path().join("a.png"), b"x").expect("write");
        fs::write(temp.path().join("a-1.png"), b"x").expect("write");
        assert_eq!(unique_filename(temp.path(), "a.png"), "a-2.png");
    }
}
