//! SQL-backed opportunity store: upsert, keyword search, staleness signal.

use std::str::FromStr;

use aipply_core::{parse_deadline, CandidateRecord, OpportunityRecord};
use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "aipply-store";

/// Fields a keyword term may match against (OR per term, AND across terms).
const KEYWORD_COLUMNS: &[&str] = &[
    "title",
    "description",
    "type",
    "organization",
    "location",
    "tags",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Search filters; absent filters match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub keyword: Option<String>,
    pub region: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

impl SearchFilter {
    pub const DEFAULT_LIMIT: i64 = 100;
}

/// Handle over the `opportunities` table. Cheap to clone; all operations
/// borrow a connection from the shared pool.
#[derive(Debug, Clone)]
pub struct OpportunityStore {
    pool: SqlitePool,
}

impl OpportunityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`, creating the database file if missing.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema setup; the `url` uniqueness constraint here is the
    /// sole concurrency safeguard against duplicate inserts.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                title        TEXT NOT NULL,
                organization TEXT,
                type         TEXT,
                deadline     DATE,
                location     TEXT,
                description  TEXT,
                url          TEXT NOT NULL UNIQUE,
                tags         TEXT,
                is_verified  BOOLEAN NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL,
                updated_at   TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_opportunities_created_at ON opportunities (created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert-or-update a batch of candidates keyed by URL, atomically.
    ///
    /// Candidates without a URL are skipped; new rows also need a title (the
    /// column is NOT NULL). Existing rows keep `id`, `url`, `created_at`,
    /// `is_verified` and `deadline`; the mutable text fields are refreshed
    /// with the candidate's values when present. Any storage error rolls the
    /// whole batch back.
    ///
    /// Returns the count of newly created records, not updates.
    pub async fn upsert_batch(&self, candidates: &[CandidateRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0u64;

        for candidate in candidates {
            let Some(url) = candidate.identity_url() else {
                debug!("skipping candidate without url");
                continue;
            };

            let existing: Option<i64> =
                sqlx::query_scalar("SELECT id FROM opportunities WHERE url = ?")
                    .bind(url)
                    .fetch_optional(&mut *tx)
                    .await?;

            if existing.is_some() {
                sqlx::query(
                    r#"
                    UPDATE opportunities SET
                        title        = COALESCE(?, title),
                        description  = COALESCE(?, description),
                        type         = COALESCE(?, type),
                        organization = COALESCE(?, organization),
                        location     = COALESCE(?, location),
                        tags         = COALESCE(?, tags),
                        updated_at   = ?
                    WHERE url = ?
                    "#,
                )
                .bind(&candidate.title)
                .bind(&candidate.description)
                .bind(&candidate.kind)
                .bind(&candidate.organization)
                .bind(&candidate.location)
                .bind(&candidate.tags)
                .bind(Utc::now())
                .bind(url)
                .execute(&mut *tx)
                .await?;
            } else {
                let Some(title) = candidate.title.as_deref().filter(|t| !t.trim().is_empty())
                else {
                    debug!(url, "skipping new candidate without title");
                    continue;
                };
                let deadline = candidate.deadline.as_deref().and_then(parse_deadline);

                sqlx::query(
                    r#"
                    INSERT INTO opportunities
                        (title, description, type, organization, location,
                         deadline, url, tags, is_verified, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                    "#,
                )
                .bind(title)
                .bind(&candidate.description)
                .bind(&candidate.kind)
                .bind(&candidate.organization)
                .bind(&candidate.location)
                .bind(deadline)
                .bind(url)
                .bind(&candidate.tags)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                added += 1;
            }
        }

        tx.commit().await?;
        Ok(added)
    }

    /// Keyword/region/type search, newest-first, capped at the filter limit.
    ///
    /// Every whitespace-separated keyword term must match at least one
    /// searchable column as a case-insensitive substring.
    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<OpportunityRecord>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, title, organization, type, deadline, location, description, \
             url, tags, is_verified, created_at, updated_at \
             FROM opportunities WHERE 1 = 1",
        );

        if let Some(keyword) = filter.keyword.as_deref() {
            for term in keyword.to_lowercase().split_whitespace() {
                qb.push(" AND (");
                for (i, column) in KEYWORD_COLUMNS.iter().enumerate() {
                    if i > 0 {
                        qb.push(" OR ");
                    }
                    qb.push(format!("instr(lower(coalesce({column}, '')), "));
                    qb.push_bind(term.to_string());
                    qb.push(") > 0");
                }
                qb.push(")");
            }
        }
        if let Some(region) = filter.region.as_deref() {
            qb.push(" AND instr(lower(coalesce(location, '')), ");
            qb.push_bind(region.to_lowercase());
            qb.push(") > 0");
        }
        if let Some(kind) = filter.kind.as_deref() {
            qb.push(" AND instr(lower(coalesce(type, '')), ");
            qb.push_bind(kind.to_lowercase());
            qb.push(") > 0");
        }

        qb.push(" ORDER BY created_at DESC, id ASC LIMIT ");
        qb.push_bind(filter.limit.unwrap_or(SearchFilter::DEFAULT_LIMIT));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    /// All stored records, newest-first, capped at `limit`.
    pub async fn list_all(&self, limit: i64) -> Result<Vec<OpportunityRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, title, organization, type, deadline, location, description, \
             url, tags, is_verified, created_at, updated_at \
             FROM opportunities ORDER BY created_at DESC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Store-wide staleness signal: true iff no record was created strictly
    /// within the last `max_age_hours`.
    pub async fn needs_refresh(&self, max_age_hours: i64) -> Result<bool, StoreError> {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let recent: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM opportunities WHERE created_at > ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        Ok(recent == 0)
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<OpportunityRecord, StoreError> {
    Ok(OpportunityRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        organization: row.try_get("organization")?,
        kind: row.try_get("type")?,
        deadline: row.try_get("deadline")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        tags: row.try_get("tags")?,
        is_verified: row.try_get("is_verified")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    async fn memory_store() -> OpportunityStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        let store = OpportunityStore::new(pool);
        store.init_schema().await.expect("schema");
        store
    }

    fn candidate(url: &str, title: &str) -> CandidateRecord {
        CandidateRecord {
            title: Some(title.to_string()),
            url: Some(url.to_string()),
            ..CandidateRecord::default()
        }
    }

    async fn set_created_at(store: &OpportunityStore, url: &str, created_at: DateTime<Utc>) {
        sqlx::query("UPDATE opportunities SET created_at = ? WHERE url = ?")
            .bind(created_at)
            .bind(url)
            .execute(store.pool())
            .await
            .expect("set created_at");
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = memory_store().await;
        let batch = vec![
            candidate("https://x.org/a", "Fulbright"),
            candidate("https://x.org/b", "Chevening"),
        ];
        assert_eq!(store.upsert_batch(&batch).await.unwrap(), 2);
        assert_eq!(store.upsert_batch(&batch).await.unwrap(), 0);
        assert_eq!(store.list_all(100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_url_updates_instead_of_inserting() {
        let store = memory_store().await;
        store
            .upsert_batch(&[candidate("https://x.org/a", "Old Title")])
            .await
            .unwrap();
        let before = store.list_all(10).await.unwrap().remove(0);
        assert!(before.updated_at.is_none());

        let mut updated = candidate("https://x.org/a", "New Title");
        updated.description = Some("refreshed".into());
        let added = store.upsert_batch(&[updated]).await.unwrap();
        assert_eq!(added, 0);

        let all = store.list_all(10).await.unwrap();
        assert_eq!(all.len(), 1);
        let after = &all[0];
        assert_eq!(after.title, "New Title");
        assert_eq!(after.description.as_deref(), Some("refreshed"));
        assert_eq!(after.id, before.id);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at.is_some());
    }

    #[tokio::test]
    async fn update_keeps_prior_values_for_absent_fields() {
        let store = memory_store().await;
        let mut first = candidate("https://x.org/a", "Fulbright");
        first.organization = Some("US State Dept".into());
        first.tags = Some("fully-funded,masters".into());
        store.upsert_batch(&[first]).await.unwrap();

        // Second pass carries only a title; the rest must survive.
        store
            .upsert_batch(&[candidate("https://x.org/a", "Fulbright 2027")])
            .await
            .unwrap();
        let record = store.list_all(10).await.unwrap().remove(0);
        assert_eq!(record.title, "Fulbright 2027");
        assert_eq!(record.organization.as_deref(), Some("US State Dept"));
        assert_eq!(record.tags.as_deref(), Some("fully-funded,masters"));
    }

    #[tokio::test]
    async fn candidates_without_url_are_skipped() {
        let store = memory_store().await;
        let batch = vec![
            CandidateRecord {
                title: Some("No URL".into()),
                ..CandidateRecord::default()
            },
            candidate("https://x.org/a", "Has URL"),
        ];
        assert_eq!(store.upsert_batch(&batch).await.unwrap(), 1);
        assert_eq!(store.list_all(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_deadline_is_stored_absent() {
        let store = memory_store().await;
        let mut bad = candidate("https://x.org/a", "Fuzzy Deadline");
        bad.deadline = Some("not-a-date".into());
        let mut good = candidate("https://x.org/b", "Crisp Deadline");
        good.deadline = Some("2026-12-31".into());
        assert_eq!(store.upsert_batch(&[bad, good]).await.unwrap(), 2);

        let mut all = store.list_all(10).await.unwrap();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        assert_eq!(all[0].deadline, None);
        assert_eq!(
            all[1].deadline,
            chrono::NaiveDate::from_ymd_opt(2026, 12, 31)
        );
    }

    #[tokio::test]
    async fn keyword_requires_every_term() {
        let store = memory_store().await;
        let mut funded = candidate("https://x.org/a", "Fully Funded PhD");
        funded.description = Some("A fully funded doctoral program".into());
        let partial = candidate("https://x.org/b", "Partially Funded MSc");
        store.upsert_batch(&[funded, partial]).await.unwrap();

        let hits = store
            .search(&SearchFilter {
                keyword: Some("fully funded".into()),
                ..SearchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://x.org/a");

        // A single matching term is enough only for single-term queries.
        let hits = store
            .search(&SearchFilter {
                keyword: Some("funded".into()),
                ..SearchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn keyword_matches_across_fields_case_insensitively() {
        let store = memory_store().await;
        let mut c = candidate("https://x.org/a", "Research Grant");
        c.organization = Some("DAAD".into());
        c.location = Some("Germany".into());
        store.upsert_batch(&[c]).await.unwrap();

        // One term hits the organization, the other the location.
        let hits = store
            .search(&SearchFilter {
                keyword: Some("daad GERMANY".into()),
                ..SearchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn region_and_type_filters_are_anded() {
        let store = memory_store().await;
        let mut usa = candidate("https://x.org/a", "Fulbright");
        usa.kind = Some("scholarship".into());
        usa.location = Some("USA".into());
        store.upsert_batch(&[usa]).await.unwrap();

        let hits = store
            .search(&SearchFilter {
                keyword: Some("fulbright".into()),
                ..SearchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Fulbright");

        let hits = store
            .search(&SearchFilter {
                keyword: Some("fulbright".into()),
                region: Some("Germany".into()),
                ..SearchFilter::default()
            })
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = store
            .search(&SearchFilter {
                kind: Some("scholar".into()),
                region: Some("usa".into()),
                ..SearchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn list_all_returns_newest_first_with_limit() {
        let store = memory_store().await;
        store
            .upsert_batch(&[
                candidate("https://x.org/old", "Old"),
                candidate("https://x.org/new", "New"),
            ])
            .await
            .unwrap();
        let now = Utc::now();
        set_created_at(&store, "https://x.org/old", now - Duration::hours(2)).await;
        set_created_at(&store, "https://x.org/new", now - Duration::hours(1)).await;

        let top = store.list_all(1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].url, "https://x.org/new");
    }

    #[tokio::test]
    async fn staleness_boundary_at_threshold() {
        let store = memory_store().await;
        store
            .upsert_batch(&[candidate("https://x.org/a", "Fulbright")])
            .await
            .unwrap();

        let now = Utc::now();
        set_created_at(
            &store,
            "https://x.org/a",
            now - Duration::hours(6) - Duration::seconds(1),
        )
        .await;
        assert!(store.needs_refresh(6).await.unwrap());

        set_created_at(
            &store,
            "https://x.org/a",
            now - Duration::hours(5) - Duration::minutes(59),
        )
        .await;
        assert!(!store.needs_refresh(6).await.unwrap());
    }

    #[tokio::test]
    async fn empty_store_always_needs_refresh() {
        let store = memory_store().await;
        assert!(store.needs_refresh(6).await.unwrap());
    }
}
