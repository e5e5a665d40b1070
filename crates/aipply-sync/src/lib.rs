//! Refresh orchestration: scraping collaborators, fire-and-forget refresh,
//! optional cron scheduling, and env configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aipply_core::CandidateRecord;
use aipply_store::OpportunityStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aipply-sync";

/// Anchors shorter than this are navigation chrome, not listings.
const MIN_ANCHOR_TEXT_LEN: usize = 8;
const MAX_CANDIDATES_PER_SOURCE: usize = 50;

/// Optional focus hints forwarded to the scraping collaborator.
#[derive(Debug, Clone, Default)]
pub struct ScrapeHints {
    pub keyword: Option<String>,
    pub region: Option<String>,
    pub kind: Option<String>,
}

/// External scraping collaborator: yields unvalidated candidate records.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, hints: &ScrapeHints) -> Result<Vec<CandidateRecord>>;
}

/// Counters for one refresh run.
#[derive(Debug, Clone, Copy)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub scraped: usize,
    pub added: u64,
}

/// Pulls candidates from the scraping collaborator and hands them to the
/// store's upsert path. Synchronous callers get counts back; background
/// callers get their errors logged and swallowed.
pub struct RefreshOrchestrator {
    store: OpportunityStore,
    scraper: Arc<dyn Scraper>,
}

impl RefreshOrchestrator {
    pub fn new(store: OpportunityStore, scraper: Arc<dyn Scraper>) -> Self {
        Self { store, scraper }
    }

    /// Scrape + upsert, blocking the caller. Admin-triggered path.
    pub async fn refresh(&self, hints: &ScrapeHints) -> Result<RefreshOutcome> {
        let run_id = Uuid::new_v4();
        let candidates = self
            .scraper
            .scrape(hints)
            .await
            .context("scraping collaborator failed")?;
        let added = self
            .store
            .upsert_batch(&candidates)
            .await
            .context("storing scraped candidates")?;
        info!(%run_id, scraped = candidates.len(), added, "refresh complete");
        Ok(RefreshOutcome {
            run_id,
            scraped: candidates.len(),
            added,
        })
    }

    /// Staleness-triggered path: runs after the in-flight response, never
    /// awaited by it. Failures end at the warn log.
    pub fn spawn_refresh(self: &Arc<Self>, hints: ScrapeHints) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = orchestrator.refresh(&hints).await {
                warn!(error = %err, ?hints, "background refresh failed");
            }
        });
    }

    /// Direct collaborator call, bypassing the store. Used as the degraded
    /// answer when the store query itself fails.
    pub async fn scrape_raw(&self, hints: &ScrapeHints) -> Result<Vec<CandidateRecord>> {
        self.scraper
            .scrape(hints)
            .await
            .context("scraping collaborator failed")
    }
}

/// One listing page to scrape.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_path(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Live collaborator: fetches each enabled listing page and extracts
/// keyword-matching anchors as candidates. Per-source failures are logged
/// and skipped; there is deliberately no retry or backoff here.
pub struct HttpScraper {
    client: reqwest::Client,
    registry: SourceRegistry,
}

impl HttpScraper {
    pub fn new(registry: SourceRegistry, user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, registry })
    }

    async fn scrape_source(
        &self,
        source: &SourceConfig,
        terms: &[String],
    ) -> Result<Vec<CandidateRecord>> {
        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .with_context(|| format!("fetching {}", source.url))?
            .error_for_status()
            .with_context(|| format!("fetching {}", source.url))?;
        let body = response
            .text()
            .await
            .with_context(|| format!("reading body of {}", source.url))?;
        extract_candidates(source, &body, terms)
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, hints: &ScrapeHints) -> Result<Vec<CandidateRecord>> {
        let terms: Vec<String> = hints
            .keyword
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let kind_hint = hints.kind.as_deref().map(str::to_lowercase);

        let mut out = Vec::new();
        for source in self.registry.sources.iter().filter(|s| s.enabled) {
            if let (Some(hint), Some(kind)) = (kind_hint.as_deref(), source.kind.as_deref()) {
                if !kind.to_lowercase().contains(hint) {
                    continue;
                }
            }
            match self.scrape_source(source, &terms).await {
                Ok(mut candidates) => out.append(&mut candidates),
                Err(err) => {
                    warn!(source = %source.name, error = %err, "source scrape failed, skipping")
                }
            }
        }
        Ok(out)
    }
}

// `Html` is not `Send`, so all document work stays in this synchronous helper
// instead of crossing an await point.
fn extract_candidates(
    source: &SourceConfig,
    body: &str,
    terms: &[String],
) -> Result<Vec<CandidateRecord>> {
    let document = Html::parse_document(body);
    let anchors =
        Selector::parse("a[href]").map_err(|err| anyhow!("anchor selector: {err:?}"))?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for element in document.select(&anchors) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !href.starts_with("http") {
            continue;
        }
        let text = element
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if text.len() < MIN_ANCHOR_TEXT_LEN {
            continue;
        }
        let haystack = text.to_lowercase();
        if !terms.iter().all(|term| haystack.contains(term)) {
            continue;
        }
        if !seen.insert(href.to_string()) {
            continue;
        }
        out.push(CandidateRecord {
            title: Some(text),
            url: Some(href.to_string()),
            kind: source.kind.clone(),
            organization: Some(source.name.clone()),
            ..CandidateRecord::default()
        });
        if out.len() >= MAX_CANDIDATES_PER_SOURCE {
            break;
        }
    }
    Ok(out)
}

/// Fixture-backed collaborator: a JSON array of candidate records on disk.
pub struct FixtureScraper {
    path: PathBuf,
}

impl FixtureScraper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Scraper for FixtureScraper {
    async fn scrape(&self, _hints: &ScrapeHints) -> Result<Vec<CandidateRecord>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub stale_after_hours: i64,
    pub sources_path: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://aipply.db".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            stale_after_hours: std::env::var("AIPPLY_STALE_AFTER_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6),
            sources_path: std::env::var("AIPPLY_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            scheduler_enabled: std::env::var("AIPPLY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("AIPPLY_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            user_agent: std::env::var("AIPPLY_USER_AGENT")
                .unwrap_or_else(|_| "aipply-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("AIPPLY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Optional cron-driven refresh; disabled unless configured. Job failures
/// are logged inside the job body.
pub async fn maybe_build_scheduler(
    config: &AppConfig,
    orchestrator: Arc<RefreshOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_id, _sched| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            match orchestrator.refresh(&ScrapeHints::default()).await {
                Ok(outcome) => info!(
                    run_id = %outcome.run_id,
                    scraped = outcome.scraped,
                    added = outcome.added,
                    "scheduled refresh complete"
                ),
                Err(err) => warn!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {cron}"))?;
    sched.add(job).await.context("adding refresh job")?;
    Ok(Some(sched))
}
