//! Query execution pipeline: preflight, batch execution, manifest, schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use btpi_core::{http_date, BatchOutcome, QueryDefinition, QueryUpdate, StatusChange};
use btpi_net::{ConnectivityProber, HttpReachability, TokioSleeper};
use btpi_storage::{render_first_row, ManifestWriter, OutputStore, StorageError};
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod pg;

pub use config::{AppConfig, ConfigSources};
pub use pg::PgQuerySource;

pub const CRATE_NAME: &str = "btpi-sync";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("connecting to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("connecting to {target} timed out after {timeout_ms} ms")]
    ConnectTimeout { target: String, timeout_ms: u64 },
    #[error("executing query: {0}")]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where batches get their database connection. Production uses
/// [`PgQuerySource`]; tests substitute scripted sources.
#[async_trait]
pub trait QuerySource: Send + Sync {
    fn describe(&self) -> String;

    async fn connect(&self, timeout: Duration) -> Result<Box<dyn QueryConnection>, ExecutorError>;
}

#[async_trait]
pub trait QueryConnection: Send {
    /// Runs `sql` verbatim and materializes every row.
    async fn fetch_rows(&mut self, sql: &str) -> Result<Vec<Map<String, Value>>, ExecutorError>;

    async fn close(self: Box<Self>) -> Result<(), ExecutorError>;
}

#[derive(Debug, Clone, Copy)]
/// Preflight cadence. The per-attempt timeout is the batch's connect timeout.
pub struct ProbeSettings {
    pub sleep_between: Duration,
    pub max_retries: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            sleep_between: Duration::from_secs(3),
            max_retries: 4,
        }
    }
}

pub struct QueryExecutor {
    source: Arc<dyn QuerySource>,
    prober: ConnectivityProber,
    outputs: OutputStore,
    manifest: ManifestWriter,
    probe: ProbeSettings,
    json_spaces: usize,
}

impl QueryExecutor {
    pub fn new(
        source: Arc<dyn QuerySource>,
        prober: ConnectivityProber,
        manifest: ManifestWriter,
    ) -> Self {
        Self {
            source,
            prober,
            outputs: OutputStore::new(),
            manifest,
            probe: ProbeSettings::default(),
            json_spaces: 2,
        }
    }

    pub fn with_probe_settings(mut self, probe: ProbeSettings) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_json_spaces(mut self, spaces: usize) -> Self {
        self.json_spaces = spaces;
        self
    }

    pub fn manifest_writer(&self) -> &ManifestWriter {
        &self.manifest
    }

    /// Runs one batch over `queries` and reports what changed.
    ///
    /// The definitions are not mutated; callers merge `updates` themselves.
    /// Output files written before a failure are kept.
    pub async fn run(
        &self,
        queries: &[QueryDefinition],
        timeout: Duration,
        record_manifest: bool,
    ) -> BatchOutcome {
        let started_at = http_date(Utc::now());
        if !queries.iter().any(|q| q.enabled) {
            warn!(configured = queries.len(), "no enabled queries to run; check the configuration");
            return BatchOutcome::failed(started_at);
        }

        let online = self
            .prober
            .probe(timeout, self.probe.sleep_between, self.probe.max_retries)
            .await;
        if !online {
            // Not fatal: connectivity may return before the next tick.
            error!("no internet connection; skipping database work");
            return BatchOutcome::failed(started_at);
        }

        let mut outcome = BatchOutcome {
            succeeded: true,
            started_at,
            updates: Vec::new(),
            manifest: Vec::new(),
        };
        let mut in_flight: Option<String> = None;

        if let Err(err) = self
            .run_batch(queries, timeout, record_manifest, &mut outcome, &mut in_flight)
            .await
        {
            error!(error = %err, query = in_flight.as_deref().unwrap_or("-"), "batch aborted");
            if let Some(name) = in_flight {
                outcome.updates.push(QueryUpdate {
                    name,
                    change: StatusChange::Failed {
                        error: err.to_string(),
                    },
                });
            }
            outcome.succeeded = false;
        }
        outcome
    }

    async fn run_batch(
        &self,
        queries: &[QueryDefinition],
        timeout: Duration,
        record_manifest: bool,
        outcome: &mut BatchOutcome,
        in_flight: &mut Option<String>,
    ) -> Result<(), ExecutorError> {
        let mut conn = self.source.connect(timeout).await?;
        info!(db = %self.source.describe(), "connected to database");

        let result = self
            .run_queries(conn.as_mut(), queries, record_manifest, outcome, in_flight)
            .await;
        // Released on every path, including a failed query.
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing database connection failed");
        }
        result
    }

    async fn run_queries(
        &self,
        conn: &mut dyn QueryConnection,
        queries: &[QueryDefinition],
        record_manifest: bool,
        outcome: &mut BatchOutcome,
        in_flight: &mut Option<String>,
    ) -> Result<(), ExecutorError> {
        for query in queries {
            if !query.enabled {
                info!(query = %query.name, "query is not enabled; skipping");
                continue;
            }

            *in_flight = Some(query.name.clone());
            info!(query = %query.name, "executing query");
            let rows = conn.fetch_rows(&query.sql).await?;

            let Some(first) = rows.first() else {
                warn!(query = %query.name, "query returned no results");
                *in_flight = None;
                continue;
            };

            let rendered = match render_first_row(first, self.json_spaces) {
                Ok(rendered) => rendered,
                Err(err) => {
                    error!(query = %query.name, error = %err, "unable to render query results");
                    outcome.updates.push(QueryUpdate {
                        name: query.name.clone(),
                        change: StatusChange::Failed {
                            error: err.to_string(),
                        },
                    });
                    *in_flight = None;
                    continue;
                }
            };

            // Maintenance statements may have no output file.
            if query.has_output() {
                self.outputs.write_text(&query.file, &rendered.text).await?;
                info!(
                    query = %query.name,
                    file = %query.file,
                    last_modified = %outcome.started_at,
                    mode = ?rendered.mode,
                    "query results written"
                );
                outcome
                    .manifest
                    .push(self.manifest.entry_for(&query.name, &query.title, &query.file));
            }

            outcome.updates.push(QueryUpdate {
                name: query.name.clone(),
                change: StatusChange::Succeeded {
                    last_modified: outcome.started_at.clone(),
                },
            });
            *in_flight = None;
        }

        if record_manifest && !outcome.manifest.is_empty() {
            self.manifest.write(&outcome.manifest).await?;
        }
        Ok(())
    }
}

/// Process-lifetime owner of the configured query definitions.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    queries: RwLock<Vec<QueryDefinition>>,
}

impl QueryRegistry {
    pub fn new(queries: Vec<QueryDefinition>) -> Self {
        Self {
            queries: RwLock::new(queries),
        }
    }

    pub async fn snapshot(&self) -> Vec<QueryDefinition> {
        self.queries.read().await.clone()
    }

    /// Exact, case-sensitive match on `Name`.
    pub async fn find(&self, name: &str) -> Option<QueryDefinition> {
        self.queries
            .read()
            .await
            .iter()
            .find(|q| q.name == name)
            .cloned()
    }

    pub async fn enabled_count(&self) -> usize {
        self.queries.read().await.iter().filter(|q| q.enabled).count()
    }

    pub async fn first_last_modified(&self) -> Option<String> {
        self.queries
            .read()
            .await
            .iter()
            .find(|q| !q.last_modified.is_empty())
            .map(|q| q.last_modified.clone())
    }

    pub async fn first_error(&self) -> Option<QueryDefinition> {
        self.queries
            .read()
            .await
            .iter()
            .find(|q| !q.error.is_empty())
            .cloned()
    }

    /// Merges a batch's updates by `Name`.
    ///
    /// Batches are not serialized against each other: a scheduled run and a
    /// manual `/data` request can overlap, write the same files, and land
    /// here in completion order. The later merge wins for any query both
    /// touched.
    pub async fn apply(&self, outcome: &BatchOutcome) {
        let mut queries = self.queries.write().await;
        for update in &outcome.updates {
            for query in queries.iter_mut().filter(|q| q.name == update.name) {
                query.apply(&update.change);
            }
        }
    }
}

/// Executor plus registry: what the HTTP surface and the scheduler drive.
pub struct ReportService {
    executor: QueryExecutor,
    registry: QueryRegistry,
    db_timeout: Duration,
}

impl ReportService {
    pub fn new(executor: QueryExecutor, registry: QueryRegistry, db_timeout: Duration) -> Self {
        Self {
            executor,
            registry,
            db_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = btpi_net::build_client(&btpi_net::HttpClientConfig::default())?;
        let prober = ConnectivityProber::new(
            Arc::new(HttpReachability::new(client)),
            Arc::new(TokioSleeper),
        );
        let source = PgQuerySource::from_settings(&config.database)
            .context("building database connect options")?;
        let manifest = ManifestWriter::new(config.btpi.manifest_path(), &config.btpi.public_root);
        let executor = QueryExecutor::new(Arc::new(source), prober, manifest)
            .with_probe_settings(ProbeSettings {
                sleep_between: config.btpi.probe_sleep(),
                max_retries: config.btpi.probe_retries,
            })
            .with_json_spaces(config.btpi.json_spaces);
        Ok(Self::new(
            executor,
            QueryRegistry::new(config.queries.clone()),
            config.database.connection_timeout(),
        ))
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub async fn run_all(&self) -> BatchOutcome {
        let queries = self.registry.snapshot().await;
        let outcome = self.executor.run(&queries, self.db_timeout, true).await;
        self.registry.apply(&outcome).await;
        outcome
    }

    /// Runs one named query without touching the manifest. `None` when no
    /// definition has that name.
    pub async fn run_one(&self, name: &str) -> Option<(BatchOutcome, QueryDefinition)> {
        let query = self.registry.find(name).await?;
        let outcome = self
            .executor
            .run(std::slice::from_ref(&query), self.db_timeout, false)
            .await;
        self.registry.apply(&outcome).await;
        let updated = self.registry.find(name).await.unwrap_or(query);
        Some((outcome, updated))
    }
}

/// The scheduler wants a leading seconds field; classic 5-field cron
/// expressions fire at second 0.
pub fn with_seconds_field(cron: &str) -> String {
    let cron = cron.trim();
    if cron.split_whitespace().count() == 5 {
        format!("0 {cron}")
    } else {
        cron.to_string()
    }
}

/// Registers a job that runs every query on `cron`, evaluated in local time.
pub async fn build_scheduler(service: Arc<ReportService>, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let schedule = with_seconds_field(cron);
    let job = Job::new_async_tz(schedule.as_str(), chrono::Local, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            info!("running scheduled job");
            let outcome = service.run_all().await;
            if !outcome.succeeded {
                warn!("scheduled job did not complete successfully");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, %schedule, "schedule created");
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use btpi_core::ManifestEntry;
    use btpi_net::{NoopSleeper, Reachability};
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Online {
        online: bool,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl Reachability for Online {
        async fn reachable(&self, _host: &str, timeout: Duration) -> bool {
            self.journal.probe_timeouts.lock().unwrap().push(timeout);
            self.online
        }
    }

    #[derive(Clone)]
    enum Script {
        Rows(Vec<Value>),
        Fail(&'static str),
    }

    #[derive(Default)]
    struct Journal {
        executed: Mutex<Vec<String>>,
        connects: AtomicUsize,
        probe_timeouts: Mutex<Vec<Duration>>,
        closes: AtomicUsize,
    }

    struct ScriptedSource {
        scripts: HashMap<String, Script>,
        refuse_connect: bool,
        journal: Arc<Journal>,
    }

    struct ScriptedConnection {
        scripts: HashMap<String, Script>,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl QuerySource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".into()
        }

        async fn connect(&self, _timeout: Duration) -> Result<Box<dyn QueryConnection>, ExecutorError> {
            self.journal.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connect {
                return Err(ExecutorError::ConnectTimeout {
                    target: "scripted".into(),
                    timeout_ms: 1,
                });
            }
            Ok(Box::new(ScriptedConnection {
                scripts: self.scripts.clone(),
                journal: self.journal.clone(),
            }))
        }
    }

    #[async_trait]
    impl QueryConnection for ScriptedConnection {
        async fn fetch_rows(&mut self, sql: &str) -> Result<Vec<Map<String, Value>>, ExecutorError> {
            self.journal.executed.lock().unwrap().push(sql.to_string());
            match self.scripts.get(sql) {
                Some(Script::Rows(rows)) => Ok(rows
                    .iter()
                    .map(|r| r.as_object().cloned().expect("row objects"))
                    .collect()),
                Some(Script::Fail(msg)) => Err(ExecutorError::Sql(sqlx::Error::Protocol(msg.to_string()))),
                None => Ok(Vec::new()),
            }
        }

        async fn close(self: Box<Self>) -> Result<(), ExecutorError> {
            self.journal.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        dir: TempDir,
        journal: Arc<Journal>,
        executor: QueryExecutor,
    }

    impl Harness {
        fn new(scripts: &[(&str, Script)]) -> Self {
            Self::build(scripts, true, false)
        }

        fn build(scripts: &[(&str, Script)], online: bool, refuse_connect: bool) -> Self {
            let dir = tempdir().expect("tempdir");
            let journal = Arc::new(Journal::default());
            let source = ScriptedSource {
                scripts: scripts
                    .iter()
                    .map(|(sql, s)| (sql.to_string(), s.clone()))
                    .collect(),
                refuse_connect,
                journal: journal.clone(),
            };
            let prober = ConnectivityProber::new(
                Arc::new(Online {
                    online,
                    journal: journal.clone(),
                }),
                Arc::new(NoopSleeper::default()),
            );
            let public = dir.path().join("public");
            let manifest = ManifestWriter::new(public.join("data").join("queryList.json"), &public);
            let executor = QueryExecutor::new(Arc::new(source), prober, manifest);
            Self {
                dir,
                journal,
                executor,
            }
        }

        fn out(&self, name: &str) -> PathBuf {
            self.dir.path().join("public").join("data").join(format!("{name}.json"))
        }

        fn manifest_path(&self) -> PathBuf {
            self.dir.path().join("public").join("data").join("queryList.json")
        }

        fn query(&self, name: &str, sql: &str, enabled: bool) -> QueryDefinition {
            QueryDefinition {
                name: name.into(),
                title: format!("{name} title"),
                sql: sql.into(),
                file: self.out(name).display().to_string(),
                enabled,
                last_modified: String::new(),
                error: String::new(),
            }
        }

        fn executed(&self) -> Vec<String> {
            self.journal.executed.lock().unwrap().clone()
        }

        fn manifest(&self) -> Vec<ManifestEntry> {
            serde_json::from_str(&std::fs::read_to_string(self.manifest_path()).unwrap()).unwrap()
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn disabled_queries_are_never_executed_or_published() {
        let h = Harness::new(&[
            ("q_on", Script::Rows(vec![json!({"n": 1})])),
            ("q_off", Script::Rows(vec![json!({"n": 2})])),
        ]);
        let mut off = h.query("off", "q_off", false);
        off.last_modified = "Mon, 02 Feb 2026 10:00:00 GMT".into();
        off.error = "stale".into();
        let queries = vec![h.query("on", "q_on", true), off.clone()];

        let outcome = h.executor.run(&queries, TIMEOUT, true).await;

        assert!(outcome.succeeded);
        assert_eq!(h.executed(), vec!["q_on".to_string()]);
        assert!(!h.out("off").exists());
        assert!(outcome.update_for("off").is_none());
        assert_eq!(h.manifest().len(), 1);
        assert_eq!(h.manifest()[0].name, "on");

        let registry = QueryRegistry::new(queries);
        registry.apply(&outcome).await;
        assert_eq!(registry.find("off").await.unwrap(), off);
    }

    #[tokio::test]
    async fn embedded_json_is_reserialized_and_bad_json_is_isolated() {
        let h = Harness::new(&[
            ("q_good", Script::Rows(vec![json!({"JSON_F52E": "[{\"id\":1,\"qty\":3}]"})])),
            ("q_bad", Script::Rows(vec![json!({"JSON_F52E": "[{\"id\":1,"})])),
            ("q_row", Script::Rows(vec![json!({"total": 12, "label": "open"})])),
        ]);
        std::fs::create_dir_all(h.out("bad").parent().unwrap()).unwrap();
        std::fs::write(h.out("bad"), "previous").unwrap();
        let queries = vec![
            h.query("good", "q_good", true),
            h.query("bad", "q_bad", true),
            h.query("row", "q_row", true),
        ];

        let outcome = h.executor.run(&queries, TIMEOUT, true).await;

        assert!(outcome.succeeded);
        let expected = serde_json::to_string_pretty(&json!([{"id": 1, "qty": 3}])).unwrap();
        assert_eq!(read(&h.out("good")), expected);
        assert_eq!(read(&h.out("bad")), "previous");
        assert_eq!(
            read(&h.out("row")),
            "{\n  \"total\": 12,\n  \"label\": \"open\"\n}"
        );
        assert!(matches!(outcome.update_for("bad"), Some(StatusChange::Failed { .. })));
        assert!(matches!(outcome.update_for("row"), Some(StatusChange::Succeeded { .. })));
        let names = h.manifest().into_iter().map(|e| e.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["good".to_string(), "row".to_string()]);
    }

    #[tokio::test]
    async fn zero_queries_fail_without_connecting() {
        let h = Harness::new(&[]);
        let outcome = h.executor.run(&[], TIMEOUT, true).await;
        assert!(!outcome.succeeded);
        assert_eq!(h.journal.connects.load(Ordering::SeqCst), 0);
        assert!(!h.manifest_path().exists());
    }

    #[tokio::test]
    async fn only_disabled_queries_fail_before_the_preflight() {
        let h = Harness::new(&[("q", Script::Rows(vec![json!({"a": 1})]))]);
        let outcome = h.executor.run(&[h.query("a", "q", false)], TIMEOUT, true).await;
        assert!(!outcome.succeeded);
        assert!(outcome.updates.is_empty());
        assert!(h.journal.probe_timeouts.lock().unwrap().is_empty());
        assert_eq!(h.journal.connects.load(Ordering::SeqCst), 0);
        assert!(!h.manifest_path().exists());
    }

    #[tokio::test]
    async fn preflight_attempts_use_the_batch_timeout() {
        let h = Harness::build(&[], false, false);
        let timeout = Duration::from_millis(1234);
        let outcome = h.executor.run(&[h.query("a", "q", true)], timeout, true).await;
        assert!(!outcome.succeeded);
        let seen = h.journal.probe_timeouts.lock().unwrap().clone();
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|t| *t == timeout));
    }

    #[tokio::test]
    async fn offline_preflight_skips_database_work() {
        let h = Harness::build(&[("q", Script::Rows(vec![json!({"a": 1})]))], false, false);
        let outcome = h.executor.run(&[h.query("a", "q", true)], TIMEOUT, true).await;
        assert!(!outcome.succeeded);
        assert!(outcome.updates.is_empty());
        assert_eq!(h.journal.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rows_plus_empty_result_yield_one_file_and_one_entry() {
        let h = Harness::new(&[
            ("q_rows", Script::Rows(vec![json!({"a": 1}), json!({"a": 2})])),
            ("q_empty", Script::Rows(vec![])),
        ]);
        let mut empty = h.query("empty", "q_empty", true);
        empty.error = "left from last time".into();
        let queries = vec![h.query("rows", "q_rows", true), empty];
        let registry = QueryRegistry::new(queries.clone());

        let outcome = h.executor.run(&queries, TIMEOUT, true).await;
        registry.apply(&outcome).await;

        assert!(outcome.succeeded);
        assert!(h.out("rows").exists());
        assert!(!h.out("empty").exists());
        assert_eq!(h.manifest().len(), 1);
        assert_eq!(h.manifest()[0].file, "data/rows.json");
        let empty = registry.find("empty").await.unwrap();
        assert_eq!(empty.error, "left from last time");
        assert!(empty.last_modified.is_empty());
        let rows = registry.find("rows").await.unwrap();
        assert_eq!(rows.last_modified, outcome.started_at);
    }

    #[tokio::test]
    async fn sql_error_aborts_but_keeps_earlier_outputs() {
        let h = Harness::new(&[
            ("q1", Script::Rows(vec![json!({"a": 1})])),
            ("q2", Script::Fail("relation \"missing\" does not exist")),
            ("q3", Script::Rows(vec![json!({"c": 3})])),
        ]);
        let queries = vec![
            h.query("first", "q1", true),
            h.query("second", "q2", true),
            h.query("third", "q3", true),
        ];

        let outcome = h.executor.run(&queries, TIMEOUT, true).await;

        assert!(!outcome.succeeded);
        assert!(h.out("first").exists());
        assert!(!h.out("third").exists());
        assert_eq!(h.executed(), vec!["q1".to_string(), "q2".to_string()]);
        assert_eq!(h.journal.closes.load(Ordering::SeqCst), 1);
        assert!(!h.manifest_path().exists());
        match outcome.update_for("second") {
            Some(StatusChange::Failed { error }) => assert!(error.contains("missing")),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_failure_fails_the_batch() {
        let h = Harness::build(&[("q", Script::Rows(vec![json!({"a": 1})]))], true, true);
        let outcome = h.executor.run(&[h.query("a", "q", true)], TIMEOUT, true).await;
        assert!(!outcome.succeeded);
        assert!(outcome.updates.is_empty());
        assert!(h.executed().is_empty());
    }

    #[tokio::test]
    async fn maintenance_statement_updates_bookkeeping_without_a_file() {
        let h = Harness::new(&[("CALL refresh_stats()", Script::Rows(vec![json!({"ok": true})]))]);
        let mut q = h.query("maint", "CALL refresh_stats()", true);
        q.file.clear();

        let outcome = h.executor.run(&[q], TIMEOUT, true).await;

        assert!(outcome.succeeded);
        assert!(matches!(outcome.update_for("maint"), Some(StatusChange::Succeeded { .. })));
        assert!(outcome.manifest.is_empty());
        assert!(!h.manifest_path().exists());
    }

    #[tokio::test]
    async fn single_query_runs_leave_the_manifest_alone() {
        let h = Harness::new(&[("q", Script::Rows(vec![json!({"a": 1})]))]);
        let outcome = h.executor.run(&[h.query("a", "q", true)], TIMEOUT, false).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.manifest.len(), 1);
        assert!(h.out("a").exists());
        assert!(!h.manifest_path().exists());
    }

    #[tokio::test]
    async fn overlapping_batches_merge_last_writer_wins() {
        let q = QueryDefinition {
            name: "a".into(),
            title: String::new(),
            sql: "q".into(),
            file: String::new(),
            enabled: true,
            last_modified: String::new(),
            error: String::new(),
        };
        let registry = QueryRegistry::new(vec![q]);
        let scheduled = BatchOutcome {
            succeeded: true,
            started_at: "Mon, 02 Feb 2026 10:00:00 GMT".into(),
            updates: vec![QueryUpdate {
                name: "a".into(),
                change: StatusChange::Succeeded {
                    last_modified: "Mon, 02 Feb 2026 10:00:00 GMT".into(),
                },
            }],
            manifest: vec![],
        };
        let manual = BatchOutcome {
            succeeded: false,
            started_at: "Mon, 02 Feb 2026 09:59:58 GMT".into(),
            updates: vec![QueryUpdate {
                name: "a".into(),
                change: StatusChange::Failed {
                    error: "lost the connection".into(),
                },
            }],
            manifest: vec![],
        };

        // The manual run started first but finished last.
        registry.apply(&scheduled).await;
        registry.apply(&manual).await;

        let a = registry.find("a").await.unwrap();
        assert_eq!(a.error, "lost the connection");
        assert_eq!(a.last_modified, "Mon, 02 Feb 2026 10:00:00 GMT");
    }

    #[tokio::test]
    async fn run_one_matches_names_case_sensitively() {
        let h = Harness::new(&[("q", Script::Rows(vec![json!({"a": 1})]))]);
        let q = h.query("LastApproved", "q", true);
        let out = h.out("LastApproved");
        let service = ReportService::new(h.executor, QueryRegistry::new(vec![q]), TIMEOUT);

        assert!(service.run_one("lastapproved").await.is_none());
        let (outcome, updated) = service.run_one("LastApproved").await.unwrap();
        assert!(outcome.succeeded);
        assert_eq!(updated.last_modified, outcome.started_at);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn scheduler_accepts_the_default_cadence_and_rejects_garbage() {
        let h = Harness::new(&[]);
        let service = Arc::new(ReportService::new(h.executor, QueryRegistry::new(Vec::new()), TIMEOUT));

        assert!(build_scheduler(service.clone(), config::DEFAULT_INTERVAL).await.is_ok());
        assert!(build_scheduler(service.clone(), "0 15 6 * * *").await.is_ok());
        match build_scheduler(service, "every half hour").await {
            Ok(_) => panic!("garbage cron accepted"),
            Err(err) => assert!(err.to_string().contains("every half hour")),
        }
    }

    #[test]
    fn five_field_cron_gains_a_seconds_field() {
        assert_eq!(with_seconds_field("*/30 8-17 * * 1-5"), "0 */30 8-17 * * 1-5");
        assert_eq!(with_seconds_field(" 0 6 * * * "), "0 0 6 * * *");
        assert_eq!(with_seconds_field("0 15 6 * * *"), "0 15 6 * * *");
    }
}
