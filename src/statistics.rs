use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub outcome: String,
    pub count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_messages: u64,
    pub total_scanned: u64,
    pub total_matches: u64,
    pub total_reports: u64,
    pub total_report_failures: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    /// A hook ran for a message.
    MessageSeen,
    /// The message was skipped before reaching the matching service.
    Skipped { reason: String },
    /// The matching service was consulted.
    Scanned,
    /// Positive match, with the quarantine action taken.
    Matched { action: String },
    ReportSubmitted,
    ReportFailed,
}

pub struct StatisticsCollector {
    db_path: String,
    sender: mpsc::UnboundedSender<StatEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    /// Must be called inside a tokio runtime.
    pub fn new(db_path: String, flush_interval_seconds: u64) -> Result<Self> {
        if let Some(parent) = Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create stats directory: {}", parent.display())
            })?;
        }
        // Fail early on an unusable database path.
        Self::init_database(&db_path)?;

        let (sender, receiver) = mpsc::unbounded_channel();

        let db_path_clone = db_path.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                Self::stats_worker(db_path_clone, receiver, flush_interval_seconds.max(1)).await
            {
                log::error!("Statistics worker error: {e}");
            }
        });

        Ok(Self {
            db_path,
            sender,
            handle,
        })
    }

    pub fn record_event(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("Failed to send statistics event: {e}");
        }
    }

    /// Closes the event channel and waits for the final flush.
    pub async fn shutdown(self) {
        let StatisticsCollector { sender, handle, .. } = self;
        drop(sender);
        if let Err(e) = handle.await {
            log::warn!("Statistics worker did not shut down cleanly: {e}");
        }
    }

    async fn stats_worker(
        db_path: String,
        mut receiver: mpsc::UnboundedReceiver<StatEvent>,
        flush_interval_seconds: u64,
    ) -> Result<()> {
        let conn = Self::init_database(&db_path)?;
        let mut buffer: HashMap<String, OutcomeStats> = HashMap::new();
        let mut pending = GlobalDelta::default();

        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds));

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => Self::process_event(event, &mut buffer, &mut pending),
                        None => {
                            Self::flush_to_database(&conn, &buffer, &pending)?;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if buffer.is_empty() && pending.is_empty() {
                        continue;
                    }
                    match Self::flush_to_database(&conn, &buffer, &pending) {
                        Ok(()) => {
                            buffer.clear();
                            pending = GlobalDelta::default();
                        }
                        Err(e) => log::error!("Failed to flush statistics: {e}"),
                    }
                }
            }
        }

        Ok(())
    }

    fn process_event(
        event: StatEvent,
        buffer: &mut HashMap<String, OutcomeStats>,
        pending: &mut GlobalDelta,
    ) {
        let mut bump = |outcome: String| {
            let now = Utc::now();
            let stats = buffer
                .entry(outcome.clone())
                .or_insert_with(|| OutcomeStats {
                    outcome,
                    count: 0,
                    first_seen: Some(now),
                    last_seen: Some(now),
                });
            stats.count += 1;
            stats.last_seen = Some(now);
        };

        match event {
            StatEvent::MessageSeen => pending.messages += 1,
            StatEvent::Skipped { reason } => bump(format!("skipped:{reason}")),
            StatEvent::Scanned => pending.scanned += 1,
            StatEvent::Matched { action } => {
                pending.matches += 1;
                bump(format!("matched:{action}"));
            }
            StatEvent::ReportSubmitted => pending.reports += 1,
            StatEvent::ReportFailed => pending.report_failures += 1,
        }
    }

    fn init_database(db_path: &str) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open statistics database: {db_path}"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outcome_stats (
                outcome TEXT PRIMARY KEY,
                hits INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT,
                last_seen TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS global_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_messages INTEGER NOT NULL DEFAULT 0,
                total_scanned INTEGER NOT NULL DEFAULT 0,
                total_matches INTEGER NOT NULL DEFAULT 0,
                total_reports INTEGER NOT NULL DEFAULT 0,
                total_report_failures INTEGER NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )",
            [],
        )?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO global_stats (id, start_time, last_updated) VALUES (1, ?1, ?2)",
            params![now, now],
        )?;

        Ok(conn)
    }

    fn flush_to_database(
        conn: &Connection,
        buffer: &HashMap<String, OutcomeStats>,
        pending: &GlobalDelta,
    ) -> Result<()> {
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "UPDATE global_stats SET
                total_messages = total_messages + ?1,
                total_scanned = total_scanned + ?2,
                total_matches = total_matches + ?3,
                total_reports = total_reports + ?4,
                total_report_failures = total_report_failures + ?5,
                last_updated = ?6
             WHERE id = 1",
            params![
                pending.messages,
                pending.scanned,
                pending.matches,
                pending.reports,
                pending.report_failures,
                Utc::now().to_rfc3339()
            ],
        )?;

        for stats in buffer.values() {
            tx.execute(
                "INSERT INTO outcome_stats (outcome, hits, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(outcome) DO UPDATE SET
                    hits = hits + excluded.hits,
                    last_seen = excluded.last_seen",
                params![
                    stats.outcome,
                    stats.count,
                    stats.first_seen.map(|t| t.to_rfc3339()),
                    stats.last_seen.map(|t| t.to_rfc3339()),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<(GlobalStats, Vec<OutcomeStats>)> {
        let conn = Self::init_database(&self.db_path)?;

        let global_stats = conn.query_row(
            "SELECT total_messages, total_scanned, total_matches, total_reports,
                    total_report_failures, start_time, last_updated
             FROM global_stats WHERE id = 1",
            [],
            |row| {
                Ok(GlobalStats {
                    total_messages: row.get(0)?,
                    total_scanned: row.get(1)?,
                    total_matches: row.get(2)?,
                    total_reports: row.get(3)?,
                    total_report_failures: row.get(4)?,
                    start_time: parse_timestamp(&row.get::<_, String>(5)?),
                    last_updated: parse_timestamp(&row.get::<_, String>(6)?),
                })
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT outcome, hits, first_seen, last_seen FROM outcome_stats ORDER BY hits DESC",
        )?;
        let outcome_stats = stmt
            .query_map([], |row| {
                Ok(OutcomeStats {
                    outcome: row.get(0)?,
                    count: row.get(1)?,
                    first_seen: row.get::<_, Option<String>>(2)?.map(|s| parse_timestamp(&s)),
                    last_seen: row.get::<_, Option<String>>(3)?.map(|s| parse_timestamp(&s)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((global_stats, outcome_stats))
    }

    pub fn reset_stats(&self) -> Result<()> {
        let conn = Self::init_database(&self.db_path)?;
        let now = Utc::now().to_rfc3339();

        conn.execute("DELETE FROM outcome_stats", [])?;
        conn.execute(
            "UPDATE global_stats SET
                total_messages = 0, total_scanned = 0, total_matches = 0,
                total_reports = 0, total_report_failures = 0,
                start_time = ?1, last_updated = ?2
             WHERE id = 1",
            params![now, now],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GlobalDelta {
    messages: u64,
    scanned: u64,
    matches: u64,
    reports: u64,
    report_failures: u64,
}

impl GlobalDelta {
    fn is_empty(&self) -> bool {
        self.messages == 0
            && self.scanned == 0
            && self.matches == 0
            && self.reports == 0
            && self.report_failures == 0
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
