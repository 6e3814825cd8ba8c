//! Relational storage for agent runs, steps and explanations
//!
//! SQLite with WAL journaling, one pool per process. Inserts are idempotent
//! on (project_id, run_id): re-ingesting a run is a no-op that leaves the
//! originally derived flags and opportunities untouched.

pub mod schema;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::agent_runs::flags::StepExplanation;
use crate::agent_runs::types::{
    AgentStep, CachingOpportunity, CostSummary, Flag, RunStatus, StepType,
};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// A fully persisted run as read back from the store.
#[derive(Clone, Debug)]
pub struct StoredRun {
    pub run_id: String,
    pub project_id: String,
    pub agent_name: String,
    pub status: RunStatus,
    pub summary: CostSummary,
    pub flags: Vec<Flag>,
    pub opportunities: Vec<CachingOpportunity>,
    pub steps: Vec<AgentStep>,
}

/// Record handed to [`PersistenceLayer::insert_run`].
pub struct RunRecord<'a> {
    pub project_id: &'a str,
    pub run_id: &'a str,
    pub agent_name: &'a str,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub user_id: Option<&'a str>,
    pub summary: &'a CostSummary,
    pub flags: &'a [Flag],
    pub opportunities: &'a [CachingOpportunity],
    pub steps: &'a [AgentStep],
    pub explanations: &'a [StepExplanation],
}

pub struct PersistenceLayer {
    pool: SqlitePool,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl PersistenceLayer {
    pub async fn new(db_path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(&database_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
        sqlx::raw_sql(schema::SCHEMA).execute(&pool).await?;

        info!("agent run store initialized at {:?}", db_path);
        Ok(Self { pool, db_path: db_path.to_path_buf() })
    }

    /// Insert a run with all of its children in one transaction. Returns
    /// `false` without writing anything when the run already exists.
    pub async fn insert_run(&self, record: RunRecord<'_>) -> PersistenceResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"INSERT OR IGNORE INTO agent_debug_logs
               (project_id, run_id, agent_name, started_at, ended_at, status,
                total_cost_usd, wasted_spend_usd, amount_saved_usd, cache_hit_rate,
                flags_json, opportunities_json, user_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.project_id)
        .bind(record.run_id)
        .bind(record.agent_name)
        .bind(record.started_at.to_rfc3339())
        .bind(record.ended_at.map(|t| t.to_rfc3339()))
        .bind(status_str(record.status))
        .bind(record.summary.total_cost_usd)
        .bind(record.summary.wasted_spend_usd)
        .bind(record.summary.amount_saved_usd)
        .bind(record.summary.cache_hit_rate)
        .bind(serde_json::to_string(record.flags).unwrap_or_else(|_| "[]".to_string()))
        .bind(serde_json::to_string(record.opportunities).unwrap_or_else(|_| "[]".to_string()))
        .bind(record.user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            tx.rollback().await?;
            return Ok(false);
        }

        for step in record.steps {
            sqlx::query(
                r#"INSERT OR IGNORE INTO agent_debug_steps
                   (project_id, run_id, step_index, timestamp, step_type, summary,
                    decision, tool, tool_args_json, tool_output_summary, raw,
                    token_cost, api_cost_usd, cache_hit)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(record.project_id)
            .bind(record.run_id)
            .bind(step.step_index as i64)
            .bind(step.timestamp.to_rfc3339())
            .bind(step.step_type.as_str())
            .bind(step.summary.as_deref())
            .bind(step.decision.as_deref())
            .bind(step.tool.as_deref())
            .bind(step.tool_args.as_ref().map(|v| v.to_string()))
            .bind(step.tool_output_summary.as_deref())
            .bind(step.raw.as_deref())
            .bind(step.token_cost.map(|t| t as i64))
            .bind(step.api_cost_usd)
            .bind(step.cache_hit.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }

        for explanation in record.explanations {
            sqlx::query(
                r#"INSERT OR IGNORE INTO agent_debug_explanations
                   (project_id, run_id, step_index, explanation, confidence, source)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(record.project_id)
            .bind(record.run_id)
            .bind(explanation.step_index as i64)
            .bind(&explanation.text)
            .bind(explanation.confidence)
            .bind(explanation.source.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn run_exists(&self, project_id: &str, run_id: &str) -> PersistenceResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM agent_debug_logs WHERE project_id = ? AND run_id = ?",
        )
        .bind(project_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn get_run(
        &self,
        project_id: &str,
        run_id: &str,
    ) -> PersistenceResult<Option<StoredRun>> {
        let Some(row) = sqlx::query(
            r#"SELECT agent_name, status, total_cost_usd, wasted_spend_usd,
                      amount_saved_usd, cache_hit_rate, flags_json, opportunities_json
               FROM agent_debug_logs WHERE project_id = ? AND run_id = ?"#,
        )
        .bind(project_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let flags_json: String = row.get("flags_json");
        let flags: Vec<Flag> = serde_json::from_str(&flags_json)
            .map_err(|e| PersistenceError::Corrupt(format!("flags_json: {e}")))?;
        let opportunities_json: String = row.get("opportunities_json");
        let opportunities: Vec<CachingOpportunity> = serde_json::from_str(&opportunities_json)
            .map_err(|e| PersistenceError::Corrupt(format!("opportunities_json: {e}")))?;

        let status_text: String = row.get("status");
        let status = parse_status(&status_text)
            .ok_or_else(|| PersistenceError::Corrupt(format!("status: {status_text}")))?;

        let summary = CostSummary {
            total_cost_usd: row.get("total_cost_usd"),
            wasted_spend_usd: row.get("wasted_spend_usd"),
            amount_saved_usd: row.get("amount_saved_usd"),
            cache_hit_rate: row.get("cache_hit_rate"),
            cacheable_steps: 0,
            cache_hits: 0,
        };
        let agent_name: String = row.get("agent_name");

        let steps = self.get_steps(project_id, run_id).await?;

        Ok(Some(StoredRun {
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
            agent_name,
            status,
            summary,
            flags,
            opportunities,
            steps,
        }))
    }

    async fn get_steps(
        &self,
        project_id: &str,
        run_id: &str,
    ) -> PersistenceResult<Vec<AgentStep>> {
        let rows = sqlx::query(
            r#"SELECT step_index, timestamp, step_type, summary, decision, tool,
                      tool_args_json, tool_output_summary, raw, token_cost,
                      api_cost_usd, cache_hit
               FROM agent_debug_steps
               WHERE project_id = ? AND run_id = ?
               ORDER BY step_index"#,
        )
        .bind(project_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let step_type_text: String = row.get("step_type");
            let step_type = parse_step_type(&step_type_text)
                .ok_or_else(|| PersistenceError::Corrupt(format!("step_type: {step_type_text}")))?;
            let timestamp_text: String = row.get("timestamp");
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_text)
                .map_err(|e| PersistenceError::Corrupt(format!("timestamp: {e}")))?
                .with_timezone(&Utc);
            let tool_args_json: Option<String> = row.get("tool_args_json");

            steps.push(AgentStep {
                step_index: row.get::<i64, _>("step_index") as usize,
                timestamp,
                step_type,
                summary: row.get("summary"),
                decision: row.get("decision"),
                tool: row.get("tool"),
                tool_args: tool_args_json.and_then(|s| serde_json::from_str(&s).ok()),
                tool_output_summary: row.get("tool_output_summary"),
                raw: row.get("raw"),
                token_cost: row.get::<Option<i64>, _>("token_cost").map(|t| t as u64),
                api_cost_usd: row.get("api_cost_usd"),
                cache_hit: row.get::<Option<i64>, _>("cache_hit").map(|v| v != 0),
            });
        }
        Ok(steps)
    }

    /// Drop runs older than the retention window. Returns how many were
    /// removed.
    pub async fn cleanup_old_runs(&self, older_than_days: i64) -> PersistenceResult<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(older_than_days)).to_rfc3339();

        sqlx::query(
            r#"DELETE FROM agent_debug_steps WHERE (project_id, run_id) IN
               (SELECT project_id, run_id FROM agent_debug_logs WHERE created_at < ?)"#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"DELETE FROM agent_debug_explanations WHERE (project_id, run_id) IN
               (SELECT project_id, run_id FROM agent_debug_logs WHERE created_at < ?)"#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        let deleted = sqlx::query("DELETE FROM agent_debug_logs WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted > 0 {
            info!(deleted, "cleaned up expired agent runs");
        }
        Ok(deleted)
    }
}

fn status_str(status: RunStatus) -> &'static str {
    status.as_str()
}

fn parse_status(text: &str) -> Option<RunStatus> {
    match text {
        "running" => Some(RunStatus::Running),
        "completed" => Some(RunStatus::Completed),
        "failed" => Some(RunStatus::Failed),
        "cancelled" => Some(RunStatus::Cancelled),
        _ => None,
    }
}

fn parse_step_type(text: &str) -> Option<StepType> {
    match text {
        "user_input" => Some(StepType::UserInput),
        "decision" => Some(StepType::Decision),
        "tool_call" => Some(StepType::ToolCall),
        "tool_result" => Some(StepType::ToolResult),
        "model_response" => Some(StepType::ModelResponse),
        "error" => Some(StepType::Error),
        "retry" => Some(StepType::Retry),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_runs::types::FlagKind;
    use tempfile::tempdir;

    fn step(index: usize, step_type: StepType) -> AgentStep {
        AgentStep {
            step_index: index,
            timestamp: Utc::now(),
            step_type,
            summary: Some(format!("step {index}")),
            decision: None,
            tool: Some("search".to_string()),
            tool_args: Some(serde_json::json!({"q": "x"})),
            tool_output_summary: Some("ok".to_string()),
            raw: None,
            token_cost: Some(100),
            api_cost_usd: Some(0.01),
            cache_hit: Some(false),
        }
    }

    fn record<'a>(
        project: &'a str,
        run: &'a str,
        summary: &'a CostSummary,
        flags: &'a [Flag],
        steps: &'a [AgentStep],
    ) -> RunRecord<'a> {
        RunRecord {
            project_id: project,
            run_id: run,
            agent_name: "researcher",
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Completed,
            user_id: None,
            summary,
            flags,
            opportunities: &[],
            steps,
            explanations: &[],
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let dir = tempdir().unwrap();
        let layer = PersistenceLayer::new(dir.path().join("runs.db")).await.unwrap();

        let summary = CostSummary { total_cost_usd: 0.02, ..Default::default() };
        let flags = vec![Flag::new(FlagKind::RepeatedTool, "tool repeated", Some(0))];
        let steps = vec![step(0, StepType::ToolCall), step(1, StepType::ToolCall)];

        let inserted = layer
            .insert_run(record("p1", "run-1", &summary, &flags, &steps))
            .await
            .unwrap();
        assert!(inserted);

        let stored = layer.get_run("p1", "run-1").await.unwrap().unwrap();
        assert_eq!(stored.agent_name, "researcher");
        assert_eq!(stored.flags.len(), 1);
        assert_eq!(stored.flags[0].kind, FlagKind::RepeatedTool);
        assert_eq!(stored.steps.len(), 2);
        assert_eq!(stored.steps[1].step_index, 1);
        assert_eq!(stored.steps[0].tool.as_deref(), Some("search"));
    }

    #[tokio::test]
    async fn test_reinsert_is_a_noop() {
        let dir = tempdir().unwrap();
        let layer = PersistenceLayer::new(dir.path().join("runs.db")).await.unwrap();

        let summary = CostSummary::default();
        let steps = vec![step(0, StepType::Retry)];

        assert!(layer.insert_run(record("p1", "run-1", &summary, &[], &steps)).await.unwrap());
        assert!(!layer.insert_run(record("p1", "run-1", &summary, &[], &steps)).await.unwrap());

        let stored = layer.get_run("p1", "run-1").await.unwrap().unwrap();
        assert_eq!(stored.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_runs_are_project_scoped() {
        let dir = tempdir().unwrap();
        let layer = PersistenceLayer::new(dir.path().join("runs.db")).await.unwrap();

        let summary = CostSummary::default();
        let steps = vec![step(0, StepType::ToolCall)];
        layer.insert_run(record("p1", "run-1", &summary, &[], &steps)).await.unwrap();

        assert!(layer.get_run("p2", "run-1").await.unwrap().is_none());
        assert!(layer.run_exists("p1", "run-1").await.unwrap());
        assert!(!layer.run_exists("p2", "run-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_removes_nothing_fresh() {
        let dir = tempdir().unwrap();
        let layer = PersistenceLayer::new(dir.path().join("runs.db")).await.unwrap();

        let summary = CostSummary::default();
        let steps = vec![step(0, StepType::ToolCall)];
        layer.insert_run(record("p1", "run-1", &summary, &[], &steps)).await.unwrap();

        let deleted = layer.cleanup_old_runs(30).await.unwrap();
        assert_eq!(deleted, 0);
        assert!(layer.run_exists("p1", "run-1").await.unwrap());
    }
}
