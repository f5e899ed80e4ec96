//! SQLite-backed result store.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use sqlx::query::QueryAs;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};

use super::ResultStore;
use crate::error::EngineResult;
use crate::models::{CareGapAlert, DedupKey, MeasureResult, Narrative, RiskScore};

pub struct SqliteResultStore {
    pool: Arc<SqlitePool>,
}

impl SqliteResultStore {
    /// Connects and applies the bundled migrations.
    pub async fn connect(url: &str, max_connections: u32) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool: Arc::new(pool) };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> Arc<SqlitePool> {
        self.pool.clone()
    }

    async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    async fn bodies<'q, T: DeserializeOwned>(
        &self,
        query: QueryAs<'q, Sqlite, (String,), SqliteArguments<'q>>,
    ) -> EngineResult<Vec<T>> {
        let rows = query.fetch_all(self.pool.as_ref()).await?;
        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn put_measure_result(&self, result: &MeasureResult) -> EngineResult<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO measure_results \
             (measure_id, measure_version, patient_id, context_version, body, evaluated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.measure_id)
        .bind(&result.measure_version)
        .bind(&result.patient_id)
        .bind(result.context_version as i64)
        .bind(serde_json::to_string(result)?)
        .bind(result.evaluated_at.timestamp_millis())
        .execute(self.pool.as_ref())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn measure_results(&self, measure_id: &str, patient_id: &str) -> EngineResult<Vec<MeasureResult>> {
        self.bodies(
            sqlx::query_as(
                "SELECT body FROM measure_results WHERE measure_id = ? AND patient_id = ? \
                 ORDER BY context_version, measure_version",
            )
            .bind(measure_id)
            .bind(patient_id),
        )
        .await
    }

    async fn latest_measure_results(&self, measure_id: &str) -> EngineResult<Vec<MeasureResult>> {
        self.bodies(
            sqlx::query_as(
                "SELECT body FROM ( \
                   SELECT body, patient_id, ROW_NUMBER() OVER ( \
                     PARTITION BY patient_id ORDER BY context_version DESC, measure_version DESC) AS rn \
                   FROM measure_results WHERE measure_id = ?) \
                 WHERE rn = 1 ORDER BY patient_id",
            )
            .bind(measure_id),
        )
        .await
    }

    async fn put_alert(&self, alert: &CareGapAlert) -> EngineResult<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO care_gap_alerts \
             (dedup_key, patient_id, priority, rule_id, body, generated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(alert.dedup_key.as_str())
        .bind(&alert.patient_id)
        .bind(alert.priority)
        .bind(&alert.rule_id)
        .bind(serde_json::to_string(alert)?)
        .bind(alert.generated_at.timestamp_millis())
        .execute(self.pool.as_ref())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn resolve_alert(&self, key: &DedupKey, at: DateTime<Utc>) -> EngineResult<bool> {
        let done = sqlx::query(
            "UPDATE care_gap_alerts SET resolved_at = ? WHERE dedup_key = ? AND resolved_at IS NULL",
        )
        .bind(at.timestamp_millis())
        .bind(key.as_str())
        .execute(self.pool.as_ref())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn alerts_for(&self, patient_id: &str) -> EngineResult<Vec<CareGapAlert>> {
        let rows: Vec<(String, Option<i64>)> = sqlx::query_as(
            "SELECT body, resolved_at FROM care_gap_alerts WHERE patient_id = ? \
             ORDER BY priority DESC, rule_id, dedup_key, id",
        )
        .bind(patient_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter()
            .map(|(body, resolved_at)| -> EngineResult<CareGapAlert> {
                let mut alert: CareGapAlert = serde_json::from_str(&body)?;
                alert.resolved_at = resolved_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
                Ok(alert)
            })
            .collect()
    }

    async fn put_risk_score(&self, score: &RiskScore) -> EngineResult<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO risk_scores \
             (patient_id, context_version, model_version, body, computed_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&score.patient_id)
        .bind(score.context_version as i64)
        .bind(&score.model_version)
        .bind(serde_json::to_string(score)?)
        .bind(score.computed_at.timestamp_millis())
        .execute(self.pool.as_ref())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn latest_risk_score(&self, patient_id: &str) -> EngineResult<Option<RiskScore>> {
        let mut scores = self
            .bodies(
                sqlx::query_as(
                    "SELECT body FROM risk_scores WHERE patient_id = ? \
                     ORDER BY context_version DESC, computed_at DESC LIMIT 1",
                )
                .bind(patient_id),
            )
            .await?;
        Ok(scores.pop())
    }

    async fn put_narrative(&self, narrative: &Narrative) -> EngineResult<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO narratives (patient_id, context_version, body, generated_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&narrative.patient_id)
        .bind(narrative.context_version as i64)
        .bind(serde_json::to_string(narrative)?)
        .bind(narrative.generated_at.timestamp_millis())
        .execute(self.pool.as_ref())
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn latest_narrative(&self, patient_id: &str) -> EngineResult<Option<Narrative>> {
        let mut narratives = self
            .bodies(
                sqlx::query_as(
                    "SELECT body FROM narratives WHERE patient_id = ? \
                     ORDER BY context_version DESC LIMIT 1",
                )
                .bind(patient_id),
            )
            .await?;
        Ok(narratives.pop())
    }

    async fn prune_superseded(&self, keep: usize) -> EngineResult<usize> {
        let done = sqlx::query(
            "DELETE FROM measure_results WHERE rowid IN ( \
               SELECT rid FROM ( \
                 SELECT rowid AS rid, DENSE_RANK() OVER ( \
                   PARTITION BY measure_id, patient_id ORDER BY context_version DESC) AS version_rank \
                 FROM measure_results) \
               WHERE version_rank > ?)",
        )
        .bind(keep as i64)
        .execute(self.pool.as_ref())
        .await?;
        Ok(done.rows_affected() as usize)
    }
}
