use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted analysis run. `result` is the full `AnalysisResult` as JSONB.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalysisRow {
    pub id: Uuid,
    pub resume_id: Uuid,
    pub requester_key: String,
    pub analyzer: String,
    pub status: String,
    pub overall_score: Option<f64>,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}
