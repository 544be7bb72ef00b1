use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::analysis::AnalysisResult;
use crate::models::analysis::AnalysisRow;
use crate::models::resume::ResumeFileRow;

/// Creates and returns a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

pub async fn get_resume_file(db: &PgPool, resume_id: Uuid) -> Result<Option<ResumeFileRow>, sqlx::Error> {
    sqlx::query_as::<_, ResumeFileRow>("SELECT id, s3_key, content_type FROM resumes WHERE id = $1")
        .bind(resume_id)
        .fetch_optional(db)
        .await
}

/// Stores a finished run keyed by its request id.
pub async fn save_analysis(
    db: &PgPool,
    requester_key: &str,
    result: &AnalysisResult,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO resume_analyses
            (id, resume_id, requester_key, analyzer, status, overall_score, result, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(result.request_id)
    .bind(result.resume_id)
    .bind(requester_key)
    .bind(&result.analyzer)
    .bind(result.status.as_str())
    .bind(result.overall_score)
    .bind(analysis_payload(result))
    .bind(result.finished_at)
    .execute(db)
    .await?;
    Ok(())
}

/// The JSONB `result` column holds the whole serialized run.
fn analysis_payload(result: &AnalysisResult) -> Json<&AnalysisResult> {
    Json(result)
}

pub async fn get_analysis(db: &PgPool, id: Uuid) -> Result<Option<AnalysisRow>, sqlx::Error> {
    sqlx::query_as::<_, AnalysisRow>("SELECT * FROM resume_analyses WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::RunStatus;
    use chrono::Utc;

    #[test]
    fn test_payload_serializes_full_result() {
        let now = Utc::now();
        let result = AnalysisResult {
            request_id: Uuid::new_v4(),
            resume_id: Uuid::new_v4(),
            analyzer: "orchestrator".to_string(),
            status: RunStatus::Partial,
            stages: vec![],
            overall_score: Some(85.0),
            failure: None,
            started_at: now,
            finished_at: now,
        };

        let json = serde_json::to_value(&*analysis_payload(&result)).unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["overall_score"], 85.0);
        assert_eq!(json["analyzer"], "orchestrator");
        assert!(json.get("failure").is_none());
    }
}
