use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Where an uploaded resume lives in object storage.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResumeFileRow {
    pub id: Uuid,
    pub s3_key: String,
    pub content_type: String,
}
