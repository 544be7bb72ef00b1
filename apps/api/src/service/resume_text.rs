//! Turns an uploaded resume file into plain text for analysis.

use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info};

use crate::errors::AppError;
use crate::models::resume::ResumeFileRow;

/// Downloads the resume and extracts its text.
pub async fn fetch_resume_text(
    s3: &S3Client,
    bucket: &str,
    file: &ResumeFileRow,
) -> Result<String, AppError> {
    let bytes = download(s3, bucket, file).await?;
    extract_text(&file.content_type, &bytes)
}

async fn download(s3: &S3Client, bucket: &str, file: &ResumeFileRow) -> Result<Bytes, AppError> {
    let object = s3
        .get_object()
        .bucket(bucket)
        .key(&file.s3_key)
        .send()
        .await
        .map_err(|e| AppError::S3(format!("get_object {}: {e}", file.s3_key)))?;
    let bytes = object
        .body
        .collect()
        .await
        .map_err(|e| AppError::S3(format!("reading {}: {e}", file.s3_key)))?
        .into_bytes();
    info!(
        "Downloaded resume {} from s3://{}/{} ({} bytes)",
        file.id,
        bucket,
        file.s3_key,
        bytes.len()
    );
    Ok(bytes)
}

/// PDFs go through `pdf-extract`; anything else must be UTF-8 text.
pub fn extract_text(content_type: &str, bytes: &[u8]) -> Result<String, AppError> {
    let text = if is_pdf(content_type, bytes) {
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| AppError::Validation(format!("could not read PDF resume: {e}")))?
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| AppError::Validation("resume file is not valid UTF-8 text".to_string()))?
    };
    let text = normalize_whitespace(&text);
    debug!("Extracted {} characters of resume text", text.chars().count());
    if text.is_empty() {
        return Err(AppError::Validation("resume file contains no text".to_string()));
    }
    Ok(text)
}

fn is_pdf(content_type: &str, bytes: &[u8]) -> bool {
    content_type.eq_ignore_ascii_case("application/pdf") || bytes.starts_with(b"%PDF-")
}

/// Collapses runs of blank lines and trailing spaces that PDF extraction leaves behind.
fn normalize_whitespace(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() && out.last().map_or(true, |prev| prev.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}
