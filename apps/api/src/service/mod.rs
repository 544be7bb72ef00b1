// Analysis Service host: HTTP handlers, resume text extraction, and the
// admin view over prompt configuration.

pub mod catalog_summary;
pub mod handlers;
pub mod resume_text;
