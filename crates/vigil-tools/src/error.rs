use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Unsupported metric type: {0}")]
    UnsupportedMetric(String),
    #[error("Query failed: {0}")]
    Query(#[from] anyhow::Error),
}
