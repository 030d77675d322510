pub mod gemini;
pub mod loop_detector;
pub mod openai;
pub mod schema;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid tool parameter schema: {0}")]
    Schema(#[from] schema::SchemaError),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}
