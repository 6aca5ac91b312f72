pub mod embedding;
pub mod llm;
pub mod rerank;

pub use embedding::{EmbeddingClient, HashingEmbedder, HttpEmbedder};
pub use llm::{HttpLlmClient, LlmClient, LlmConfig, LlmProvider};
pub use rerank::{CrossEncoder, HttpCrossEncoder, LexicalCrossEncoder};
