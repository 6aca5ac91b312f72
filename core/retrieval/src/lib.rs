pub mod budget;
pub mod fusion;
pub mod recall;
pub mod reranker;
pub mod spreading;
pub mod strategies;
pub mod temporal;
pub mod tokenizer;

pub use budget::filter_by_budget;
pub use fusion::{rrf_fuse, FusedHit, RRF_K};
pub use recall::{RecallConfig, RecallEngine};
pub use reranker::{RerankCandidate, RerankHandle};
pub use spreading::{spread, ActivatedNode, NeighborProvider, Seed, SpreadingConfig};
pub use strategies::{RankedList, StrategyHit};
pub use temporal::TemporalParser;
pub use tokenizer::count_tokens;
