pub mod entities;
pub mod extractor;
pub mod links;
pub mod observations;
pub mod retain;
pub mod worker;

pub use entities::EntityResolver;
pub use extractor::{
    CausalHint, EntityMention, ExtractedFact, FactExtractor, LlmFactExtractor,
};
pub use retain::{RetainContext, RetainPipeline};
pub use worker::{Task, TaskQueue, WorkerPool};
