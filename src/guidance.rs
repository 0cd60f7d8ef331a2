use async_trait::async_trait;

use crate::error::Result;

/// Retrieval port feeding opaque guidance into the planner prompt.
///
/// The knowledge base, chunking and embeddings all live behind this seam;
/// the runtime only ever sees text.
#[async_trait]
pub trait GuidanceSource: Send + Sync {
    /// Guidance relevant to the query, or `None` when the source has
    /// nothing useful.
    async fn retrieve(&self, query: &str) -> Result<Option<String>>;
}

/// Default source: retrieval disabled.
pub struct NullGuidance;

#[async_trait]
impl GuidanceSource for NullGuidance {
    async fn retrieve(&self, _query: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
