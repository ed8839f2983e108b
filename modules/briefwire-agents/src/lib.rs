//! The agent roster: stateless functions over (article, shared context)
//! producing structured outputs, all funneled through the LLM gateway.

pub mod analysts;
pub mod collector;
pub mod context;
pub mod curator;
pub mod editor;
pub mod extractor;
pub mod librarian;
pub mod merger;
pub mod normalize;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use analysts::{Analyst, AnalystKind};
pub use collector::{Collector, CollectorOutput};
pub use context::{AnalysisContext, CollectedEntity, TimelineEvent};
pub use curator::{Curation, Curator, CuratorSettings};
pub use editor::Editor;
pub use extractor::{source_reference, Extractor, ExtractorOutput};
pub use librarian::{Librarian, LibrarianOutput};
pub use merger::Merger;
pub use traits::{AgentOutput, TraceBuilder};
