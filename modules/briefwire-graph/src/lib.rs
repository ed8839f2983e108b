//! Three-tier entity knowledge graph on SQLite.
//!
//! Entities are resolved through a case-folded alias table; mentions are
//! unique per (entity, unit); relations are plain edges keyed by
//! (source, target, type) with evidence accumulation. The write path is
//! [`EntityStore::process_extracted`]; reads cover hot entities, timelines,
//! and BFS ego networks.

mod store;

pub use store::{
    EntityStore, HotEntity, MentionTrend, NetworkEdge, NetworkGraph, TimelineEntry,
};
