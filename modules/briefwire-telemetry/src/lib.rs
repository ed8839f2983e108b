//! Append-only telemetry for AI calls.
//!
//! Two layers: full [`AiCallRecord`]s go to daily JSONL shards on disk, and
//! a compact index row goes to SQLite for querying and aggregation. Records
//! are never mutated; cleanup deletes whole shards past retention.

mod recorder;

pub use recorder::{AggregateReport, CallFilter, CallSummary, Recorder, SessionSummary};
