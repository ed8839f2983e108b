//! Feed registry and the concurrent fetcher.

pub mod fetcher;
pub mod readability;
pub mod registry;

pub use fetcher::{Fetcher, FetcherSettings};
pub use registry::{FeedEntry, FeedRegistry};
