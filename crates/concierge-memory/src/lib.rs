//! Memory and history read/write paths.
//!
//! Two read paths (archived-session summary search, paginated full-text
//! history search) and one write path: a background writer consuming a
//! bounded job queue. Writer failures log and never affect the request path.

pub mod metrics;
pub mod search;
pub mod writer;

pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use search::{HistoryPage, HistorySearch, SummaryHit, SummarySearch};
pub use writer::{MemoryJob, MemorySink, MemoryWriter};
