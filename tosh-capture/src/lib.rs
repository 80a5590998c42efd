pub mod change;
pub mod cursor;
pub mod detector;
pub mod queue;
pub mod wal;
pub mod watermark;

pub use change::ChangeRecord;
pub use cursor::{Cursor, CursorStore};
pub use detector::{DetectError, DetectOutcome, SourceDetector, SourcePreset, SqliteDetector};
pub use queue::{ChangeQueue, QueueCorrupt, QueueEntry, QueueStats, SourceQueueStats};
pub use watermark::Watermark;
