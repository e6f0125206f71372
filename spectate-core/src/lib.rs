//! Spectator stream mirroring: replay model, storage and pacing.
//! Host-driven: no network I/O; the host polls or serves and feeds results in.

pub mod ids;
pub mod manager;
pub mod metadata;
pub mod pacing;
pub mod protocol;
pub mod region;
pub mod replay;
pub mod session;
pub mod storage;
pub mod time;

#[cfg(test)]
pub(crate) mod test_support;

pub use ids::{ChunkId, InvalidId, KeyFrameId};
pub use manager::{IncompleteReplay, ReplayManager, StoredReplay};
pub use metadata::{ChunkInfo, GameKey, GameMetadata, KeyFrameInfo, LastChunkInfo};
pub use pacing::{ChunkInfoGenerator, Pacer, PacingError, DEFAULT_TIME_DIVISOR};
pub use protocol::{Param, Route, SpectateFunction};
pub use region::Region;
pub use replay::{Chunk, IntegrityError, KeyFrame, Replay};
pub use session::{DownloadSession, PollPlan, Segment, SegmentLost, SessionSettings};
pub use storage::{ExpandedFormatter, ReplayDataLoader, ReplayDataWriter, StorageError};
pub use time::{DurationMs, LolTime, TimeParseError};
