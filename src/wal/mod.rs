//! WAL ring buffer: durable, append-only staging area for frame mutations ahead of commit.
pub mod record;
pub mod ring;

pub use record::{FLAG_IS_PADDING, RECORD_HEADER_LEN, RecordHeader};
pub use ring::{FsyncPolicy, WalRing};
