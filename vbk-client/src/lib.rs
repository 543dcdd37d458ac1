//! Client side of VelBackuper: collectors produce byte streams, the two
//! backup engines push them into the object store, restore pulls them
//! back out.

pub mod archive_writer;
pub mod backup_stream;
pub mod collector;
pub mod compression;
pub mod extract;
pub mod incremental_writer;
pub mod restore;

pub use backup_stream::CollectorStream;
pub use collector::{collector_for_job, Collector, CompositeCollector};
pub use compression::StreamCompression;
