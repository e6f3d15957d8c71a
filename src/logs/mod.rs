// Logs module - Process output capture into append-only files

mod manager;
mod writer;

pub use manager::{LogNotice, LogStreamManager, MAX_RECORD_BYTES};
pub use writer::{format_record, LogFile, LogSink, StreamKind, WriteOutcome};
