/// Default chunk size (16KB, fits every browser data channel)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk a single frame may carry (256KB)
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Default receiver ceiling for a declared file size (1GB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Longest file name accepted in metadata
pub const MAX_FILENAME_LENGTH: usize = 255;

/// MIME type used when the source does not name one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Pause writing above this many buffered bytes (1MB)
pub const DEFAULT_BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Resume writing once the buffer is back under this (256KB)
pub const DEFAULT_BUFFERED_AMOUNT_LOW: usize = 256 * 1024;

/// How often the back-pressure loop re-reads the buffered gauge
pub const DRAIN_POLL_INTERVAL_MS: u64 = 10;

/// Notify observers after this many percentage points of progress
pub const PROGRESS_UPDATE_STEP: u8 = 3;

pub const DEFAULT_ACCEPT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONSECUTIVE_DECODE_ERRORS: usize = 8;
