//! File transfer over a single ordered, reliable channel.
//!
//! - `protocol`: the envelope frame and its protobuf encoding
//! - `sender` / `receiver`: per-file state machines
//! - `session`: demultiplexes one channel into those state machines
//! - `transport`: the channel seam plus an in-memory implementation

pub mod accounting;
pub mod constants;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod transport;
pub mod utils;

pub use accounting::TransferStats;
pub use sender::FileSource;
pub use utils::{format_bitrate, human_file_size, sanitize_file_name, save_received, validate_metadata};
