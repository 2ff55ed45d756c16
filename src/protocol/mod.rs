//! Protocol definitions and constants

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Expected auth frame, got {0}")]
    AuthRequired(String),
}

/// Outbound event queue capacity of a channel
pub const WRITE_QUEUE_CAPACITY: usize = 5;

/// Keepalive interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before retrying a failed connect
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Poll delay while a channel has no sessions to carry
pub const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Poll delay of the write loop while the connection is down
pub const CLOSED_WRITE_RETRY: Duration = Duration::from_millis(5);

/// Read chunk size
pub const READ_BUFFER_SIZE: usize = 8192;

/// Request paths ending with this suffix hold the response open for pushes
pub const PULL_PATH_SUFFIX: &str = "pull";

/// Wall-clock window of one pull request
pub const PULL_WINDOW: Duration = Duration::from_secs(10);

/// Events drained per pull iteration
pub const PULL_BATCH: usize = 2;

/// Wait per peek inside a pull loop
pub const PULL_PEEK_TIMEOUT: Duration = Duration::from_millis(50);

/// Per-connection event queue capacity on the server
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Wait for room when queueing a response for a stream connection
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
