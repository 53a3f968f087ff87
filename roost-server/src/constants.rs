use std::time::Duration;

use uuid::Uuid;

/// The HTTP path children request to start streaming.
pub const STREAM_PATH: &str = "/stream";

/// Handshake prompts, sent raw on the socket once a child is accepted.
///
/// The wire value of every token is its name: children match on the prefix
/// and never parse further, so the tokens only need to be fixed and unique.
pub const START_STREAMING_PROMPT_V1: &str = "START_STREAMING_PROMPT_V1";
pub const START_STREAMING_PROMPT_V2: &str = "START_STREAMING_PROMPT_V2";
pub const START_STREAMING_PROMPT_VN: &str = "START_STREAMING_PROMPT_VN";

/// Rejections sent as an HTTP body before the socket is taken over.
pub const START_STREAMING_ERROR_NOT_PERMITTED: &str = "START_STREAMING_ERROR_NOT_PERMITTED";
pub const START_STREAMING_ERROR_BUSY_TRY_LATER: &str = "START_STREAMING_ERROR_BUSY_TRY_LATER";

/// Rejections sent raw on a socket we already own.
pub const START_STREAMING_ERROR_ALREADY_STREAMING: &str = "START_STREAMING_ERROR_ALREADY_STREAMING";
pub const START_STREAMING_ERROR_INTERNAL_ERROR: &str = "START_STREAMING_ERROR_INTERNAL_ERROR";
pub const START_STREAMING_ERROR_INITIALIZATION: &str = "START_STREAMING_ERROR_INITIALIZATION";
pub const START_STREAMING_ERROR_SAME_LOCALHOST: &str = "START_STREAMING_ERROR_SAME_LOCALHOST";

/// Size of the per-connection compressed read buffer.
pub const COMPRESSION_MAX_CHUNK: usize = 0x4000;

/// A previous receiver whose last message is older than this is stale and may
/// be preempted by a new connection for the same host.
pub const STALE_RECEIVER_AGE_SECS: i64 = 30;

/// How long a new connection waits for a preempted stale receiver to exit.
pub const STALE_RECEIVER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the cloud connector is told about a newly connected child.
pub const NODE_STATE_UPDATE_DELAY: Duration = Duration::from_secs(300);

/// Hop count reported by a directly connected child.
pub const DEFAULT_HOPS: i16 = 1;

/// Message id attached to every log line of the child acceptance flow, so
/// that log aggregation can group them across nodes.
pub const STREAMING_FROM_CHILD_MSGID: Uuid =
    Uuid::from_u128(0x5f1a_79f8_86dd_4c23_b2e5_0c0b_2c3a_91d7);
