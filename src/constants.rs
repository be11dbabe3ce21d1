//! Application-wide constants for channel-tail.
//!
//! This module centralizes magic numbers and protocol defaults so the
//! session, renderer and realtime adapter agree on them.
//!
//! # Categories
//!
//! - **Filtering & rendering**: wildcard filter, separators, sentinels
//! - **Shutdown**: close and hard-exit deadlines
//! - **Realtime**: endpoint defaults, reconnection and liveness tuning

use std::time::Duration;

// ============================================================================
// Filtering & Rendering
// ============================================================================

/// Event filter value meaning "render every event".
pub const WILDCARD_EVENT: &str = "*";

/// Width of the separator line framing each rendered event.
pub const SEPARATOR_WIDTH: usize = 80;

/// Character used for separator lines.
pub const SEPARATOR_CHAR: char = '─';

/// Timestamp layout for rendered events (local time, millisecond precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Shown in place of a missing event name.
pub const UNNAMED_EVENT: &str = "unnamed";

/// Shown in place of a missing client or connection id.
pub const NOT_AVAILABLE: &str = "N/A";

/// Event name whose messages go through the verbose renderer by default.
pub const GQL_RESULT_EVENT: &str = "gql-result";

// ============================================================================
// Shutdown
// ============================================================================

/// Upper bound on the graceful connection close during shutdown.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Hard upper bound between a termination signal and process exit.
///
/// If the graceful path has not finished by then, a watchdog thread
/// exits the process.
pub const HARD_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Time given to outstanding runtime tasks when the runtime is torn down.
pub const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Realtime
// ============================================================================

/// Default realtime endpoint host.
pub const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";

/// Realtime protocol version requested on connect.
pub const PROTOCOL_VERSION: &str = "1.2";

/// Capacity of each event queue between the adapter and the session.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Initial reconnection backoff.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum reconnection backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Time without a connection after which the state becomes `Suspended`.
pub const SUSPENDED_AFTER: Duration = Duration::from_secs(120);

/// Idle interval assumed until the server reports its own.
pub const DEFAULT_MAX_IDLE_INTERVAL: Duration = Duration::from_secs(15);

/// Grace added on top of the idle interval before a connection is stale.
pub const IDLE_GRACE: Duration = Duration::from_secs(10);

/// How often the connection task checks for staleness.
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed for the server to confirm a connection after the handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Time allowed for the server to acknowledge a CLOSE.
pub const CLOSE_ACK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Upper bound on the client's own close handshake (command plus CLOSED ack).
///
/// Shorter than [`CLOSE_TIMEOUT`] so the client gives up before the session does.
pub const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_millis(1750);
