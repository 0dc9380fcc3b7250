/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Messages returned by a history query when the caller gives no limit
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Upper bound on a single history page
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// Maximum message body size in bytes (16 KiB)
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Maximum length of a group or channel name, in characters
pub const MAX_NAME_CHARS: usize = 100;

/// Maximum length of an opaque identity or domain id
pub const MAX_ID_CHARS: usize = 128;

/// Per-connection outbound event buffer
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Channels created for every domain the server sees for the first time
pub const DEFAULT_CHANNELS: &[&str] = &["general", "random"];

/// Headers set by the upstream identity/session gateway
pub const IDENTITY_HEADER: &str = "x-identity-id";
pub const DOMAIN_HEADER: &str = "x-identity-domain";
pub const DISPLAY_NAME_HEADER: &str = "x-identity-name";
