//! Protocol constants, key layout, and nucleus connection settings.

use std::time::Duration;

/// Language tag reported by the `version` command.
pub const LANG: &str = "Rust";

/// Full package version; the wire-reported version is `major.minor` as a
/// float (see [`version_float`]).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default time to wait for a command acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default time a caller is told to wait for a command response.
pub const RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Default approximate cap on stream length.
pub const STREAM_LEN: usize = 1024;

/// Block budget used for reads that should wait "forever". The nucleus
/// rejects larger values.
pub const MAX_BLOCK_MS: u64 = 999_999_999_999_999;

/// Size of the pooled connection set used for pipelined operations.
pub const PIPELINE_POOL_SIZE: usize = 20;

/// Pause between healthcheck sweeps in [`crate::Element::wait_for_elements_healthy`].
pub const HEALTHCHECK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum peer version gate for healthcheck support.
pub const HEALTHCHECK_MIN_VERSION: f64 = 0.2;

/// Minimum peer version gate for `command_list` support.
pub const COMMAND_LIST_MIN_VERSION: f64 = 0.3;

pub const HEALTHCHECK_COMMAND: &str = "healthcheck";
pub const VERSION_COMMAND: &str = "version";
pub const COMMAND_LIST_COMMAND: &str = "command_list";

/// Command names owned by the runtime. `command_add` refuses them;
/// `healthcheck` is replaceable through `healthcheck_set` only.
pub const RESERVED_COMMANDS: [&str; 3] =
    [COMMAND_LIST_COMMAND, VERSION_COMMAND, HEALTHCHECK_COMMAND];

/// Envelope keys that may never appear as user extras.
pub const RESERVED_ENVELOPE_KEYS: [&str; 7] = [
    "element", "cmd", "cmd_id", "data", "err_code", "err_str", "timeout",
];

/// The global log stream.
pub const LOG_STREAM: &str = "log";

/// `major.minor` of [`VERSION`] as the float reported over the wire.
pub fn version_float() -> f64 {
    let mut parts = VERSION.split('.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("{major}.{minor}").parse().unwrap_or(0.0)
}

/// Key of an element's command inbox.
pub fn command_key(element: &str) -> String {
    format!("command:{element}")
}

/// Key of an element's response inbox.
pub fn response_key(element: &str) -> String {
    format!("response:{element}")
}

/// Key of a data stream owned by an element.
pub fn stream_key(element: &str, stream: &str) -> String {
    format!("stream:{element}:{stream}")
}

/// How to reach the nucleus. Accepts `redis://host:port` and
/// `redis+unix:///path` URLs.
#[derive(Debug, Clone)]
pub struct NucleusConfig {
    pub url: String,
    pub pool_size: usize,
}

impl Default for NucleusConfig {
    fn default() -> Self {
        let url = std::env::var("ATOM_NUCLEUS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self {
            url,
            pool_size: PIPELINE_POOL_SIZE,
        }
    }
}

impl NucleusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}
