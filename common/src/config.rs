//! Client configuration: exactly the options table the external interface
//! exposes when constructing a client, plus nothing else — derived
//! constants (fetch interval, transport timeout, backoff bounds) live as
//! associated constants on the scheduler/codec types that own them, not as
//! fields here.

/// Options accepted when constructing a new client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the encrypted state file.
    pub state_filename: String,

    /// When true, the scheduler and store accept an injected `Clock` and
    /// skip the real erasure-storage anchor, for deterministic tests.
    pub testing: bool,

    /// When true, relaxes the relay-server TLS/identity checks the
    /// out-of-scope transport layer would otherwise enforce. Never set in
    /// a release build.
    pub dev: bool,

    /// When true, the scheduler polls the relay for new messages on its own
    /// timer; when false, fetches happen only when the caller asks for one.
    pub auto_fetch: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            state_filename: "pond.state".to_string(),
            testing: false,
            dev: false,
            auto_fetch: true,
        }
    }
}

impl ClientConfig {
    pub fn testing_defaults(state_filename: impl Into<String>) -> Self {
        ClientConfig {
            state_filename: state_filename.into(),
            testing: true,
            dev: true,
            auto_fetch: false,
        }
    }
}
