//! Gateway configuration
//!
//! All numeric values are treated as pre-validated; nothing here clamps or
//! sanity-checks timeouts.

use crate::error::ConfigError;
use std::time::Duration;
use workergate_protocol::methods;
pub use workergate_transport::{ProcessConfig, SupervisorConfig};

/// Which method carries the user's message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnMethod {
    /// `sendUserTurn`
    #[default]
    SendUserTurn,
    /// `sendUserMessage`
    SendUserMessage,
}

impl TurnMethod {
    /// JSON-RPC method name
    pub fn method(&self) -> &'static str {
        match self {
            Self::SendUserTurn => methods::SEND_USER_TURN,
            Self::SendUserMessage => methods::SEND_USER_MESSAGE,
        }
    }
}

impl std::str::FromStr for TurnMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sendUserTurn" | "send_user_turn" | "turn" => Ok(Self::SendUserTurn),
            "sendUserMessage" | "send_user_message" | "message" => Ok(Self::SendUserMessage),
            other => Err(ConfigError::InvalidValue {
                key: "turn_method".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// RPC transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Fail every turn with `worker_disabled` when false
    pub worker_enabled: bool,

    /// How long to wait for a worker channel to appear
    pub ready_timeout: Duration,

    /// Deadline for the `initialize` exchange
    pub handshake_timeout: Duration,

    /// Deadline for every other RPC
    pub request_timeout: Duration,

    /// Deadline for a whole turn
    pub turn_timeout: Duration,

    /// How long a turn with a result waits for its final message
    pub completion_grace: Duration,

    /// Maximum simultaneously active turns
    pub max_concurrent_turns: usize,

    /// Method used to send the user's message
    pub turn_method: TurnMethod,

    /// Client name announced during `initialize`
    pub client_name: String,

    /// Client version announced during `initialize`
    pub client_version: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            worker_enabled: true,
            ready_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            turn_timeout: Duration::from_secs(600),
            completion_grace: Duration::from_millis(1500),
            max_concurrent_turns: 4,
            turn_method: TurnMethod::default(),
            client_name: "workergate".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl TransportConfig {
    /// Create a new transport config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the worker
    pub fn with_worker_enabled(mut self, enabled: bool) -> Self {
        self.worker_enabled = enabled;
        self
    }

    /// Set the channel wait timeout
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-RPC timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-turn timeout
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// Set the completion grace window
    pub fn with_completion_grace(mut self, grace: Duration) -> Self {
        self.completion_grace = grace;
        self
    }

    /// Set the concurrency cap
    pub fn with_max_concurrent_turns(mut self, max: usize) -> Self {
        self.max_concurrent_turns = max;
        self
    }

    /// Set the turn method
    pub fn with_turn_method(mut self, method: TurnMethod) -> Self {
        self.turn_method = method;
        self
    }
}

/// Stop-after-tools policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopAfterTools {
    /// Keep streaming after tool blocks
    #[default]
    Off,
    /// Cut as soon as the first tool block completes
    First,
    /// Cut once no new tool block has completed for `grace`
    Burst {
        /// Debounce window
        grace: Duration,
    },
}

impl StopAfterTools {
    /// Whether any cutoff policy is active
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Parse a mode name; `grace` applies to `burst`
    pub fn parse(mode: &str, grace: Duration) -> Result<Self, ConfigError> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "" | "off" | "false" | "none" => Ok(Self::Off),
            "first" | "true" => Ok(Self::First),
            "burst" | "grace" | "debounce" => Ok(Self::Burst { grace }),
            other => Err(ConfigError::InvalidValue {
                key: "stop_after_tools".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Streaming translator settings
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Terminate the turn when no backend frame arrives for this long
    pub idle_timeout: Duration,

    /// Interval for `: keepalive` comments; `None` disables them
    pub keepalive_interval: Option<Duration>,

    /// Cutoff policy once tool blocks complete
    pub stop_after_tools: StopAfterTools,

    /// Cut immediately once this many tool blocks completed
    pub max_tool_blocks: Option<usize>,

    /// Withhold text after the last complete tool block
    pub suppress_tail_after_tools: bool,

    /// Accept more than one tool call id per turn
    pub parallel_tool_calls: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Some(Duration::from_secs(15)),
            stop_after_tools: StopAfterTools::Off,
            max_tool_blocks: None,
            suppress_tail_after_tools: false,
            parallel_tool_calls: true,
        }
    }
}

impl StreamConfig {
    /// Create a new stream config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set or disable keepalive comments
    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the stop-after-tools policy
    pub fn with_stop_after_tools(mut self, policy: StopAfterTools) -> Self {
        self.stop_after_tools = policy;
        self
    }

    /// Set the tool block cap
    pub fn with_max_tool_blocks(mut self, max: usize) -> Self {
        self.max_tool_blocks = Some(max);
        self
    }

    /// Enable tail suppression
    pub fn with_suppress_tail(mut self, suppress: bool) -> Self {
        self.suppress_tail_after_tools = suppress;
        self
    }

    /// Enable or disable parallel tool calls
    pub fn with_parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    /// Whether text after the last complete tool block is withheld
    pub fn withholds_tail(&self) -> bool {
        self.suppress_tail_after_tools || self.stop_after_tools.is_active()
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Worker process supervision
    pub supervisor: SupervisorConfig,
    /// RPC transport
    pub transport: TransportConfig,
    /// Streaming translator
    pub stream: StreamConfig,
}

impl GatewayConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the supervisor settings
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replace the transport settings
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Replace the stream settings
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is read first when present.
    /// Unparseable numbers keep their defaults; unknown mode names are errors.
    ///
    /// This will look for:
    /// - `WORKERGATE_ENABLED` (`true`/`false`)
    /// - `WORKERGATE_WORKER_COMMAND`, `WORKERGATE_WORKER_ARGS` (whitespace separated),
    ///   `WORKERGATE_WORKER_CWD`, `WORKERGATE_READY_PATTERN`
    /// - `WORKERGATE_MAX_RESTARTS`, `WORKERGATE_BACKOFF_INITIAL_MS`,
    ///   `WORKERGATE_BACKOFF_MAX_MS`, `WORKERGATE_SHUTDOWN_GRACE_MS`
    /// - `WORKERGATE_READY_TIMEOUT_MS`, `WORKERGATE_HANDSHAKE_TIMEOUT_MS`,
    ///   `WORKERGATE_REQUEST_TIMEOUT_MS`, `WORKERGATE_TURN_TIMEOUT_MS`,
    ///   `WORKERGATE_COMPLETION_GRACE_MS`, `WORKERGATE_MAX_CONCURRENCY`,
    ///   `WORKERGATE_TURN_METHOD`
    /// - `WORKERGATE_IDLE_TIMEOUT_MS`, `WORKERGATE_KEEPALIVE_MS` (0 disables),
    ///   `WORKERGATE_STOP_AFTER_TOOLS` (`off`/`first`/`burst`),
    ///   `WORKERGATE_STOP_AFTER_TOOLS_GRACE_MS`, `WORKERGATE_MAX_TOOL_BLOCKS`,
    ///   `WORKERGATE_SUPPRESS_TAIL`, `WORKERGATE_PARALLEL_TOOL_CALLS`
    #[cfg(feature = "env")]
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env_vars()
    }

    /// Same as [`GatewayConfig::from_env`] without reading a `.env` file
    #[cfg(feature = "env")]
    pub fn from_env_vars() -> Result<Self, ConfigError> {
        use std::env;

        let mut config = Self::default();
        let ms = |key: &str| {
            env::var(key)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        // Worker process
        if let Ok(enabled) = env::var("WORKERGATE_ENABLED") {
            config.transport.worker_enabled = parse_bool("WORKERGATE_ENABLED", &enabled)?;
        }
        if let Ok(command) = env::var("WORKERGATE_WORKER_COMMAND") {
            config.supervisor.process.command = command;
        }
        if let Ok(args) = env::var("WORKERGATE_WORKER_ARGS") {
            config.supervisor.process.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(cwd) = env::var("WORKERGATE_WORKER_CWD") {
            config.supervisor.process.cwd = Some(cwd.into());
        }
        if let Ok(pattern) = env::var("WORKERGATE_READY_PATTERN")
            && !pattern.is_empty()
        {
            config.supervisor.ready_pattern = Some(pattern);
        }

        // Restart policy
        if let Ok(value) = env::var("WORKERGATE_MAX_RESTARTS")
            && let Ok(max) = value.trim().parse::<u32>()
        {
            config.supervisor.max_restarts = max;
        }
        if let Some(initial) = ms("WORKERGATE_BACKOFF_INITIAL_MS") {
            config.supervisor.initial_backoff = initial;
        }
        if let Some(max) = ms("WORKERGATE_BACKOFF_MAX_MS") {
            config.supervisor.max_backoff = max;
        }
        if let Some(grace) = ms("WORKERGATE_SHUTDOWN_GRACE_MS") {
            config.supervisor.shutdown_grace = grace;
        }

        // Transport
        if let Some(timeout) = ms("WORKERGATE_READY_TIMEOUT_MS") {
            config.transport.ready_timeout = timeout;
        }
        if let Some(timeout) = ms("WORKERGATE_HANDSHAKE_TIMEOUT_MS") {
            config.transport.handshake_timeout = timeout;
        }
        if let Some(timeout) = ms("WORKERGATE_REQUEST_TIMEOUT_MS") {
            config.transport.request_timeout = timeout;
        }
        if let Some(timeout) = ms("WORKERGATE_TURN_TIMEOUT_MS") {
            config.transport.turn_timeout = timeout;
        }
        if let Some(grace) = ms("WORKERGATE_COMPLETION_GRACE_MS") {
            config.transport.completion_grace = grace;
        }
        if let Ok(value) = env::var("WORKERGATE_MAX_CONCURRENCY")
            && let Ok(max) = value.trim().parse::<usize>()
        {
            config.transport.max_concurrent_turns = max;
        }
        if let Ok(method) = env::var("WORKERGATE_TURN_METHOD") {
            config.transport.turn_method = method.parse()?;
        }

        // Streaming
        if let Some(timeout) = ms("WORKERGATE_IDLE_TIMEOUT_MS") {
            config.stream.idle_timeout = timeout;
        }
        if let Some(interval) = ms("WORKERGATE_KEEPALIVE_MS") {
            config.stream.keepalive_interval = (!interval.is_zero()).then_some(interval);
        }
        if let Ok(mode) = env::var("WORKERGATE_STOP_AFTER_TOOLS") {
            let grace = ms("WORKERGATE_STOP_AFTER_TOOLS_GRACE_MS")
                .unwrap_or(Duration::from_millis(250));
            config.stream.stop_after_tools = StopAfterTools::parse(&mode, grace)?;
        }
        if let Ok(value) = env::var("WORKERGATE_MAX_TOOL_BLOCKS")
            && let Ok(max) = value.trim().parse::<usize>()
        {
            config.stream.max_tool_blocks = (max > 0).then_some(max);
        }
        if let Ok(value) = env::var("WORKERGATE_SUPPRESS_TAIL") {
            config.stream.suppress_tail_after_tools = parse_bool("WORKERGATE_SUPPRESS_TAIL", &value)?;
        }
        if let Ok(value) = env::var("WORKERGATE_PARALLEL_TOOL_CALLS") {
            config.stream.parallel_tool_calls =
                parse_bool("WORKERGATE_PARALLEL_TOOL_CALLS", &value)?;
        }

        Ok(config)
    }
}

#[cfg(feature = "env")]
fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert!(config.transport.worker_enabled);
        assert_eq!(config.transport.max_concurrent_turns, 4);
        assert_eq!(config.transport.turn_method.method(), "sendUserTurn");
        assert_eq!(config.stream.stop_after_tools, StopAfterTools::Off);
        assert!(!config.stream.withholds_tail());
    }

    #[test]
    fn test_builders() {
        let stream = StreamConfig::new()
            .with_stop_after_tools(StopAfterTools::First)
            .with_max_tool_blocks(2)
            .with_keepalive(None);
        assert!(stream.withholds_tail());
        assert_eq!(stream.max_tool_blocks, Some(2));
        assert!(stream.keepalive_interval.is_none());

        let transport = TransportConfig::new()
            .with_max_concurrent_turns(1)
            .with_turn_method(TurnMethod::SendUserMessage)
            .with_completion_grace(Duration::from_millis(10));
        assert_eq!(transport.turn_method.method(), "sendUserMessage");
        assert_eq!(transport.completion_grace, Duration::from_millis(10));
    }

    #[test]
    fn test_stop_after_tools_parse() {
        let grace = Duration::from_millis(100);
        assert_eq!(StopAfterTools::parse("first", grace).unwrap(), StopAfterTools::First);
        assert_eq!(
            StopAfterTools::parse("Burst", grace).unwrap(),
            StopAfterTools::Burst { grace }
        );
        assert_eq!(StopAfterTools::parse("off", grace).unwrap(), StopAfterTools::Off);
        assert!(StopAfterTools::parse("sometimes", grace).is_err());
    }

    #[cfg(feature = "env")]
    #[test]
    fn test_config_from_env_variables() {
        temp_env::with_vars(
            [
                ("WORKERGATE_WORKER_COMMAND", Some("/usr/bin/worker")),
                ("WORKERGATE_WORKER_ARGS", Some("serve --stdio")),
                ("WORKERGATE_MAX_RESTARTS", Some("9")),
                ("WORKERGATE_BACKOFF_INITIAL_MS", Some("50")),
                ("WORKERGATE_MAX_CONCURRENCY", Some("2")),
                ("WORKERGATE_TURN_METHOD", Some("sendUserMessage")),
                ("WORKERGATE_KEEPALIVE_MS", Some("0")),
                ("WORKERGATE_STOP_AFTER_TOOLS", Some("burst")),
                ("WORKERGATE_STOP_AFTER_TOOLS_GRACE_MS", Some("75")),
                ("WORKERGATE_SUPPRESS_TAIL", Some("yes")),
                ("WORKERGATE_REQUEST_TIMEOUT_MS", Some("not-a-number")),
            ],
            || {
                let config = GatewayConfig::from_env_vars().unwrap();
                assert_eq!(config.supervisor.process.command, "/usr/bin/worker");
                assert_eq!(
                    config.supervisor.process.args,
                    vec!["serve".to_string(), "--stdio".to_string()]
                );
                assert_eq!(config.supervisor.max_restarts, 9);
                assert_eq!(config.supervisor.initial_backoff, Duration::from_millis(50));
                assert_eq!(config.transport.max_concurrent_turns, 2);
                assert_eq!(config.transport.turn_method, TurnMethod::SendUserMessage);
                assert!(config.stream.keepalive_interval.is_none());
                assert_eq!(
                    config.stream.stop_after_tools,
                    StopAfterTools::Burst {
                        grace: Duration::from_millis(75)
                    }
                );
                assert!(config.stream.suppress_tail_after_tools);
                // Unparseable numbers keep the default
                assert_eq!(config.transport.request_timeout, Duration::from_secs(30));
            },
        );
    }

    #[cfg(feature = "env")]
    #[test]
    fn test_config_from_env_rejects_unknown_mode() {
        temp_env::with_var("WORKERGATE_STOP_AFTER_TOOLS", Some("sometimes"), || {
            assert!(matches!(
                GatewayConfig::from_env_vars(),
                Err(ConfigError::InvalidValue { .. })
            ));
        });
    }
}
