use std::net::SocketAddr;
use std::time::Duration;

/// Captured output ceiling for every collected stream (64 KiB).
pub const OUTPUT_LIMIT: u64 = 64 << 10;

/// Resource ceilings handed to the sandbox executor for one command.
///
/// The executor enforces these; the broker and worker never time out a
/// command on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_bytes: u64,
    pub proc_limit: u64,
    pub output_bytes: u64,
}

impl ResourceLimits {
    pub fn compile() -> Self {
        Self {
            cpu_time: Duration::from_secs(10),
            wall_time: Duration::from_secs(12),
            memory_bytes: 512 << 20,
            proc_limit: 100,
            output_bytes: OUTPUT_LIMIT,
        }
    }

    pub fn run() -> Self {
        Self {
            cpu_time: Duration::from_secs(3),
            wall_time: Duration::from_secs(3),
            memory_bytes: 256 << 20,
            proc_limit: 1,
            output_bytes: OUTPUT_LIMIT,
        }
    }

    pub fn shell() -> Self {
        Self {
            cpu_time: Duration::from_secs(30),
            wall_time: Duration::from_secs(30 * 60),
            memory_bytes: 256 << 20,
            proc_limit: 50,
            output_bytes: OUTPUT_LIMIT,
        }
    }
}

/// Limits used by the grading engine for the compile step and for each case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradingLimits {
    pub compile: ResourceLimits,
    pub run: ResourceLimits,
}

impl Default for GradingLimits {
    fn default() -> Self {
        Self {
            compile: ResourceLimits::compile(),
            run: ResourceLimits::run(),
        }
    }
}

impl GradingLimits {
    /// Per-case limits for a language. Managed runtimes spawn helper threads,
    /// so they get a larger process allowance than native binaries.
    pub fn run_limits_for(&self, language: &str) -> ResourceLimits {
        let proc_limit = match language {
            "java" => 25,
            "go" | "javascript" | "typescript" | "ruby" | "csharp" | "perl" => 12,
            _ => self.run.proc_limit,
        };
        ResourceLimits {
            proc_limit,
            ..self.run
        }
    }
}

/// Command line and limits for interactive shell sessions.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub limits: ResourceLimits,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            args: vec!["/bin/bash".to_string()],
            env: vec![
                "PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
                "HOME=/w".to_string(),
                "TERM=xterm-256color".to_string(),
            ],
            limits: ResourceLimits::shell(),
        }
    }
}

/// Heartbeat and deadline settings shared by every duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between heartbeat frames.
    pub ping_period: Duration,
    /// A connection with no inbound traffic for this long is dead.
    pub pong_wait: Duration,
    /// Upper bound on a single outbound write.
    pub write_wait: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(50),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    /// Maximum number of pending judge requests.
    pub queue_capacity: usize,
    /// Buffer between stream handlers and the update loop.
    pub update_buffer: usize,
    /// Mailbox size of each update observer.
    pub observer_mailbox: usize,
    pub auth_token: Option<String>,
    pub keepalive: KeepaliveConfig,
    pub shell: ShellConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5081)),
            queue_capacity: 64,
            update_buffer: 64,
            observer_mailbox: 64,
            auth_token: None,
            keepalive: KeepaliveConfig::default(),
            shell: ShellConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker URI, e.g. `http://127.0.0.1:5081`.
    pub broker_addr: String,
    pub auth_token: Option<String>,
    /// Pause between connection attempts; a random jitter of up to a second is added.
    pub reconnect_interval: Duration,
    pub limits: GradingLimits,
    pub keepalive: KeepaliveConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_addr: "http://127.0.0.1:5081".to_string(),
            auth_token: None,
            reconnect_interval: Duration::from_secs(5),
            limits: GradingLimits::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(broker_addr: impl Into<String>) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub broker_addr: String,
    pub auth_token: Option<String>,
    pub observer_mailbox: usize,
    /// Largest accepted REST request body.
    pub body_limit: usize,
    /// Pause before re-subscribing to broker updates after a failure.
    pub reconnect_interval: Duration,
    pub keepalive: KeepaliveConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            broker_addr: "http://127.0.0.1:5081".to_string(),
            auth_token: None,
            observer_mailbox: 64,
            body_limit: 64 << 10,
            reconnect_interval: Duration::from_secs(5),
            keepalive: KeepaliveConfig::default(),
        }
    }
}
