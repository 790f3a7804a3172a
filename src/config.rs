use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub timers: TimersConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.autonomy.max_consecutive == 0 {
            anyhow::bail!("autonomy.max_consecutive must be > 0");
        }
        if self.autonomy.cooldown_ms <= 0 {
            anyhow::bail!("autonomy.cooldown_ms must be > 0");
        }
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "sessiond.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_queue_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_queue_poll_interval_ms() -> u64 {
    50
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_outbox_poll_interval_ms(),
            batch_size: default_outbox_batch_size(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

fn default_outbox_poll_interval_ms() -> u64 {
    250
}
fn default_outbox_batch_size() -> usize {
    32
}
fn default_chunk_chars() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimersConfig {
    #[serde(default = "default_timer_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timer_batch_size")]
    pub batch_size: usize,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_timer_poll_interval_ms(),
            batch_size: default_timer_batch_size(),
        }
    }
}

fn default_timer_poll_interval_ms() -> u64 {
    1_000
}
fn default_timer_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

fn default_agent_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutonomyConfig {
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            max_consecutive: default_max_consecutive(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_max_consecutive() -> u32 {
    3
}
fn default_cooldown_ms() -> i64 {
    15_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8099
}
