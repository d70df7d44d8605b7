use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub log_level: String,
    pub transport_mode: TransportMode,
    pub sse_host: String,
    pub sse_port: u16,
    pub rx_buffer_limit: usize,
    pub rx_buffer_retain: usize,
    pub max_write_bytes: usize,
    pub run_timeout_ms: u64,
    pub fs_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
    pub terminal_max_lines: usize,
    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stdio,
    Sse,
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "sse" => Ok(TransportMode::Sse),
            _ => Err(anyhow::anyhow!("Invalid transport mode: {}", s)),
        }
    }
}

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

/// Reads `key` from the environment and parses it, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        let log_dir = PathBuf::from(".mpy-bridge");
        Self {
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            log_level: "info".to_string(),
            transport_mode: TransportMode::Stdio,
            sse_host: "127.0.0.1".to_string(),
            sse_port: 3000,
            rx_buffer_limit: 200_000,
            rx_buffer_retain: 100_000,
            max_write_bytes: 60_000,
            run_timeout_ms: 60_000,
            fs_timeout_ms: 12_000,
            transfer_timeout_ms: 20_000,
            terminal_max_lines: 2_000,
            audit_log_file: log_dir.join("tool_calls.log"),
            audit_log_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let serial_port = match std::env::var("SERIAL_PORT").ok().filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(expand_tilde(raw.trim()).to_string_lossy().into_owned()),
            None => None,
        };

        let baud_rate = env_parse("BAUD_RATE", defaults.baud_rate)?;
        if baud_rate == 0 {
            anyhow::bail!("BAUD_RATE must be greater than zero");
        }

        let log_level = std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level);

        let transport_mode_str = std::env::var("MCP_TRANSPORT").unwrap_or_else(|_| "stdio".to_string());
        let transport_mode = TransportMode::from_str(&transport_mode_str)?;

        let sse_host = std::env::var("MCP_SSE_HOST").unwrap_or(defaults.sse_host);
        let sse_port = env_parse("MCP_SSE_PORT", defaults.sse_port)?;

        let rx_buffer_limit = env_parse("RX_BUFFER_LIMIT", defaults.rx_buffer_limit)?;
        let mut rx_buffer_retain = env_parse("RX_BUFFER_RETAIN", defaults.rx_buffer_retain)?;
        if rx_buffer_retain > rx_buffer_limit {
            warn!(
                retain = rx_buffer_retain,
                limit = rx_buffer_limit,
                "RX_BUFFER_RETAIN exceeds RX_BUFFER_LIMIT; clamping to the limit"
            );
            rx_buffer_retain = rx_buffer_limit;
        }

        let max_write_bytes = env_parse("MAX_WRITE_BYTES", defaults.max_write_bytes)?;
        let run_timeout_ms = env_parse("RUN_TIMEOUT_MS", defaults.run_timeout_ms)?;
        let fs_timeout_ms = env_parse("FS_TIMEOUT_MS", defaults.fs_timeout_ms)?;
        let transfer_timeout_ms = env_parse("TRANSFER_TIMEOUT_MS", defaults.transfer_timeout_ms)?;
        let terminal_max_lines = env_parse("TERMINAL_MAX_LINES", defaults.terminal_max_lines)?;

        let log_dir_base = std::env::var("MCP_LOG_DIR")
            .ok()
            .map(|s| expand_tilde(&s))
            .unwrap_or_else(|| PathBuf::from(".mpy-bridge"));
        let audit_log_file = log_dir_base.join("tool_calls.log");
        let audit_log_max_size_bytes = env_parse::<u64>("AUDIT_LOG_MAX_SIZE_MB", 10)? * 1024 * 1024;

        Ok(Config {
            serial_port,
            baud_rate,
            log_level,
            transport_mode,
            sse_host,
            sse_port,
            rx_buffer_limit,
            rx_buffer_retain,
            max_write_bytes,
            run_timeout_ms,
            fs_timeout_ms,
            transfer_timeout_ms,
            terminal_max_lines,
            audit_log_file,
            audit_log_max_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_mode_parses_case_insensitively() {
        assert_eq!(TransportMode::from_str("SSE").unwrap(), TransportMode::Sse);
        assert_eq!(TransportMode::from_str("stdio").unwrap(), TransportMode::Stdio);
        assert!(TransportMode::from_str("websocket").is_err());
    }

    #[test]
    fn defaults_match_device_expectations() {
        let config = Config::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.max_write_bytes, 60_000);
        assert!(config.rx_buffer_retain <= config.rx_buffer_limit);
    }

    #[test]
    fn tilde_expands_to_home_and_plain_paths_pass_through() {
        assert_eq!(expand_tilde("/dev/ttyACM0"), PathBuf::from("/dev/ttyACM0"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_tilde("~/logs"), PathBuf::from(home).join("logs"));
        }
    }

    #[test]
    fn env_parse_falls_back_and_rejects_garbage() {
        std::env::remove_var("MPY_BRIDGE_TEST_UNSET");
        assert_eq!(env_parse("MPY_BRIDGE_TEST_UNSET", 42u64).unwrap(), 42);

        std::env::set_var("MPY_BRIDGE_TEST_GARBAGE", "forty-two");
        assert!(env_parse("MPY_BRIDGE_TEST_GARBAGE", 42u64).is_err());
        std::env::remove_var("MPY_BRIDGE_TEST_GARBAGE");
    }
}
