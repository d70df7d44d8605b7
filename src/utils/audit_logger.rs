use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Arguments carrying program text or file content above this size are not logged verbatim.
const MAX_LOGGED_ARG_LEN: usize = 1024;
const BULKY_ARGS: [&str; 2] = ["code", "content"];

pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: &Config) -> Self {
        if let Some(parent_dir) = config.audit_log_file.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path: config.audit_log_file.clone(),
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn log_tool_call(&self, tool_name: &str, arguments: &Value, outcome: &str) {
        if let Err(e) = self.try_log_tool_call(tool_name, arguments, outcome).await {
            error!(tool = %tool_name, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_tool_call(&self, tool_name: &str, arguments: &Value, outcome: &str) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        let args_string = serde_json::to_string(&sanitize_arguments(arguments))?;
        let log_entry = format!(
            "{} | {:<18} | {:<5} | Arguments: {}\n",
            timestamp, tool_name, outcome, args_string
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

fn sanitize_arguments(arguments: &Value) -> Value {
    let mut sanitized = arguments.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for key in BULKY_ARGS {
            if let Some(Value::String(s)) = obj.get_mut(key) {
                if s.len() > MAX_LOGGED_ARG_LEN {
                    *s = format!("<{} truncated for log: {} bytes>", key, s.len());
                }
            }
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_in(dir: &std::path::Path, max_size_bytes: u64) -> Config {
        Config {
            audit_log_file: dir.join("logs").join("tool_calls.log"),
            audit_log_max_size_bytes: max_size_bytes,
            ..Config::default()
        }
    }

    #[test]
    fn large_code_is_truncated() {
        let args = json!({"code": "x".repeat(5000), "path": "/main.py"});
        let sanitized = sanitize_arguments(&args);
        assert_eq!(sanitized["code"], "<code truncated for log: 5000 bytes>");
        assert_eq!(sanitized["path"], "/main.py");
    }

    #[tokio::test]
    async fn appends_entries_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 200);
        let logger = AuditLogger::new(&config);

        logger.log_tool_call("run_code", &json!({"code": "print(1)"}), "ok").await;
        let first = std::fs::read_to_string(&config.audit_log_file).unwrap();
        assert!(first.contains("run_code"));
        assert!(first.contains("print(1)"));

        for _ in 0..5 {
            logger.log_tool_call("device_status", &json!({}), "ok").await;
        }
        let rotated = std::fs::read_dir(dir.path().join("logs")).unwrap().count();
        assert!(rotated >= 2, "expected a rotated backup next to the live log");
    }
}
