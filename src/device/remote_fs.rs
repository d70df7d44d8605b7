use crate::device::repl::RawRepl;
use crate::device::scripts::{self, WRITE_CHUNK_CHARS};
use crate::device::sentinel::{self, StatusLine, END, META};
use crate::error::AppError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl RemoteEntry {
    fn error(path: &str, msg: impl Into<String>) -> Self {
        Self {
            name: "<error>".to_string(),
            path: path.to_string(),
            kind: EntryKind::Error,
            size: None,
            msg: Some(msg.into()),
        }
    }
}

/// Parses the JSON listing printed between the frame sentinels. A missing frame or
/// malformed payload becomes a single error entry.
pub fn parse_listing(captured: &str, path: &str) -> Vec<RemoteEntry> {
    let Some(body) = sentinel::framed_body(captured) else {
        return vec![RemoteEntry::error(path, "no listing returned by device")];
    };
    let mut entries = match serde_json::from_str::<Vec<RemoteEntry>>(body.trim()) {
        Ok(entries) => entries,
        Err(e) => return vec![RemoteEntry::error(path, format!("unreadable listing: {}", e))],
    };
    sort_entries(&mut entries);
    entries
}

/// Directories first, then by name.
pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        let a_dir = a.kind == EntryKind::Dir;
        let b_dir = b.kind == EntryKind::Dir;
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
}

/// Reassembles file content from the base64 lines of a read capture.
pub fn decode_read_payload(captured: &str) -> Result<Vec<u8>, AppError> {
    let body = sentinel::framed_body(captured)
        .ok_or_else(|| AppError::ReadFailure("no file payload returned by device".to_string()))?;
    let lines = sentinel::payload_lines(body);
    if let Some(message) = sentinel::error_line(&lines) {
        return Err(AppError::ReadFailure(message.to_string()));
    }

    let mut out = Vec::new();
    for line in lines.iter().filter(|l| !l.starts_with(META)) {
        let chunk = BASE64
            .decode(line)
            .map_err(|e| AppError::ReadFailure(format!("corrupt chunk from device: {}", e)))?;
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Filesystem operations run as one-shot raw executions on the device.
pub struct RemoteFs<'a> {
    repl: &'a RawRepl,
    max_write_bytes: usize,
    fs_timeout_ms: u64,
    transfer_timeout_ms: u64,
}

impl<'a> RemoteFs<'a> {
    pub fn new(repl: &'a RawRepl, max_write_bytes: usize, fs_timeout_ms: u64, transfer_timeout_ms: u64) -> Self {
        Self {
            repl,
            max_write_bytes,
            fs_timeout_ms,
            transfer_timeout_ms,
        }
    }

    fn check_size(&self, size: usize) -> Result<(), AppError> {
        if size > self.max_write_bytes {
            warn!(size, limit = self.max_write_bytes, "Rejected oversized upload");
            return Err(AppError::TooLarge {
                size,
                limit: self.max_write_bytes,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, AppError> {
        let captured = self
            .repl
            .execute(&scripts::list_dir(path), END, self.fs_timeout_ms)
            .await?;
        let entries = parse_listing(&captured, path);
        debug!(count = entries.len(), "Directory listed");
        Ok(entries)
    }

    #[instrument(skip(self))]
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, AppError> {
        let captured = self
            .repl
            .execute(&scripts::read_file(path), END, self.transfer_timeout_ms)
            .await?;
        let bytes = decode_read_payload(&captured)?;
        debug!(size = bytes.len(), "File read");
        Ok(bytes)
    }

    /// Uploads `bytes`. The size ceiling is checked before anything reaches the device.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), AppError> {
        self.check_size(bytes.len())?;
        let encoded = BASE64.encode(bytes);
        let chunks = scripts::split_ascii(&encoded, WRITE_CHUNK_CHARS);
        let captured = self
            .repl
            .execute(&scripts::write_file(path, &chunks), END, self.transfer_timeout_ms)
            .await?;
        match sentinel::parse_status(&captured) {
            StatusLine::Ok => Ok(()),
            StatusLine::Err(message) => Err(AppError::WriteFailure(message)),
            StatusLine::Missing => Err(AppError::WriteFailure("no status returned by device".to_string())),
        }
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, path: &str, is_dir: bool) -> Result<(), AppError> {
        let script = if is_dir {
            scripts::remove_dir(path)
        } else {
            scripts::remove_file(path)
        };
        self.run_status(&script).await
    }

    #[instrument(skip(self))]
    pub async fn mkdir(&self, path: &str) -> Result<(), AppError> {
        self.run_status(&scripts::make_dir(path)).await
    }

    #[instrument(skip(self))]
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), AppError> {
        self.run_status(&scripts::rename(from, to)).await
    }

    /// Stores `code` at `path` on the device and runs it, returning what the program printed.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn save_and_run(&self, path: &str, code: &str, timeout_ms: u64) -> Result<String, AppError> {
        self.check_size(code.len())?;
        let encoded = BASE64.encode(code.as_bytes());
        let chunks = scripts::split_ascii(&encoded, WRITE_CHUNK_CHARS);
        let captured = self
            .repl
            .execute(&scripts::save_and_run(path, &chunks), END, timeout_ms)
            .await?;
        Ok(sentinel::program_output(&captured, END))
    }

    async fn run_status(&self, script: &str) -> Result<(), AppError> {
        let captured = self.repl.execute(script, END, self.fs_timeout_ms).await?;
        match sentinel::parse_status(&captured) {
            StatusLine::Ok => Ok(()),
            StatusLine::Err(message) => Err(AppError::RemoteOperationFailure(message)),
            StatusLine::Missing => Err(AppError::RemoteOperationFailure(
                "no status returned by device".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_parses_and_sorts_directories_first() {
        let captured = "OK___BEGIN___\r\n[{\"name\": \"main.py\", \"path\": \"/main.py\", \"type\": \"file\", \"size\": 40}, \
            {\"name\": \"lib\", \"path\": \"/lib\", \"type\": \"dir\", \"size\": 0}, \
            {\"name\": \"boot.py\", \"path\": \"/boot.py\", \"type\": \"file\", \"size\": null}]\r\n___END___";
        let entries = parse_listing(captured, "/");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["lib", "boot.py", "main.py"]);
        assert_eq!(entries[0].kind, EntryKind::Dir);
        assert_eq!(entries[1].size, None);
        assert_eq!(entries[2].size, Some(40));
    }

    #[test]
    fn device_side_listing_error_is_an_entry() {
        let captured = "___BEGIN___\n[{\"name\": \"<error>\", \"path\": \"/nope\", \"type\": \"error\", \"size\": null, \"msg\": \"[Errno 2] ENOENT\"}]\n___END___";
        let entries = parse_listing(captured, "/nope");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Error);
        assert_eq!(entries[0].msg.as_deref(), Some("[Errno 2] ENOENT"));
    }

    #[test]
    fn garbage_listing_becomes_error_entry() {
        let entries = parse_listing("Traceback (most recent call last):", "/");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Error);
        assert_eq!(entries[0].path, "/");
    }

    #[test]
    fn read_payload_concatenates_chunks_and_skips_meta() {
        let captured = format!(
            "___BEGIN___\r\n{}\r\n{}\r\n___META___{{\"ok\": true}}\r\n___END___",
            BASE64.encode(b"hello "),
            BASE64.encode(b"world"),
        );
        assert_eq!(decode_read_payload(&captured).unwrap(), b"hello world");
    }

    #[test]
    fn read_payload_reports_device_error() {
        let captured = "___BEGIN___\r\n___ERROR___[Errno 2] ENOENT\r\n___END___";
        match decode_read_payload(captured) {
            Err(AppError::ReadFailure(message)) => assert_eq!(message, "[Errno 2] ENOENT"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn empty_file_reads_as_empty() {
        let captured = "___BEGIN___\r\n___META___{\"ok\": true}\r\n___END___";
        assert!(decode_read_payload(captured).unwrap().is_empty());
    }
}
