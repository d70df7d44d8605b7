//! Simulated MicroPython board for integration tests. It speaks the raw REPL handshake and
//! interprets the generated filesystem scripts against an in-memory filesystem.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use mpy_bridge::config::Config;
use mpy_bridge::device::channel::{BoxedStream, ByteChannel, Connector};
use mpy_bridge::device::repl::RawRepl;
use mpy_bridge::device::rx_buffer::RxBuffer;
use mpy_bridge::error::AppError;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const BOOT_BANNER: &str =
    "MicroPython v1.22.0 on 2024-01-05; Raspberry Pi Pico with RP2040\r\nType \"help()\" for more information.\r\n>>> ";

#[derive(Debug, Default)]
pub struct FakeFs {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
}

impl FakeFs {
    pub fn new() -> Self {
        let mut fs = Self::default();
        fs.dirs.insert("/".to_string());
        fs
    }

    fn parent(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => path[..idx].to_string(),
        }
    }

    fn name(path: &str) -> String {
        path.rsplit('/').next().unwrap_or_default().to_string()
    }
}

#[derive(Debug, Default)]
pub struct DeviceOptions {
    /// When set, every raw execution answers with exactly this text.
    pub canned_reply: Option<String>,
    /// Skip the `OK` acknowledgment after a raw payload.
    pub silent_ack: bool,
    /// Enter raw mode without printing the raw banner and prompt.
    pub silent_raw_banner: bool,
}

/// Everything the fake device saw, shared with the test.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub received: Vec<u8>,
    pub executions: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Mode {
    Friendly,
    Raw,
}

pub struct FakeDevice {
    io: DuplexStream,
    mode: Mode,
    code: Vec<u8>,
    line: Vec<u8>,
    running: bool,
    fs: Arc<Mutex<FakeFs>>,
    log: Arc<Mutex<DeviceLog>>,
    options: Arc<DeviceOptions>,
}

impl FakeDevice {
    async fn send(&mut self, text: &str) {
        let _ = self.io.write_all(text.as_bytes()).await;
    }

    async fn run(mut self, unplug: Arc<Notify>) {
        let mut buf = [0u8; 1024];
        loop {
            let n = tokio::select! {
                _ = unplug.notified() => return,
                read = self.io.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                },
            };
            self.log.lock().unwrap().received.extend_from_slice(&buf[..n]);
            for &byte in &buf[..n] {
                self.on_byte(byte).await;
            }
        }
    }

    async fn on_byte(&mut self, byte: u8) {
        match byte {
            0x03 => {
                if self.running {
                    self.running = false;
                    self.send("Traceback (most recent call last):\r\nKeyboardInterrupt: \r\n\x04>").await;
                } else if self.mode == Mode::Raw {
                    self.code.clear();
                } else {
                    self.line.clear();
                    self.send("\r\n>>> ").await;
                }
            }
            0x01 => {
                self.running = false;
                self.mode = Mode::Raw;
                self.code.clear();
                if !self.options.silent_raw_banner {
                    self.send("raw REPL; CTRL-B to exit\r\n>").await;
                }
            }
            0x02 => {
                self.running = false;
                self.mode = Mode::Friendly;
                self.send(&format!("\r\n{}", BOOT_BANNER)).await;
            }
            0x04 => {
                if self.mode == Mode::Raw {
                    let code = String::from_utf8_lossy(&std::mem::take(&mut self.code)).into_owned();
                    self.execute(code).await;
                } else {
                    self.send(&format!("MPY: soft reboot\r\n{}", BOOT_BANNER)).await;
                }
            }
            _ if self.mode == Mode::Raw => self.code.push(byte),
            b'\r' => {}
            b'\n' => {
                let line = String::from_utf8_lossy(&std::mem::take(&mut self.line)).into_owned();
                self.send(&format!("{}\r\n", line)).await;
                if let Some(out) = eval_print(line.trim()) {
                    self.send(&format!("{}\r\n", out)).await;
                }
                self.send(">>> ").await;
            }
            _ => self.line.push(byte),
        }
    }

    async fn execute(&mut self, code: String) {
        self.log.lock().unwrap().executions.push(code.clone());
        if !self.options.silent_ack {
            self.send("OK").await;
        }
        if let Some(reply) = self.options.canned_reply.clone() {
            self.send(&format!("{}\x04\x04>", reply)).await;
            return;
        }

        let (output, hang) = {
            let mut fs = self.fs.lock().unwrap();
            interpret(&code, &mut fs)
        };
        let output = output.replace('\n', "\r\n");
        self.send(&output).await;
        if hang {
            self.running = true;
        } else {
            self.send("\x04\x04>").await;
        }
    }
}

fn assignment<T: serde::de::DeserializeOwned>(code: &str, name: &str) -> Option<T> {
    let prefix = format!("{} = ", name);
    code.lines()
        .find_map(|l| l.strip_prefix(prefix.as_str()))
        .and_then(|literal| serde_json::from_str(literal).ok())
}

/// `print(<json literal>)` evaluated the way the board would print it.
fn eval_print(line: &str) -> Option<String> {
    let inner = line.strip_prefix("print(")?.strip_suffix(')')?;
    match serde_json::from_str::<serde_json::Value>(inner).ok()? {
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn frame(body: &str) -> String {
    format!("___BEGIN___\n{}\n___END___\n", body)
}

fn status(result: Result<(), String>) -> String {
    match result {
        Ok(()) => frame("OK"),
        Err(e) => frame(&format!("ERR:{}", e)),
    }
}

const ENOENT: &str = "[Errno 2] ENOENT";

/// Returns the printed output and whether the program keeps running.
fn interpret(code: &str, fs: &mut FakeFs) -> (String, bool) {
    let path: Option<String> = assignment(code, "P");

    if code.contains("uos.listdir(P)") {
        let p = path.unwrap_or_default();
        let listing = if !fs.dirs.contains(&p) {
            json!([{"name": "<error>", "path": p, "type": "error", "size": null, "msg": ENOENT}])
        } else {
            let mut entries = Vec::new();
            for d in fs.dirs.iter().filter(|d| d.as_str() != "/" && FakeFs::parent(d) == p) {
                entries.push(json!({"name": FakeFs::name(d), "path": d, "type": "dir", "size": 0}));
            }
            for (f, data) in fs.files.iter().filter(|(f, _)| FakeFs::parent(f) == p) {
                entries.push(json!({"name": FakeFs::name(f), "path": f, "type": "file", "size": data.len()}));
            }
            serde_json::Value::Array(entries)
        };
        return (frame(&listing.to_string()), false);
    }

    if code.contains("open(P, \"rb\")") {
        let p = path.unwrap_or_default();
        let body = match fs.files.get(&p) {
            Some(data) => {
                let mut lines: Vec<String> = data.chunks(512).map(|c| BASE64.encode(c)).collect();
                lines.push(format!("___META___{}", json!({"ok": true, "path": p})));
                lines.join("\n")
            }
            None => format!("___ERROR___{}", ENOENT),
        };
        return (frame(&body), false);
    }

    if code.contains("open(P, \"wb\")") {
        let p = path.unwrap_or_default();
        let chunks: Vec<String> = assignment(code, "DATA").unwrap_or_default();
        let mut data = Vec::new();
        for chunk in &chunks {
            data.extend(BASE64.decode(chunk).unwrap_or_default());
        }
        if !fs.dirs.contains(&FakeFs::parent(&p)) {
            let out = if code.contains("exec(") {
                format!("Traceback (most recent call last):\nOSError: {}\n___END___\n", ENOENT)
            } else {
                status(Err(ENOENT.to_string()))
            };
            return (out, false);
        }
        let program = String::from_utf8_lossy(&data).into_owned();
        fs.files.insert(p.clone(), data);
        if code.contains("exec(") {
            let (printed, hang) = run_lines(&program);
            return (format!("Saved: {}\n{}___END___\n", p, printed), hang);
        }
        return (status(Ok(())), false);
    }

    if code.contains("uos.remove(P)") {
        let p = path.unwrap_or_default();
        let result = fs.files.remove(&p).map(|_| ()).ok_or_else(|| ENOENT.to_string());
        return (status(result), false);
    }
    if code.contains("uos.rmdir(P)") {
        let p = path.unwrap_or_default();
        let busy = fs.files.keys().chain(fs.dirs.iter()).any(|x| x != &p && FakeFs::parent(x) == p);
        let result = if !fs.dirs.contains(&p) {
            Err(ENOENT.to_string())
        } else if busy {
            Err("[Errno 39] ENOTEMPTY".to_string())
        } else {
            fs.dirs.remove(&p);
            Ok(())
        };
        return (status(result), false);
    }
    if code.contains("uos.mkdir(P)") {
        let p = path.unwrap_or_default();
        let result = if fs.dirs.contains(&p) || fs.files.contains_key(&p) {
            Err("[Errno 17] EEXIST".to_string())
        } else {
            fs.dirs.insert(p);
            Ok(())
        };
        return (status(result), false);
    }
    if code.contains("uos.rename(A, B)") {
        let from: String = assignment(code, "A").unwrap_or_default();
        let to: String = assignment(code, "B").unwrap_or_default();
        let result = match fs.files.remove(&from) {
            Some(data) => {
                fs.files.insert(to, data);
                Ok(())
            }
            None => Err(ENOENT.to_string()),
        };
        return (status(result), false);
    }

    run_lines(code)
}

/// Minimal program runner: `print(<literal>)`, `raise ...` and `while True:`.
fn run_lines(code: &str) -> (String, bool) {
    let mut out = String::new();
    let mut raised = false;
    for raw in code.lines() {
        let line = raw.trim();
        if raised {
            if line.starts_with("except") {
                raised = false;
                out.push_str("Traceback (most recent call last):\n  File \"<stdin>\", line 2, in <module>\nValueError: boom\n");
            }
            continue;
        }
        if line == "while True:" {
            return (out, true);
        }
        if line.starts_with("raise ") {
            raised = true;
            continue;
        }
        if let Some(printed) = eval_print(line) {
            out.push_str(&printed);
            out.push('\n');
        }
    }
    (out, false)
}

/// Hands out one end of a fresh duplex pipe per connect, with a fake board on the other end.
pub struct FakeConnector {
    pub fs: Arc<Mutex<FakeFs>>,
    pub log: Arc<Mutex<DeviceLog>>,
    pub options: Arc<DeviceOptions>,
    pub unplug: Arc<Notify>,
    pub connects: Mutex<usize>,
    pub fail_with: Mutex<Option<AppError>>,
    devices: Mutex<Vec<JoinHandle<()>>>,
}

impl FakeConnector {
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            fs: Arc::new(Mutex::new(FakeFs::new())),
            log: Arc::new(Mutex::new(DeviceLog::default())),
            options: Arc::new(options),
            unplug: Arc::new(Notify::new()),
            connects: Mutex::new(0),
            fail_with: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Simulates pulling the USB cable: the board side of the pipe goes away.
    pub fn unplug(&self) {
        self.unplug.notify_waiters();
    }

    pub fn executions(&self) -> Vec<String> {
        self.log.lock().unwrap().executions.clone()
    }

    pub fn received(&self) -> Vec<u8> {
        self.log.lock().unwrap().received.clone()
    }

    pub fn clear_log(&self) {
        let mut log = self.log.lock().unwrap();
        log.received.clear();
        log.executions.clear();
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _baud_rate: u32) -> Result<BoxedStream, AppError> {
        if let Some(err) = self.fail_with.lock().unwrap().take() {
            return Err(err);
        }
        *self.connects.lock().unwrap() += 1;
        let (client, board) = tokio::io::duplex(64 * 1024);
        let device = FakeDevice {
            io: board,
            mode: Mode::Friendly,
            code: Vec::new(),
            line: Vec::new(),
            running: false,
            fs: self.fs.clone(),
            log: self.log.clone(),
            options: self.options.clone(),
        };
        let handle = tokio::spawn(device.run(self.unplug.clone()));
        self.devices.lock().unwrap().push(handle);
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "fake://pico".to_string()
    }
}

/// A protocol stack wired by hand: channel, buffer pump and REPL driver.
pub struct Harness {
    pub connector: Arc<FakeConnector>,
    pub channel: Arc<ByteChannel>,
    pub buffer: Arc<RxBuffer>,
    pub repl: Arc<RawRepl>,
    pump: JoinHandle<()>,
}

impl Harness {
    pub async fn start(options: DeviceOptions) -> Self {
        let connector = Arc::new(FakeConnector::new(options));
        let channel = Arc::new(ByteChannel::open(connector.as_ref(), 115_200).await.unwrap());
        let buffer = Arc::new(RxBuffer::new(200_000, 100_000));
        let mut events = channel.subscribe();
        let pump_buffer = buffer.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let mpy_bridge::device::ChannelEvent::Data(text) = event {
                    pump_buffer.append(&text);
                }
            }
        });
        channel.start_receive_loop().unwrap();
        let repl = Arc::new(RawRepl::new(channel.clone(), buffer.clone()));
        Self {
            connector,
            channel,
            buffer,
            repl,
            pump,
        }
    }

    pub async fn stop(self) {
        self.channel.close().await;
        self.pump.abort();
    }
}

pub fn test_config() -> Config {
    let dir = std::env::temp_dir().join(format!("mpy-bridge-test-{}", uuid::Uuid::new_v4()));
    Config {
        audit_log_file: dir.join("tool_calls.log"),
        run_timeout_ms: 5_000,
        fs_timeout_ms: 5_000,
        transfer_timeout_ms: 5_000,
        ..Config::default()
    }
}
