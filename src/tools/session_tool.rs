use crate::config::Config;
use crate::device::channel::{ByteChannel, ChannelEvent, Connector};
use crate::device::remote_fs::RemoteFs;
use crate::device::renderer::{DeviceInfo, TerminalRenderer};
use crate::device::repl::{RawRepl, ReplMode};
use crate::device::rx_buffer::RxBuffer;
use crate::device::sentinel::{self, END};
use crate::device::serial::SerialConnector;
use crate::device::scripts;
use crate::error::AppError;
use crate::utils::remote_path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_PROGRAM_FILE: &str = "main.py";
const DEFAULT_VIEWPORT_ROWS: usize = 40;
/// Quiet time after which text held back as a possible marker start is shown.
const PENDING_FLUSH_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize, Default)]
pub struct ConnectParams {
    /// Overrides the configured serial port for this connection.
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RunCodeParams {
    pub code: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SaveAndRunParams {
    pub code: String,
    pub filename: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ReplSendParams {
    pub line: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectResult {
    pub connection_id: String,
    pub port: String,
    pub baud_rate: u32,
    pub mode: ReplMode,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResult {
    pub was_connected: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub connection_id: Option<String>,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub connected_since_iso: Option<String>,
    pub mode: Option<ReplMode>,
    pub busy: bool,
    pub buffered_chars: usize,
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Serialize)]
pub struct RunResult {
    pub output: String,
    pub duration_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct SaveAndRunResult {
    pub path: String,
    pub output: String,
    pub duration_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct ModeResult {
    pub mode: ReplMode,
    pub message: String,
}

/// Everything that lives exactly as long as one open connection.
#[derive(Debug)]
pub struct DeviceLink {
    id: Uuid,
    connected_at: DateTime<Utc>,
    baud_rate: u32,
    repl: Arc<RawRepl>,
    lost: Arc<AtomicBool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl DeviceLink {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn repl(&self) -> &RawRepl {
        &self.repl
    }

    pub fn channel(&self) -> &ByteChannel {
        self.repl.channel()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.repl.abort();
        self.repl.channel().close().await;
        self.repl.buffer().reset();
        self.repl.reset_state();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        debug!(connection_id = %self.id, "Device link torn down");
    }
}

/// The only owner of the device connection. Opens and closes the channel and exposes the
/// run/stop/reset lifecycle on top of it.
pub struct SessionManager {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    link: TokioMutex<Option<Arc<DeviceLink>>>,
    terminal: Arc<StdMutex<TerminalRenderer>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("connector", &self.connector.describe())
            .finish()
    }
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Self {
        let connector = Arc::new(SerialConnector::new(config.serial_port.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: Arc<Config>, connector: Arc<dyn Connector>) -> Self {
        let terminal = TerminalRenderer::new(config.terminal_max_lines, DEFAULT_VIEWPORT_ROWS);
        Self {
            config,
            connector,
            link: TokioMutex::new(None),
            terminal: Arc::new(StdMutex::new(terminal)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn terminal(&self) -> Arc<StdMutex<TerminalRenderer>> {
        self.terminal.clone()
    }

    fn system_line(&self, text: &str) {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_system(text);
    }

    /// The live link, or `NotConnected`. A link whose read loop died is torn down here.
    pub async fn current_link(&self) -> Result<Arc<DeviceLink>, AppError> {
        let mut guard = self.link.lock().await;
        match guard.as_ref() {
            None => Err(AppError::NotConnected),
            Some(link) if link.is_lost() => {
                let link = link.clone();
                *guard = None;
                drop(guard);
                warn!(connection_id = %link.id, "Discarding lost device link");
                link.shutdown().await;
                Err(AppError::NotConnected)
            }
            Some(link) => Ok(link.clone()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.current_link().await.is_ok()
    }

    /// Filesystem view over the current link with the configured limits.
    pub fn remote_fs<'a>(&self, link: &'a DeviceLink) -> RemoteFs<'a> {
        RemoteFs::new(
            link.repl(),
            self.config.max_write_bytes,
            self.config.fs_timeout_ms,
            self.config.transfer_timeout_ms,
        )
    }

    #[instrument(skip(self, params), fields(port = ?params.port, baud_rate = ?params.baud_rate))]
    pub async fn connect(&self, params: &ConnectParams) -> Result<ConnectResult, AppError> {
        let baud_rate = params.baud_rate.unwrap_or(self.config.baud_rate);
        if baud_rate == 0 {
            return Err(AppError::InvalidInputArgument("baud_rate must be greater than zero".to_string()));
        }

        let mut guard = self.link.lock().await;
        if let Some(previous) = guard.take() {
            info!(connection_id = %previous.id, "Closing previous connection before reconnecting");
            previous.shutdown().await;
        }

        let override_connector;
        let connector: &dyn Connector = match &params.port {
            Some(port) => {
                override_connector = SerialConnector::new(Some(port.clone()));
                &override_connector
            }
            None => self.connector.as_ref(),
        };

        let channel = Arc::new(ByteChannel::open(connector, baud_rate).await?);
        let buffer = Arc::new(RxBuffer::new(self.config.rx_buffer_limit, self.config.rx_buffer_retain));
        let lost = Arc::new(AtomicBool::new(false));

        let tasks = vec![
            spawn_buffer_pump(channel.subscribe(), buffer.clone(), lost.clone()),
            spawn_terminal_pump(channel.subscribe(), self.terminal.clone()),
        ];
        if let Err(e) = channel.start_receive_loop() {
            for task in &tasks {
                task.abort();
            }
            channel.close().await;
            return Err(e);
        }

        let link = Arc::new(DeviceLink {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            baud_rate,
            repl: Arc::new(RawRepl::new(channel.clone(), buffer)),
            lost,
            tasks: StdMutex::new(tasks),
        });
        *guard = Some(link.clone());
        drop(guard);

        let port = channel.label().to_string();
        self.system_line(&format!("Connected to {} at {} baud", port, baud_rate));
        info!(connection_id = %link.id, port = %port, baud_rate, "Device connected");

        let mode = match link.repl.ensure_interactive().await {
            Ok(mode) => mode,
            Err(e) => {
                warn!(error = %e, "Could not resynchronize to the interactive prompt after connecting");
                link.repl.mode()
            }
        };

        Ok(ConnectResult {
            connection_id: link.id.to_string(),
            port: port.clone(),
            baud_rate,
            mode,
            message: format!("Connected to {} at {} baud", port, baud_rate),
        })
    }

    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<DisconnectResult, AppError> {
        let previous = self.link.lock().await.take();
        let Some(link) = previous else {
            return Ok(DisconnectResult {
                was_connected: false,
                message: "No device connected".to_string(),
            });
        };

        link.shutdown().await;
        {
            let mut terminal = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
            terminal.reset_for_disconnect();
            terminal.push_system("Disconnected");
        }
        info!(connection_id = %link.id, "Device disconnected");
        Ok(DisconnectResult {
            was_connected: true,
            message: format!("Disconnected from {}", link.channel().label()),
        })
    }

    pub async fn status(&self) -> SessionStatus {
        let device = self
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .device_info()
            .cloned();
        match self.current_link().await {
            Ok(link) => SessionStatus {
                connected: true,
                connection_id: Some(link.id.to_string()),
                port: Some(link.channel().label().to_string()),
                baud_rate: Some(link.baud_rate),
                connected_since_iso: Some(link.connected_at.to_rfc3339()),
                mode: Some(link.repl.mode()),
                busy: link.repl.is_busy(),
                buffered_chars: link.repl.buffer().len(),
                device,
            },
            Err(_) => SessionStatus {
                connected: false,
                connection_id: None,
                port: None,
                baud_rate: None,
                connected_since_iso: None,
                mode: None,
                busy: false,
                buffered_chars: 0,
                device: None,
            },
        }
    }

    /// Runs a program in raw mode and returns what it printed.
    #[instrument(skip(self, params), fields(code_len = params.code.len()))]
    pub async fn run(&self, params: &RunCodeParams) -> Result<RunResult, AppError> {
        if params.code.trim().is_empty() {
            return Err(AppError::InvalidInputArgument("code must not be empty".to_string()));
        }
        let link = self.current_link().await?;
        let timeout_ms = params.timeout_ms.unwrap_or(self.config.run_timeout_ms);

        let started = Instant::now();
        let captured = link
            .repl
            .execute(&scripts::run_program(&params.code), END, timeout_ms)
            .await?;
        let output = sentinel::program_output(&captured, END);
        let duration_ms = started.elapsed().as_millis();
        info!(duration_ms, output_len = output.len(), "Program finished");
        Ok(RunResult { output, duration_ms })
    }

    /// Writes the program to a device file, then runs that file.
    #[instrument(skip(self, params), fields(code_len = params.code.len(), filename = ?params.filename))]
    pub async fn save_and_run(&self, params: &SaveAndRunParams) -> Result<SaveAndRunResult, AppError> {
        if params.code.trim().is_empty() {
            return Err(AppError::InvalidInputArgument("code must not be empty".to_string()));
        }
        let filename = params
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_PROGRAM_FILE);
        let path = remote_path::join("/", filename);
        if path == "/" {
            return Err(AppError::InvalidInputArgument(format!("invalid filename: {:?}", filename)));
        }

        let link = self.current_link().await?;
        let timeout_ms = params.timeout_ms.unwrap_or(self.config.run_timeout_ms);
        let started = Instant::now();
        let output = self
            .remote_fs(&link)
            .save_and_run(&path, &params.code, timeout_ms)
            .await?;
        Ok(SaveAndRunResult {
            path,
            output,
            duration_ms: started.elapsed().as_millis(),
        })
    }

    /// Interrupts whatever runs on the device and fails any pending wait with `Aborted`.
    /// Resynchronization afterwards is best-effort.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<ModeResult, AppError> {
        let link = self.current_link().await?;
        link.repl.interrupt().await?;
        link.repl.abort();
        if let Err(e) = link.repl.ensure_interactive().await {
            warn!(error = %e, "Resynchronization after stop failed");
        }
        self.system_line("Program stopped");
        let mode = link.repl.mode();
        Ok(ModeResult {
            mode,
            message: "Interrupt sent".to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn soft_reset(&self) -> Result<ModeResult, AppError> {
        let link = self.current_link().await?;
        if link.repl.is_busy() {
            return Err(AppError::Busy);
        }
        link.repl.soft_reset().await?;
        self.system_line("Soft reset");
        Ok(ModeResult {
            mode: link.repl.mode(),
            message: "Soft reset sent".to_string(),
        })
    }

    /// Sends one line to the interactive prompt, resynchronizing first if the mode is uncertain.
    #[instrument(skip(self, params))]
    pub async fn send_repl_line(&self, params: &ReplSendParams) -> Result<ModeResult, AppError> {
        let link = self.current_link().await?;
        if link.repl.is_busy() {
            return Err(AppError::Busy);
        }
        if link.repl.mode() != ReplMode::Interactive {
            link.repl.ensure_interactive().await?;
        }
        let line = params.line.trim_end_matches(['\r', '\n']);
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_input(line);
        link.channel().write(format!("{}\r\n", line).as_bytes()).await?;
        Ok(ModeResult {
            mode: link.repl.mode(),
            message: "Line sent".to_string(),
        })
    }

    /// Switches the interpreter to raw mode outside of any execution.
    pub async fn enter_raw_mode(&self) -> Result<ModeResult, AppError> {
        let link = self.current_link().await?;
        if link.repl.is_busy() {
            return Err(AppError::Busy);
        }
        link.repl.clear_abort();
        link.repl.enter_raw().await?;
        Ok(ModeResult {
            mode: link.repl.mode(),
            message: "Raw mode requested".to_string(),
        })
    }

    pub async fn enter_interactive_mode(&self) -> Result<ModeResult, AppError> {
        let link = self.current_link().await?;
        if link.repl.is_busy() {
            return Err(AppError::Busy);
        }
        let mode = link.repl.ensure_interactive().await?;
        Ok(ModeResult {
            mode,
            message: match mode {
                ReplMode::Interactive => "Interactive prompt ready".to_string(),
                _ => "Interactive prompt not detected".to_string(),
            },
        })
    }
}

fn spawn_buffer_pump(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    buffer: Arc<RxBuffer>,
    lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Data(text) => buffer.append(&text),
                ChannelEvent::Closed { .. } => {
                    lost.store(true, Ordering::SeqCst);
                    buffer.reset();
                }
            }
        }
    })
}

fn spawn_terminal_pump(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    terminal: Arc<StdMutex<TerminalRenderer>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let holding = terminal.lock().unwrap_or_else(PoisonError::into_inner).has_pending();
            let next = if holding {
                match tokio::time::timeout(PENDING_FLUSH_DELAY, events.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        terminal.lock().unwrap_or_else(PoisonError::into_inner).flush_pending();
                        continue;
                    }
                }
            } else {
                events.recv().await
            };
            let Some(event) = next else { break };
            let mut terminal = terminal.lock().unwrap_or_else(PoisonError::into_inner);
            match event {
                ChannelEvent::Data(text) => terminal.push_chunk(&text),
                ChannelEvent::Closed { reason } => {
                    terminal.reset_for_disconnect();
                    match reason {
                        Some(reason) => terminal.push_system(&format!("Device connection lost: {}", reason)),
                        None => terminal.push_system("Device connection lost"),
                    }
                }
            }
        }
    })
}
