use crate::device::renderer::{TranscriptLine, Viewport};
use crate::error::AppError;
use crate::tools::session_tool::{ConnectParams, ReplSendParams, SessionManager, SessionStatus};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};
use tracing::{debug, instrument};

const DEFAULT_READ_LINES: usize = 200;

pub const HELP_TEXT: &str = "Commands: help, clear, status, connect, disconnect, :raw, :friendly. \
Anything else is sent to the device prompt.";

#[derive(Debug, Deserialize, Default)]
pub struct ReadTerminalParams {
    /// Number of trailing lines to return.
    pub lines: Option<usize>,
    /// Moves the viewport before reading.
    pub scroll_to: Option<usize>,
    pub viewport_height: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TerminalCommandParams {
    pub input: String,
}

#[derive(Debug, Serialize)]
pub struct ReadTerminalResult {
    pub total_lines: usize,
    pub banner_shown: bool,
    pub viewport: Viewport,
    pub visible: Vec<TranscriptLine>,
    pub lines: Vec<TranscriptLine>,
}

#[derive(Debug, Serialize)]
pub struct TerminalCommandResult {
    pub command: String,
    pub handled_locally: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
}

/// One line typed into the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCommand {
    Help,
    Clear,
    Status,
    Connect,
    Disconnect,
    Raw,
    Friendly,
    Line(String),
}

impl TerminalCommand {
    pub fn parse(input: &str) -> Self {
        let line = input.trim_end_matches(['\r', '\n']);
        match line.trim() {
            "help" | ":help" => TerminalCommand::Help,
            "clear" => TerminalCommand::Clear,
            "status" => TerminalCommand::Status,
            "connect" => TerminalCommand::Connect,
            "disconnect" => TerminalCommand::Disconnect,
            ":raw" => TerminalCommand::Raw,
            ":friendly" => TerminalCommand::Friendly,
            _ => TerminalCommand::Line(line.to_string()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TerminalCommand::Help => "help",
            TerminalCommand::Clear => "clear",
            TerminalCommand::Status => "status",
            TerminalCommand::Connect => "connect",
            TerminalCommand::Disconnect => "disconnect",
            TerminalCommand::Raw => ":raw",
            TerminalCommand::Friendly => ":friendly",
            TerminalCommand::Line(_) => "line",
        }
    }
}

fn describe_status(status: &SessionStatus) -> String {
    if !status.connected {
        return "Not connected".to_string();
    }
    let mut text = format!(
        "Connected to {} at {} baud, mode {}",
        status.port.as_deref().unwrap_or("?"),
        status.baud_rate.unwrap_or_default(),
        status.mode.map(|m| m.to_string()).unwrap_or_else(|| "unknown".to_string()),
    );
    if status.busy {
        text.push_str(", busy");
    }
    if let Some(device) = &status.device {
        text.push_str(&format!(
            "; MicroPython {} ({}) on {}",
            device.version, device.build_date, device.board
        ));
    }
    text
}

#[derive(Debug)]
pub struct TerminalManager {
    session: Arc<SessionManager>,
}

impl TerminalManager {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    fn note(&self, text: &str) {
        self.session
            .terminal()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_system(text);
    }

    #[instrument(skip(self, params))]
    pub async fn read_terminal(&self, params: &ReadTerminalParams) -> Result<ReadTerminalResult, AppError> {
        let terminal = self.session.terminal();
        let mut terminal = terminal.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(height) = params.viewport_height {
            terminal.set_viewport_height(height);
        }
        if let Some(top) = params.scroll_to {
            terminal.scroll_to(top);
        }
        Ok(ReadTerminalResult {
            total_lines: terminal.len(),
            banner_shown: terminal.banner_shown(),
            viewport: terminal.viewport(),
            visible: terminal.visible(),
            lines: terminal.tail(params.lines.unwrap_or(DEFAULT_READ_LINES)),
        })
    }

    /// Interprets a terminal input line: local commands are handled here, anything else goes
    /// to the device prompt.
    #[instrument(skip(self, params), fields(input_len = params.input.len()))]
    pub async fn terminal_command(&self, params: &TerminalCommandParams) -> Result<TerminalCommandResult, AppError> {
        let command = TerminalCommand::parse(&params.input);
        debug!(command = command.name(), "Terminal input");

        let mut status = None;
        let message = match &command {
            TerminalCommand::Help => {
                self.note(HELP_TEXT);
                HELP_TEXT.to_string()
            }
            TerminalCommand::Clear => {
                self.session
                    .terminal()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                "Terminal cleared".to_string()
            }
            TerminalCommand::Status => {
                let current = self.session.status().await;
                let text = describe_status(&current);
                self.note(&text);
                status = Some(current);
                text
            }
            TerminalCommand::Connect => self.report(self.session.connect(&ConnectParams::default()).await.map(|r| r.message))?,
            TerminalCommand::Disconnect => self.report(self.session.disconnect().await.map(|r| r.message))?,
            TerminalCommand::Raw => self.report(self.session.enter_raw_mode().await.map(|r| r.message))?,
            TerminalCommand::Friendly => self.report(self.session.enter_interactive_mode().await.map(|r| r.message))?,
            TerminalCommand::Line(line) => {
                if !self.session.is_connected().await {
                    self.note("Not connected. Type 'connect' first.");
                    "Not connected".to_string()
                } else {
                    let params = ReplSendParams { line: line.clone() };
                    self.report(self.session.send_repl_line(&params).await.map(|r| r.message))?
                }
            }
        };

        Ok(TerminalCommandResult {
            command: command.name().to_string(),
            handled_locally: !matches!(command, TerminalCommand::Line(_)),
            message,
            status,
        })
    }

    /// Mirrors a failed command into the transcript before handing the error back.
    fn report(&self, outcome: Result<String, AppError>) -> Result<String, AppError> {
        if let Err(e) = &outcome {
            self.note(&format!("Error: {}", e));
        }
        outcome
    }
}
