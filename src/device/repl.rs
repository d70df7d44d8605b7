use crate::device::channel::ByteChannel;
use crate::device::rx_buffer::RxBuffer;
use crate::device::sentinel::{FRIENDLY_PROMPT, RAW_ACK, RAW_PROMPT, RAW_REPL_BANNER};
use crate::error::AppError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, instrument, warn};

pub const CTRL_A: u8 = 0x01; // enter raw mode
pub const CTRL_B: u8 = 0x02; // exit raw mode
pub const CTRL_C: u8 = 0x03; // interrupt
pub const CTRL_D: u8 = 0x04; // end of transmission / soft reset

const FRIENDLY_PROMPT_TIMEOUT: Duration = Duration::from_millis(1200);
const RAW_BANNER_TIMEOUT: Duration = Duration::from_millis(1500);
const RAW_ACK_TIMEOUT: Duration = Duration::from_millis(2500);
const SIGNAL_SETTLE: Duration = Duration::from_millis(80);
const SOFT_RESET_SETTLE: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplMode {
    Interactive,
    Raw,
    Unknown,
}

impl std::fmt::Display for ReplMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplMode::Interactive => "interactive",
            ReplMode::Raw => "raw",
            ReplMode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Clears the busy flag however `execute` exits.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives the remote interpreter between interactive and raw mode and runs one raw
/// payload at a time.
#[derive(Debug)]
pub struct RawRepl {
    channel: Arc<ByteChannel>,
    buffer: Arc<RxBuffer>,
    mode: StdMutex<ReplMode>,
    busy: AtomicBool,
    abort_requested: AtomicBool,
}

impl RawRepl {
    pub fn new(channel: Arc<ByteChannel>, buffer: Arc<RxBuffer>) -> Self {
        Self {
            channel,
            buffer,
            mode: StdMutex::new(ReplMode::Unknown),
            busy: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> ReplMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: ReplMode) {
        let mut guard = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard != mode {
            debug!(from = %*guard, to = %mode, "REPL mode change");
        }
        *guard = mode;
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn buffer(&self) -> &Arc<RxBuffer> {
        &self.buffer
    }

    pub fn channel(&self) -> &Arc<ByteChannel> {
        &self.channel
    }

    async fn send_ctrl(&self, byte: u8) -> Result<(), AppError> {
        self.channel.write(&[byte]).await
    }

    /// Sends the interrupt twice so it gets through even if one byte lands mid-read.
    pub async fn interrupt(&self) -> Result<(), AppError> {
        self.channel.write(&[CTRL_C, CTRL_C]).await
    }

    /// Best-effort resync to the `>>>` prompt. A missing prompt leaves the mode `Unknown`
    /// instead of failing; only transport errors are returned.
    #[instrument(skip(self))]
    pub async fn ensure_interactive(&self) -> Result<ReplMode, AppError> {
        self.interrupt().await?;
        self.send_ctrl(CTRL_B).await?;
        self.channel.write(b"\r\n").await?;

        match self.buffer.wait_for(FRIENDLY_PROMPT, FRIENDLY_PROMPT_TIMEOUT).await {
            Ok(()) => self.set_mode(ReplMode::Interactive),
            Err(e) => {
                debug!(error = %e, "Interactive prompt not seen; mode unknown");
                self.set_mode(ReplMode::Unknown);
            }
        }
        Ok(self.mode())
    }

    /// Enters raw mode. Banner and prompt waits are hints only: their text varies by firmware.
    /// A pending abort still fails the call.
    #[instrument(skip(self))]
    pub async fn enter_raw(&self) -> Result<(), AppError> {
        self.interrupt().await?;
        sleep(SIGNAL_SETTLE).await;
        self.check_abort(RAW_REPL_BANNER)?;
        self.send_ctrl(CTRL_A).await?;
        self.set_mode(ReplMode::Raw);

        match self.wait_hint(RAW_REPL_BANNER, RAW_BANNER_TIMEOUT).await {
            Ok(()) => {}
            Err(e @ AppError::Aborted(_)) => return Err(e),
            Err(e) => debug!(error = %e, "Raw REPL banner not seen"),
        }
        match self.wait_hint(RAW_PROMPT, RAW_BANNER_TIMEOUT).await {
            Ok(()) => {}
            Err(e @ AppError::Aborted(_)) => return Err(e),
            Err(e) => debug!(error = %e, "Raw REPL prompt not seen"),
        }
        Ok(())
    }

    /// Leaves raw mode and assumes the interactive prompt is back.
    #[instrument(skip(self))]
    pub async fn exit_raw(&self) -> Result<(), AppError> {
        let sent = self.send_ctrl(CTRL_B).await;
        sleep(SIGNAL_SETTLE).await;
        self.set_mode(ReplMode::Interactive);
        sent
    }

    /// Soft reboot from the interactive prompt.
    #[instrument(skip(self))]
    pub async fn soft_reset(&self) -> Result<(), AppError> {
        self.send_ctrl(CTRL_B).await?;
        sleep(SOFT_RESET_SETTLE).await;
        self.send_ctrl(CTRL_D).await?;
        self.set_mode(ReplMode::Interactive);
        info!("Soft reset sent");
        Ok(())
    }

    fn check_abort(&self, stage: &str) -> Result<(), AppError> {
        if self.abort_requested.load(Ordering::SeqCst) {
            return Err(AppError::Aborted(stage.to_string()));
        }
        Ok(())
    }

    /// A wait that honours a pending abort request before and while suspending.
    async fn wait_hint(&self, pattern: &str, wait: Duration) -> Result<(), AppError> {
        self.check_abort(pattern)?;
        self.buffer.wait_for(pattern, wait).await
    }

    /// Runs `code` in raw mode and returns everything captured up to and including
    /// `end_marker`. At most one execution is in flight; a concurrent call fails with `Busy`.
    /// Raw mode is always exited afterwards, whatever the outcome.
    #[instrument(skip(self, code), fields(code_len = code.len(), end_marker = %end_marker))]
    pub async fn execute(&self, code: &str, end_marker: &str, timeout_ms: u64) -> Result<String, AppError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Rejected execution: another one is in progress");
            return Err(AppError::Busy);
        }
        let _busy = BusyGuard(&self.busy);
        self.abort_requested.store(false, Ordering::SeqCst);

        let outcome = self.execute_inner(code, end_marker, timeout_ms).await;

        if let Err(e) = self.exit_raw().await {
            warn!(error = %e, "Failed to leave raw mode after execution");
        }
        match &outcome {
            Ok(captured) => debug!(captured_len = captured.len(), "Execution finished"),
            Err(e) => warn!(error = %e, "Execution failed"),
        }
        outcome
    }

    async fn execute_inner(&self, code: &str, end_marker: &str, timeout_ms: u64) -> Result<String, AppError> {
        self.buffer.reset();
        self.enter_raw().await?;

        self.check_abort("payload")?;
        self.channel.write(code.as_bytes()).await?;
        if !code.ends_with('\n') {
            self.channel.write(b"\n").await?;
        }
        self.send_ctrl(CTRL_D).await?;

        match self.wait_hint(RAW_ACK, RAW_ACK_TIMEOUT).await {
            Ok(()) => {}
            Err(e @ AppError::Aborted(_)) => return Err(e),
            Err(e) => debug!(error = %e, "Raw acknowledgment not seen"),
        }

        self.wait_hint(end_marker, Duration::from_millis(timeout_ms)).await?;

        Ok(self
            .buffer
            .consume_through(end_marker)
            .unwrap_or_else(|| self.buffer.snapshot()))
    }

    /// Makes any in-progress or upcoming wait of the current execution fail with `Aborted`.
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        let rejected = self.buffer.abort_waiters();
        info!(rejected, "Abort requested");
    }

    /// Forgets an abort left over from a previous stop. Only meaningful while idle.
    pub fn clear_abort(&self) {
        if !self.is_busy() {
            self.abort_requested.store(false, Ordering::SeqCst);
        }
    }

    /// Back to the initial state after a disconnect.
    pub fn reset_state(&self) {
        self.set_mode(ReplMode::Unknown);
        self.abort_requested.store(false, Ordering::SeqCst);
    }
}
