use crate::device::channel::{BoxedStream, Connector};
use crate::error::AppError;
use async_trait::async_trait;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info, warn};

/// Opens a USB/UART serial port with `tokio-serial`.
#[derive(Debug, Clone, Default)]
pub struct SerialConnector {
    port_path: Option<String>,
}

impl SerialConnector {
    pub fn new(port_path: Option<String>) -> Self {
        Self { port_path }
    }

    /// Picks the configured port, or the first enumerated one when none is configured.
    fn resolve_port(&self) -> Result<String, AppError> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| AppError::NoTransportSupport(e.to_string()))?;
        debug!(count = ports.len(), "Enumerated serial ports");

        if let Some(path) = &self.port_path {
            if !ports.iter().any(|p| &p.port_name == path) {
                // Some platforms do not enumerate every tty; let the open attempt decide.
                warn!(port = %path, "Configured serial port was not enumerated");
            }
            return Ok(path.clone());
        }

        // Prefer USB adapters, which is how MicroPython boards usually show up.
        let preferred = ports
            .iter()
            .find(|p| matches!(p.port_type, SerialPortType::UsbPort(_)))
            .or_else(|| ports.first());

        preferred
            .map(|p| p.port_name.clone())
            .ok_or_else(|| AppError::NoAuthorizedDevice("no serial ports found".to_string()))
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self, baud_rate: u32) -> Result<BoxedStream, AppError> {
        let path = self.resolve_port()?;
        info!(port = %path, baud_rate, "Opening serial port");

        #[allow(unused_mut)]
        let mut stream = tokio_serial::new(&path, baud_rate)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => {
                    AppError::NoAuthorizedDevice(format!("{}: {}", path, e))
                }
                _ => AppError::OpenFailure(format!("{}: {}", path, e)),
            })?;

        #[cfg(unix)]
        stream
            .set_exclusive(true)
            .map_err(|e| AppError::OpenFailure(format!("{}: cannot acquire exclusive access: {}", path, e)))?;

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.port_path.clone().unwrap_or_else(|| "auto".to_string())
    }
}
