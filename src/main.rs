use anyhow::Result;
use mpy_bridge::config::{Config, TransportMode};
use mpy_bridge::mcp::handler::DeviceServerHandler;
use rust_mcp_schema::{Implementation, InitializeResult, ServerCapabilities, ServerCapabilitiesTools, LATEST_PROTOCOL_VERSION};
use rust_mcp_sdk::error::McpSdkError;
#[cfg(feature = "stdio")]
use rust_mcp_sdk::McpServer;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

#[cfg(feature = "sse")]
use rust_mcp_sdk::mcp_server::{
    error::TransportServerError,
    hyper_server::create_server as create_sse_server,
    HyperServerOptions,
};
#[cfg(feature = "stdio")]
use rust_mcp_sdk::mcp_server::server_runtime::create_server as create_stdio_server;
#[cfg(feature = "stdio")]
use rust_mcp_transport::{StdioTransport, TransportOptions};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mpy_bridge={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

fn get_server_details() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: "mpy-bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "Bridge to a MicroPython board over a serial port. Call `device_connect` first. \
            `run_code` executes a program in raw mode and returns its printed output; only one run can be in flight, \
            use `stop_program` to interrupt it. The terminal transcript (`read_terminal`) shows everything the board prints. \
            Filesystem tools operate on the board's flash; writes are limited to MAX_WRITE_BYTES."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

fn map_mcp_sdk_error(err: McpSdkError) -> anyhow::Error {
    anyhow::anyhow!("MCP SDK Error: {:?}", err)
}

#[cfg(feature = "sse")]
fn map_transport_server_error(err: TransportServerError) -> anyhow::Error {
    anyhow::anyhow!("SSE server error: {}", err)
}

#[tokio::main]
async fn main() -> Result<()> {
    let initial_config = Arc::new(Config::load()?);
    setup_logging(&initial_config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting mpy-bridge server");
    tracing::debug!("Loaded initial configuration: {:?}", initial_config);

    let server_details = get_server_details();
    let handler = DeviceServerHandler::new(initial_config.clone());

    match initial_config.transport_mode {
        #[cfg(feature = "stdio")]
        TransportMode::Stdio => {
            tracing::info!("Using STDIO transport mode.");
            let transport = StdioTransport::new(TransportOptions::default())
                .map_err(|e| anyhow::anyhow!("Failed to create StdioTransport: {}", e))?;
            let server_runtime = create_stdio_server(server_details, transport, handler);
            server_runtime.start().await.map_err(map_mcp_sdk_error)?;
        }
        #[cfg(feature = "sse")]
        TransportMode::Sse => {
            tracing::info!(host = %initial_config.sse_host, port = %initial_config.sse_port, "Using SSE transport mode.");
            let sse_options = HyperServerOptions {
                host: initial_config.sse_host.clone(),
                port: initial_config.sse_port,
                ..Default::default()
            };
            let sse_server_runtime = create_sse_server(server_details, handler, sse_options);
            sse_server_runtime.start().await.map_err(map_transport_server_error)?;
        }
        #[cfg(not(all(feature = "stdio", feature = "sse")))]
        #[allow(unreachable_patterns)]
        _ => {
            let available_feature = if cfg!(feature = "stdio") { "stdio" } else if cfg!(feature = "sse") { "sse" } else { "none" };
            tracing::error!(
                selected_transport = ?initial_config.transport_mode,
                available_feature = %available_feature,
                "Selected transport mode is not available due to compiled features."
            );
            anyhow::bail!(
                "Selected transport mode {:?} is not available. Compiled with {} support only.",
                initial_config.transport_mode,
                available_feature
            );
        }
    }

    tracing::info!("Server shutdown.");
    Ok(())
}
