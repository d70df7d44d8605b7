//! Protocol client for the MicroPython interactive interpreter over a serial link.

pub mod channel;
pub mod remote_fs;
pub mod renderer;
pub mod repl;
pub mod rx_buffer;
pub mod scripts;
pub mod sentinel;
pub mod serial;

pub use channel::{BoxedStream, ByteChannel, ChannelEvent, Connector};
pub use remote_fs::{EntryKind, RemoteEntry, RemoteFs};
pub use renderer::{DeviceInfo, LineKind, TerminalRenderer, TranscriptLine};
pub use repl::{RawRepl, ReplMode};
pub use rx_buffer::RxBuffer;
pub use serial::SerialConnector;
