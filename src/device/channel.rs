use crate::error::AppError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CHUNK_SIZE: usize = 4096;

/// Any duplex byte stream the device can be reached over.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Obtains an opened duplex stream to one device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, baud_rate: u32) -> Result<BoxedStream, AppError>;

    /// Human readable description of where the connector points.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(String),
    /// The read loop ended while the channel was still considered open.
    Closed { reason: Option<String> },
}

/// Incremental UTF-8 decoder; holds back an incomplete trailing sequence until the next chunk.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}

/// Owns the physical connection. The only component that writes to or reads from the device.
pub struct ByteChannel {
    label: String,
    writer: TokioMutex<Option<WriteHalf<BoxedStream>>>,
    reader: StdMutex<Option<ReadHalf<BoxedStream>>>,
    read_task: StdMutex<Option<JoinHandle<()>>>,
    subscribers: Arc<StdMutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ByteChannel {
    /// Opens the device through `connector`. Nothing stays half-open on failure: the
    /// connector either hands back a fully opened stream or an error.
    pub async fn open(connector: &dyn Connector, baud_rate: u32) -> Result<Self, AppError> {
        let label = connector.describe();
        debug!(port = %label, baud_rate, "Opening byte channel");
        let stream = connector.connect(baud_rate).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        info!(port = %label, baud_rate, "Byte channel open");

        Ok(Self {
            label,
            writer: TokioMutex::new(Some(write_half)),
            reader: StdMutex::new(Some(read_half)),
            read_task: StdMutex::new(None),
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), AppError> {
        if !self.is_open() {
            return Err(AppError::NotOpen);
        }
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(AppError::NotOpen)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        debug!(len = bytes.len(), "Wrote to device");
        Ok(())
    }

    /// Registers a consumer of decoded chunks. Subscribe before starting the receive loop
    /// to observe every chunk.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Starts the background read loop. It runs until the channel is closed or a read fails;
    /// in the latter case subscribers receive exactly one `ChannelEvent::Closed`.
    pub fn start_receive_loop(&self) -> Result<(), AppError> {
        let mut reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AppError::NotOpen)?;
        let subscribers = self.subscribers.clone();
        let open = self.open.clone();
        let label = self.label.clone();

        let handle = tokio::spawn(async move {
            let mut decoder = Utf8StreamDecoder::default();
            let mut buf = [0u8; READ_CHUNK_SIZE];
            let reason = loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break None,
                    Ok(n) => {
                        let text = decoder.decode(&buf[..n]);
                        if !text.is_empty() {
                            publish(&subscribers, ChannelEvent::Data(text));
                        }
                    }
                    Err(e) => break Some(e.to_string()),
                }
            };

            // Only a loop that ends on its own reports; close() clears `open` first.
            if open.swap(false, Ordering::SeqCst) {
                warn!(port = %label, reason = ?reason, "Serial read loop ended; connection lost");
                publish(&subscribers, ChannelEvent::Closed { reason });
            } else {
                debug!(port = %label, "Read loop finished after close");
            }
        });

        *self.read_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Cancels the read loop, releases both halves and closes the port. Idempotent. When this
    /// returns the underlying stream has been dropped, so the port can be reopened at once.
    pub async fn close(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);

        let read_task = self
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = read_task {
            handle.abort();
            // The task owns the read half; the port is only released once it has finished.
            let _ = handle.await;
        }
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(port = %self.label, error = %e, "Ignoring error while shutting down writer");
            }
        }
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if was_open {
            info!(port = %self.label, "Byte channel closed");
        }
    }
}

fn publish(subscribers: &StdMutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>, event: ChannelEvent) {
    let mut guard = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    guard.retain(|tx| tx.send(event.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Duplex stream that records when it is dropped.
    struct TrackedStream {
        inner: tokio::io::DuplexStream,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for TrackedStream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl AsyncRead for TrackedStream {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TrackedStream {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    struct TrackedConnector(StdMutex<Option<TrackedStream>>);

    #[async_trait]
    impl Connector for TrackedConnector {
        async fn connect(&self, _baud_rate: u32) -> Result<BoxedStream, AppError> {
            let stream = self
                .0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AppError::NoAuthorizedDevice("already taken".to_string()))?;
            Ok(Box::new(stream))
        }

        fn describe(&self) -> String {
            "tracked".to_string()
        }
    }

    struct DuplexConnector(StdMutex<Option<tokio::io::DuplexStream>>);

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, _baud_rate: u32) -> Result<BoxedStream, AppError> {
            let stream = self
                .0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AppError::NoAuthorizedDevice("already taken".to_string()))?;
            Ok(Box::new(stream))
        }

        fn describe(&self) -> String {
            "duplex".to_string()
        }
    }

    #[test]
    fn decoder_holds_split_multibyte_sequences() {
        let mut decoder = Utf8StreamDecoder::default();
        let bytes = "Olá".as_bytes();
        assert_eq!(decoder.decode(&bytes[..3]), "Ol");
        assert_eq!(decoder.decode(&bytes[3..]), "á");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8StreamDecoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn write_after_close_fails_with_not_open() {
        let (client, _device) = tokio::io::duplex(64);
        let connector = DuplexConnector(StdMutex::new(Some(client)));
        let channel = ByteChannel::open(&connector, 115_200).await.unwrap();

        channel.close().await;
        channel.close().await;
        assert!(matches!(channel.write(b"x").await, Err(AppError::NotOpen)));
    }

    #[tokio::test]
    async fn receive_loop_publishes_chunks_and_reports_loss_once() {
        let (client, mut device) = tokio::io::duplex(64);
        let connector = DuplexConnector(StdMutex::new(Some(client)));
        let channel = ByteChannel::open(&connector, 115_200).await.unwrap();
        let mut events = channel.subscribe();
        channel.start_receive_loop().unwrap();

        device.write_all(b">>> ").await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Data(">>> ".to_string())));

        drop(device);
        assert_eq!(events.recv().await, Some(ChannelEvent::Closed { reason: None }));
        assert!(!channel.is_open());
        channel.close().await;
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn close_releases_the_stream_before_returning() {
        let (client, _device) = tokio::io::duplex(64);
        let dropped = Arc::new(AtomicBool::new(false));
        let connector = TrackedConnector(StdMutex::new(Some(TrackedStream {
            inner: client,
            dropped: dropped.clone(),
        })));
        let channel = ByteChannel::open(&connector, 115_200).await.unwrap();
        channel.start_receive_loop().unwrap();
        tokio::task::yield_now().await;
        assert!(!dropped.load(Ordering::SeqCst));

        channel.close().await;
        assert!(dropped.load(Ordering::SeqCst));
    }
}
