//! A full-duplex link to the serial CAN bridge.

use std::{
    io::ErrorKind,
    sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use jaguar_bridge_proto::{CanMessage, Decoder, Encode, EncodeError, encode};
use log::{debug, error, trace, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::{
        Mutex,
        mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError},
    },
    task::JoinHandle,
    time::sleep,
};

/// Number of bytes requested from the transport per read.
pub const READ_BUFFER_SIZE: usize = 64;

/// How long the reader waits before retrying after a transport error.
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

type Incoming = Result<CanMessage, LinkError>;

/// An open link to the bridge.
///
/// The link owns its transport. A background task reads from it, decodes
/// frames and queues completed messages until they are picked up with
/// [`SerialLink::receive`]. Every method takes `&self`, so a link can be
/// shared between tasks behind an [`Arc`](std::sync::Arc).
pub struct SerialLink {
    writer: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    incoming: Mutex<UnboundedReceiver<Incoming>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SerialLink {
    /// Creates a link over any full-duplex byte transport and starts reading
    /// from it.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (sender, receiver) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(read_half, sender));
        debug!("Opened bridge link.");

        Self {
            writer: Mutex::new(Some(Box::new(write_half))),
            incoming: Mutex::new(receiver),
            reader: StdMutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns whether [`SerialLink::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encodes a message and writes the whole frame to the transport.
    ///
    /// Concurrent sends are serialized so frames never interleave on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidArgument`] without touching the transport if
    /// the identifier or payload is out of range.
    pub async fn send(&self, id: u32, payload: &[u8]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::LinkClosed);
        }

        self.write_frame(&encode(id, payload)?).await
    }

    /// Sends an already validated message.
    pub async fn send_message(&self, message: &CanMessage) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::LinkClosed);
        }

        self.write_frame(&message.to_bytes()).await
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(LinkError::LinkClosed)?;

        trace!("sent frame: {:x?}", frame);

        writer.write_all(frame).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Waits for the oldest queued message.
    ///
    /// Transport errors hit by the reader are returned here once, in the order
    /// they happened. The reader keeps running after them.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::LinkClosed`] after [`SerialLink::close`], including
    /// for a call that was already waiting, or once the transport has reached
    /// end of stream and every queued message was received.
    pub async fn receive(&self) -> Result<CanMessage, LinkError> {
        if self.is_closed() {
            return Err(LinkError::LinkClosed);
        }

        let next = self.incoming.lock().await.recv().await;
        match next {
            Some(_) if self.is_closed() => Err(LinkError::LinkClosed),
            Some(result) => result,
            None => Err(LinkError::LinkClosed),
        }
    }

    /// Like [`SerialLink::receive`], but gives up after `timeout`.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<CanMessage, LinkError> {
        select! {
            result = self.receive() => result,
            _ = sleep(timeout) => Err(LinkError::Timeout),
        }
    }

    /// Returns the oldest queued message without waiting.
    ///
    /// Returns `Ok(None)` if nothing is queued, or if another task is currently
    /// waiting in [`SerialLink::receive`].
    pub fn try_receive(&self) -> Result<Option<CanMessage>, LinkError> {
        if self.is_closed() {
            return Err(LinkError::LinkClosed);
        }

        let Ok(mut incoming) = self.incoming.try_lock() else {
            return Ok(None);
        };

        match incoming.try_recv() {
            Ok(result) => result.map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(LinkError::LinkClosed),
        }
    }

    /// Stops the reader and releases the transport.
    ///
    /// Pending and future calls to [`SerialLink::receive`] and
    /// [`SerialLink::send`] fail with [`LinkError::LinkClosed`]. Closing an
    /// already closed link does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the reader task drops the channel sender, which wakes
        // anyone blocked in `receive`.
        self.abort_reader();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                warn!("Failed to shut down transport: {}", e);
            }
        }

        debug!("Closed bridge link.");
    }

    fn abort_reader(&self) {
        let reader = match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Reads from the transport until end of stream or until nobody is listening,
/// feeding every byte through the decoder.
async fn read_loop<R>(mut reader: R, incoming: UnboundedSender<Incoming>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::new();
    let mut buf = [0; READ_BUFFER_SIZE];
    // Set while reads keep failing. Only the first error of a streak is queued.
    let mut errored = false;

    debug!("Bridge reader started.");

    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Transport reached end of stream. Stopping reader.");
                break;
            }
            Ok(read) => read,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::TimedOut) => continue,
            Err(e) if errored => {
                trace!("Transport is still failing: {}", e);
                sleep(READ_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                error!("Failed to read from transport: {}", e);
                errored = true;
                if incoming.send(Err(LinkError::IoError(e))).is_err() {
                    break;
                }
                sleep(READ_RETRY_DELAY).await;
                continue;
            }
        };

        if errored {
            debug!("Transport recovered.");
            errored = false;
        }

        for result in decoder.feed_slice(&buf[..read]) {
            match result {
                Ok(message) => {
                    trace!("received message: {:?}", message);
                    if incoming.send(Ok(message)).is_err() {
                        debug!("Link dropped. Stopping reader.");
                        return;
                    }
                }
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] EncodeError),

    #[error("Device number {device} is out of range")]
    InvalidDeviceNumber { device: u8 },

    #[error("The link has been closed")]
    LinkClosed,

    #[error("Timed out waiting for a message")]
    Timeout,

    #[cfg(feature = "serial")]
    #[error("Serialport Error")]
    SerialportError(#[from] tokio_serial::Error),
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    };

    use jaguar_bridge_proto::{Decoder, encode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf, duplex};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn message(id: u32, payload: &[u8]) -> CanMessage {
        CanMessage::new(id, payload).unwrap()
    }

    /// A transport whose first read fails.
    struct FlakyTransport {
        inner: DuplexStream,
        failed: bool,
    }

    impl AsyncRead for FlakyTransport {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.failed {
                self.failed = true;
                return Poll::Ready(Err(io::Error::new(ErrorKind::BrokenPipe, "unplugged")));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FlakyTransport {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// A transport that fails every read, like an unplugged adapter.
    struct UnpluggedTransport;

    impl AsyncRead for UnpluggedTransport {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(ErrorKind::BrokenPipe, "unplugged")))
        }
    }

    impl AsyncWrite for UnpluggedTransport {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn receives_frames_split_across_reads() {
        let (ours, mut bridge) = duplex(256);
        let link = SerialLink::new(ours);

        let mut stream = encode(0x123, &[0xAA, 0xFF]).unwrap();
        stream.extend(encode(0x0204_0080, &[0xFE; 8]).unwrap());

        // Split mid escape sequence and mid identifier.
        for chunk in stream.chunks(3) {
            bridge.write_all(chunk).await.unwrap();
            bridge.flush().await.unwrap();
            tokio::task::yield_now().await;
        }

        assert_eq!(
            link.receive_timeout(TIMEOUT).await.unwrap(),
            message(0x123, &[0xAA, 0xFF])
        );
        assert_eq!(
            link.receive_timeout(TIMEOUT).await.unwrap(),
            message(0x0204_0080, &[0xFE; 8])
        );
    }

    #[tokio::test]
    async fn drops_malformed_frames_and_resynchronizes() {
        let (ours, mut bridge) = duplex(256);
        let link = SerialLink::new(ours);

        let mut stream = vec![0xFF, 0x02];
        stream.extend([0xFF, 0x05, 0x01, 0x00, 0x00, 0x00, 0xFE, 0x00]);
        stream.extend(encode(0x42, &[7]).unwrap());
        bridge.write_all(&stream).await.unwrap();

        assert_eq!(link.receive_timeout(TIMEOUT).await.unwrap(), message(0x42, &[7]));
        assert!(link.try_receive().unwrap().is_none());
    }

    #[tokio::test]
    async fn sends_encoded_frame() {
        let (ours, mut bridge) = duplex(256);
        let link = SerialLink::new(ours);

        link.send(0x123, &[0xAA, 0xFF]).await.unwrap();

        let mut written = [0; 9];
        bridge.read_exact(&mut written).await.unwrap();
        assert_eq!(written, [0xFF, 0x06, 0x23, 0x01, 0x00, 0x00, 0xAA, 0xFE, 0xFE]);
    }

    #[tokio::test]
    async fn rejects_invalid_arguments_before_writing() {
        let (ours, mut bridge) = duplex(256);
        let link = SerialLink::new(ours);

        assert!(matches!(
            link.send(0x2000_0000, &[]).await,
            Err(LinkError::InvalidArgument(EncodeError::IdentifierOutOfRange { .. }))
        ));
        assert!(matches!(
            link.send(1, &[0; 9]).await,
            Err(LinkError::InvalidArgument(EncodeError::PayloadTooLong { len: 9 }))
        ));

        // Nothing was written, so the next frame on the wire is the valid one.
        link.send_message(&message(5, &[])).await.unwrap();
        let mut written = [0; 6];
        bridge.read_exact(&mut written).await.unwrap();
        assert_eq!(written, [0xFF, 0x04, 0x05, 0x00, 0x00, 0x00]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_do_not_interleave() {
        let (ours, mut bridge) = duplex(4096);
        let link = Arc::new(SerialLink::new(ours));

        let mut tasks = Vec::new();
        for id in 0..32u32 {
            let link = link.clone();
            tasks.push(tokio::spawn(async move {
                link.send(0x00FF_FF00 | id, &[0xFF, 0xFE, id as u8, 0xFF])
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        link.close().await;

        let mut written = Vec::new();
        bridge.read_to_end(&mut written).await.unwrap();

        let mut decoder = Decoder::new();
        let mut ids: Vec<u32> = decoder
            .feed_slice(&written)
            .map(|result| result.unwrap().id() & 0xFF)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn try_receive_does_not_block() {
        let (ours, mut bridge) = duplex(256);
        let link = SerialLink::new(ours);

        assert!(link.try_receive().unwrap().is_none());

        bridge.write_all(&encode(9, &[1, 2]).unwrap()).await.unwrap();
        let received = link.receive_timeout(TIMEOUT).await.unwrap();
        assert_eq!(received, message(9, &[1, 2]));
        assert!(link.try_receive().unwrap().is_none());
    }

    #[tokio::test]
    async fn receive_times_out_without_traffic() {
        let (ours, _bridge) = duplex(256);
        let link = SerialLink::new(ours);

        assert!(matches!(
            link.receive_timeout(Duration::from_millis(20)).await,
            Err(LinkError::Timeout)
        ));
    }

    #[tokio::test]
    async fn close_unblocks_pending_receive() {
        let (ours, _bridge) = duplex(256);
        let link = Arc::new(SerialLink::new(ours));

        let waiting = tokio::spawn({
            let link = link.clone();
            async move { link.receive().await }
        });
        tokio::task::yield_now().await;

        link.close().await;

        let result = tokio::time::timeout(TIMEOUT, waiting).await.unwrap().unwrap();
        assert!(matches!(result, Err(LinkError::LinkClosed)));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let (ours, _bridge) = duplex(256);
        let link = SerialLink::new(ours);

        link.close().await;
        link.close().await;

        assert!(link.is_closed());
        assert!(matches!(link.send(1, &[]).await, Err(LinkError::LinkClosed)));
        assert!(matches!(link.receive().await, Err(LinkError::LinkClosed)));
        assert!(matches!(link.try_receive(), Err(LinkError::LinkClosed)));
    }

    #[tokio::test]
    async fn end_of_stream_closes_receive() {
        let (ours, mut bridge) = duplex(256);
        let link = SerialLink::new(ours);

        bridge.write_all(&encode(3, &[]).unwrap()).await.unwrap();
        drop(bridge);

        assert_eq!(link.receive_timeout(TIMEOUT).await.unwrap(), message(3, &[]));
        assert!(matches!(
            link.receive_timeout(TIMEOUT).await,
            Err(LinkError::LinkClosed)
        ));
    }

    #[tokio::test]
    async fn read_errors_are_reported_and_reader_keeps_going() {
        let (inner, mut bridge) = duplex(256);
        let link = SerialLink::new(FlakyTransport {
            inner,
            failed: false,
        });

        assert!(matches!(
            link.receive_timeout(TIMEOUT).await,
            Err(LinkError::IoError(e)) if e.kind() == ErrorKind::BrokenPipe
        ));

        bridge.write_all(&encode(0x77, &[0x01]).unwrap()).await.unwrap();
        assert_eq!(link.receive_timeout(TIMEOUT).await.unwrap(), message(0x77, &[0x01]));
    }

    #[tokio::test]
    async fn persistent_read_failure_is_reported_once() {
        let link = SerialLink::new(UnpluggedTransport);

        // Many retry periods.
        sleep(READ_RETRY_DELAY * 20).await;

        assert!(matches!(
            link.try_receive(),
            Err(LinkError::IoError(e)) if e.kind() == ErrorKind::BrokenPipe
        ));
        assert!(link.try_receive().unwrap().is_none());
    }

    #[tokio::test]
    async fn write_errors_are_returned_from_send() {
        let (ours, bridge) = duplex(64);
        let link = SerialLink::new(ours);
        drop(bridge);

        assert!(matches!(link.send(1, &[1]).await, Err(LinkError::IoError(_))));
    }

    #[test]
    fn invalid_device_number_message() {
        assert_eq!(
            LinkError::InvalidDeviceNumber { device: 64 }.to_string(),
            "Device number 64 is out of range"
        );
    }
}
