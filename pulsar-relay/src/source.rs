//! Source reader: owns the device handle and feeds decoded frames to the hub.

use std::{
    io::{self, ErrorKind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tracing::{Span, debug, info, trace, warn};

use crate::{
    codec::{self, Envelope},
    device::{DeviceOpener, DeviceStream},
    framer::LineFramer,
    hub::{HubError, HubHandle},
};

const READ_CHUNK: usize = 512;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no device address has been supplied")]
    NoAddress,
    #[error("failed to open {address}: {source}")]
    Open {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Why a read loop ended.
#[derive(Debug)]
pub enum ReadExit {
    /// A stop was requested, or the hub went away.
    Stopped,
    /// The device failed; its handle has already been released.
    Failed(io::Error),
}

/// Cloneable stop signal for a [`SourceReader`].
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Asks the read loop to exit at its next iteration boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct SourceReader {
    opener: Arc<dyn DeviceOpener>,
    hub: HubHandle,
    address: Option<String>,
    device: Option<DeviceStream>,
    stop: Arc<AtomicBool>,
    reading: Arc<AtomicBool>,
    max_frame_len: usize,
    span: Span,
}

impl SourceReader {
    pub fn new(
        opener: Arc<dyn DeviceOpener>,
        hub: HubHandle,
        max_frame_len: usize,
        span: Span,
    ) -> Self {
        Self {
            opener,
            hub,
            address: None,
            device: None,
            stop: Arc::new(AtomicBool::new(false)),
            reading: Arc::new(AtomicBool::new(false)),
            max_frame_len,
            span,
        }
    }

    /// Opens `address`, remembering it for later [`reconnect`](Self::reconnect)
    /// calls even when this attempt fails.
    pub async fn connect(&mut self, address: &str) -> Result<(), ConnectError> {
        self.address = Some(address.to_string());
        self.reconnect().await
    }

    /// Makes one attempt to re-open the last address given to `connect`.
    pub async fn reconnect(&mut self) -> Result<(), ConnectError> {
        let address = self.address.clone().ok_or(ConnectError::NoAddress)?;

        // Never hold two handles to the same device.
        self.close();

        let opener = Arc::clone(&self.opener);
        let target = address.clone();
        let opened = tokio::task::spawn_blocking(move || opener.open(&target))
            .await
            .unwrap_or_else(|join_err| Err(io::Error::other(join_err)));

        match opened {
            Ok(device) => {
                self.device = Some(device);
                self.stop.store(false, Ordering::SeqCst);
                self.span.in_scope(|| info!(%address, "connected to device"));
                Ok(())
            }
            Err(source) => Err(ConnectError::Open { address, source }),
        }
    }

    /// Reads lines until stopped or until the device fails.
    ///
    /// On failure the handle is dropped before returning. On a clean stop it
    /// is kept so the caller decides whether to [`close`](Self::close) it.
    pub async fn read_loop(&mut self) -> ReadExit {
        let Some(mut device) = self.device.take() else {
            return ReadExit::Failed(io::Error::new(
                ErrorKind::NotConnected,
                "device is not connected",
            ));
        };

        self.reading.store(true, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let hub = self.hub.clone();
        let span = self.span.clone();
        let max_frame_len = self.max_frame_len;

        let joined = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let exit = pump(&mut device, &stop, &hub, max_frame_len);
            (device, exit)
        })
        .await;
        self.reading.store(false, Ordering::SeqCst);

        match joined {
            Ok((device, ReadExit::Stopped)) => {
                self.device = Some(device);
                ReadExit::Stopped
            }
            Ok((_, exit)) => exit,
            Err(join_err) => ReadExit::Failed(io::Error::other(join_err)),
        }
    }

    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Releases the device handle if one is held.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            self.span.in_scope(|| info!("device closed"));
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

fn pump(
    device: &mut DeviceStream,
    stop: &AtomicBool,
    hub: &HubHandle,
    max_frame_len: usize,
) -> ReadExit {
    let mut framer = LineFramer::new(max_frame_len);
    let mut buf = [0u8; READ_CHUNK];

    while !stop.load(Ordering::SeqCst) {
        match device.read(&mut buf) {
            Ok(0) => {
                return ReadExit::Failed(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "device stream ended",
                ));
            }
            Ok(n) => {
                for line in framer.feed(&buf[..n]) {
                    if relay_line(&line, hub).is_err() {
                        warn!("hub closed, stopping reader");
                        stop.store(true, Ordering::SeqCst);
                        return ReadExit::Stopped;
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(err) => return ReadExit::Failed(err),
        }
    }

    ReadExit::Stopped
}

/// Decodes one device line and publishes it. Bad frames are logged and
/// skipped; only a closed hub is reported back.
fn relay_line(line: &str, hub: &HubHandle) -> Result<(), HubError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    if !codec::is_data_line(line) {
        trace!(line, "device output");
        return Ok(());
    }

    let sample = match codec::decode(line) {
        Ok(sample) => sample,
        Err(err) => {
            warn!(error = %err, "failed to decode frame");
            return Ok(());
        }
    };

    let position = sample.position;
    let payload = match Envelope::position_update(sample).encode() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "dropping envelope");
            return Ok(());
        }
    };

    hub.blocking_publish(payload)?;
    debug!(
        x = position.x,
        y = position.y,
        accuracy = position.accuracy,
        "published position"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, time::Duration};

    use super::*;
    use crate::{
        codec::{POSITION_UPDATE, Sample},
        hub::Hub,
    };

    struct CursorOpener(&'static [u8]);

    impl DeviceOpener for CursorOpener {
        fn open(&self, address: &str) -> io::Result<DeviceStream> {
            if address == "missing" {
                return Err(io::Error::new(ErrorKind::NotFound, "no such device"));
            }
            Ok(Box::new(Cursor::new(self.0)))
        }
    }

    fn reader_for(data: &'static [u8]) -> (SourceReader, HubHandle) {
        let (hub, _) = Hub::spawn(Duration::from_millis(50), Span::none());
        let opener = Arc::new(CursorOpener(data));
        let reader = SourceReader::new(opener, hub.clone(), 1024, Span::none());
        (reader, hub)
    }

    #[tokio::test]
    async fn failed_connect_still_records_address() {
        let (mut reader, _hub) = reader_for(b"");
        assert!(matches!(reader.reconnect().await, Err(ConnectError::NoAddress)));

        let err = reader.connect("missing").await.expect_err("open fails");
        assert!(matches!(err, ConnectError::Open { .. }));
        assert_eq!(reader.address(), Some("missing"));
        assert!(!reader.is_connected());
    }

    #[tokio::test]
    async fn malformed_line_does_not_stop_the_stream() {
        let data = b"boot v1.2\n{\"timestamp\":oops}\n{\"timestamp\":1000,\"position\":{\"x\":1.0,\"y\":2.0,\"accuracy\":0.5},\"wifi\":{},\"ble\":{},\"fusion\":{\"wifi_weight\":0.6,\"ble_weight\":0.4}}\n";
        let (mut reader, hub) = reader_for(data);
        let (subscriber, mut inbox) = hub.subscriber(8);
        hub.register(subscriber).await.expect("register");

        reader.connect("/dev/fake").await.expect("connect");
        let exit = reader.read_loop().await;

        // The cursor runs dry, which looks like an unplugged device.
        assert!(matches!(
            exit,
            ReadExit::Failed(ref err) if err.kind() == ErrorKind::UnexpectedEof
        ));
        assert!(!reader.is_connected());
        assert!(!reader.is_reading());

        let payload = inbox.recv().await.expect("one envelope");
        let envelope: Envelope<Sample> = serde_json::from_slice(&payload).expect("json");
        assert_eq!(envelope.kind, POSITION_UPDATE);
        assert_eq!(envelope.data.position.x, 1.0);
        assert!(envelope.timestamp >= 1000);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_before_reading_keeps_handle_until_close() {
        let (mut reader, _hub) = reader_for(b"{}\n");
        reader.connect("/dev/fake").await.expect("connect");

        reader.stop();
        reader.stop();
        assert!(matches!(reader.read_loop().await, ReadExit::Stopped));
        assert!(reader.is_connected());
        assert!(!reader.is_reading());

        reader.close();
        reader.close();
        assert!(!reader.is_connected());
    }

    #[tokio::test]
    async fn read_without_connection_fails() {
        let (mut reader, _hub) = reader_for(b"");
        assert!(matches!(reader.read_loop().await, ReadExit::Failed(_)));
    }
}
