//! Live capture streams.
//!
//! A live source is a TCP endpoint (`host:port`) serving pcap or pcapng
//! bytes, e.g. `tcpdump -w - | nc -l 5555`. The socket is read with a short
//! timeout so the packet loop can notice shutdown while the stream is idle.

use std::io::{self, Read};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::shutdown::Shutdown;

/// A reader that gives up (returns end of stream) once shutdown is
/// requested. Read timeouts from the inner reader are retried.
pub struct CancellableRead<R> {
    inner: R,
    shutdown: Shutdown,
}

impl<R: Read> CancellableRead<R> {
    pub fn new(inner: R, shutdown: Shutdown) -> Self {
        Self { inner, shutdown }
    }
}

impl<R: Read> Read for CancellableRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(0);
            }
            match self.inner.read(buf) {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                other => return other,
            }
        }
    }
}

/// Connect to a live capture endpoint.
pub fn connect(endpoint: &str, poll_interval: Duration, shutdown: Shutdown) -> Result<CancellableRead<TcpStream>> {
    let stream = TcpStream::connect(endpoint).map_err(|e| PipelineError::unavailable(endpoint, e))?;
    stream
        .set_read_timeout(Some(poll_interval))
        .map_err(|e| PipelineError::unavailable(endpoint, e))?;
    tracing::info!(endpoint, "Connected to live capture stream");
    Ok(CancellableRead::new(stream, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Times out a fixed number of times, then yields its data.
    struct SlowReader {
        timeouts: usize,
        data: Cursor<Vec<u8>>,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.timeouts > 0 {
                self.timeouts -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn test_timeouts_are_retried() {
        let inner = SlowReader {
            timeouts: 3,
            data: Cursor::new(b"abc".to_vec()),
        };
        let mut reader = CancellableRead::new(inner, Shutdown::new());
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");
    }

    #[test]
    fn test_shutdown_ends_stream() {
        let shutdown = Shutdown::new();
        let inner = SlowReader {
            timeouts: usize::MAX,
            data: Cursor::new(Vec::new()),
        };
        let mut reader = CancellableRead::new(inner, shutdown.clone());
        shutdown.trigger();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_connect_refused_is_source_error() {
        // Port 1 on localhost is essentially never listening.
        let err = connect("127.0.0.1:1", Duration::from_millis(50), Shutdown::new()).err().unwrap();
        assert!(!err.is_fatal());
    }
}
