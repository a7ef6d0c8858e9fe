use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::is_transient;

/// Outcome of one [`Transport::receive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    /// Nothing arrived before the deadline.
    Empty,
    /// The stream ended for good.
    Closed,
}

/// Byte pipe a session runs over.
pub trait Transport {
    /// Waits until `deadline` (forever for `None`) for bytes.
    fn receive(&mut self, deadline: Option<Instant>) -> io::Result<Received>;

    /// Returns how many bytes were accepted, possibly fewer than offered.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    fn close(&mut self) {}
}

const TCP_READ_SIZE: usize = 4096;
const REPLAY_READ_SIZE: usize = 512 * 1024;

pub struct TcpTransport {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        TcpTransport {
            stream,
            buf: vec![0; TCP_READ_SIZE],
        }
    }
}

impl Transport for TcpTransport {
    fn receive(&mut self, deadline: Option<Instant>) -> io::Result<Received> {
        let timeout = deadline.map(|d| {
            d.saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1))
        });
        self.stream.set_read_timeout(timeout)?;
        match self.stream.read(&mut self.buf) {
            Ok(0) => Ok(Received::Closed),
            Ok(n) => Ok(Received::Data(self.buf[..n].to_vec())),
            Err(err) if is_transient(&err) => Ok(Received::Empty),
            Err(err) => Err(err),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.stream.write(data) {
            Err(err) if is_transient(&err) => Ok(0),
            res => res,
        }
    }

    fn close(&mut self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!(?err, "tcp shutdown");
        }
    }
}

/// Plays back a recorded stream. Sent bytes are discarded.
pub struct ReaderTransport<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: Read> ReaderTransport<R> {
    pub fn new(reader: R) -> Self {
        ReaderTransport {
            reader,
            buf: vec![0; REPLAY_READ_SIZE],
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Transport for ReaderTransport<R> {
    fn receive(&mut self, _deadline: Option<Instant>) -> io::Result<Received> {
        match self.reader.read(&mut self.buf) {
            Ok(0) => Ok(Received::Closed),
            Ok(n) => Ok(Received::Data(self.buf[..n].to_vec())),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Received::Empty),
            Err(err) => Err(err),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }
}
