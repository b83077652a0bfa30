//! Request-scoped sessions against one worker
//!
//! A [`Session`] is a single-use bidirectional stream to one worker for one
//! request: the header frame goes out, body blocks follow, the write side is
//! half-closed, and the worker's CGI-style response is read back. The session
//! owns its worker checkout and returns the worker to the pool when dropped;
//! any recorded failure (I/O error, timeout, protocol misuse) releases the
//! worker as unhealthy so the pool retires it.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::GatewayError;
use crate::message::write_scalar;
use crate::pool::Checkout;
use crate::worker::WorkerStream;

/// Where a session is in its request/response lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    SendingHeaders,
    SendingBody,
    AwaitingResponse,
    ReadingResponse,
    Closed,
}

/// A live session with one worker.
pub struct Session {
    pid: u32,
    phase: SessionPhase,
    reader: ReadHalf<WorkerStream>,
    writer: Option<WriteHalf<WorkerStream>>,
    reader_timeout: Duration,
    writer_timeout: Duration,
    failed: bool,
    checkout: Checkout,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid)
            .field("phase", &self.phase)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to the checked-out worker's endpoint. A connection failure
    /// releases the worker as unhealthy before surfacing the error.
    pub(crate) async fn open(mut checkout: Checkout) -> Result<Self, GatewayError> {
        let endpoint = checkout.endpoint();
        match endpoint.connect().await {
            Ok(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                Ok(Session {
                    pid: checkout.pid(),
                    phase: SessionPhase::SendingHeaders,
                    reader,
                    writer: Some(writer),
                    reader_timeout: Duration::ZERO,
                    writer_timeout: Duration::ZERO,
                    failed: false,
                    checkout,
                })
            }
            Err(e) => {
                checkout.release(false);
                Err(GatewayError::session_io("connecting to the worker", e))
            }
        }
    }

    /// PID of the worker serving this session.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Set the read timeout. Zero disables it.
    pub fn set_reader_timeout(&mut self, timeout: Duration) {
        self.reader_timeout = timeout;
    }

    /// Set the write timeout. Zero disables it.
    pub fn set_writer_timeout(&mut self, timeout: Duration) {
        self.writer_timeout = timeout;
    }

    /// Send the serialized request-header blob as one length-prefixed frame.
    pub async fn send_headers(&mut self, blob: &[u8]) -> Result<(), GatewayError> {
        if self.phase != SessionPhase::SendingHeaders {
            return Err(self.misuse("headers already sent"));
        }
        let writer = self.writer.as_mut().expect("writer open in SendingHeaders");
        let timeout = self.writer_timeout;
        let result = timed(timeout, write_scalar(writer, blob)).await;
        match result {
            Ok(()) => {
                self.phase = SessionPhase::SendingBody;
                Ok(())
            }
            Err(e) => Err(self.fail("sending request headers", e)),
        }
    }

    /// Send one raw chunk of the request body. May be called zero or more
    /// times after the headers.
    pub async fn send_body_block(&mut self, chunk: &[u8]) -> Result<(), GatewayError> {
        if self.phase != SessionPhase::SendingBody {
            return Err(self.misuse("body block outside the body phase"));
        }
        let writer = self.writer.as_mut().expect("writer open in SendingBody");
        let timeout = self.writer_timeout;
        let result = timed(timeout, writer.write_all(chunk)).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail("sending request body", e)),
        }
    }

    /// Half-close the write direction, signalling end-of-request.
    pub async fn shutdown_writer(&mut self) -> Result<(), GatewayError> {
        if !matches!(
            self.phase,
            SessionPhase::SendingHeaders | SessionPhase::SendingBody
        ) {
            return Err(self.misuse("writer already shut down"));
        }
        let mut writer = self.writer.take().expect("writer open before shutdown");
        let result = timed(self.writer_timeout, writer.shutdown()).await;
        match result {
            Ok(()) => {
                self.phase = SessionPhase::AwaitingResponse;
                Ok(())
            }
            Err(e) => Err(self.fail("half-closing the request stream", e)),
        }
    }

    /// Read a chunk of the worker's response. Returns 0 at end-of-response,
    /// which closes the session.
    pub async fn read_response(&mut self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        if !matches!(
            self.phase,
            SessionPhase::AwaitingResponse | SessionPhase::ReadingResponse
        ) {
            return Err(self.misuse("reading before the request was finished"));
        }
        let timeout = self.reader_timeout;
        let result = timed(timeout, self.reader.read(buf)).await;
        match result {
            Ok(0) => {
                self.phase = SessionPhase::Closed;
                Ok(0)
            }
            Ok(n) => {
                self.phase = SessionPhase::ReadingResponse;
                Ok(n)
            }
            Err(e) => Err(self.fail("reading the response", e)),
        }
    }

    /// Record that this session failed; the worker is released unhealthy.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn fail(&mut self, context: &'static str, source: io::Error) -> GatewayError {
        self.failed = true;
        GatewayError::session_io(context, source)
    }

    fn misuse(&mut self, what: &'static str) -> GatewayError {
        self.failed = true;
        GatewayError::session_io(
            "session protocol",
            io::Error::new(io::ErrorKind::InvalidInput, what),
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.failed {
            self.checkout.release(false);
        }
        // Otherwise the checkout's own drop returns the worker healthy.
    }
}

/// Run an I/O future under a timeout; zero disables the limit.
async fn timed<F, T>(limit: Duration, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    if limit.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "worker I/O timed out",
            )),
        }
    }
}
