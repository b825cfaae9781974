//! Bidirectional splice pump
//!
//! After the proxy has connected client and upstream and replayed the
//! handshake prelude, all remaining traffic is opaque. This module
//! pumps bytes in both directions with per-direction byte counters and
//! an idle timeout covering both directions.
//!
//! Termination is symmetric: the first direction to finish (EOF, reset,
//! or error) ends the pump, and the caller closes both halves. The idle
//! timer rearms whenever a byte moves in either direction; when it
//! fires, the pump ends as if both sides had closed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

/// Buffer size per pump direction.
pub const DEFAULT_PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of a finished pump.
#[derive(Debug, Clone, Copy, Default)]
pub struct PumpResult {
    /// Bytes moved client -> upstream.
    pub client_to_upstream: u64,
    /// Bytes moved upstream -> client.
    pub upstream_to_client: u64,
    /// Whether the idle timeout ended the pump.
    pub idle_timed_out: bool,
}

impl PumpResult {
    /// Total bytes moved in both directions.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// One direction of transfer.
struct TransferState {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    read_done: bool,
    done: bool,
    bytes: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            pos: 0,
            cap: 0,
            read_done: false,
            done: false,
            bytes: 0,
        }
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes += n as u64;
                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                match writer.as_mut().poll_flush(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                self.done = true;
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

struct Splice<'a, C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    client: &'a mut C,
    upstream: &'a mut U,
    c2u: TransferState,
    u2c: TransferState,
    idle: Option<(Duration, Pin<Box<Sleep>>)>,
}

impl<C, U> Future for Splice<'_, C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<PumpResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let before = this.c2u.bytes + this.u2c.bytes;

        let c2u = if this.c2u.done {
            Poll::Ready(Ok(()))
        } else {
            this.c2u
                .poll_transfer(cx, Pin::new(&mut this.client), Pin::new(&mut this.upstream))
        };
        let u2c = if this.u2c.done {
            Poll::Ready(Ok(()))
        } else {
            this.u2c
                .poll_transfer(cx, Pin::new(&mut this.upstream), Pin::new(&mut this.client))
        };

        let result = PumpResult {
            client_to_upstream: this.c2u.bytes,
            upstream_to_client: this.u2c.bytes,
            idle_timed_out: false,
        };

        // First direction to finish ends the pump; the caller closes
        // both halves and the sibling direction with them.
        match (c2u, u2c) {
            (Poll::Ready(Err(e)), _) | (_, Poll::Ready(Err(e)))
                if !is_benign_close(&e) =>
            {
                return Poll::Ready(Err(e));
            }
            (Poll::Ready(_), _) | (_, Poll::Ready(_)) => {
                return Poll::Ready(Ok(result));
            }
            (Poll::Pending, Poll::Pending) => {}
        }

        if let Some((window, deadline)) = this.idle.as_mut() {
            let after = this.c2u.bytes + this.u2c.bytes;
            if after != before {
                deadline.as_mut().reset(Instant::now() + *window);
            }
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Ok(PumpResult {
                    idle_timed_out: true,
                    ..result
                }));
            }
        }

        Poll::Pending
    }
}

/// Connection resets and aborts at pump time are normal client
/// departures, not errors worth surfacing.
fn is_benign_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Pump bytes between client and upstream until either side closes or
/// the idle window elapses with no traffic in either direction.
///
/// A zero `idle_timeout` disables the idle timer.
///
/// # Errors
///
/// Propagates non-benign transport errors; resets and broken pipes end
/// the pump cleanly with the counters gathered so far.
pub async fn splice<C, U>(
    client: &mut C,
    upstream: &mut U,
    idle_timeout: Duration,
) -> io::Result<PumpResult>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let idle = if idle_timeout.is_zero() {
        None
    } else {
        Some((idle_timeout, Box::pin(sleep(idle_timeout))))
    };
    Splice {
        client,
        upstream,
        c2u: TransferState::new(DEFAULT_PUMP_BUFFER_SIZE),
        u2c: TransferState::new(DEFAULT_PUMP_BUFFER_SIZE),
        idle,
    }
    .await
}
