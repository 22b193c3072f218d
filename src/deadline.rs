//! Connection deadlines for the HTTP listeners
//!
//! [`DeadlineStream`] wraps an accepted socket and fails the pending read or
//! write with `TimedOut` once the deadline of the connection's current phase
//! has passed:
//!
//! - request: from accept until the first head reaches the handler (covers
//!   the TLS handshake), then from the first byte of each later request
//! - idle: from the end of a response until the next request starts
//! - write: one write that makes no progress
//!
//! No read deadline applies while a handler is running. Handlers are
//! counted through the [`InFlight`] shared with the service.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// TLS handshake plus the first request head
    pub first_request: Duration,
    /// Head of every later request, counted from its first byte
    pub header: Duration,
    pub write: Duration,
    pub idle: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    active: AtomicUsize,
}

/// Requests a connection has handed to its handler, and how many still run
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    counters: Arc<Counters>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as running until the guard drops
    pub fn start(&self) -> InFlightGuard {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counters: Arc::clone(&self.counters),
        }
    }

    fn started(&self) -> u64 {
        self.counters.started.load(Ordering::SeqCst)
    }

    fn busy(&self) -> bool {
        self.counters.active.load(Ordering::SeqCst) > 0
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    counters: Arc<Counters>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Request,
    Idle,
}

pub struct DeadlineStream<S> {
    inner: S,
    timeouts: ConnectionTimeouts,
    in_flight: InFlight,
    phase: Phase,
    /// Requests already accounted for by the current phase
    seen: u64,
    read_deadline: Pin<Box<Sleep>>,
    write_timer: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, timeouts: ConnectionTimeouts, in_flight: InFlight) -> Self {
        Self {
            inner,
            timeouts,
            in_flight,
            phase: Phase::Request,
            seen: 0,
            read_deadline: Box::pin(sleep(timeouts.first_request)),
            write_timer: None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        let limit = match phase {
            Phase::Request => self.timeouts.header,
            Phase::Idle => self.timeouts.idle,
        };
        self.phase = phase;
        self.read_deadline.as_mut().reset(Instant::now() + limit);
    }

    /// True once per batch of requests whose handlers have all finished
    fn handled(&mut self) -> bool {
        let started = self.in_flight.started();
        if started > self.seen && !self.in_flight.busy() {
            self.seen = started;
            true
        } else {
            false
        }
    }

    fn wrote(&mut self) {
        self.write_timer = None;
        // Handshake writes happen before any request and keep the first deadline
        if self.in_flight.started() > 0 && !self.in_flight.busy() {
            self.seen = self.in_flight.started();
            self.enter(Phase::Idle);
        }
    }

    fn poll_write_timer(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let limit = self.timeouts.write;
        let timer = self.write_timer.get_or_insert_with(|| Box::pin(sleep(limit)));
        match timer.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.write_timer = None;
                Poll::Ready(timed_out("write"))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline exceeded", what))
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before && this.phase == Phase::Idle {
                    this.enter(Phase::Request);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                if this.in_flight.busy() {
                    return Poll::Pending;
                }
                if this.handled() {
                    this.enter(Phase::Idle);
                }
                match this.read_deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Err(timed_out(match this.phase {
                        Phase::Request => "request",
                        Phase::Idle => "idle",
                    }))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.wrote();
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_write_timer(cx).map(Err),
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.wrote();
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_write_timer(cx).map(Err),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_write_timer(cx).map(Err),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.write_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_write_timer(cx).map(Err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn timeouts(millis: u64) -> ConnectionTimeouts {
        ConnectionTimeouts {
            first_request: Duration::from_millis(millis),
            header: Duration::from_millis(millis),
            write: Duration::from_millis(millis),
            idle: Duration::from_millis(millis * 2),
        }
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (_client, server) = duplex(64);
        let mut stream = DeadlineStream::new(server, timeouts(50), InFlight::new());

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_running_handler_suspends_read_deadline() {
        let (mut client, server) = duplex(64);
        let in_flight = InFlight::new();
        let mut stream = DeadlineStream::new(server, timeouts(50), in_flight.clone());

        let guard = in_flight.start();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
        assert!(read.is_err(), "read must stay pending while a handler runs");

        client.write_all(b"ping").await.unwrap();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        drop(guard);
    }

    #[tokio::test]
    async fn test_idle_deadline_after_response() {
        let (mut client, server) = duplex(64);
        let in_flight = InFlight::new();
        let mut stream = DeadlineStream::new(server, timeouts(50), in_flight.clone());

        drop(in_flight.start());
        stream.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();

        // past the request deadline but inside the idle one
        tokio::time::sleep(Duration::from_millis(60)).await;
        client.write_all(b"next").await.unwrap();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);

        drop(in_flight.start());
        stream.write_all(b"again").await.unwrap();
        let started = Instant::now();
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let (_client, server) = duplex(8);
        let mut stream = DeadlineStream::new(server, timeouts(50), InFlight::new());

        let err = stream.write_all(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
