//! In-memory single-producer/single-consumer byte pipe.
//!
//! Each transform stage writes into the producer end from its own task
//! while the next stage reads the consumer end. Closing the writer with an
//! error makes that error surface as the consumer's read error once the
//! buffered bytes drain; dropping the writer is a clean EOF. A detachable
//! [`PipeCloser`] lets the orchestrator force the pipe shut from outside,
//! which fails the producer's next write instead of leaving it blocked.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Chunks buffered between producer and consumer before writes block.
const PIPE_DEPTH: usize = 8;

#[derive(Default)]
struct Shared {
    /// Error stored by `close_with_error`, surfaced to the reader at drain.
    error: Mutex<Option<(io::ErrorKind, String)>>,
    /// Set once the reader has observed a clean end of stream.
    clean_eof: AtomicBool,
}

impl Shared {
    fn stored_error(&self) -> Option<io::Error> {
        self.error
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|(kind, msg)| io::Error::new(*kind, msg.clone())))
    }
}

/// Creates a connected reader/writer pair.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(PIPE_DEPTH);
    let shared = Arc::new(Shared::default());
    let receiver = Arc::new(Mutex::new(rx));
    (
        PipeReader {
            receiver,
            shared: shared.clone(),
            current: Vec::new(),
            pos: 0,
        },
        PipeWriter {
            sender: PollSender::new(tx),
            shared,
        },
    )
}

/// Consumer end of a pipe.
pub struct PipeReader {
    receiver: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    shared: Arc<Shared>,
    current: Vec<u8>,
    pos: usize,
}

impl PipeReader {
    /// A handle that can force this pipe closed from another task.
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            receiver: self.receiver.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Closes the read side. Pending and future producer writes fail.
    pub fn close(&mut self) {
        if let Ok(mut rx) = self.receiver.lock() {
            rx.close();
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if me.pos < me.current.len() {
                let n = (me.current.len() - me.pos).min(buf.remaining());
                buf.put_slice(&me.current[me.pos..me.pos + n]);
                me.pos += n;
                return Poll::Ready(Ok(()));
            }

            let polled = match me.receiver.lock() {
                Ok(mut rx) => rx.poll_recv(cx),
                Err(_) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::Other,
                        "pipe state poisoned",
                    )))
                }
            };
            match polled {
                Poll::Ready(Some(chunk)) => {
                    me.current = chunk;
                    me.pos = 0;
                }
                Poll::Ready(None) => {
                    return Poll::Ready(match me.shared.stored_error() {
                        Some(err) => Err(err),
                        None => {
                            me.shared.clean_eof.store(true, Ordering::SeqCst);
                            Ok(())
                        }
                    });
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Detached close handle for a [`PipeReader`].
#[derive(Clone)]
pub struct PipeCloser {
    receiver: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    shared: Arc<Shared>,
}

impl PipeCloser {
    /// Closes the read side. Idempotent.
    pub fn close(&self) {
        if let Ok(mut rx) = self.receiver.lock() {
            rx.close();
        }
    }

    /// The producer's stored error, if the stream never reached a clean
    /// EOF. Mirrors what a close on the source reader should report.
    pub fn pending_error(&self) -> Option<io::Error> {
        if self.shared.clean_eof.load(Ordering::SeqCst) {
            return None;
        }
        self.shared.stored_error()
    }
}

/// Producer end of a pipe.
pub struct PipeWriter {
    sender: PollSender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Stores `err` for the consumer and closes the pipe. The consumer
    /// drains buffered bytes first, then observes `err` on every read.
    pub fn close_with_error(&mut self, err: io::Error) {
        if let Ok(mut slot) = self.shared.error.lock() {
            if slot.is_none() {
                *slot = Some((err.kind(), err.to_string()));
            }
        }
        self.sender.close();
    }

    /// Closes the pipe cleanly; the consumer sees EOF after the drain.
    pub fn close(&mut self) {
        self.sender.close();
    }

    /// A future that resolves once the read side is closed or dropped, so
    /// a producer can stop work whose output nobody will consume.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let sender = self.sender.get_ref().cloned();
        async move {
            match sender {
                Some(s) => s.closed().await,
                None => (),
            }
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let me = self.get_mut();
        match me.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => match me.sender.send_item(buf.to_vec()) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(_) => Poll::Ready(Err(broken_pipe())),
            },
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().sender.close();
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is closed")
}
