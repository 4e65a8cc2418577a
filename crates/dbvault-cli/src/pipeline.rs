//! Pipeline assembly: transform stages behind pipes, torn down in LIFO order.
//!
//! Every optional transform wraps the current stream in a fresh pipe whose
//! producer task runs the codec. The consumer-side close handle is pushed
//! onto the orchestrator's [`CloseStack`], which is closed exactly once in
//! reverse construction order on every exit path, so blocked producers are
//! always unblocked before source and sink are closed.

use std::io;

use tokio::io::AsyncRead;
use tracing::debug;

use crate::pipe::{pipe, PipeCloser};

/// Type-erased stream flowing between stages.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// LIFO list of pipe close handles owned by the orchestrator.
#[derive(Default)]
pub struct CloseStack {
    closers: Vec<PipeCloser>,
}

impl CloseStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage's close handle.
    pub fn push(&mut self, closer: PipeCloser) {
        self.closers.push(closer);
    }

    /// Closes every registered stage, newest first. Idempotent: the stack
    /// drains on the first call.
    pub fn close_all(&mut self) {
        for closer in self.closers.drain(..).rev() {
            closer.close();
        }
    }
}

fn codec_error(err: dbvault_codec::CodecError) -> io::Error {
    match err {
        dbvault_codec::CodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Compression stage: the producer gzips `src` into the pipe.
pub fn gzip_stage(src: BoxedReader, stack: &mut CloseStack) -> BoxedReader {
    let (reader, mut writer) = pipe();
    stack.push(reader.closer());
    tokio::spawn(async move {
        let mut src = src;
        match dbvault_codec::gzip(&mut writer, &mut src).await {
            Ok(n) => debug!(bytes = n, "gzip stage finished"),
            Err(e) => writer.close_with_error(codec_error(e)),
        }
    });
    Box::new(reader)
}

/// Decompression stage, the inverse of [`gzip_stage`].
pub fn gunzip_stage(src: BoxedReader, stack: &mut CloseStack) -> BoxedReader {
    let (reader, mut writer) = pipe();
    stack.push(reader.closer());
    tokio::spawn(async move {
        let mut src = src;
        if let Err(e) = dbvault_codec::gunzip(&mut writer, &mut src).await {
            writer.close_with_error(codec_error(e));
        }
    });
    Box::new(reader)
}

/// Encryption stage: the producer seals `src` into the framed envelope.
pub fn encrypt_stage(src: BoxedReader, password: String, stack: &mut CloseStack) -> BoxedReader {
    let (reader, mut writer) = pipe();
    stack.push(reader.closer());
    tokio::spawn(async move {
        let mut src = src;
        match dbvault_codec::encrypt(&mut writer, &mut src, &password).await {
            Ok(n) => debug!(bytes = n, "encrypt stage finished"),
            Err(e) => writer.close_with_error(codec_error(e)),
        }
    });
    Box::new(reader)
}

/// Decryption stage, the inverse of [`encrypt_stage`].
pub fn decrypt_stage(src: BoxedReader, password: String, stack: &mut CloseStack) -> BoxedReader {
    let (reader, mut writer) = pipe();
    stack.push(reader.closer());
    tokio::spawn(async move {
        let mut src = src;
        if let Err(e) = dbvault_codec::decrypt(&mut writer, &mut src, &password).await {
            writer.close_with_error(codec_error(e));
        }
    });
    Box::new(reader)
}
