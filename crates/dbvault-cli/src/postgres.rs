//! External tool adapters: `pg_dump` as a streaming source, `pg_restore`
//! and `psql` as streaming sinks.
//!
//! The dump adapter surfaces the child's stdout through a pipe; a non-zero
//! exit becomes the pipe's read error, carrying the captured stderr, so the
//! orchestrator sees tool failures as stream failures in the right order.
//! Closing the returned stream kills the child rather than leaving it
//! writing into nothing.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::process::Command;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::pipe::{pipe, PipeCloser, PipeReader};

/// Errors from spawning or waiting on external tools.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The tool binary is not on PATH.
    #[error("{tool} not found in PATH")]
    ToolMissing {
        /// Tool name.
        tool: &'static str,
    },

    /// The tool could not be spawned.
    #[error("spawn {tool}: {source}")]
    Spawn {
        /// Tool name.
        tool: &'static str,
        /// Underlying error.
        source: io::Error,
    },

    /// The tool ran but exited unsuccessfully.
    #[error("{tool} failed with {status}: {stderr}")]
    ToolFailed {
        /// Tool name.
        tool: &'static str,
        /// Exit status.
        status: std::process::ExitStatus,
        /// Captured, trimmed stderr.
        stderr: String,
    },

    /// Stream plumbing around the tool failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Finds `tool` on the process PATH.
pub fn lookup_path(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// True when `tool` is available on PATH.
pub fn tool_on_path(tool: &str) -> bool {
    lookup_path(tool).is_some()
}

/// A producer of database dump streams. The production implementation
/// spawns `pg_dump`; tests substitute canned bytes.
#[async_trait]
pub trait DumpSource: Send + Sync {
    /// Starts a dump of `db` and returns its byte stream.
    async fn open(&self, db: &DatabaseConfig) -> Result<DumpStream, AdapterError>;
}

/// A live dump stream. Reading yields the archive bytes; a failed dump
/// surfaces as a read error once its output ends.
pub struct DumpStream {
    reader: PipeReader,
}

impl DumpStream {
    /// Wraps an already-connected pipe reader. Used by in-process dump
    /// sources and tests.
    pub fn from_reader(reader: PipeReader) -> Self {
        Self { reader }
    }

    /// Detached handle that can close the stream from another task.
    pub fn handle(&self) -> DumpHandle {
        DumpHandle {
            closer: self.reader.closer(),
        }
    }
}

impl AsyncRead for DumpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// Close handle for a [`DumpStream`] that outlives the stream itself once
/// the stream has been boxed into the pipeline.
pub struct DumpHandle {
    closer: PipeCloser,
}

impl DumpHandle {
    /// Closes the stream, terminating the producer. Reports the producer's
    /// failure if its output was never consumed to a clean end.
    pub fn close(&self) -> io::Result<()> {
        self.closer.close();
        match self.closer.pending_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Closes the stream, discarding any pending producer error.
    pub fn force_close(&self) {
        self.closer.close();
    }
}

/// Streams `pg_dump --format=custom` archives.
pub struct PostgresDump;

#[async_trait]
impl DumpSource for PostgresDump {
    async fn open(&self, db: &DatabaseConfig) -> Result<DumpStream, AdapterError> {
        if !tool_on_path("pg_dump") {
            return Err(AdapterError::ToolMissing { tool: "pg_dump" });
        }

        let conn = &db.connection;
        let mut cmd = Command::new("pg_dump");
        cmd.arg("--host")
            .arg(&conn.host)
            .arg("--port")
            .arg(conn.port.to_string())
            .arg("--dbname")
            .arg(&conn.database)
            .arg("--username")
            .arg(&conn.user)
            .arg("--format=custom")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !conn.password.is_empty() {
            cmd.env("PGPASSWORD", &conn.password);
        }

        let mut child = cmd.spawn().map_err(|source| AdapterError::Spawn {
            tool: "pg_dump",
            source,
        })?;
        let Some(mut stdout) = child.stdout.take() else {
            return Err(AdapterError::Spawn {
                tool: "pg_dump",
                source: io::Error::new(io::ErrorKind::Other, "stdout not captured"),
            });
        };
        let stderr = child.stderr.take();
        debug!(db = %db.name, "pg_dump started");

        let (reader, mut writer) = pipe();
        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_end(&mut buf).await;
                }
                buf
            });

            let consumer_gone = writer.closed();
            let copy_res = tokio::select! {
                r = tokio::io::copy(&mut stdout, &mut writer) => r.map(|_| ()),
                _ = consumer_gone => {
                    let _ = child.start_kill();
                    Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "dump consumer closed",
                    ))
                }
            };

            let status = child.wait().await;
            let stderr_buf = stderr_task.await.unwrap_or_default();

            match (copy_res, status) {
                (Ok(()), Ok(st)) if st.success() => {
                    // dropping the writer delivers a clean EOF
                }
                (Ok(()), Ok(st)) => {
                    let msg = String::from_utf8_lossy(&stderr_buf);
                    writer.close_with_error(io::Error::new(
                        io::ErrorKind::Other,
                        format!("pg_dump failed with {st}: {}", msg.trim()),
                    ));
                }
                (Ok(()), Err(e)) => {
                    writer.close_with_error(io::Error::new(
                        io::ErrorKind::Other,
                        format!("pg_dump wait: {e}"),
                    ));
                }
                (Err(e), _) => writer.close_with_error(e),
            }
        });

        Ok(DumpStream { reader })
    }
}

/// Runs a restore tool, feeding its stdin from `stream`.
///
/// Stdin is closed before waiting; a non-zero exit maps to
/// [`AdapterError::ToolFailed`] with the captured stderr.
pub async fn run_restore_tool<R>(
    tool: &'static str,
    args: &[String],
    password: &str,
    stream: &mut R,
) -> Result<(), AdapterError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut cmd = Command::new(tool);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !password.is_empty() {
        cmd.env("PGPASSWORD", password);
    }

    let mut child = cmd
        .spawn()
        .map_err(|source| AdapterError::Spawn { tool, source })?;
    let Some(mut stdin) = child.stdin.take() else {
        return Err(AdapterError::Spawn {
            tool,
            source: io::Error::new(io::ErrorKind::Other, "stdin not captured"),
        });
    };
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    });

    let copy_res = tokio::io::copy(stream, &mut stdin).await;
    let _ = stdin.shutdown().await;
    drop(stdin);

    let status = child.wait().await?;
    let stderr_buf = stderr_task.await.unwrap_or_default();

    copy_res?;
    if !status.success() {
        return Err(AdapterError::ToolFailed {
            tool,
            status,
            stderr: String::from_utf8_lossy(&stderr_buf).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_common_binaries() {
        // `sh` exists on every platform the tool targets
        assert!(tool_on_path("sh"));
        assert!(!tool_on_path("definitely-not-a-real-binary-name"));
    }

    #[tokio::test]
    async fn dump_handle_reports_producer_failure() {
        let (reader, mut writer) = pipe();
        let stream = DumpStream::from_reader(reader);
        let handle = stream.handle();
        writer.close_with_error(io::Error::new(io::ErrorKind::Other, "dump exploded"));

        drop(stream);
        let err = handle.close().unwrap_err();
        assert_eq!(err.to_string(), "dump exploded");
    }

    #[tokio::test]
    async fn dump_handle_clean_after_full_read() {
        let (reader, mut writer) = pipe();
        writer.write_all(b"archive").await.unwrap();
        drop(writer);

        let mut stream = DumpStream::from_reader(reader);
        let handle = stream.handle();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"archive");
        handle.close().unwrap();
    }
}
