//! Output side of a dispatched command.
//!
//! The dispatcher writes child output through an [`OutputSink`] as it is
//! read, chunk by chunk.  Over SSH the sink is the channel (see
//! `ssh::channel`); in forced-command mode it is the process's own stdio.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

#[async_trait::async_trait]
pub trait OutputSink: Send {
    async fn stdout(&mut self, data: &[u8]) -> io::Result<()>;
    async fn stderr(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Sink over any pair of async writers.
pub struct StdioSink<O, E> {
    out: O,
    err: E,
}

impl<O, E> StdioSink<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self { out, err }
    }
}

impl StdioSink<tokio::io::Stdout, tokio::io::Stderr> {
    pub fn process() -> Self {
        Self::new(tokio::io::stdout(), tokio::io::stderr())
    }
}

#[async_trait::async_trait]
impl<O, E> OutputSink for StdioSink<O, E>
where
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    async fn stdout(&mut self, data: &[u8]) -> io::Result<()> {
        self.out.write_all(data).await?;
        self.out.flush().await
    }

    async fn stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.err.write_all(data).await?;
        self.err.flush().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Stream {
        Stdout,
        Stderr,
    }

    /// Records every chunk in arrival order.
    #[derive(Debug, Default)]
    pub struct CaptureSink {
        pub chunks: Vec<(Stream, Vec<u8>)>,
    }

    impl CaptureSink {
        pub fn stdout_bytes(&self) -> Vec<u8> {
            self.collect(Stream::Stdout)
        }

        pub fn stderr_text(&self) -> String {
            String::from_utf8_lossy(&self.collect(Stream::Stderr)).into_owned()
        }

        pub fn stdout_text(&self) -> String {
            String::from_utf8_lossy(&self.stdout_bytes()).into_owned()
        }

        fn collect(&self, which: Stream) -> Vec<u8> {
            self.chunks
                .iter()
                .filter(|(s, _)| *s == which)
                .flat_map(|(_, d)| d.iter().copied())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl OutputSink for CaptureSink {
        async fn stdout(&mut self, data: &[u8]) -> io::Result<()> {
            self.chunks.push((Stream::Stdout, data.to_vec()));
            Ok(())
        }

        async fn stderr(&mut self, data: &[u8]) -> io::Result<()> {
            self.chunks.push((Stream::Stderr, data.to_vec()));
            Ok(())
        }
    }
}
