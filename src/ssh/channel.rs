//! Exec channel plumbing between russh and the dispatcher.

use std::io;

use bytes::Bytes;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::StreamReader;

use crate::dispatch::OutputSink;
use crate::supervisor::ChannelOutput;

/// SSH extended-data type code for stderr (RFC 4254 section 5.2).
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Writes child output to one SSH channel: stdout as channel data, stderr as
/// extended data.  `Handle::data` waits for window space, so a slow client
/// slows the child down instead of buffering without bound.
pub struct ChannelSink {
    handle: Handle,
    channel: ChannelId,
}

impl ChannelSink {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "SSH channel closed")
}

#[async_trait::async_trait]
impl OutputSink for ChannelSink {
    async fn stdout(&mut self, data: &[u8]) -> io::Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| closed())
    }

    async fn stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.handle
            .extended_data(
                self.channel,
                SSH_EXTENDED_DATA_STDERR,
                CryptoVec::from_slice(data),
            )
            .await
            .map_err(|_| closed())
    }
}

#[async_trait::async_trait]
impl ChannelOutput for ChannelSink {
    /// RFC 4254: exit-status, then EOF, then close.  Git clients treat a
    /// close without exit-status as "the remote end hung up unexpectedly".
    async fn finish(&mut self, exit_code: i32) {
        let _ = self
            .handle
            .exit_status_request(self.channel, exit_code as u32)
            .await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

/// Reader half of a channel's stdin: whatever the client sends arrives here
/// in order; EOF once the sender is dropped.
pub type ChannelStdin = StreamReader<UnboundedReceiverStream<io::Result<Bytes>>, Bytes>;

pub type StdinSender = mpsc::UnboundedSender<io::Result<Bytes>>;

/// Create the pipe that feeds client data into a dispatched command.
pub fn stdin_pipe() -> (StdinSender, ChannelStdin) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, StreamReader::new(UnboundedReceiverStream::new(rx)))
}
