//! Outbound half of a worker channel.
//!
//! Envelopes from any number of tasks are funneled through one writer task
//! so frames never interleave on the byte stream. The writer exits when the
//! last sender is dropped or the sink fails; senders observe the latter as a
//! send error on their next envelope.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use taskfarm_protocol::{wire, Envelope};

/// Spawn the writer task for one channel and return its sender.
pub(crate) fn spawn_writer<W>(mut sink: W) -> mpsc::UnboundedSender<Envelope>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let line = match wire::encode_line(&envelope) {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, "failed to encode envelope");
                    continue;
                }
            };

            if let Err(err) = sink.write_all(line.as_bytes()).await {
                debug!(error = %err, "channel writer closed");
                break;
            }
            if let Err(err) = sink.flush().await {
                debug!(error = %err, "channel writer closed on flush");
                break;
            }
        }
    });

    tx
}
