// Local crates
use crate::decoder::{decoder::decode_bytes, models::Event};

// External crates
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Unit of data the reader hands to the stream controller.
#[derive(Debug)]
pub enum InputItem {
    Event(Event),
    /// The input reached end of stream.
    End,
    /// Reading failed; the reader has stopped.
    Failed(std::io::Error),
}

/// Read `reader` line by line on a dedicated task, decoding each line.
///
/// Blank lines are skipped. Exactly one `End` or `Failed` item terminates the
/// stream. The channel is bounded, so a slow consumer slows reading down
/// rather than growing memory here.
pub fn spawn_line_reader<R>(reader: R, capacity: usize) -> (mpsc::Receiver<InputItem>, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(read_lines(reader, tx));
    (rx, handle)
}

#[instrument(
    name = "relay_input::read_lines",
    target = "input::reader",
    skip_all,
    level = "debug"
)]
async fn read_lines<R>(mut reader: R, output: mpsc::Sender<InputItem>)
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut lines: u64 = 0;

    loop {
        buffer.clear();
        let item = match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => {
                tracing::debug!(lines, "Input reached end of stream");
                let _ = output.send(InputItem::End).await;
                return;
            }
            Ok(_) => {
                lines += 1;
                match decode_bytes(&buffer) {
                    Some(event) => InputItem::Event(event),
                    None => continue,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, lines, "Failed to read input");
                let _ = output.send(InputItem::Failed(e)).await;
                return;
            }
        };

        if output.send(item).await.is_err() {
            tracing::debug!("Input consumer gone, stopping reader");
            return;
        }
    }
}
