use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{
    self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::task::Task;

use super::Context;

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";

/// Runs one accepted connection.
///
/// The read loop parses each line into a task bound to this connection's
/// peer address and spawns its execution; completed tasks push their
/// formatted line into the outbound channel, which a single writer drains
/// onto the socket. Tasks from one connection run concurrently and may
/// finish out of submission order; each request is answered by exactly one
/// line.
///
/// The writer dying ends the whole session: a connection that cannot be
/// answered must not keep executing commands.
pub(crate) async fn handle<S>(stream: S, peer: SocketAddr, ctx: Arc<Context>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    let mut writer = tokio::spawn(write_loop(write_half, rx));

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = &mut writer => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let msg = line.trim().to_string();
        if msg.is_empty() || msg == "quit" || msg == "exit" {
            break;
        }

        let task = Task::build(&ctx, peer, &msg).await;
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = match task.run().await {
                Ok(result) => {
                    format!("{} {}\n", STATUS_SUCCESS, result)
                }
                Err(e) => format!("{} {}\n", STATUS_ERROR, e),
            };
            // fails only if the connection already died under the writer
            let _ = tx.send(reply);
        });
    }

    info!("disconnected: {}", peer);
}

/// Drains the fan-in channel onto the socket in arrival order. Terminates
/// when every producer is gone (reader finished and all in-flight tasks
/// answered) or the peer stops accepting writes, closing the connection.
async fn write_loop<W>(mut sock: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(msg) = rx.recv().await {
        if sock.write_all(msg.as_bytes()).await.is_err() {
            return;
        }
    }
}
