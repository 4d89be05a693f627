// src/sys/relay.rs

use std::future;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::sys::runner::OutputLines;

/// How a relay ended. Packaging runs after every variant.
#[derive(Debug)]
pub enum RelayOutcome {
    Exited(ExitStatus),
    /// The deadline elapsed and the child was killed.
    TimedOut(Duration),
    /// The HTTP body was dropped and the child was killed.
    ClientGone,
    /// Reading the pipe or reaping the child failed.
    Failed(std::io::Error),
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => future::pending().await,
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill playbook process");
    }
}

/// Forwards every line to `sink` as soon as it is read, then reaps the
/// child. Lines reach the sink in the order the pipe delivered them.
///
/// The deadline and a closed sink are watched at every await point,
/// including while a send waits for the client to drain the channel.
pub async fn relay_output(
    mut lines: OutputLines,
    child: &mut Child,
    sink: &mpsc::Sender<String>,
    timeout: Option<Duration>,
) -> RelayOutcome {
    let deadline = deadline(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            next = lines.next() => match next {
                Some(Ok(mut line)) => {
                    if !line.ends_with('\n') {
                        line.push('\n');
                    }
                    tokio::select! {
                        sent = sink.send(line) => {
                            if sent.is_err() {
                                kill(child).await;
                                return RelayOutcome::ClientGone;
                            }
                        }
                        _ = &mut deadline => {
                            kill(child).await;
                            return RelayOutcome::TimedOut(timeout.unwrap_or_default());
                        }
                    }
                }
                Some(Err(e)) => {
                    kill(child).await;
                    return RelayOutcome::Failed(e);
                }
                None => break,
            },
            _ = sink.closed() => {
                kill(child).await;
                return RelayOutcome::ClientGone;
            }
            _ = &mut deadline => {
                kill(child).await;
                return RelayOutcome::TimedOut(timeout.unwrap_or_default());
            }
        }
    }

    // EOF on the pipe; the child may still be finishing up.
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => RelayOutcome::Exited(status),
            Err(e) => RelayOutcome::Failed(e),
        },
        _ = sink.closed() => {
            kill(child).await;
            RelayOutcome::ClientGone
        }
        _ = &mut deadline => {
            kill(child).await;
            RelayOutcome::TimedOut(timeout.unwrap_or_default())
        }
    }
}
