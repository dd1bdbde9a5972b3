//! Closing connections after success, failure and cancellation

use super::{
    Finished, PeerMessage, TransferError,
    messages::CANCELLED,
    session::{Control, Session},
};
use crate::{Mood, transit::RecordError, util};
use std::{future::Future, time::Duration};

/// Maximum duration that we are willing to wait for cleanup tasks to finish
pub(super) const SHUTDOWN_TIME: Duration = Duration::from_secs(5);

/// Run a cleanup future with a timeout, ignore errors
async fn wrap_timeout(run: impl Future<Output = ()>) {
    if util::timeout(SHUTDOWN_TIME, run).await.is_err() {
        tracing::debug!("Post-transfer cleanup timed out");
    }
}

/// Ignore an error but at least debug print it
fn debug_err(result: Result<(), impl std::fmt::Display>, operation: &str) {
    if let Err(error) = result {
        tracing::debug!("Failed to {} after transfer: {}", operation, error);
    }
}

impl Control {
    /// Tell the peer, if we can talk to it already
    async fn notify(&mut self, message: &PeerMessage) {
        if let Control::Wormhole(wormhole) = self {
            debug_err(wormhole.send_json(message).await, "notify the peer");
        }
    }

    /// Close the mailbox with our mood and drop the connection
    async fn close(&mut self, mood: Mood) {
        match std::mem::take(self) {
            Control::Offline => {},
            Control::Mailbox(mut client) => debug_err(client.close(mood).await, "close the mailbox"),
            Control::Wormhole(mut wormhole) => {
                debug_err(wormhole.close(mood).await, "close the Wormhole")
            },
        }
    }

    /// Look whether the peer has told us what went wrong
    async fn peer_error(&mut self) -> Option<TransferError> {
        let Control::Wormhole(wormhole) = self else {
            return None;
        };
        loop {
            match util::timeout(SHUTDOWN_TIME / 3, wormhole.receive_json::<PeerMessage>()).await {
                Ok(Ok(PeerMessage::Error(error))) => return Some(TransferError::from_peer(error)),
                Ok(Ok(other)) => tracing::debug!("Skipping {:?} while looking for an error", other),
                _ => return None,
            }
        }
    }
}

fn mood_after(error: &TransferError) -> Mood {
    match error {
        TransferError::Wormhole(error) => error.mood(),
        TransferError::PeerCancelled | TransferError::Rejected => Mood::Happy,
        _ => Mood::Errory,
    }
}

/// Delete an incomplete download
async fn discard_partial(session: &mut Session) {
    if let Some(partial) = session.partial.take() {
        tracing::debug!("Removing incomplete file {}", partial.display());
        debug_err(
            async_std::fs::remove_file(&partial).await,
            "remove the incomplete file",
        );
    }
}

/**
 * Handle the post-{transfer, failure, cancellation} logic, then close the mailbox
 *
 * Emits the terminal event of the session as the very last thing, so that all files
 * and connections are cleaned up by the time the application sees it.
 */
pub(super) async fn handle_run_result(
    session: &mut Session,
    control: &mut Control,
    result: Result<Result<Finished, TransferError>, util::Cancelled>,
) {
    match result {
        /* Happy case: everything went okay. Now close the wormhole */
        Ok(Ok(finished)) => {
            tracing::debug!(
                "{} transfer done in state {}, doing cleanup logic",
                session.role(),
                session.state()
            );
            wrap_timeout(control.close(Mood::Happy)).await;
            match finished {
                Finished::Completed(path) => session.complete(path),
                Finished::Declined => session.cancel(),
            }
        },
        /* Got peer error: stop everything immediately */
        Ok(Err(
            error @ (TransferError::PeerError(_)
            | TransferError::PeerCancelled
            | TransferError::Rejected),
        )) => {
            tracing::debug!(
                "Transfer encountered an error ({}), doing cleanup logic",
                error
            );
            wrap_timeout(control.close(mood_after(&error))).await;
            discard_partial(session).await;
            finish_with(session, error);
        },
        /* Got transit error: try to receive peer error for better error message */
        Ok(Err(
            mut error @ (TransferError::Transit(_)
            | TransferError::Record(RecordError::Io(_) | RecordError::Timeout)),
        )) => {
            tracing::debug!(
                "Transfer encountered an error ({}), doing cleanup logic",
                error
            );
            wrap_timeout(async {
                if let Some(peer_error) = control.peer_error().await {
                    error = peer_error;
                } else {
                    tracing::debug!("Failed to retrieve more specific error message from peer. Maybe it crashed?");
                    control
                        .notify(&PeerMessage::error(error.to_string()))
                        .await;
                }
                control.close(mood_after(&error)).await;
            })
            .await;
            discard_partial(session).await;
            finish_with(session, error);
        },
        /* Other error: try to notify peer */
        Ok(Err(error)) => {
            tracing::debug!(
                "Transfer encountered an error ({}), doing cleanup logic",
                error
            );
            wrap_timeout(async {
                control
                    .notify(&PeerMessage::error(error.to_string()))
                    .await;
                control.close(mood_after(&error)).await;
            })
            .await;
            discard_partial(session).await;
            session.fail(error);
        },
        /* Cancelled: try to notify peer */
        Err(util::Cancelled) => {
            tracing::debug!("Transfer got cancelled, doing cleanup logic");
            wrap_timeout(async {
                control.notify(&PeerMessage::error(CANCELLED)).await;
                control.close(Mood::Happy).await;
            })
            .await;
            discard_partial(session).await;
            session.cancel();
        },
    }
}

/// A cancellation by the peer is a cancellation for us too
fn finish_with(session: &mut Session, error: TransferError) {
    match error {
        TransferError::PeerCancelled => session.cancel(),
        error => session.fail(error),
    }
}
