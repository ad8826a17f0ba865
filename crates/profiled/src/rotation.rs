//! Periodic rotation of profile windows.
//!
//! A background task closes the current window on a fixed period and hands every
//! finished profile to the [`Uploader`]. Shutting the task down performs one final
//! rotation so observations recorded since the last tick are not lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::store::ProfileStore;
use crate::upload::Uploader;

/// Handle for controlling the background rotation task.
pub struct RotationHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: JoinHandle<()>,
}

impl RotationHandle {
    /// Stops the task after one final rotation and waits for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join_handle.await;
    }

    /// Aborts the task without a final rotation.
    pub fn abort(self) {
        self.join_handle.abort();
    }
}

/// Rotates every window once and submits the results. Returns how many were submitted.
pub fn rotate_and_submit(store: &ProfileStore, uploader: &Uploader) -> usize {
    let rotated = store.rotate_all();
    let count = rotated.len();
    for profile in rotated {
        uploader.submit(profile);
    }
    count
}

/// Starts the rotation task with the given period.
///
/// The first rotation happens one full period after start.
pub fn start_rotation(
    store: Arc<ProfileStore>,
    uploader: Arc<Uploader>,
    period: Duration,
) -> RotationHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join_handle = tokio::spawn(async move {
        tracing::info!(period_secs = period.as_secs(), "Starting rotation task");

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let submitted = rotate_and_submit(&store, &uploader);
                    tracing::info!(
                        epoch = store.epoch(),
                        submitted,
                        pending_uploads = uploader.pending(),
                        "Rotated profile windows"
                    );
                }
                _ = &mut shutdown_rx => {
                    tracing::info!("Shutdown signal received, performing final rotation");
                    let submitted = rotate_and_submit(&store, &uploader);
                    tracing::info!(submitted, "Final rotation submitted");
                    break;
                }
            }
        }

        tracing::info!("Rotation task stopped");
    });

    RotationHandle {
        shutdown_tx: Some(shutdown_tx),
        join_handle,
    }
}
