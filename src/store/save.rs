use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::Store;
use crate::error::CoreResult;

/// Single-flight bookkeeping: whether a write is running and who is waiting
/// for the next one.
#[derive(Default)]
pub(super) struct SaveFlight {
    pub running: bool,
    pub waiters: Vec<oneshot::Sender<CoreResult<()>>>,
}

/// Runs the cancel-and-reset debounce timer for [`Store::schedule_save`].
///
/// Each trigger restarts the window; the save fires once the window elapses
/// with no further triggers. The task ends when the store is dropped.
pub(super) fn spawn_debouncer(
    store: Weak<Store>,
    mut triggers: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while triggers.recv().await.is_some() {
            loop {
                match tokio::time::timeout(debounce, triggers.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) | Err(_) => break,
                }
            }

            let Some(store) = store.upgrade() else {
                return;
            };
            if let Err(e) = store.save().await {
                tracing::error!(error = %e, "Scheduled save failed, state kept in memory");
            }
        }
        tracing::debug!("Save debouncer stopped");
    })
}
