use crate::modules::{common::signal::SIGNAL_MANAGER, error::RelayMailResult};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{oneshot, Notify};
use tracing::{info, warn};

pub struct PeriodicTask {
    name: String,
}

pub struct TaskHandle {
    cancel_sender: Option<oneshot::Sender<()>>,
    join_handle: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    pub async fn cancel(self) {
        if let Some(sender) = self.cancel_sender {
            let _ = sender.send(());
        }
        let _ = self.join_handle.await;
    }
}

impl PeriodicTask {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }

    /// Run `task` every `interval`, with three extra wake-up paths: an
    /// optional `Notify` that forces an immediate iteration, a cancel
    /// handle, and the process shutdown broadcast.
    pub fn start<F, T>(
        self,
        task: T,
        wake: Option<Arc<Notify>>,
        interval: Duration,
        run_immediately: bool,
    ) -> TaskHandle
    where
        T: Fn() -> F + Send + Sync + 'static,
        F: Future<Output = RelayMailResult<()>> + Send + 'static,
    {
        info!("Task '{}' started", &self.name);

        let (cancel_sender, mut cancel_receiver) = oneshot::channel::<()>();
        let name_clone = self.name.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut shutdown = SIGNAL_MANAGER.subscribe();

            if !run_immediately {
                ticker.tick().await; // discard first immediate tick
            }

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task().await {
                            warn!("Task '{}' failed: {:?}", name_clone, e);
                        }
                    }
                    _ = async {
                        match &wake {
                            Some(notify) => notify.notified().await,
                            None => futures::future::pending().await,
                        }
                    } => {
                        if let Err(e) = task().await {
                            warn!("Task '{}' failed: {:?}", name_clone, e);
                        }
                        ticker.reset();
                    }
                    _ = &mut cancel_receiver => {
                        info!("Task '{}' received cancellation signal", name_clone);
                        break;
                    }
                    _ = shutdown.recv() => {
                        info!("Task '{}' shutting down due to shutdown signal", name_clone);
                        break;
                    }
                }
            }

            info!("Task '{}' stopped", name_clone);
        });

        TaskHandle {
            cancel_sender: Some(cancel_sender),
            join_handle,
        }
    }
}
