use std::sync::LazyLock;

use crate::modules::common::shutdown::shutdown_signal;
use tokio::sync::broadcast;

pub static SIGNAL_MANAGER: LazyLock<SignalManager> = LazyLock::new(SignalManager::new);

pub struct SignalManager {
    sender: broadcast::Sender<()>,
}

impl SignalManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        SignalManager { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }

    /// Forward SIGINT/SIGTERM into the broadcast channel.
    pub fn listen_for_os_signals(&'static self) {
        tokio::spawn(async move {
            shutdown_signal().await;
            println!("\nSending shutdown signal...");
            let _ = self.sender.send(());
        });
    }
}
