use log::info;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub struct ShutdownManager {
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) _shutdown_rcv: broadcast::Receiver<()>,
    pub(crate) external_shutdown: mpsc::UnboundedReceiver<()>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Shutdown {
    pub(crate) shutdown_signal_rcv: broadcast::Receiver<()>,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    pub(crate) external_shutdown: mpsc::UnboundedSender<()>,
}

impl ShutdownHandle {
    /// Shut the process down: signals all tasks and lets the manager join
    /// them.
    pub fn shutdown(&self) {
        let _ = self.external_shutdown.send(());
    }
}

impl ShutdownManager {
    pub fn init() -> (ShutdownManager, ShutdownHandle) {
        let (shutdown_tx, shutdown_rcv) = broadcast::channel(1);
        let (external_tx, external_rcv) = mpsc::unbounded_channel();
        let handle = ShutdownHandle {
            external_shutdown: external_tx,
        };
        let manager = Self {
            shutdown_tx,
            _shutdown_rcv: shutdown_rcv,
            external_shutdown: external_rcv,
            handles: vec![],
        };
        (manager, handle)
    }

    /// Waits for an external shutdown request.
    pub async fn wait(&mut self) {
        let _ = self.external_shutdown.recv().await;
    }

    pub async fn stop(self) {
        info!("Starting DBRB shutdown");
        let _ = self.shutdown_tx.send(());
        info!("Waiting for tasks to finish");
        for handle in self.handles {
            if let Err(err) = handle.await {
                info!("Task finished with error: {err}");
            }
        }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            shutdown_signal_rcv: self.shutdown_tx.subscribe(),
        }
    }

    pub fn add_handle(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }
}
