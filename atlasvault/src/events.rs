use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::source::ProgressInfo;
use crate::uploader::TransferProgress;

pub const BACKUP_STARTED: &str = "backup-started";
pub const BACKUP_PROGRESS: &str = "backup-progress";
pub const BACKUP_SAVING: &str = "backup-saving";
pub const BACKUP_DONE: &str = "backup-done";
pub const UPLOAD_STARTED: &str = "upload-started";
pub const UPLOAD_PROGRESS: &str = "upload-progress";
pub const UPLOAD_DONE: &str = "upload-done";

/// Lifecycle notification emitted by backup sources and uploaders.
#[derive(Debug, Clone)]
pub enum Event {
    BackupStarted,
    BackupProgress(ProgressInfo),
    BackupSaving,
    BackupDone,
    UploadStarted(&'static str),
    UploadProgress(TransferProgress),
    UploadDone(&'static str),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::BackupStarted => BACKUP_STARTED,
            Event::BackupProgress(_) => BACKUP_PROGRESS,
            Event::BackupSaving => BACKUP_SAVING,
            Event::BackupDone => BACKUP_DONE,
            Event::UploadStarted(_) => UPLOAD_STARTED,
            Event::UploadProgress(_) => UPLOAD_PROGRESS,
            Event::UploadDone(_) => UPLOAD_DONE,
        }
    }
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Registry {
    handlers: RwLock<HashMap<&'static str, Vec<Handler>>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Registry {
    fn deliver(&self, event: &Event) {
        let handlers = self.handlers.read();
        if let Some(list) = handlers.get(event.kind()) {
            for handler in list {
                handler(event);
            }
        }
    }
}

/// Publish/subscribe channel for backup lifecycle events.
///
/// Clones share the same subscriber registry. Dropping the last clone stops
/// the background delivery task.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
}

impl EventDispatcher {
    /// Creates a dispatcher. Must be called from within a tokio runtime,
    /// which hosts the background task draining fire-and-forget events.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let registry = Arc::new(Registry {
            handlers: RwLock::new(HashMap::new()),
            tx,
        });

        let weak = Arc::downgrade(&registry);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match weak.upgrade() {
                    Some(registry) => registry.deliver(&event),
                    None => break,
                }
            }
        });

        Self { registry }
    }

    /// Subscribes `handler` to all events of the given kind.
    pub fn add_handler<F>(&self, kind: &'static str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.registry
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Queues the event for background delivery and returns immediately.
    pub fn dispatch(&self, event: Event) {
        let _ = self.registry.tx.send(event);
    }

    /// Runs every matching subscriber to completion before returning.
    pub fn dispatch_and_wait(&self, event: Event) {
        self.registry.deliver(&event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
