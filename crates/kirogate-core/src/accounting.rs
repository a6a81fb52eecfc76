use tokio::sync::mpsc;

use kirogate_storage::{LogStore, RequestLogRecord};

const QUEUE_SIZE: usize = 1000;
const WORKER_COUNT: usize = 3;

/// Asynchronous accounting sink. Records are queued and persisted off the
/// request path; when the queue is full the record is dropped, since the
/// log is observability, not billing.
#[derive(Clone)]
pub struct Accounting {
    tx: mpsc::Sender<RequestLogRecord>,
}

impl Accounting {
    pub fn new(store: LogStore) -> Self {
        let (tx, rx) = mpsc::channel::<RequestLogRecord>(QUEUE_SIZE);
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..WORKER_COUNT {
            let store = store.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let record = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(record) = record else {
                        return;
                    };
                    if let Err(err) = store.insert(record).await {
                        tracing::error!(error = %err, "request log write failed");
                    }
                }
            });
        }
        Self { tx }
    }

    pub fn record(&self, record: RequestLogRecord) {
        if self.tx.try_send(record).is_err() {
            tracing::debug!("request log queue full, dropping record");
        }
    }
}
