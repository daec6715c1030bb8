use std::sync::Arc;

use crate::model::RequestLog;
use crate::store::UsageSink;

/// Hands a completed request's log record to the persistence collaborator
/// without blocking the caller; the sink owns its own failure logging.
pub struct Recorder {
    sink: Arc<dyn UsageSink>,
}

impl Recorder {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, log: RequestLog) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.record(log).await;
        });
    }
}
