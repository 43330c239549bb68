//! Analysis worker: pull consumer of the analysis request queue.
//!
//! Pull rather than push so an empty queue can double as the trigger for the
//! stuck-analysis sweep.

use std::sync::Arc;

use async_trait::async_trait;

use tender_bus::BrokerConnector;
use tender_core::{AnalysisRequest, Result};

use crate::analysis::AnalysisService;
use crate::config::WorkerConfig;
use crate::consumer::{MessageHandler, QueueConsumer};

pub struct AnalysisWorker {
    service: Arc<AnalysisService>,
}

impl AnalysisWorker {
    pub fn new(service: Arc<AnalysisService>) -> Self {
        Self { service }
    }

    /// Pull consumer for `queue` using the worker timings.
    pub fn consumer(
        self,
        connector: Arc<dyn BrokerConnector>,
        queue: impl Into<String>,
        config: &WorkerConfig,
    ) -> QueueConsumer<Self> {
        QueueConsumer::new(connector, queue, Arc::new(self), config.pull())
    }
}

#[async_trait]
impl MessageHandler for AnalysisWorker {
    type Message = AnalysisRequest;

    fn component(&self) -> &'static str {
        "analysis_worker"
    }

    async fn handle(&self, request: AnalysisRequest) -> Result<()> {
        self.service.process_request(&request).await
    }

    async fn on_idle(&self) -> Result<()> {
        self.service.reset_stuck().await.map(|_| ())
    }
}
