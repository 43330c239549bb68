#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use tender_bus::{EventBusConfig, MemoryBroker, TaskDispatcher};
use tender_core::Notice;
use tender_jobs::{ConsumerEvent, WorkerConfig};

pub const COMMAND_QUEUE: &str = "tender.commands";
pub const ANALYSIS_QUEUE: &str = "tender.commands.analysis";
pub const RESULT_QUEUE: &str = "tender.commands.analysis.result";
pub const VECTOR_REQUEST_QUEUE: &str = "tender.vectors.request";
pub const VECTOR_RESPONSE_QUEUE: &str = "tender.vectors.response";

pub fn bus_config() -> EventBusConfig {
    EventBusConfig::default()
        .with_enabled(true)
        .with_url("memory://")
        .with_command_queue(COMMAND_QUEUE)
        .with_vector_queues(VECTOR_REQUEST_QUEUE, VECTOR_RESPONSE_QUEUE)
}

pub fn dispatcher(broker: &MemoryBroker) -> Arc<TaskDispatcher> {
    Arc::new(
        TaskDispatcher::new(Arc::new(broker.clone()), bus_config().queues())
            .with_retry(1, Duration::ZERO),
    )
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_idle_poll_delay(50)
        .with_error_backoff(100)
        .with_reconnect_delays(100, 100)
}

pub fn notice(purchase_object_info: Option<&str>) -> Notice {
    let now = Utc::now();
    Notice {
        id: Uuid::new_v4(),
        external_id: Uuid::new_v4().to_string(),
        source: "test".into(),
        document_type: "epNotificationEF2020".into(),
        region: 77,
        period: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        entry_name: "notice.json".into(),
        version_number: 1,
        purchase_number: Some("0373100000125000001".into()),
        document_number: None,
        publish_date: None,
        href: None,
        placing_way_code: None,
        placing_way_name: None,
        etp_code: None,
        etp_name: None,
        etp_url: None,
        contract_conclusion_on_st83_ch2: false,
        purchase_object_info: purchase_object_info.map(str::to_string),
        max_price: None,
        currency_code: None,
        okpd2_code: None,
        okpd2_name: None,
        kvr_code: None,
        kvr_name: None,
        collecting_end: None,
        created_at: now,
        updated_at: now,
    }
}

/// Wait for the first event matching `pred`.
pub async fn wait_for(
    events: &mut broadcast::Receiver<ConsumerEvent>,
    pred: impl Fn(&ConsumerEvent) -> bool,
) -> ConsumerEvent {
    loop {
        match events.recv().await {
            Ok(event) if pred(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("consumer stopped"),
        }
    }
}
