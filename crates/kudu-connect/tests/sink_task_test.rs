//! Sink task tests against the in-memory cluster
//!
//! Run with: cargo test -p kudu-connect --test sink_task_test

use kudu_connect::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn orders_table(name: &str) -> TableSchema {
    TableSchema::new(
        name,
        vec![
            ColumnSchema::key("id", ColumnType::Int64),
            ColumnSchema::new("amount", ColumnType::Double),
            ColumnSchema::nullable("region", ColumnType::String),
        ],
    )
    .unwrap()
}

fn order(topic: &str, partition: u32, offset: u64) -> Record {
    let value = StructValue::builder()
        .field("id", offset as i64)
        .field("amount", 10.0 + offset as f64)
        .build()
        .unwrap();
    Record::new(topic, partition, offset, value)
}

fn orders(topic: &str, offsets: std::ops::Range<u64>) -> Vec<Record> {
    offsets.map(|o| order(topic, 0, o)).collect()
}

fn config() -> KuduSinkConfig {
    let mut config = KuduSinkConfig::new("m1:7051,m2:7051");
    config.worker_count = 2;
    config
}

async fn start(config: &KuduSinkConfig, cluster: &MemoryCluster) -> KuduSinkTask {
    KuduSinkTask::start(config, Arc::new(cluster.connector()))
        .await
        .unwrap()
}

fn attempts_for(cluster: &MemoryCluster, offset: u64) -> Vec<tokio::time::Instant> {
    cluster
        .attempts()
        .into_iter()
        .filter(|a| a.source.offset == offset)
        .map(|a| a.started_at)
        .collect()
}

fn cell<'a>(row: &'a [Cell], column: &str) -> Option<&'a Value> {
    row.iter().find(|c| c.column == column).map(|c| &c.value)
}

#[tokio::test]
async fn test_topic_routes_to_table_of_same_name() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut task = start(&config(), &cluster).await;

    task.put(orders("orders", 0..3)).await.unwrap();
    let offsets = task.flush().await.unwrap();

    assert_eq!(cluster.row_count("orders"), 3);
    assert!(cluster.attempts().iter().all(|a| a.table == "orders"));
    assert_eq!(offsets[&TopicPartition::new("orders", 0)], 3);
    assert_eq!(task.watermarks()[&TopicPartition::new("orders", 0)], 2);

    let stats = task.stats();
    assert_eq!(stats.records_received, 3);
    assert_eq!(stats.rows_written, 3);
    assert_eq!(stats.batches_acked, 1);

    let report = task.close().await;
    assert_eq!(report.aborted, 0);
    assert!(report.failure.is_none());
}

#[tokio::test]
async fn test_failover_to_reachable_master() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    cluster.set_unreachable([MasterAddress::new("m1", 7051)]);
    let mut task = start(&config(), &cluster).await;

    task.put(orders("orders", 0..2)).await.unwrap();
    task.flush().await.unwrap();
    assert_eq!(cluster.row_count("orders"), 2);
}

#[tokio::test]
async fn test_no_master_reachable_fails_start() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    cluster.set_unreachable([MasterAddress::new("m1", 7051), MasterAddress::new("m2", 7051)]);

    let err = KuduSinkTask::start(&config(), Arc::new(cluster.connector()))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::FatalConnection);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_acked_after_two_retries() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    cluster.add_fault_rule(|m, seen| {
        (m.source().offset == 1 && seen <= 2).then(|| Fault::transient("tablet leader changed"))
    });

    let mut config = config();
    config.max_retries = 2;
    config.retry_backoff_ms = 100;
    let mut task = start(&config, &cluster).await;

    task.put(orders("orders", 0..3)).await.unwrap();
    let offsets = task.flush().await.unwrap();

    assert_eq!(cluster.row_count("orders"), 3);
    assert_eq!(offsets[&TopicPartition::new("orders", 0)], 3);

    // only the failed row is resubmitted
    assert_eq!(attempts_for(&cluster, 0).len(), 1);
    let retried = attempts_for(&cluster, 1);
    assert_eq!(retried.len(), 3);
    for pair in retried.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(100));
    }

    let stats = task.stats();
    assert_eq!(stats.batches_acked, 1);
    assert_eq!(stats.batches_retried, 2);
    assert_eq!(stats.batches_fatal, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_fails_task() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut config = config();
    config.max_retries = 1;
    config.retry_backoff_ms = 100;
    let mut task = start(&config, &cluster).await;
    let partition = TopicPartition::new("orders", 0);

    task.put(orders("orders", 0..2)).await.unwrap();
    task.flush().await.unwrap();
    assert_eq!(task.watermarks()[&partition], 1);

    cluster.add_fault_rule(|_, _| Some(Fault::transient("tablet unavailable")));
    task.put(orders("orders", 2..5)).await.unwrap();
    let err = task.flush().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::RetriesExhausted);

    // the watermark stays below the failed batch
    assert_eq!(task.watermarks()[&partition], 1);
    assert_eq!(attempts_for(&cluster, 2).len(), 2);
    assert!(task.is_failed());

    let err = task.put(orders("orders", 5..6)).await.unwrap_err();
    assert!(matches!(err, ConnectError::TaskFailed(_)));

    let report = task.close().await;
    assert!(report.failure.is_some());
    assert_eq!(report.commit_offsets[&partition], 2);
}

#[tokio::test(start_paused = true)]
async fn test_default_backoff_spaces_attempts() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    cluster.fail_next(1, Fault::transient("timed out"));
    let mut task = start(&config(), &cluster).await;

    task.put(orders("orders", 0..1)).await.unwrap();
    task.flush().await.unwrap();

    let attempts = attempts_for(&cluster, 0);
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(3000));
}

#[tokio::test]
async fn test_table_filter_excludes_records() {
    let cluster = MemoryCluster::new()
        .with_table(orders_table("orders_prod"))
        .with_table(orders_table("orders_dev"));
    let mut config = config();
    config.table_filter = Some("prod".into());
    let mut task = start(&config, &cluster).await;

    let mut records = orders("orders_prod", 0..2);
    records.extend(orders("orders_dev", 0..3));
    task.put(records).await.unwrap();
    let offsets = task.flush().await.unwrap();

    assert_eq!(cluster.row_count("orders_prod"), 2);
    assert_eq!(cluster.row_count("orders_dev"), 0);
    // excluded records are released at once
    assert_eq!(offsets[&TopicPartition::new("orders_dev", 0)], 3);
    assert_eq!(task.stats().records_excluded, 3);
}

#[tokio::test]
async fn test_table_field_routing() {
    let cluster = MemoryCluster::new()
        .with_table(orders_table("eu_orders"))
        .with_table(orders_table("us_orders"));
    let mut config = config();
    config.table_field = Some("region".into());
    let mut task = start(&config, &cluster).await;

    let record = |offset: u64, table: &str| {
        let value = StructValue::builder()
            .field("id", offset as i64)
            .field("amount", 1.0)
            .field("region", table)
            .build()
            .unwrap();
        Record::new("orders", 0, offset, value)
    };
    task.put(vec![record(0, "eu_orders"), record(1, "us_orders"), record(2, "eu_orders")])
        .await
        .unwrap();
    let offsets = task.flush().await.unwrap();

    assert_eq!(cluster.row_count("eu_orders"), 2);
    assert_eq!(cluster.row_count("us_orders"), 1);
    assert_eq!(cluster.row_count("orders"), 0);
    assert_eq!(offsets[&TopicPartition::new("orders", 0)], 3);
}

#[tokio::test]
async fn test_table_field_routing_without_matching_column() {
    let cluster = MemoryCluster::new()
        .with_table(orders_table("eu_orders"))
        .with_table(orders_table("us_orders"));
    let mut config = config();
    config.table_field = Some("target".into());
    let mut task = start(&config, &cluster).await;

    let record = |offset: u64, table: &str| {
        let value = StructValue::builder()
            .field("id", offset as i64)
            .field("amount", 1.0)
            .field("target", table)
            .build()
            .unwrap();
        Record::new("orders", 0, offset, value)
    };
    task.put(vec![record(0, "eu_orders"), record(1, "us_orders")])
        .await
        .unwrap();
    task.flush().await.unwrap();

    assert_eq!(cluster.row_count("eu_orders"), 1);
    assert_eq!(cluster.row_count("us_orders"), 1);
    let rows = cluster.rows("eu_orders");
    assert!(cell(&rows[0], "target").is_none());
    assert!(!task.is_failed());
}

#[tokio::test]
async fn test_missing_table_field_fails_task() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut config = config();
    config.table_field = Some("target".into());
    let mut task = start(&config, &cluster).await;

    let err = task.put(orders("orders", 0..1)).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Routing);
    assert_eq!(task.stats().records_failed, 1);
    assert!(cluster.attempts().is_empty());

    let err = task.put(orders("orders", 1..2)).await.unwrap_err();
    assert!(matches!(err, ConnectError::TaskFailed(_)));
}

#[tokio::test]
async fn test_schema_mismatch_fails_task() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut task = start(&config(), &cluster).await;

    let value = StructValue::builder()
        .field("id", 1_i64)
        .field("amount", 2.0)
        .field("coupon", "SAVE10")
        .build()
        .unwrap();
    let err = task
        .put(vec![Record::new("orders", 0, 0, value)])
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Schema);
    assert!(task.watermarks().is_empty());
}

fn keyed_order(offset: u64, key: StructValue) -> Record {
    order("orders", 0, offset).with_key(key)
}

#[tokio::test]
async fn test_key_fields_ignored_without_key_insert() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut task = start(&config(), &cluster).await;

    let key = StructValue::builder().field("region", "eu").build().unwrap();
    task.put(vec![keyed_order(0, key)]).await.unwrap();
    task.flush().await.unwrap();

    let rows = cluster.rows("orders");
    assert_eq!(rows.len(), 1);
    assert!(cell(&rows[0], "region").is_none());
}

#[tokio::test]
async fn test_key_insert_merges_key_and_value_wins() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut config = config();
    config.key_insert = true;
    let mut task = start(&config, &cluster).await;

    let key = StructValue::builder()
        .field("id", 99_i64)
        .field("region", "eu")
        .build()
        .unwrap();
    task.put(vec![keyed_order(5, key)]).await.unwrap();
    task.flush().await.unwrap();

    let rows = cluster.rows("orders");
    assert_eq!(rows.len(), 1);
    assert_eq!(cell(&rows[0], "id"), Some(&Value::Int64(5)));
    assert_eq!(cell(&rows[0], "region"), Some(&Value::String("eu".into())));
}

#[tokio::test(start_paused = true)]
async fn test_watermark_waits_for_earliest_batch() {
    let cluster = MemoryCluster::new()
        .with_table(orders_table("slow"))
        .with_table(orders_table("fast"));
    cluster.add_fault_rule(|m, seen| {
        (m.table() == "slow" && seen == 1).then(|| Fault::transient("leader election"))
    });

    let mut config = config();
    config.table_field = Some("region".into());
    config.batch_max_rows = 1;
    config.retry_backoff_ms = 1000;
    let mut task = start(&config, &cluster).await;

    let record = |offset: u64, table: &str| {
        let value = StructValue::builder()
            .field("id", offset as i64)
            .field("amount", 1.0)
            .field("region", table)
            .build()
            .unwrap();
        Record::new("events", 0, offset, value)
    };
    task.put(vec![record(0, "slow"), record(1, "fast"), record(2, "fast")])
        .await
        .unwrap();

    // the later batches are durable, the first one is still backing off
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.row_count("fast"), 2);
    assert_eq!(cluster.row_count("slow"), 0);
    let partition = TopicPartition::new("events", 0);
    assert_eq!(task.offsets().watermark(&partition), None);

    let offsets = task.flush().await.unwrap();
    assert_eq!(offsets[&partition], 3);
    assert_eq!(cluster.row_count("slow"), 1);
}

#[tokio::test]
async fn test_rejected_row_fails_task_by_default() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut config = config();
    config.operation = OperationKind::Insert;
    let mut task = start(&config, &cluster).await;

    task.put(orders("orders", 0..2)).await.unwrap();
    task.flush().await.unwrap();

    // same keys again: insert rejects them
    let mut redelivered = orders("orders", 0..1);
    redelivered[0].offset = 2;
    task.put(redelivered).await.unwrap();
    let err = task.flush().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NonRetryable);
    assert_eq!(task.watermarks()[&TopicPartition::new("orders", 0)], 1);
    assert_eq!(task.stats().batches_retried, 0);
}

#[tokio::test]
async fn test_skip_policy_drops_rejected_rows() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    cluster.add_fault_rule(|m, _| {
        (m.source().offset == 1).then(|| Fault::non_retryable("row violates constraint"))
    });
    let mut config = config();
    config.row_error_policy = RowErrorPolicy::Skip;
    let mut task = start(&config, &cluster).await;

    task.put(orders("orders", 0..3)).await.unwrap();
    let offsets = task.flush().await.unwrap();

    assert_eq!(cluster.row_count("orders"), 2);
    assert_eq!(offsets[&TopicPartition::new("orders", 0)], 3);
    let stats = task.stats();
    assert_eq!(stats.records_dropped, 1);
    assert_eq!(stats.rows_written, 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_aborts_after_deadline() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let mut config = config();
    config.shutdown_timeout_ms = 1000;
    let mut task = start(&config, &cluster).await;

    task.put(orders("orders", 0..2)).await.unwrap();
    task.flush().await.unwrap();

    cluster.add_fault_rule(|_, _| Some(Fault::transient("tablet unavailable")));
    task.put(orders("orders", 2..4)).await.unwrap();

    let report = task.close().await;
    assert_eq!(report.aborted, 1);
    assert_eq!(report.drained, 0);
    assert!(report.failure.is_none());
    // nothing of the aborted batch is committed
    assert_eq!(report.commit_offsets[&TopicPartition::new("orders", 0)], 2);
}

#[tokio::test]
async fn test_close_drains_open_batches() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    let task_config = config();
    let mut task = start(&task_config, &cluster).await;

    task.put(orders("orders", 0..4)).await.unwrap();
    assert_eq!(cluster.row_count("orders"), 0);

    let report = task.close().await;
    assert_eq!(report.drained, 1);
    assert_eq!(cluster.row_count("orders"), 4);
    assert_eq!(report.commit_offsets[&TopicPartition::new("orders", 0)], 4);
}

#[tokio::test(start_paused = true)]
async fn test_put_waits_for_free_in_flight_slot() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    cluster.set_latency(Duration::from_millis(500));
    let mut config = config();
    config.batch_max_rows = 1;
    let mut task = start(&config, &cluster).await;

    let started = tokio::time::Instant::now();
    task.put(orders("orders", 0..6)).await.unwrap();

    // two writers: the last two batches wait for the second round of writes
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(cluster.row_count("orders"), 4);
    assert_eq!(task.in_flight(), 2);
    assert!(cluster.peak_concurrency() <= 2);

    let offsets = task.flush().await.unwrap();
    assert_eq!(cluster.row_count("orders"), 6);
    assert_eq!(offsets[&TopicPartition::new("orders", 0)], 6);
}

#[tokio::test(start_paused = true)]
async fn test_no_write_lands_after_close() {
    let cluster = MemoryCluster::new().with_table(orders_table("orders"));
    cluster.set_latency(Duration::from_secs(5));
    let mut config = config();
    config.shutdown_timeout_ms = 1000;
    let mut task = start(&config, &cluster).await;

    task.put(orders("orders", 0..2)).await.unwrap();
    let report = task.close().await;
    assert_eq!(report.aborted, 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cluster.row_count("orders"), 0);
    assert!(cluster.attempts().is_empty());
    assert!(report.commit_offsets.is_empty());
}
