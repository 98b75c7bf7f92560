//! Cache and Buffer Layer Integration Tests
//!
//! Tests buffering, eviction, flush and shutdown against a recording driver

mod common;

use common::{RecordingDriver, overrides};
use kvlayer::{CacheAndBufferLayer, KvError, Operation};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn layer(driver: &Arc<RecordingDriver>, cache_capacity: usize, write_interval_ms: u64) -> CacheAndBufferLayer {
    CacheAndBufferLayer::new(driver.clone(), overrides(cache_capacity, write_interval_ms))
}

#[tokio::test]
async fn test_read_your_write_buffered() {
    // Test: an unflushed write is visible to the next read
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 100, 1000);

    let _ack = layer.set("pad:1", Some(json!({"text": "hello"}))).await.unwrap();
    assert_eq!(
        layer.get("pad:1").await.unwrap(),
        Some(json!({"text": "hello"}))
    );
    assert_eq!(driver.get_count(), 0);
    assert_eq!(driver.raw("pad:1"), None);
}

#[tokio::test]
async fn test_read_your_write_unbuffered() {
    // Test: with buffering off the write reaches the driver before set returns
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 100, 0);

    let ack = layer.set("pad:1", Some(json!([1, 2, 3]))).await.unwrap();
    assert!(ack.is_persisted());
    assert_eq!(driver.raw("pad:1"), Some("[1,2,3]".to_string()));
    assert_eq!(layer.get("pad:1").await.unwrap(), Some(json!([1, 2, 3])));
    assert_eq!(driver.bulk_count(), 0);

    // Same without a read cache
    let uncached = self::layer(&driver, 0, 0);
    let _ = uncached.set("pad:2", Some(json!("x"))).await.unwrap();
    assert_eq!(uncached.get("pad:2").await.unwrap(), Some(json!("x")));
    assert!(uncached.is_empty());
}

#[tokio::test]
async fn test_absent_key_is_cached() {
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 100, 1000);

    assert_eq!(layer.get("missing").await.unwrap(), None);
    assert_eq!(layer.get("missing").await.unwrap(), None);
    assert_eq!(driver.get_count(), 1);

    let stats = layer.stats();
    assert_eq!(stats.reads, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.driver_reads, 1);
}

#[tokio::test]
async fn test_eviction_respects_dirtiness() {
    // Test: dirty entries survive eviction even past capacity
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 4, 1000);

    for i in 0..10 {
        let _ack = layer.set(&format!("k{}", i), Some(json!(i))).await.unwrap();
    }
    assert_eq!(layer.len(), 10);
    assert_eq!(layer.stats().evictions, 0);
    for i in 0..10 {
        assert!(layer.entry_state(&format!("k{}", i)).unwrap().dirty);
    }

    // Once clean, the buffer shrinks to half capacity
    assert_eq!(layer.flush().await, 10);
    assert_eq!(layer.len(), 2);
    assert!(layer.entry_state("k9").is_some());
    assert!(layer.entry_state("k8").is_some());
}

#[tokio::test]
async fn test_eviction_skips_in_flight_entries() {
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 4, 1000);

    let _a = layer.set("a", Some(json!(1))).await.unwrap();
    let _b = layer.set("b", Some(json!(2))).await.unwrap();

    driver.close_gate();
    let flush = tokio::spawn({
        let layer = layer.clone();
        async move { layer.flush().await }
    });
    driver.bulk_started().await;

    // Reads of other keys push the buffer over capacity during the flush
    for i in 0..8 {
        driver.put_raw(&format!("r{}", i), "0");
        layer.get(&format!("r{}", i)).await.unwrap();
    }
    assert!(layer.entry_state("a").unwrap().write_in_flight);
    assert!(layer.entry_state("b").unwrap().write_in_flight);
    assert!(layer.stats().evictions > 0);

    driver.open_gate();
    assert_eq!(flush.await.unwrap(), 2);
    assert!(!layer.entry_state("a").is_some_and(|s| s.write_in_flight));
}

#[tokio::test]
async fn test_capacity_convergence() {
    // Test: reading more clean keys than capacity keeps the buffer bounded
    let driver = RecordingDriver::new();
    for i in 0..25 {
        driver.put_raw(&format!("k{}", i), &i.to_string());
    }
    let layer = layer(&driver, 10, 1000);

    for i in 0..25 {
        layer.get(&format!("k{}", i)).await.unwrap();
        assert!(layer.len() <= 10);
    }
    assert_eq!(layer.len(), 5);

    // Survivors are the most recently touched keys
    for i in 20..25 {
        assert!(layer.entry_state(&format!("k{}", i)).is_some());
    }
}

#[tokio::test]
async fn test_flush_without_dirty_entries() {
    // Test: a no-op flush does not call the driver and releases shutdown waiters
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 1000);
    driver.put_raw("k", "1");
    layer.get("k").await.unwrap();

    assert_eq!(layer.flush().await, 0);
    assert_eq!(driver.bulk_count(), 0);

    tokio::time::timeout(Duration::from_secs(1), layer.do_shutdown())
        .await
        .unwrap();
    assert_eq!(driver.bulk_count(), 0);
}

#[tokio::test]
async fn test_flush_takes_a_snapshot() {
    // Test: writes accepted during a flush go into the next one
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 1000);

    let first = layer.set("a", Some(json!(1))).await.unwrap();

    driver.close_gate();
    let flush = tokio::spawn({
        let layer = layer.clone();
        async move { layer.flush().await }
    });
    driver.bulk_started().await;

    // Overlapping flushes are skipped
    assert_eq!(layer.flush().await, 0);

    let second = layer.set("a", Some(json!(2))).await.unwrap();
    let other = layer.set("b", Some(json!(3))).await.unwrap();
    let state = layer.entry_state("a").unwrap();
    assert!(state.dirty && state.write_in_flight);

    driver.open_gate();
    assert_eq!(flush.await.unwrap(), 1);
    first.persisted().await.unwrap();
    assert_eq!(driver.raw("a"), Some("1".to_string()));
    assert!(layer.entry_state("a").unwrap().dirty);

    assert_eq!(layer.flush().await, 2);
    second.persisted().await.unwrap();
    other.persisted().await.unwrap();
    assert_eq!(driver.raw("a"), Some("2".to_string()));

    let bulks = driver.bulks();
    assert_eq!(bulks.len(), 2);
    assert_eq!(
        bulks[0],
        vec![Operation::Set {
            key: "a".to_string(),
            value: "1".to_string()
        }]
    );
}

#[tokio::test]
async fn test_failed_flush_reaches_every_ack() {
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 1000);
    driver.fail_writes(true);

    let a = layer.set("a", Some(json!(1))).await.unwrap();
    let b = layer.remove("b").await.unwrap();
    layer.flush().await;

    let expected = Err(KvError::Driver("injected write failure".to_string()));
    assert_eq!(a.persisted().await, expected);
    assert_eq!(b.persisted().await, expected);

    // Failed writes are not retried on their own
    let state = layer.entry_state("a").unwrap();
    assert!(!state.dirty && !state.write_in_flight);
    assert_eq!(layer.flush().await, 0);
    assert_eq!(layer.stats().flush_failures, 1);

    // Reads are still served from the buffer
    assert_eq!(layer.get("a").await.unwrap(), Some(json!(1)));

    // Resubmitting after recovery persists the value
    driver.fail_writes(false);
    let retry = layer.set("a", Some(json!(1))).await.unwrap();
    layer.flush().await;
    retry.persisted().await.unwrap();
    assert_eq!(driver.raw("a"), Some("1".to_string()));
}

#[tokio::test]
async fn test_shutdown_drains_fully() {
    // Test: do_shutdown waits for a flush cycle that leaves nothing dirty
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 20);
    layer.init().await.unwrap();

    for key in ["a", "b", "c"] {
        let _ack = layer.set(key, Some(json!(key))).await.unwrap();
    }

    driver.close_gate();
    driver.bulk_started().await;

    let shutdown = tokio::spawn({
        let layer = layer.clone();
        async move { layer.do_shutdown().await }
    });

    // A write arriving mid-flush keeps the buffer from draining
    let _late = layer.set("d", Some(json!("d"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!shutdown.is_finished());

    driver.open_gate();
    tokio::time::timeout(Duration::from_secs(2), shutdown)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(layer.stats().dirty_entries, 0);
    for key in ["a", "b", "c", "d"] {
        assert!(driver.raw(key).is_some(), "{} was not flushed", key);
    }
    assert!(driver.bulk_count() >= 2);
}

#[test]
fn test_shutdown_without_timer_flushes_itself() {
    // Test: a layer built outside a runtime has no flush task until init
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 10);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let ack = layer.set("k", Some(json!(true))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), layer.do_shutdown())
            .await
            .unwrap();

        ack.persisted().await.unwrap();
    });
    assert_eq!(driver.raw("k"), Some("true".to_string()));
}

#[tokio::test]
async fn test_shutdown_does_not_wait_for_the_next_tick() {
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 60_000);

    let ack = layer.set("k", Some(json!(1))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), layer.do_shutdown())
        .await
        .unwrap();
    ack.persisted().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_on_interval() {
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 100);
    layer.init().await.unwrap();

    let ack = layer.set("k", Some(json!(1))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.bulk_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.bulk_count(), 1);
    ack.persisted().await.unwrap();

    // Idle ticks do not reach the driver
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(driver.bulk_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_least_recently_touched_is_evicted() {
    // Test: capacity 2, three writes flushed by the timer, oldest key falls out
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 2, 100);
    layer.init().await.unwrap();

    let _a = layer.set("a", Some(json!({"x": 1}))).await.unwrap();
    let _b = layer.set("b", Some(json!({"x": 2}))).await.unwrap();
    let _c = layer.set("c", Some(json!({"x": 3}))).await.unwrap();
    assert_eq!(layer.len(), 3);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(driver.bulk_count(), 1);
    assert!(layer.entry_state("a").is_none());
    assert!(layer.entry_state("b").is_none());
    assert!(layer.entry_state("c").is_some());

    // The most recent write is still served from the cache
    assert_eq!(layer.get("c").await.unwrap(), Some(json!({"x": 3})));
    assert_eq!(driver.get_count(), 0);
    assert_eq!(layer.get("a").await.unwrap(), Some(json!({"x": 1})));
    assert_eq!(driver.get_count(), 1);
}

#[tokio::test]
async fn test_find_keys_passes_through() {
    let driver = RecordingDriver::new();
    for key in ["pad:1", "pad:1:revs:0", "pad:2", "author:1"] {
        driver.put_raw(key, "null");
    }
    let layer = layer(&driver, 10, 1000);

    let mut keys = layer.find_keys("pad:*", Some("pad:*:*")).await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["pad:1".to_string(), "pad:2".to_string()]);
}

#[tokio::test]
async fn test_close_drains_and_rejects() {
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 10, 50);
    layer.init().await.unwrap();

    let ack = layer.set("k", Some(json!("v"))).await.unwrap();
    layer.close().await.unwrap();

    ack.persisted().await.unwrap();
    assert_eq!(driver.raw("k"), Some("\"v\"".to_string()));
    assert_eq!(layer.get("k").await.unwrap_err(), KvError::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_writers_loses_nothing() {
    // Test: every write accepted while close runs is flushed before the driver closes
    let driver = RecordingDriver::new();
    let layer = layer(&driver, 1000, 1000);

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let layer = layer.clone();
            tokio::spawn(async move {
                let mut acks = Vec::new();
                for i in 0..200 {
                    match layer.set(&format!("w{}:{}", w, i), Some(json!(i))).await {
                        Ok(ack) => acks.push(ack),
                        Err(e) => {
                            assert_eq!(e, KvError::Closed);
                            break;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                acks
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(2)).await;
    layer.close().await.unwrap();

    for writer in writers {
        for ack in writer.await.unwrap() {
            tokio::time::timeout(Duration::from_secs(2), ack.persisted())
                .await
                .expect("accepted write was never flushed")
                .unwrap();
        }
    }
    assert_eq!(layer.stats().dirty_entries, 0);
}
