mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use latency_indexer::agent::{self, RefreshKinds};
use latency_indexer::latency::LatencyKind;
use latency_indexer::refresh::RefreshError;
use latency_indexer::serviceability::Topology;

use common::{
    final_values, forward, links_topology, metro, refresh_config, Harness, INTERVAL_US, START_US,
};

#[tokio::test]
async fn test_end_to_end_incremental_refresh() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let circuit = forward("l1");
    let cancel = CancellationToken::new();

    h.telemetry.push_device(&circuit, 100, &[5000, 6000, 7000]);

    let first = h
        .refresher
        .refresh_device_link(&cancel)
        .await
        .expect("first cycle");
    assert_eq!(first.circuits, 2);
    assert_eq!(first.fetches, 4, "two directions over epochs 100 and 99");
    assert_eq!(first.samples, 3);
    assert_eq!(first.failed_fetches, 0);
    assert!(!first.cancelled);

    let rows = h.backend().rows_final(LatencyKind::DeviceLink);
    assert_eq!(rows.len(), 3);
    let ipdv: Vec<Option<u32>> = rows.iter().map(|r| r.ipdv_us).collect();
    assert_eq!(ipdv, vec![None, Some(1000), Some(1000)]);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.sample_index, i as u32);
        assert_eq!(row.epoch, 100);
        assert_eq!(
            row.event_ts.timestamp_micros(),
            (START_US + i as u64 * INTERVAL_US) as i64
        );
        assert!(!row.is_loss);
    }
    let before = rows;

    h.telemetry.push_device(&circuit, 100, &[8000, 9000]);

    let second = h
        .refresher
        .refresh_device_link(&cancel)
        .await
        .expect("second cycle");
    assert_eq!(second.samples, 2);

    let rows = h.backend().rows_final(LatencyKind::DeviceLink);
    assert_eq!(rows.len(), 5);
    assert_eq!(&rows[..3], &before[..], "earlier rows are never rewritten");
    assert_eq!(rows[3].sample_index, 3);
    assert_eq!(rows[3].ipdv_us, Some(1000));
    assert_eq!(rows[4].sample_index, 4);
    assert_eq!(rows[4].ipdv_us, Some(1000));
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 5);
}

#[tokio::test]
async fn test_cycle_without_new_samples_writes_nothing() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000]);

    h.refresher.refresh_device_link(&cancel).await.expect("first");
    let outcome = h.refresher.refresh_device_link(&cancel).await.expect("second");

    assert_eq!(outcome.samples, 0);
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 1);
}

#[tokio::test]
async fn test_high_water_mark_failure_aborts_cycle() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000, 6000]);
    h.refresher.refresh_device_link(&cancel).await.expect("seed");
    let calls = h.telemetry.calls();

    h.telemetry.push_device(&forward("l1"), 100, &[7000]);
    h.backend().fail_table(LatencyKind::DeviceLink);

    let result = h.refresher.refresh_device_link(&cancel).await;
    assert!(matches!(result, Err(RefreshError::HighWaterMarks(_))));
    assert_eq!(h.telemetry.calls(), calls, "no remote call after a failed mark query");

    h.backend().restore_table(LatencyKind::DeviceLink);
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 2);
}

#[tokio::test]
async fn test_epoch_and_topology_failures_are_fatal() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000]);

    h.epochs.set_failing(true);
    let result = h.refresher.refresh_device_link(&cancel).await;
    assert!(matches!(result, Err(RefreshError::Epoch(_))));

    h.epochs.set_failing(false);
    h.topology.set_failing(true);
    let result = h.refresher.refresh_device_link(&cancel).await;
    assert!(matches!(result, Err(RefreshError::Topology(_))));

    assert_eq!(h.telemetry.calls(), 0);
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 0);
}

#[tokio::test]
async fn test_append_failure_surfaces_and_next_cycle_recovers() {
    let h = Harness::new(100, links_topology(&["l1"]));
    h.telemetry.push_device(&forward("l1"), 100, &[5000, 6000]);
    h.telemetry.set_delay(Duration::from_millis(200));

    let refresher = Arc::clone(&h.refresher);
    let cycle = tokio::spawn(async move {
        refresher
            .refresh_device_link(&CancellationToken::new())
            .await
    });

    // Marks are loaded before the first fetch starts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.backend().fail_table(LatencyKind::DeviceLink);

    let result = cycle.await.expect("join");
    assert!(matches!(result, Err(RefreshError::Append(_))));

    h.backend().restore_table(LatencyKind::DeviceLink);
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 0);

    let outcome = h
        .refresher
        .refresh_device_link(&CancellationToken::new())
        .await
        .expect("retry");
    assert_eq!(outcome.samples, 2);
}

#[tokio::test]
async fn test_failing_circuits_do_not_fail_cycle() {
    let h = Harness::new(100, links_topology(&["l1", "l2"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000]);
    h.telemetry.push_device(&forward("l2"), 100, &[6000, 6100]);
    h.telemetry.fail_link("l1");

    let outcome = h.refresher.refresh_device_link(&cancel).await.expect("cycle");

    assert_eq!(outcome.circuits, 4);
    assert_eq!(outcome.fetches, 8);
    assert_eq!(outcome.failed_fetches, 4);
    assert_eq!(outcome.samples, 2);

    let rows = h.backend().rows_final(LatencyKind::DeviceLink);
    assert!(rows.iter().all(|r| r.key[2] == "l2"));
}

#[tokio::test]
async fn test_not_found_everywhere_is_empty_success() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();

    let outcome = h.refresher.refresh_device_link(&cancel).await.expect("cycle");

    assert_eq!(outcome.fetches, 4);
    assert_eq!(outcome.samples, 0);
    assert_eq!(outcome.failed_fetches, 0);
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 0);
}

#[tokio::test]
async fn test_genesis_epoch_only_fetches_epoch_zero() {
    let h = Harness::new(0, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 0, &[5000]);

    let outcome = h.refresher.refresh_device_link(&cancel).await.expect("cycle");

    assert_eq!(outcome.fetches, 2);
    assert_eq!(outcome.samples, 1);
}

#[tokio::test]
async fn test_previous_epoch_tail_is_picked_up_after_rollover() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    let circuit = forward("l1");
    h.telemetry.push_device(&circuit, 100, &[5000, 5100]);
    h.refresher.refresh_device_link(&cancel).await.expect("first");

    // Late samples land in epoch 100 after the oracle moved on.
    h.telemetry.push_device(&circuit, 100, &[5200]);
    h.telemetry.push_device(&circuit, 101, &[5300]);
    h.epochs.set_epoch(101);

    let outcome = h.refresher.refresh_device_link(&cancel).await.expect("second");
    assert_eq!(outcome.samples, 2);

    let rows = h.backend().rows_final(LatencyKind::DeviceLink);
    let keys: Vec<(u64, u32, Option<u32>)> = rows
        .iter()
        .map(|r| (r.epoch, r.sample_index, r.ipdv_us))
        .collect();
    assert_eq!(
        keys,
        vec![
            (100, 0, None),
            (100, 1, Some(100)),
            (100, 2, Some(100)),
            (101, 0, Some(100)),
        ]
    );
}

#[tokio::test]
async fn test_cancellation_keeps_collected_samples() {
    let mut cfg = refresh_config();
    cfg.max_concurrency = 1;
    let h = Harness::with_config(100, links_topology(&["l1"]), cfg);
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000, 6000, 7000]);
    h.telemetry.cancel_on_call(1, cancel.clone());

    let outcome = h.refresher.refresh_device_link(&cancel).await.expect("cycle");

    assert!(outcome.cancelled);
    assert_eq!(outcome.fetches, 1);
    assert_eq!(outcome.samples, 3);
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 3);
}

#[tokio::test]
async fn test_cancelled_before_start_launches_nothing() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000]);
    cancel.cancel();

    let outcome = h.refresher.refresh_device_link(&cancel).await.expect("cycle");

    assert!(outcome.cancelled);
    assert_eq!(outcome.fetches, 0);
    assert_eq!(h.telemetry.calls(), 0);
}

#[tokio::test]
async fn test_internet_metro_refresh_is_incremental() {
    let mut topology = Topology::default();
    topology.metros = vec![metro("m-nyc", "nyc"), metro("m-ams", "ams")];
    let h = Harness::new(100, topology);
    let cancel = CancellationToken::new();

    h.telemetry.push_internet("m-ams", "m-nyc", 100, &[80_000, 0, 82_000]);

    let first = h
        .refresher
        .refresh_internet_metro(&cancel)
        .await
        .expect("first cycle");
    assert_eq!(first.circuits, 1);
    assert_eq!(first.fetches, 2);
    assert_eq!(first.samples, 3);

    h.telemetry.push_internet("m-ams", "m-nyc", 100, &[81_000]);
    let second = h
        .refresher
        .refresh_internet_metro(&cancel)
        .await
        .expect("second cycle");
    assert_eq!(second.samples, 1);

    let rows = h.backend().rows_final(LatencyKind::InternetMetro);
    let got: Vec<(u32, u32, Option<u32>)> = rows
        .iter()
        .map(|r| (r.sample_index, r.rtt_us, r.ipdv_us))
        .collect();
    assert_eq!(
        got,
        vec![
            (0, 80_000, None),
            (1, 0, None),
            (2, 82_000, Some(2000)),
            (3, 81_000, Some(1000)),
        ]
    );
    assert!(rows.iter().all(|r| !r.is_loss));
    assert_eq!(
        rows[0].key,
        [
            "m-ams".to_string(),
            "m-nyc".to_string(),
            common::PROVIDER.to_string()
        ]
    );
    assert_eq!(h.backend().physical_row_count(LatencyKind::InternetMetro), 4);
}

#[tokio::test]
async fn test_internet_metro_single_metro_has_no_circuits() {
    let mut topology = Topology::default();
    topology.metros = vec![metro("m-ams", "ams")];
    let h = Harness::new(100, topology);

    let outcome = h
        .refresher
        .refresh_internet_metro(&CancellationToken::new())
        .await
        .expect("cycle");

    assert_eq!(outcome.circuits, 0);
    assert_eq!(outcome.fetches, 0);
    assert_eq!(h.telemetry.calls(), 0);
}

#[tokio::test]
async fn test_backfill_repeated_converges_to_single_run() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000, 0, 6000, 5500]);

    h.refresher.refresh_device_link(&cancel).await.expect("refresh");
    let expected = final_values(h.backend(), LatencyKind::DeviceLink);

    for _ in 0..3 {
        let outcome = h
            .refresher
            .backfill_device_link(100, &cancel)
            .await
            .expect("backfill");
        assert_eq!(outcome.samples, 4);
        assert_eq!(outcome.fetches, 2, "backfill covers only the requested epoch");
    }
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 16);

    h.refresher
        .store()
        .optimize_final(LatencyKind::DeviceLink)
        .await
        .expect("optimize");

    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 4);
    assert_eq!(final_values(h.backend(), LatencyKind::DeviceLink), expected);
}

#[tokio::test]
async fn test_concurrent_backfills_converge() {
    let h = Harness::new(100, links_topology(&["l1", "l2"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000, 6000, 7000]);
    h.telemetry.push_device(&forward("l2").reversed(), 100, &[100, 0, 300]);
    h.telemetry.set_delay(Duration::from_millis(2));

    let runs = (0..4).map(|_| {
        let refresher = Arc::clone(&h.refresher);
        let cancel = cancel.clone();
        tokio::spawn(async move { refresher.backfill_device_link(100, &cancel).await })
    });
    for run in runs.collect::<Vec<_>>() {
        let outcome = run.await.expect("join").expect("backfill");
        assert_eq!(outcome.samples, 6);
    }

    h.refresher
        .store()
        .optimize_final(LatencyKind::DeviceLink)
        .await
        .expect("optimize");

    let rows = h.backend().rows_final(LatencyKind::DeviceLink);
    assert_eq!(rows.len(), 6);
    let l2: Vec<Option<u32>> = rows
        .iter()
        .filter(|r| r.key[2] == "l2")
        .map(|r| r.ipdv_us)
        .collect();
    assert_eq!(l2, vec![None, None, Some(200)]);
}

#[tokio::test]
async fn test_refresh_and_backfill_run_concurrently() {
    let h = Harness::new(100, links_topology(&["l1"]));
    let cancel = CancellationToken::new();
    h.telemetry.push_device(&forward("l1"), 100, &[5000, 6000, 7000]);
    h.telemetry.push_device(&forward("l1"), 99, &[4000, 4100]);
    h.telemetry.set_delay(Duration::from_millis(1));

    let (refresh, backfill) = tokio::join!(
        h.refresher.refresh_device_link(&cancel),
        h.refresher.backfill_device_link(99, &cancel),
    );
    refresh.expect("refresh");
    backfill.expect("backfill");

    let rows = h.backend().rows_final(LatencyKind::DeviceLink);
    let got: Vec<(u64, u32, u32)> = rows
        .iter()
        .map(|r| (r.epoch, r.sample_index, r.rtt_us))
        .collect();
    assert_eq!(
        got,
        vec![
            (99, 0, 4000),
            (99, 1, 4100),
            (100, 0, 5000),
            (100, 1, 6000),
            (100, 2, 7000),
        ]
    );
}

#[tokio::test]
async fn test_refresh_once_runs_enabled_kinds() {
    let mut topology = links_topology(&["l1"]);
    topology.metros = vec![metro("m-ams", "ams"), metro("m-nyc", "nyc")];
    let h = Harness::new(100, topology);
    h.telemetry.push_device(&forward("l1"), 100, &[5000]);
    h.telemetry.push_internet("m-ams", "m-nyc", 100, &[70_000]);

    let cancel = CancellationToken::new();
    agent::refresh_once(
        &h.refresher,
        RefreshKinds {
            device_link: true,
            internet_metro: false,
        },
        &cancel,
    )
    .await;
    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 1);
    assert_eq!(h.backend().physical_row_count(LatencyKind::InternetMetro), 0);

    h.epochs.set_failing(true);
    agent::refresh_once(
        &h.refresher,
        RefreshKinds {
            device_link: true,
            internet_metro: true,
        },
        &cancel,
    )
    .await;
    assert_eq!(h.backend().physical_row_count(LatencyKind::InternetMetro), 0);

    h.epochs.set_failing(false);
    agent::refresh_once(
        &h.refresher,
        RefreshKinds {
            device_link: true,
            internet_metro: true,
        },
        &cancel,
    )
    .await;
    assert_eq!(h.backend().physical_row_count(LatencyKind::InternetMetro), 1);
}

#[tokio::test]
async fn test_refresh_loop_stops_on_cancel() {
    let h = Harness::new(100, links_topology(&["l1"]));
    h.telemetry.push_device(&forward("l1"), 100, &[5000, 6000]);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(agent::run_refresh_loop(
        Arc::clone(&h.refresher),
        Duration::from_millis(10),
        RefreshKinds {
            device_link: true,
            internet_metro: false,
        },
        cancel.clone(),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.backend().physical_row_count(LatencyKind::DeviceLink) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first tick appends");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("loop exits")
        .expect("join");

    assert_eq!(h.backend().physical_row_count(LatencyKind::DeviceLink), 2);
}

#[tokio::test]
async fn test_internet_metro_backfill_is_idempotent() {
    let mut topology = Topology::default();
    topology.metros = vec![metro("m-ams", "ams"), metro("m-nyc", "nyc"), metro("m-sin", "sin")];
    let h = Harness::new(120, topology);
    let cancel = CancellationToken::new();
    h.telemetry.push_internet("m-ams", "m-sin", 90, &[150_000, 151_000]);
    h.telemetry.push_internet("m-nyc", "m-sin", 90, &[210_000]);

    for _ in 0..2 {
        let outcome = h
            .refresher
            .backfill_internet_metro(90, &cancel)
            .await
            .expect("backfill");
        assert_eq!(outcome.circuits, 3);
        assert_eq!(outcome.fetches, 3);
        assert_eq!(outcome.samples, 3);
    }

    h.refresher
        .store()
        .optimize_final(LatencyKind::InternetMetro)
        .await
        .expect("optimize");

    let rows = h.backend().rows_final(LatencyKind::InternetMetro);
    let got: Vec<(String, String, u32, Option<u32>)> = rows
        .iter()
        .map(|r| (r.key[0].clone(), r.key[1].clone(), r.sample_index, r.ipdv_us))
        .collect();
    assert_eq!(
        got,
        vec![
            ("m-ams".to_string(), "m-sin".to_string(), 0, None),
            ("m-ams".to_string(), "m-sin".to_string(), 1, Some(1000)),
            ("m-nyc".to_string(), "m-sin".to_string(), 0, None),
        ]
    );
}
