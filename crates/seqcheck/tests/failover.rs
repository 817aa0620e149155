//! Writer and verifier behaviour across primary loss, lost acknowledgements
//! and replica drift, driven against the in-memory cluster.

mod common;

use std::time::Duration;

use common::{start_writer, stored_sequences, tick_n, tick_until_successes, FAST_TIMEOUTS};
use seqcheck::verifier::DEFAULT_REPLICA_TOLERANCE;
use seqcheck::{
    check_replica_consistency, run_drill, run_writer, sample_replicas, ClusterController,
    ConsistencyVerifier, DrillMode, DrillOptions, MemoryCluster, RunOptions, WriteError,
};

#[tokio::test]
async fn interleaved_writers_keep_independent_sequence_spaces() {
    let cluster = MemoryCluster::new(3);
    let mut a = start_writer(&cluster, "writer-a").await;
    let mut b = start_writer(&cluster, "writer-b").await;
    for _ in 0..20 {
        assert!(a.tick().await.is_success());
        assert!(b.tick().await.is_success());
    }

    let expected = (0..20).collect::<Vec<u64>>();
    assert_eq!(stored_sequences(&cluster, "writer-a"), expected);
    assert_eq!(stored_sequences(&cluster, "writer-b"), expected);

    let verifier = ConsistencyVerifier::new(cluster.primary_view());
    let report = verifier.verify_all(None).await.unwrap();
    assert!(report.passed);
    assert_eq!(report.writers.len(), 2);
    for verdict in &report.writers {
        assert_eq!(verdict.sequences.total_rows, 20);
        assert_eq!(verdict.expected_rows, 20);
        assert!(!verdict.retries.retried());
    }
}

#[tokio::test]
async fn outage_is_absorbed_by_retrying_one_sequence() {
    let cluster = MemoryCluster::new(3);
    let mut writer = start_writer(&cluster, "c1").await;
    tick_n(&mut writer, 5).await;
    assert_eq!(writer.cursor(), 5);

    let old = cluster.current_primary().await.unwrap();
    cluster.delete_primary(&old).await.unwrap();

    let outage = tick_n(&mut writer, 10).await;
    assert!(outage.iter().all(|result| !result.is_success()));
    assert!(outage.iter().all(|result| result.sequence() == 5));
    assert!(outage[1..]
        .iter()
        .all(|result| matches!(result.cause(), Some(WriteError::ConnectionLost(_)))));
    assert_eq!(writer.current_attempt_count(), 10);

    let new = cluster
        .wait_for_new_primary(&old, Duration::from_secs(1))
        .await
        .unwrap()
        .expect("replica promoted");
    assert_ne!(new, old);

    let recovered = tick_until_successes(&mut writer, 10, 20).await;
    assert_eq!(recovered.len(), 10);
    assert_eq!(writer.cursor(), 15);

    let stats = writer.stats();
    assert_eq!(stats.total_attempts, 25);
    assert_eq!(stats.successes, 15);
    assert_eq!(stats.failures, 10);
    assert_eq!(stats.connection_errors, 9);
    assert_eq!(stats.reconnections, 1);

    let row = cluster
        .records("c1")
        .into_iter()
        .find(|record| record.sequence == 5)
        .expect("row 5 stored");
    assert_eq!(row.attempt_count, 11);
    assert_eq!(row.apply_count, 1);
    assert_eq!(row.origin_host.as_deref(), Some(new.0.as_str()));

    let verifier = ConsistencyVerifier::new(cluster.primary_view());
    let verdict = verifier.verify_writer("c1").await.unwrap().expect("rows");
    assert!(verdict.passed());
    assert_eq!(verdict.sequences.total_rows, 15);
    assert_eq!(verdict.retries.max_attempts, 11);
    assert!(verdict.ack_loss_sequences.is_empty());
}

#[tokio::test]
async fn lost_acknowledgements_show_up_as_reapplied_rows() {
    let cluster = MemoryCluster::new(1);
    let mut writer = start_writer(&cluster, "c1").await;
    tick_n(&mut writer, 3).await;

    cluster.lose_acks(1);
    tick_until_successes(&mut writer, 4, 10).await;
    cluster.lose_acks(1);
    tick_until_successes(&mut writer, 2, 10).await;

    let verifier = ConsistencyVerifier::new(cluster.primary_view());
    let report = verifier.verify(Some(&["c1".to_string()]), None).await.unwrap();
    assert!(report.passed, "ack loss never fails verification");
    let verdict = report.writer("c1").expect("c1 verified");
    assert_eq!(verdict.ack_loss_sequences, vec![3, 7]);
    assert_eq!(verdict.retries.rows_with_apply_count_gt1, 2);
    assert_eq!(verdict.retries.max_apply_count, 2);
    assert_eq!(report.ack_loss_rows(), 2);
    assert!(!verdict.has_gaps);
}

#[tokio::test]
async fn deleted_row_is_reported_as_a_gap() {
    let cluster = MemoryCluster::new(1);
    let mut writer = start_writer(&cluster, "c1").await;
    tick_n(&mut writer, 6).await;
    cluster.remove_record("c1", 3);

    let verifier = ConsistencyVerifier::new(cluster.primary_view());
    let report = verifier.verify_all(None).await.unwrap();
    assert!(!report.passed);
    assert!(report.has_gaps());
    assert!(!report.has_duplicates());
    let verdict = report.writer("c1").unwrap();
    assert_eq!(verdict.expected_rows, 6);
    assert_eq!(verdict.missing_sequences, 1);
}

#[tokio::test]
async fn unknown_or_empty_writers_fail_verification() {
    let cluster = MemoryCluster::new(1);
    let verifier = ConsistencyVerifier::new(cluster.primary_view());
    assert!(!verifier.verify_all(None).await.unwrap().passed);

    let mut writer = start_writer(&cluster, "c1").await;
    tick_n(&mut writer, 2).await;
    let report = verifier
        .verify(Some(&["c1".to_string(), "ghost".to_string()]), None)
        .await
        .unwrap();
    assert!(!report.passed);
    assert_eq!(report.missing_writers, vec!["ghost".to_string()]);
}

#[tokio::test]
async fn replica_consistency_requires_every_node_back() {
    let cluster = MemoryCluster::new(3);
    let mut writer = start_writer(&cluster, "c1").await;
    tick_n(&mut writer, 4).await;

    let old = cluster.current_primary().await.unwrap();
    cluster.delete_primary(&old).await.unwrap();
    cluster
        .wait_for_new_primary(&old, Duration::from_secs(1))
        .await
        .unwrap()
        .expect("new primary");
    tick_until_successes(&mut writer, 3, 10).await;

    let degraded = check_replica_consistency(
        sample_replicas(&cluster.replicas()).await,
        DEFAULT_REPLICA_TOLERANCE,
    );
    assert!(!degraded.consistent);
    assert_eq!(
        degraded
            .observations
            .iter()
            .filter(|observation| observation.sample.is_none())
            .count(),
        1
    );

    assert!(cluster
        .wait_for_rollout_complete(Duration::from_secs(1))
        .await
        .unwrap());
    let healed = check_replica_consistency(
        sample_replicas(&cluster.replicas()).await,
        DEFAULT_REPLICA_TOLERANCE,
    );
    assert!(healed.consistent);
    assert_eq!(healed.max_row_diff, 0);
    assert_eq!(healed.max_sequence_diff, 0);
}

#[tokio::test]
async fn write_loop_stops_between_ticks() {
    let cluster = MemoryCluster::new(1);
    let mut writer = start_writer(&cluster, "c1").await;
    let options = RunOptions {
        write_interval: Duration::from_millis(5),
        report_every: 3,
    };
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok::<(), std::io::Error>(())
    };
    let report = run_writer(&mut writer, &options, shutdown).await;
    let final_report = writer.shutdown();

    assert!(report.stats.total_attempts > 0);
    assert_eq!(report.stats.total_attempts, report.stats.successes);
    assert_eq!(final_report.sequence, report.sequence);
    assert_eq!(
        stored_sequences(&cluster, "c1"),
        (0..report.sequence).collect::<Vec<_>>()
    );
}

fn drill_options() -> DrillOptions {
    DrillOptions {
        mode: DrillMode::Failover,
        writer_ids: vec!["drill-a".to_string(), "drill-b".to_string()],
        write_interval: Duration::from_millis(5),
        timeouts: FAST_TIMEOUTS,
        warmup: Duration::from_millis(40),
        failover_timeout: Duration::from_secs(1),
        stabilize: Duration::from_millis(80),
        rollout_timeout: Duration::from_secs(1),
        replica_tolerance: 0,
    }
}

#[tokio::test]
async fn failover_drill_passes_against_memory_cluster() {
    let cluster = MemoryCluster::new(3).with_election_delay(Duration::from_millis(30));
    let report = run_drill(
        &cluster,
        cluster.clone(),
        cluster.primary_view(),
        &cluster.replicas(),
        &drill_options(),
    )
    .await
    .unwrap();

    assert!(report.passed(), "drill failed: {report:?}");
    assert_eq!(report.mode, DrillMode::Failover);
    assert_ne!(report.old_primary, report.new_primary);
    assert!(report.rollout_complete);
    assert_eq!(report.final_reports.len(), 2);
    assert_eq!(report.verification.writers.len(), 2);
    assert!(report
        .disruption_window
        .iter()
        .map(|delta| delta.failures)
        .sum::<u64>()
        > 0);
    for final_report in &report.final_reports {
        let stored = stored_sequences(&cluster, &final_report.writer_id);
        assert_eq!(stored.len() as u64, final_report.sequence);
    }
}

#[tokio::test]
async fn failover_drill_fails_when_no_primary_is_elected() {
    let cluster = MemoryCluster::new(3).with_election_delay(Duration::from_secs(5));
    let options = DrillOptions {
        failover_timeout: Duration::from_millis(20),
        ..drill_options()
    };
    let err = run_drill(
        &cluster,
        cluster.clone(),
        cluster.primary_view(),
        &cluster.replicas(),
        &options,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("no new primary"));
}

#[tokio::test]
async fn rolling_restart_drill_keeps_every_sequence() {
    let cluster = MemoryCluster::new(3).with_restart_delay(Duration::from_millis(20));
    let options = DrillOptions {
        mode: DrillMode::RollingRestart,
        stabilize: Duration::from_millis(40),
        ..drill_options()
    };
    let report = run_drill(
        &cluster,
        cluster.clone(),
        cluster.primary_view(),
        &cluster.replicas(),
        &options,
    )
    .await
    .unwrap();

    assert!(report.passed(), "drill failed: {report:?}");
    assert_eq!(report.mode, DrillMode::RollingRestart);
    assert_eq!(report.old_primary.0, "node-0");
    assert_eq!(report.new_primary.0, "node-1");
    assert!(report.rollout_complete);
    assert!(report.verification.replicas.as_ref().unwrap().consistent);
    assert!(report
        .disruption_window
        .iter()
        .map(|delta| delta.failures)
        .sum::<u64>()
        > 0);

    let verifier = ConsistencyVerifier::new(cluster.primary_view());
    for final_report in &report.final_reports {
        let stored = stored_sequences(&cluster, &final_report.writer_id);
        assert_eq!(stored, (0..final_report.sequence).collect::<Vec<_>>());
        let verdict = verifier
            .verify_writer(&final_report.writer_id)
            .await
            .unwrap()
            .expect("rows stored");
        assert!(!verdict.has_gaps);
        assert!(!verdict.has_duplicates);
        assert!(verdict.retries.max_attempts > 1);
    }
}
