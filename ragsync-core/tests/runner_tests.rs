//! Multi-source runner behaviour under time budgets, dedup and failures

mod common;

use common::{FakeFactory, FakeSource, SlowOracle};
use ragsync_core::{MemoryLedger, MultiSourceRunner, RunOutcome, SourceKind};
use std::sync::Arc;
use std::time::Duration;

fn runner(factory: &Arc<FakeFactory>, ledger: &Arc<MemoryLedger>, sub_batch: usize) -> MultiSourceRunner {
    MultiSourceRunner::new(factory.clone(), ledger.clone(), ledger.clone())
        .with_sub_batch_size(sub_batch)
}

#[tokio::test(start_paused = true)]
async fn test_even_split_scenario() {
    let factory = Arc::new(FakeFactory::new());
    // Every ingested item costs 8 time units
    let ledger = Arc::new(MemoryLedger::new().with_delay(Duration::from_secs(8)));

    let a = factory.add(FakeSource::new("drive", SourceKind::Remote, 10));
    let b = factory.add(FakeSource::new("notes", SourceKind::Local, 24));
    ledger.seed(b.ids().into_iter().skip(4));

    let record = runner(&factory, &ledger, 1)
        .run(&[b.source(), a.source()], Duration::from_secs(100))
        .await;

    let drive = &record.per_source["drive"];
    assert_eq!(drive.processed, 7);
    assert_eq!(drive.skipped, 0);
    assert!(drive.budget_exhausted);

    let notes = &record.per_source["notes"];
    assert_eq!(notes.processed, 4);
    assert_eq!(notes.skipped, 20);
    assert!(notes.error.is_none());

    assert_eq!(record.outcome, RunOutcome::Success);
    assert_eq!(record.total_items_processed, 11);
    assert_eq!(record.total_items_skipped, 20);
    // Remote first, whatever order the caller used
    assert_eq!(record.per_source.keys().next().map(String::as_str), Some("drive"));
}

#[tokio::test(start_paused = true)]
async fn test_overshoot_bounded_by_one_sub_batch() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new().with_delay(Duration::from_secs(4)));
    let sources: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| factory.add(FakeSource::new(name, SourceKind::Local, 50)).source())
        .collect();

    let budget = Duration::from_secs(90);
    let per_source = budget.as_secs_f64() / 3.0;
    let sub_batch_time = 3.0 * 4.0;

    let record = runner(&factory, &ledger, 3).run(&sources, budget).await;
    assert!(!record.per_source.is_empty());
    for (name, stats) in &record.per_source {
        assert!(
            stats.elapsed_secs <= per_source + sub_batch_time,
            "{} ran {}s",
            name,
            stats.elapsed_secs
        );
    }
    assert!(record.duration_secs <= budget.as_secs_f64() + sub_batch_time);
}

#[tokio::test(start_paused = true)]
async fn test_slow_dedup_lookups_respect_the_slice() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let oracle = Arc::new(SlowOracle::new(Duration::from_secs(1)));
    let drive = factory.add(FakeSource::new("drive", SourceKind::Remote, 200).page_size(200));
    let notes = factory.add(FakeSource::new("notes", SourceKind::Local, 5));

    let runner = MultiSourceRunner::new(factory.clone(), oracle.clone(), ledger.clone())
        .with_sub_batch_size(10);
    let record = runner
        .run(&[drive.source(), notes.source()], Duration::from_secs(20))
        .await;

    let stats = &record.per_source["drive"];
    assert!(stats.budget_exhausted);
    assert!(!stats.caught_up);
    assert!(stats.elapsed_secs <= 10.0 + 1.0, "drive ran {}s", stats.elapsed_secs);

    // The second source still gets its turn
    let notes_stats = &record.per_source["notes"];
    assert_eq!(notes_stats.processed, 5);
    assert!(record.duration_secs <= 20.0 + 1.0);
    assert!(oracle.lookups.load(std::sync::atomic::Ordering::SeqCst) < 200);
}

#[tokio::test(start_paused = true)]
async fn test_huge_budget_does_not_overflow() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let notes = factory.add(FakeSource::new("notes", SourceKind::Local, 3));

    let record = runner(&factory, &ledger, 10)
        .run(&[notes.source()], Duration::MAX)
        .await;
    assert_eq!(record.total_items_processed, 3);
    assert_eq!(record.outcome, RunOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_sources_past_run_budget_are_absent() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new().with_delay(Duration::from_secs(20)));
    let slow = factory.add(FakeSource::new("slow", SourceKind::Remote, 5));
    let late = factory.add(FakeSource::new("late", SourceKind::Local, 5));

    let record = runner(&factory, &ledger, 1)
        .run(&[slow.source(), late.source()], Duration::from_secs(10))
        .await;

    assert_eq!(record.per_source.len(), 1);
    assert!(record.per_source.contains_key("slow"));
    assert_eq!(late.discover_calls(), 0);
    // Deferred sources are not failures
    assert_eq!(record.outcome, RunOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_processes_nothing() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let drive = factory.add(FakeSource::new("drive", SourceKind::Remote, 30).page_size(10));
    let notes = factory.add(FakeSource::new("notes", SourceKind::Local, 12));
    let sources = vec![drive.source(), notes.source()];
    let runner = runner(&factory, &ledger, 10);

    let first = runner.run(&sources, Duration::from_secs(600)).await;
    assert_eq!(first.total_items_processed, 42);

    let second = runner.run(&sources, Duration::from_secs(600)).await;
    for stats in second.per_source.values() {
        assert_eq!(stats.processed, 0);
        assert!(stats.caught_up);
    }
    assert_eq!(second.outcome, RunOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_caught_up_stops_after_one_page() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let drive = factory.add(FakeSource::new("drive", SourceKind::Remote, 250).page_size(100));
    ledger.seed(drive.ids());

    let record = runner(&factory, &ledger, 10)
        .run(&[drive.source()], Duration::from_secs(600))
        .await;

    assert_eq!(drive.discover_calls(), 1);
    let stats = &record.per_source["drive"];
    assert!(stats.caught_up);
    assert_eq!(stats.skipped, 100);
    assert_eq!(stats.processed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_new_items_at_head_are_picked_up() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let drive = factory.add(FakeSource::new("drive", SourceKind::Remote, 30).page_size(10));
    // Three new items on top of an otherwise stored corpus
    ledger.seed(drive.ids().into_iter().skip(3));

    let record = runner(&factory, &ledger, 10)
        .run(&[drive.source()], Duration::from_secs(600))
        .await;

    let stats = &record.per_source["drive"];
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.skipped, 7 + 10);
    assert!(stats.caught_up);
    assert_eq!(drive.discover_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_is_isolated() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let broken = factory.add(
        FakeSource::new("drive", SourceKind::Remote, 5).failing_discovery("listing returned 403"),
    );
    let notes = factory.add(FakeSource::new("notes", SourceKind::Local, 4));

    let record = runner(&factory, &ledger, 10)
        .run(&[broken.source(), notes.source()], Duration::from_secs(600))
        .await;

    assert!(record.per_source["drive"]
        .error
        .as_deref()
        .unwrap()
        .contains("403"));
    assert_eq!(record.per_source["notes"].processed, 4);
    assert!(record.per_source["notes"].error.is_none());
    assert_eq!(record.outcome, RunOutcome::Partial);
    assert_eq!(record.first_failure.as_deref(), Some("drive"));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failures_are_counted_not_fatal() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let notes = factory.add(FakeSource::new("notes", SourceKind::Local, 10).failing_fetch(&[2, 7]));

    let record = runner(&factory, &ledger, 3)
        .run(&[notes.source()], Duration::from_secs(600))
        .await;

    let stats = &record.per_source["notes"];
    assert_eq!(stats.processed, 8);
    assert_eq!(stats.failed, 2);
    assert!(stats.error.is_none());
    assert_eq!(record.outcome, RunOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_reauthorization_skips_only_that_source() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let drive = factory.add(FakeSource::new("drive", SourceKind::Remote, 25).reauth_on_fetch());
    let notes = factory.add(FakeSource::new("notes", SourceKind::Local, 2));

    let record = runner(&factory, &ledger, 10)
        .run(&[drive.source(), notes.source()], Duration::from_secs(600))
        .await;

    let stats = &record.per_source["drive"];
    assert!(stats.error.as_deref().unwrap().contains("Reauthorization required"));
    // Abandoned on the first item rather than failing all 25
    assert_eq!(drive.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(record.per_source["notes"].processed, 2);
    assert_eq!(record.outcome, RunOutcome::Partial);
}

#[tokio::test(start_paused = true)]
async fn test_all_sources_failing_is_failure() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let a = factory.add(FakeSource::new("a", SourceKind::Remote, 1).failing_discovery("down"));
    let b = factory.add(FakeSource::new("b", SourceKind::Local, 1).failing_discovery("gone"));

    let record = runner(&factory, &ledger, 10)
        .run(&[a.source(), b.source()], Duration::from_secs(60))
        .await;

    assert_eq!(record.outcome, RunOutcome::Failure);
    assert_eq!(record.first_failure.as_deref(), Some("a"));
    assert!(record.error.unwrap().starts_with("a: "));
}

#[tokio::test(start_paused = true)]
async fn test_no_sources_is_an_empty_success() {
    let factory = Arc::new(FakeFactory::new());
    let ledger = Arc::new(MemoryLedger::new());
    let record = runner(&factory, &ledger, 10)
        .run(&[], Duration::from_secs(60))
        .await;
    assert_eq!(record.outcome, RunOutcome::Success);
    assert!(record.per_source.is_empty());
}
