use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagflow::{
    FlowError, Graph, ImmediateProgressReporter, Plan, RunOptions, Stats, Task, TaskError,
    TaskState,
};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

fn counting_task(name: &str, counter: &Arc<AtomicUsize>) -> Task {
    let counter = counter.clone();
    Task::new(name, move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn sleeping_task(name: &str, duration: Duration) -> Task {
    Task::new(name, move |_ctx| async move {
        sleep(duration).await;
        Ok(())
    })
}

fn failing_task(name: &str, counter: &Arc<AtomicUsize>, err: fn() -> TaskError) -> Task {
    let counter = counter.clone();
    Task::new(name, move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(err())
        }
    })
}

/// A -> {B, C} -> D where B is supplied by the caller.
fn diamond(b: Task, d_runs: &Arc<AtomicUsize>) -> Plan {
    let mut g = Graph::new("diamond");
    let a = g.add_task(sleeping_task("A", Duration::from_millis(10))).unwrap();
    let b = g.add_task(b.depends_on([a])).unwrap();
    let c = g
        .add_task(sleeping_task("C", Duration::from_millis(50)).depends_on([a]))
        .unwrap();
    g.add_task(counting_task("D", d_runs).depends_on([b, c]))
        .unwrap();
    g.compile().unwrap()
}

fn recording_reporter(seen: &Arc<Mutex<Vec<Stats>>>) -> Arc<ImmediateProgressReporter> {
    let sink = seen.clone();
    Arc::new(ImmediateProgressReporter::new(move |stats| {
        sink.lock().unwrap().push(stats);
    }))
}

#[tokio::test(start_paused = true)]
async fn test_independent_tasks_run_concurrently() {
    let mut g = Graph::new("parallel");
    for i in 0..5u64 {
        g.add_task(sleeping_task(
            &format!("task{}", i),
            Duration::from_millis(100 + i * 20),
        ))
        .unwrap();
    }
    let plan = g.compile().unwrap();
    let start = Instant::now();

    let report = plan.run(CancellationToken::new(), RunOptions::new()).await;

    assert!(report.is_success());
    // slowest task takes 180ms, the sum would be 700ms
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(180));
    assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
    assert_eq!(report.tasks_in(TaskState::Succeeded).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_retry_until_timeout_attempt_count() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut g = Graph::new("retry");
    g.add_task(
        failing_task("flaky", &attempts, || TaskError::from("transient"))
            .retry_until_timeout(Duration::from_millis(100), Duration::from_secs(1)),
    )
    .unwrap();
    let plan = g.compile().unwrap();

    let report = plan.run(CancellationToken::new(), RunOptions::new()).await;

    let attempts = attempts.load(Ordering::SeqCst);
    assert!((8..=11).contains(&attempts), "attempts: {}", attempts);
    assert_eq!(report.state("flaky"), Some(TaskState::Failed));
    assert!(report.errors().get("flaky").unwrap().is_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_diamond_with_permanent_failure() {
    let b_runs = Arc::new(AtomicUsize::new(0));
    let d_runs = Arc::new(AtomicUsize::new(0));
    let b = failing_task("B", &b_runs, || TaskError::permanent("bucket is locked"))
        .retry_until_timeout(Duration::from_millis(100), Duration::from_secs(10));
    let plan = diamond(b, &d_runs);

    let report = plan.run(CancellationToken::new(), RunOptions::new()).await;

    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    assert_eq!(d_runs.load(Ordering::SeqCst), 0);
    assert_eq!(report.state("A"), Some(TaskState::Succeeded));
    assert_eq!(report.state("B"), Some(TaskState::Failed));
    assert_eq!(report.state("C"), Some(TaskState::Succeeded));
    assert_eq!(report.state("D"), Some(TaskState::BlockedBySkip));
    assert_eq!(report.errors().task_names(), vec!["B"]);

    match report.into_result() {
        Err(FlowError::TaskFailures(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(
                errors.to_string(),
                "flow \"diamond\" encountered task errors: [task \"B\" failed: bucket is locked]"
            );
        }
        other => panic!("expected task failures, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry() {
    let b_runs = Arc::new(AtomicUsize::new(0));
    let d_runs = Arc::new(AtomicUsize::new(0));
    let interval = Duration::from_millis(100);
    let b = failing_task("B", &b_runs, || TaskError::from("not yet"))
        .retry_until_timeout(interval, Duration::from_secs(60));
    let plan = diamond(b, &d_runs);

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(350)).await;
        canceller.cancel();
    });
    let start = Instant::now();

    let report = plan.run(ctx, RunOptions::new()).await;

    assert!(start.elapsed() <= Duration::from_millis(350) + interval);
    assert!(report.was_cancelled());
    assert!(b_runs.load(Ordering::SeqCst) >= 3);
    assert!(report.errors().get("B").unwrap().is_cancelled());
    assert_eq!(report.state("C"), Some(TaskState::Succeeded));
    assert_eq!(d_runs.load(Ordering::SeqCst), 0);
    assert!(report.tasks_in(TaskState::Running).is_empty());
}

#[tokio::test]
async fn test_rerun_reports_monotonic_progress() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut g = Graph::new("rerun");
    let a = g.add_task(counting_task("a", &runs)).unwrap();
    let b = g.add_task(counting_task("b", &runs).depends_on([a])).unwrap();
    let c = g.add_task(counting_task("c", &runs).depends_on([a])).unwrap();
    g.add_task(counting_task("d", &runs).depends_on([b, c]))
        .unwrap();
    let plan = g.compile().unwrap();

    for round in 1..=2 {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let report = plan
            .run(
                CancellationToken::new(),
                RunOptions::new().with_progress_reporter(recording_reporter(&seen)),
            )
            .await;

        assert!(report.errors().is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 4 * round);

        let seen = seen.lock().unwrap();
        let percents: Vec<u8> = seen.iter().map(Stats::progress_percent).collect();
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);

        // one snapshot before start, then Running and Succeeded for each task
        assert_eq!(seen.len(), 1 + 2 * 4);
        assert!(seen.last().unwrap().is_finished());
        assert_eq!(
            seen.last().unwrap().last_transition,
            Some(("d".to_string(), TaskState::Succeeded))
        );
    }
}

#[tokio::test]
async fn test_concurrent_runs_share_plan() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut g = Graph::new("shared");
    let a = g.add_task(counting_task("a", &runs)).unwrap();
    g.add_task(counting_task("b", &runs).depends_on([a])).unwrap();
    let plan = g.compile().unwrap();

    let (first, second) = tokio::join!(
        plan.run(CancellationToken::new(), RunOptions::new()),
        plan.run(CancellationToken::new(), RunOptions::new()),
    );

    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_action_observes_cancellation() {
    let mut g = Graph::new("watcher");
    g.add_task(Task::new("wait for deletion", |ctx| async move {
        ctx.cancelled().await;
        Err(TaskError::Cancelled)
    }))
    .unwrap();
    let plan = g.compile().unwrap();
    let ctx = CancellationToken::new();
    let canceller = ctx.clone();

    let run = tokio::spawn(async move { plan.run(ctx, RunOptions::new()).await });
    sleep(Duration::from_millis(20)).await;
    canceller.cancel();
    let report = run.await.unwrap();

    assert!(report.errors().get("wait for deletion").unwrap().is_cancelled());
    assert!(matches!(report.into_result(), Err(FlowError::TaskFailures(_))));
}

#[tokio::test]
async fn test_slow_progress_callback_does_not_delay_scheduling() {
    let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let mut g = Graph::new("slow progress");
    for i in 0..3 {
        let starts = starts.clone();
        g.add_task(Task::new(format!("task{}", i), move |_ctx| {
            let starts = starts.clone();
            async move {
                starts.lock().unwrap().push(Instant::now());
                sleep(Duration::from_millis(100)).await;
                Ok(())
            }
        }))
        .unwrap();
    }
    let plan = g.compile().unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let reporter = Arc::new(ImmediateProgressReporter::new(move |_| {
        std::thread::sleep(Duration::from_millis(50));
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let report = plan
        .run(
            CancellationToken::new(),
            RunOptions::new().with_progress_reporter(reporter),
        )
        .await;

    assert!(report.is_success());
    // every snapshot is still delivered before the run returns
    assert_eq!(delivered.load(Ordering::SeqCst), 1 + 2 * 3);
    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    let first = *starts.iter().min().unwrap();
    let last = *starts.iter().max().unwrap();
    // a blocking callback on the scheduling path would space launches >= 50ms apart
    assert!(
        last - first < Duration::from_millis(40),
        "launches spread over {:?}",
        last - first
    );
}
