use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dagflow::{ErrorContext, Graph, RunOptions, Task, TaskError, TaskState};
use tokio_util::sync::CancellationToken;

fn recording_cleaner(cleaned: &Arc<Mutex<Vec<String>>>) -> impl Fn(&str) + Send + Sync + 'static {
    let cleaned = cleaned.clone();
    move |id: &str| cleaned.lock().unwrap().push(id.to_string())
}

#[tokio::test]
async fn test_recovered_task_is_cleaned_once() {
    let mut g = Graph::new("Shoot cluster force deletion");
    let a = g
        .add_task(Task::new("Deleting DNSRecord resources", |_ctx| async { Ok(()) }))
        .unwrap();
    g.add_task(
        Task::new("Waiting until DNSRecord resources have been deleted", |_ctx| async {
            Ok(())
        })
        .depends_on([a])
        .waiting(),
    )
    .unwrap();
    let plan = g.compile().unwrap();
    let cleaned = Arc::new(Mutex::new(Vec::new()));

    let context = ErrorContext::new(
        "Shoot cluster force deletion",
        ["Deleting DNSRecord resources", "Create botanist"],
    );
    let report = plan
        .run(
            CancellationToken::new(),
            RunOptions::new()
                .with_error_context(context)
                .with_error_cleaner(recording_cleaner(&cleaned)),
        )
        .await;

    assert!(report.is_success());
    assert_eq!(
        *cleaned.lock().unwrap(),
        vec!["Deleting DNSRecord resources".to_string()]
    );
    let context = report.error_context().unwrap();
    assert!(!context.has_error_with_id("Deleting DNSRecord resources"));
    // ids that do not belong to this graph are left alone
    assert!(context.has_error_with_id("Create botanist"));
}

#[tokio::test]
async fn test_failed_task_is_carried_into_next_run() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut g = Graph::new("flaky flow");
    g.add_task(Task::new("Deleting secrets", move |_ctx| {
        let counter = counter.clone();
        async move {
            // fails on the first run only
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TaskError::permanent("secret still referenced"))
            } else {
                Ok(())
            }
        }
    }))
    .unwrap();
    let plan = g.compile().unwrap();
    let cleaned = Arc::new(Mutex::new(Vec::new()));

    let first = plan
        .run(
            CancellationToken::new(),
            RunOptions::new()
                .with_error_context(ErrorContext::new("flaky flow", Vec::<String>::new()))
                .with_error_cleaner(recording_cleaner(&cleaned)),
        )
        .await;
    assert_eq!(first.state("Deleting secrets"), Some(TaskState::Failed));
    let persisted: Vec<String> = first
        .error_context()
        .unwrap()
        .error_ids()
        .map(str::to_string)
        .collect();
    assert_eq!(persisted, vec!["Deleting secrets".to_string()]);
    assert!(cleaned.lock().unwrap().is_empty());

    let second = plan
        .run(
            CancellationToken::new(),
            RunOptions::new()
                .with_error_context(ErrorContext::new("flaky flow", persisted))
                .with_error_cleaner(recording_cleaner(&cleaned)),
        )
        .await;
    assert!(second.is_success());
    assert_eq!(*cleaned.lock().unwrap(), vec!["Deleting secrets".to_string()]);
    assert_eq!(second.error_context().unwrap().error_ids().count(), 0);
}
