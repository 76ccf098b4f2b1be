use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagflow::{
    ErrorContext, FlowConfig, FlowError, Graph, Parallel, RunOptions, Task, TaskError, TaskFn,
    TaskId, TaskIds, to_execute,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Stand-in for the seed cluster: resource kind -> number of objects left.
#[derive(Clone, Default)]
struct Seed {
    objects: Arc<Mutex<HashMap<&'static str, usize>>>,
    flaky_deletes: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl Seed {
    fn with(kinds: &[(&'static str, usize)]) -> Self {
        let seed = Seed::default();
        seed.objects.lock().unwrap().extend(kinds.iter().copied());
        seed
    }

    /// The first `failures` delete calls for `kind` fail with a conflict.
    fn flaky(self, kind: &'static str, failures: usize) -> Self {
        self.flaky_deletes.lock().unwrap().insert(kind, failures);
        self
    }

    fn delete(
        &self,
        kind: &'static str,
    ) -> TaskFn<impl Fn(CancellationToken) -> DeleteFuture + Send + Sync + use<>> {
        let seed = self.clone();
        TaskFn::new(move |_ctx| {
            let seed = seed.clone();
            Box::pin(async move {
                sleep(Duration::from_millis(20)).await;
                if let Some(left) = seed.flaky_deletes.lock().unwrap().get_mut(kind) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(TaskError::from(format!("conflict while deleting {}", kind)));
                    }
                }
                seed.objects.lock().unwrap().insert(kind, 0);
                Ok(())
            }) as DeleteFuture
        })
    }

    fn wait_until_deleted(
        &self,
        kind: &'static str,
    ) -> impl Fn(CancellationToken) -> DeleteFuture + Send + Sync + use<> {
        let seed = self.clone();
        move |ctx: CancellationToken| {
            let seed = seed.clone();
            Box::pin(async move {
                loop {
                    if seed.objects.lock().unwrap().get(kind).copied().unwrap_or(0) == 0 {
                        return Ok(());
                    }
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(TaskError::Cancelled),
                        _ = sleep(Duration::from_millis(10)) => {}
                    }
                }
            }) as DeleteFuture
        }
    }
}

type DeleteFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TaskError>> + Send>>;

fn force_delete_graph(seed: &Seed, config: &FlowConfig) -> Result<Graph, FlowError> {
    let retry = config.default_retry_policy();
    let mut g = Graph::new("Shoot cluster force deletion");

    let delete_then_wait = |g: &mut Graph,
                            what: &str,
                            kind: &'static str|
     -> Result<TaskId, FlowError> {
        let delete = g.add_task(
            Task::with_action(format!("Deleting {}", what), seed.delete(kind))
                .with_retry_policy(retry.clone()),
        )?;
        g.add_task(
            Task::new(
                format!("Waiting until {} have been deleted", what),
                seed.wait_until_deleted(kind),
            )
            .depends_on([delete])
            .waiting(),
        )
    };

    let control_planes = delete_then_wait(&mut g, "ControlPlane resources", "controlplane")?;
    let dns_records = delete_then_wait(&mut g, "DNSRecord resources", "dnsrecord")?;
    let extensions = delete_then_wait(&mut g, "extension resources", "extension")?;
    let machines = delete_then_wait(&mut g, "MCM resources", "machine")?;
    let backup_entry = delete_then_wait(&mut g, "BackupEntry resource", "backupentry")?;

    let delete_cluster = g.add_task(
        Task::with_action("Deleting Cluster resource", seed.delete("cluster"))
            .with_retry_policy(retry.clone())
            .depends_on([extensions, backup_entry, control_planes, dns_records]),
    )?;
    g.add_task(
        Task::new(
            "Waiting until Cluster resource has been deleted",
            seed.wait_until_deleted("cluster"),
        )
        .depends_on([delete_cluster])
        .waiting(),
    )?;

    let keep_objects = g.add_task(
        Task::new(
            "Configuring managed resources to keep their objects when deleted",
            |_ctx| async { Ok(()) },
        )
        .with_retry_policy(retry.clone()),
    )?;
    let delete_managed = g.add_task(
        Task::with_action("Deleting managed resources", seed.delete("managedresource"))
            .with_retry_policy(retry.clone())
            .depends_on([keep_objects]),
    )?;
    let managed = g.add_task(
        Task::new(
            "Waiting until managed resources have been deleted",
            seed.wait_until_deleted("managedresource"),
        )
        .depends_on([delete_managed])
        .waiting(),
    )?;
    let etcds = delete_then_wait(&mut g, "Etcd resources", "etcd")?;

    let delete_secrets = g.add_task(
        Task::with_action("Deleting secrets", seed.delete("secret"))
            .with_retry_policy(retry.clone())
            .depends_on([extensions, etcds, machines, managed]),
    )?;
    let delete_namespace = g.add_task(
        Task::with_action(
            "Deleting shoot namespace",
            Parallel::new()
                .with(seed.delete("namespace"))
                .with(TaskFn::new(|_ctx| async { Ok(()) })),
        )
        .with_retry_policy(retry.clone())
        .depends_on([extensions, etcds, machines, managed, delete_secrets]),
    )?;
    g.add_task(
        Task::new(
            "Waiting until shoot namespace has been deleted",
            seed.wait_until_deleted("namespace"),
        )
        .depends_on([delete_namespace])
        .waiting(),
    )?;
    g.add_task(
        Task::new("Deleting Shoot State", |_ctx| async { Ok(()) })
            .depends_on(TaskIds::from([delete_namespace])),
    )?;

    Ok(g)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FlowConfig::from_json_str(
        r#"{
            "default_retry": {
                "interval": {"secs": 0, "nanos": 100000000},
                "timeout": {"secs": 5, "nanos": 0}
            },
            "progress": {"mode": "immediate"}
        }"#,
    )?;

    let seed = Seed::with(&[
        ("controlplane", 1),
        ("dnsrecord", 2),
        ("extension", 4),
        ("machine", 3),
        ("backupentry", 1),
        ("cluster", 1),
        ("managedresource", 6),
        ("etcd", 2),
        ("secret", 12),
        ("namespace", 1),
    ])
    .flaky("dnsrecord", 2);

    // errors persisted on the Shoot status by the previous reconciliation
    let mut error_context = ErrorContext::new(
        "Shoot cluster force deletion",
        ["Create botanist", "Deleting DNSRecord resources"],
    );
    let ctx = CancellationToken::new();

    error_context
        .handle_errors(
            &ctx,
            |id| {
                info!(step = %id, "Cleared error of previous attempt");
                Ok(())
            },
            |_, _| Ok(()),
            vec![
                to_execute("Create botanist", |_ctx| async { Ok(()) }),
                to_execute("Check required extensions exist", |_ctx| async { Ok(()) }),
            ],
        )
        .await?;

    let plan = force_delete_graph(&seed, &config)?.compile()?;
    for (layer, task) in plan.tasks_by_layer() {
        info!(layer, task = %task, "Planned");
    }

    let reporter = config.progress_reporter(|stats| {
        if let Some((task, state)) = &stats.last_transition {
            info!(progress = stats.progress_percent(), task = %task, state = %state, "Progress");
        }
    });

    let start = std::time::Instant::now();
    let report = plan
        .run(
            ctx,
            RunOptions::new()
                .with_progress_reporter(reporter)
                .with_error_context(error_context)
                .with_error_cleaner(|id| info!(task = %id, "Cleared error of previous attempt")),
        )
        .await;

    info!(elapsed = ?start.elapsed(), "Force deletion finished");
    for (task, state) in report.states() {
        println!("{:>16}  {}", state, task);
    }
    report.into_result()?;
    Ok(())
}
