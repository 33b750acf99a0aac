use anyhow::Result;
use coordinator::{
    Orchestrator, Server, ServerConfig, ServerReport, Worker, WorkerConfig, WorkerConfigFactory,
    WorkerConstructor, WorkerLayout,
};
use parking_lot::Mutex;
use runtime_core::{
    Error, ExecutionContext, Practitioner, SlotAttribution, TaskId, TrainingConfig,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Server that blocks until its gate is opened, then reports a fixed result
struct GatedServer {
    gate: Option<mpsc::Receiver<()>>,
    report: ServerReport,
    fail: bool,
}

impl Server for GatedServer {
    fn start(&mut self) -> runtime_core::Result<()> {
        if let Some(gate) = self.gate.take() {
            gate.recv().ok();
        }
        if self.fail {
            return Err(Error::RunnerFailed {
                unit: "server".to_string(),
                message: "aggregation diverged".to_string(),
            });
        }
        Ok(())
    }

    fn report(&self) -> ServerReport {
        self.report.clone()
    }
}

struct NoopWorker(Arc<AtomicUsize>);

impl Worker for NoopWorker {
    fn start(&mut self) -> runtime_core::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Layout factory whose server is released by the test
struct ScriptedFactory {
    report: ServerReport,
    fail: bool,
    gated: bool,
    gates: Mutex<Vec<mpsc::Sender<()>>>,
    servers: AtomicUsize,
    workers: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    fn new(report: ServerReport) -> Self {
        Self {
            report,
            fail: false,
            gated: true,
            gates: Mutex::new(Vec::new()),
            servers: AtomicUsize::new(0),
            workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Servers finish without waiting for `release`
    fn ungated(mut self) -> Self {
        self.gated = false;
        self
    }

    /// Let every server launched so far finish
    fn release(&self) {
        for gate in self.gates.lock().drain(..) {
            gate.send(()).ok();
        }
    }
}

impl WorkerConfigFactory for ScriptedFactory {
    fn worker_config(
        &self,
        config: &TrainingConfig,
        task_id: Option<TaskId>,
        _practitioners: Option<&BTreeSet<Practitioner>>,
    ) -> runtime_core::Result<WorkerLayout> {
        let context = ExecutionContext::from_config(&config.executor, task_id)?;

        let rx = self.gated.then(|| {
            let (tx, rx) = mpsc::channel();
            self.gates.lock().push(tx);
            rx
        });
        self.servers.fetch_add(1, Ordering::SeqCst);
        let gate = Mutex::new(rx);
        let report = self.report.clone();
        let fail = self.fail;
        let server = ServerConfig::new(Arc::new(
            move |_ctx: ExecutionContext| -> runtime_core::Result<Box<dyn Server>> {
                Ok(Box::new(GatedServer {
                    gate: gate.lock().take(),
                    report: report.clone(),
                    fail,
                }))
            },
        ));

        let started = Arc::clone(&self.workers);
        let constructor: WorkerConstructor = Arc::new(
            move |_ctx: ExecutionContext| -> runtime_core::Result<Box<dyn Worker>> {
                Ok(Box::new(NoopWorker(Arc::clone(&started))))
            },
        );
        let batch = (0..config.worker_number)
            .map(|slot| WorkerConfig::new(slot, Arc::clone(&constructor)))
            .collect();

        Ok(WorkerLayout {
            context,
            server: Some(server),
            workers: vec![batch],
        })
    }
}

fn practitioners(ids: &[&str]) -> BTreeSet<Practitioner> {
    ids.iter().map(|id| Practitioner::new(*id)).collect()
}

fn config(worker_number: usize) -> TrainingConfig {
    TrainingConfig::new("shapley_value", worker_number)
}

fn sv_report() -> ServerReport {
    let table: SlotAttribution =
        BTreeMap::from([(0, BTreeMap::from([(0, 0.1), (1, 0.2), (2, 0.3)]))]);
    ServerReport {
        performance: json!(0.9),
        shapley_values: Some(table),
    }
}

#[test]
fn test_poll_lifecycle() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()));
    let orchestrator = Orchestrator::new(factory.clone());

    let task_id = orchestrator
        .train(&config(3), Some(&practitioners(&["p3", "p1", "p2"])))?
        .expect("asynchronous mode returns a task id");

    // Server still gated: no result yet, task stays registered
    assert!(orchestrator
        .get_training_result(task_id, Some(Duration::ZERO))?
        .is_none());
    assert!(orchestrator
        .get_training_result(task_id, Some(Duration::from_millis(50)))?
        .is_none());
    assert!(orchestrator.task_registry().contains(task_id));

    factory.release();
    let stats = orchestrator
        .get_training_result(task_id, None)?
        .expect("finished task returns stats");
    assert_eq!(stats.performance(), Some(&json!(0.9)));
    assert!(!orchestrator.task_registry().contains(task_id));

    let again = orchestrator.get_training_result(task_id, None);
    assert!(matches!(again, Err(Error::TaskNotFound { .. })));
    Ok(())
}

#[test]
fn test_shapley_values_remapped_to_participants() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()));
    let orchestrator = Orchestrator::new(factory.clone());

    let task_id = orchestrator
        .train(&config(3), Some(&practitioners(&["p3", "p1", "p2"])))?
        .unwrap();
    factory.release();

    let stats = orchestrator.get_training_result(task_id, None)?.unwrap();
    assert_eq!(
        serde_json::to_value(&stats)?,
        json!({"performance": 0.9, "sv": {"0": {"p1": 0.1, "p2": 0.2, "p3": 0.3}}})
    );
    Ok(())
}

#[test]
fn test_one_server_and_all_workers_run() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(ServerReport::default()));
    let orchestrator = Orchestrator::new(factory.clone());

    let task_id = orchestrator
        .train(&config(4), Some(&practitioners(&["a", "b", "c", "d"])))?
        .unwrap();
    factory.release();
    let stats = orchestrator.get_training_result(task_id, None)?.unwrap();

    assert_eq!(factory.servers.load(Ordering::SeqCst), 1);
    assert_eq!(factory.workers.load(Ordering::SeqCst), 4);
    assert!(stats.shapley_values.is_none());
    Ok(())
}

#[test]
fn test_failed_server_surfaces_on_poll() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()).failing());
    let orchestrator = Orchestrator::new(factory.clone());

    let task_id = orchestrator
        .train(&config(3), Some(&practitioners(&["p1", "p2", "p3"])))?
        .unwrap();
    factory.release();

    let result = orchestrator.get_training_result(task_id, None);
    assert!(matches!(result, Err(Error::RunnerFailed { .. })));
    assert!(orchestrator.running_tasks().is_empty());

    let again = orchestrator.get_training_result(task_id, None);
    assert!(again.unwrap_err().is_lookup());
    Ok(())
}

#[test]
fn test_failed_server_surfaces_in_sync_mode() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let factory = Arc::new(ScriptedFactory::new(sv_report()).failing().ungated());
    let orchestrator = Orchestrator::new(factory.clone());

    let mut config = config(2);
    config.save_dir = dir.path().to_path_buf();

    let result = orchestrator.train(&config, None);
    assert!(matches!(result, Err(Error::RunnerFailed { .. })));
    assert!(orchestrator.task_registry().is_empty());
    Ok(())
}

#[test]
fn test_worker_number_mismatch_is_rejected() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()));
    let orchestrator = Orchestrator::new(factory.clone());

    // Two declared workers but three participants
    let result = orchestrator.train(&config(2), Some(&practitioners(&["p1", "p2", "p3"])));
    assert!(matches!(result, Err(Error::Precondition { .. })));
    assert_eq!(factory.servers.load(Ordering::SeqCst), 0);
    assert!(orchestrator.running_tasks().is_empty());
    Ok(())
}

#[test]
fn test_unbounded_poll_timeout_keeps_results() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()));
    let orchestrator = Orchestrator::new(factory.clone());

    let task_id = orchestrator
        .train(&config(3), Some(&practitioners(&["p1", "p2", "p3"])))?
        .unwrap();
    factory.release();

    let stats = orchestrator
        .get_training_result(task_id, Some(Duration::MAX))?
        .expect("an unbounded poll waits for the run");
    assert_eq!(stats.performance(), Some(&json!(0.9)));
    assert!(stats.shapley_values.is_some());
    Ok(())
}

#[test]
fn test_poll_from_async_context_keeps_task() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()));
    let orchestrator = Orchestrator::new(factory.clone());

    let task_id = orchestrator
        .train(&config(3), Some(&practitioners(&["p1", "p2", "p3"])))?
        .unwrap();
    factory.release();

    let runtime = tokio::runtime::Runtime::new()?;
    let polled = {
        let orchestrator = orchestrator.clone();
        runtime.block_on(async move {
            tokio::spawn(async move {
                orchestrator
                    .get_training_result(task_id, Some(Duration::from_millis(1)))
                    .map(|stats| stats.is_some())
            })
            .await
        })?
    };
    assert!(matches!(polled, Err(Error::Precondition { .. })));
    assert!(orchestrator.task_registry().contains(task_id));

    let stats = orchestrator.get_training_result(task_id, None)?.unwrap();
    assert_eq!(stats.performance(), Some(&json!(0.9)));
    Ok(())
}

#[test]
fn test_outstanding_jobs_visible_during_poll() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()));
    let orchestrator = Orchestrator::new(factory.clone());

    let task_id = orchestrator
        .train(&config(2), Some(&practitioners(&["p1", "p2"])))?
        .unwrap();

    let poller = {
        let orchestrator = orchestrator.clone();
        std::thread::spawn(move || orchestrator.get_training_result(task_id, None))
    };
    std::thread::sleep(Duration::from_millis(50));

    // Workers are done, the gated server is still held by the poll
    let summaries = orchestrator.running_tasks();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].outstanding_jobs >= 1);

    factory.release();
    let stats = poller.join().expect("poll thread panicked")?;
    assert!(stats.is_some());
    Ok(())
}

#[test]
fn test_concurrent_tasks_are_independent() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(sv_report()));
    let orchestrator = Orchestrator::new(factory.clone());

    let first = orchestrator
        .train(&config(3), Some(&practitioners(&["a", "b", "c"])))?
        .unwrap();
    let second = orchestrator
        .train(&config(3), Some(&practitioners(&["x", "y", "z"])))?
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(orchestrator.running_tasks().len(), 2);

    factory.release();
    let handles: Vec<_> = [(first, "a"), (second, "x")]
        .into_iter()
        .map(|(task_id, lowest)| {
            let orchestrator = orchestrator.clone();
            std::thread::spawn(move || {
                let stats = orchestrator.get_training_result(task_id, None).unwrap().unwrap();
                let sv = stats.shapley_values.unwrap();
                assert_eq!(sv[&0][lowest], 0.1);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("poll thread panicked");
    }

    assert!(orchestrator.running_tasks().is_empty());
    Ok(())
}

#[test]
fn test_task_ids_unique_across_threads() {
    let handles: Vec<_> = (0..4)
        .map(|_| std::thread::spawn(|| (0..10_000).map(|_| TaskId::mint()).collect::<Vec<_>>()))
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "duplicate task id {id}");
        }
    }
    assert_eq!(seen.len(), 40_000);
}

#[test]
fn test_config_snapshot_is_isolated() -> Result<()> {
    let factory = Arc::new(ScriptedFactory::new(ServerReport::default()));
    let orchestrator = Orchestrator::new(factory.clone());

    let config = config(1);
    let task_id = orchestrator
        .train(&config, Some(&practitioners(&["solo"])))?
        .unwrap();

    // The caller's config is untouched by the run's session reset
    assert!(config.session_id.is_none());

    factory.release();
    orchestrator.get_training_result(task_id, None)?;
    Ok(())
}
