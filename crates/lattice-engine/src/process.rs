//! View processes.
//!
//! A [`ViewProcess`] is a long-lived subscription to one view definition. Its
//! loop runs as a tokio task selecting over manual triggers, live market data
//! ticks, an optional fixed interval and the shutdown signal. Each trigger
//! produces one [`ViewCycle`], executed on a blocking thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use lattice_traits::{ViewCycleId, ViewProcessId};

use crate::cycle::{CycleFailure, ViewCycle, ViewCycleState};
use crate::definition::{ViewCycleExecutionOptions, ViewDefinition};
use crate::error::{EngineError, EngineResult};
use crate::executor::DependencyGraphExecutor;
use crate::graph::GraphCompiler;
use crate::live_data::{MarketDataTick, SnapshotSource};
use crate::snapshot::SnapshotState;

/// Shared table of every retained cycle, keyed by id.
pub type CycleTable = Arc<DashMap<ViewCycleId, Arc<ViewCycle>>>;

// =============================================================================
// OPTIONS AND NOTICES
// =============================================================================

/// What starts a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleTrigger {
    /// Explicit request
    Manual,
    /// Live market data changed
    LiveTick,
    /// Fixed interval elapsed
    Interval,
}

/// How a process decides when to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewProcessOptions {
    /// Run a cycle whenever the snapshot source ticks
    pub run_on_live_ticks: bool,
    /// Run a cycle at a fixed interval
    pub interval: Option<Duration>,
    /// Stop after this many cycles
    pub max_cycles: Option<u64>,
}

impl Default for ViewProcessOptions {
    fn default() -> Self {
        Self {
            run_on_live_ticks: true,
            interval: None,
            max_cycles: None,
        }
    }
}

impl ViewProcessOptions {
    /// Manual triggers only.
    pub fn manual() -> Self {
        Self {
            run_on_live_ticks: false,
            ..Default::default()
        }
    }

    /// Run at a fixed interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Stop after `max_cycles` cycles.
    pub fn with_max_cycles(mut self, max_cycles: u64) -> Self {
        self.max_cycles = Some(max_cycles);
        self
    }
}

/// Broadcast after every cycle reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleCompleted {
    /// Owning process
    pub process_id: ViewProcessId,
    /// The cycle
    pub cycle_id: ViewCycleId,
    /// Terminal state
    pub state: ViewCycleState,
    /// What started it
    pub trigger: CycleTrigger,
}

/// Engine components a process runs cycles with.
#[derive(Clone)]
pub struct ProcessResources {
    /// Compiler with the shared compiled-graph cache
    pub compiler: Arc<GraphCompiler>,
    /// Configured executor
    pub executor: Arc<dyn DependencyGraphExecutor>,
    /// Shared cycle table
    pub cycles: CycleTable,
    /// Cycles retained per process
    pub cycle_retention: usize,
    /// Buffered cycle notices per subscriber
    pub cycle_notice_capacity: usize,
}

// =============================================================================
// VIEW PROCESS
// =============================================================================

/// Long-lived producer of cycles for one view definition.
pub struct ViewProcess {
    id: ViewProcessId,
    definition: Arc<ViewDefinition>,
    source: Arc<dyn SnapshotSource>,
    options: ViewProcessOptions,
    resources: ProcessResources,
    retained: Mutex<VecDeque<ViewCycleId>>,
    current: Mutex<Option<Arc<ViewCycle>>>,
    cycles_run: AtomicU64,
    running: AtomicBool,
    notices: broadcast::Sender<CycleCompleted>,
    trigger_tx: mpsc::UnboundedSender<CycleTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<CycleTrigger>>>,
    shutdown: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ViewProcess {
    /// Create a stopped process.
    pub fn new(
        id: ViewProcessId,
        definition: ViewDefinition,
        source: Arc<dyn SnapshotSource>,
        options: ViewProcessOptions,
        resources: ProcessResources,
    ) -> Self {
        let (notices, _) = broadcast::channel(resources.cycle_notice_capacity.max(1));
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            id,
            definition: Arc::new(definition),
            source,
            options,
            resources,
            retained: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            cycles_run: AtomicU64::new(0),
            running: AtomicBool::new(false),
            notices,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Process id.
    pub fn id(&self) -> &ViewProcessId {
        &self.id
    }

    /// View definition.
    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    /// Trigger options.
    pub fn options(&self) -> &ViewProcessOptions {
        &self.options
    }

    /// Whether the loop task is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cycles run so far.
    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::SeqCst)
    }

    /// Subscribe to cycle completions.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleCompleted> {
        self.notices.subscribe()
    }

    /// Retained cycle ids, oldest first.
    pub fn retained_cycles(&self) -> Vec<ViewCycleId> {
        self.retained.lock().iter().cloned().collect()
    }

    /// Most recent retained cycle.
    pub fn latest_cycle(&self) -> Option<Arc<ViewCycle>> {
        let id = self.retained.lock().back().cloned()?;
        self.resources.cycles.get(&id).map(|c| c.clone())
    }

    /// Request a cycle. Queued until the loop is started.
    pub fn trigger_cycle(&self) -> EngineResult<()> {
        self.trigger_tx
            .send(CycleTrigger::Manual)
            .map_err(|_| EngineError::Internal(format!("process {} trigger closed", self.id)))
    }

    /// Start the loop task. A process starts at most once.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Internal(format!("process {} needs a runtime: {}", self.id, e)))?;
        let trigger_rx = self.trigger_rx.lock().take().ok_or_else(|| {
            EngineError::Internal(format!("process {} already started", self.id))
        })?;
        self.running.store(true, Ordering::SeqCst);

        let ticks = if self.options.run_on_live_ticks {
            self.source.subscribe_ticks()
        } else {
            None
        };
        let shutdown_rx = self.shutdown.subscribe();
        let this = self.clone();
        let handle = runtime.spawn(async move { this.run_loop(trigger_rx, ticks, shutdown_rx).await });
        *self.task.lock() = Some(handle);
        info!(process = %self.id, view = %self.definition.name, "View process started");
        Ok(())
    }

    /// Signal the loop to stop and cancel any running cycle.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        if let Some(cycle) = self.current.lock().as_ref() {
            cycle.cancel();
        }
    }

    /// Wait for the loop task to finish.
    pub async fn stopped(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Drop every retained cycle from the shared table.
    pub fn release_cycles(&self) {
        let mut retained = self.retained.lock();
        for id in retained.drain(..) {
            self.resources.cycles.remove(&id);
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        mut trigger_rx: mpsc::UnboundedReceiver<CycleTrigger>,
        mut ticks: Option<broadcast::Receiver<MarketDataTick>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = self.options.interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let trigger = tokio::select! {
                Some(trigger) = trigger_rx.recv() => trigger,
                tick = next_tick(&mut ticks) => match tick {
                    Some(()) => CycleTrigger::LiveTick,
                    None => {
                        ticks = None;
                        continue;
                    }
                },
                _ = next_interval(&mut ticker) => CycleTrigger::Interval,
                _ = shutdown_rx.recv() => {
                    info!(process = %self.id, "View process shutting down");
                    break;
                }
            };

            if let Err(e) = self.run_cycle(trigger).await {
                warn!(process = %self.id, error = %e, "View cycle could not run");
            }

            if let Some(max) = self.options.max_cycles {
                if self.cycles_run() >= max {
                    info!(process = %self.id, cycles = max, "View process reached max cycles");
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one cycle on a blocking thread.
    pub async fn run_cycle(self: &Arc<Self>, trigger: CycleTrigger) -> EngineResult<Arc<ViewCycle>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.run_cycle_now(trigger))
            .await
            .map_err(|e| EngineError::Internal(format!("cycle task failed: {}", e)))?
    }

    /// Run one cycle on the calling thread.
    ///
    /// Structural failures (no snapshot, compilation error) end the cycle in
    /// `ExecutionFailed`; the cycle is still returned and retained.
    pub fn run_cycle_now(&self, trigger: CycleTrigger) -> EngineResult<Arc<ViewCycle>> {
        let cycle = Arc::new(ViewCycle::new(
            self.id.clone(),
            ViewCycleExecutionOptions::now(),
            self.definition.result_model,
        ));
        *self.current.lock() = Some(cycle.clone());
        self.retain(&cycle);
        debug!(process = %self.id, cycle = %cycle.id(), trigger = ?trigger, "View cycle created");

        let outcome = self.execute_cycle(&cycle);
        *self.current.lock() = None;
        if let Err(e) = outcome {
            // A concurrent cancel may already have failed the cycle.
            if !cycle.state().is_terminal() {
                return Err(e);
            }
        }

        self.cycles_run.fetch_add(1, Ordering::SeqCst);
        let _ = self.notices.send(CycleCompleted {
            process_id: self.id.clone(),
            cycle_id: cycle.id().clone(),
            state: cycle.state(),
            trigger,
        });
        Ok(cycle)
    }

    fn execute_cycle(&self, cycle: &ViewCycle) -> EngineResult<()> {
        let snapshot = match self.source.snapshot() {
            Ok(snapshot) if snapshot.state() >= SnapshotState::Complete => snapshot,
            Ok(snapshot) => {
                return cycle.fail(CycleFailure::NoSnapshot(format!(
                    "snapshot {} is {:?}",
                    snapshot.id(),
                    snapshot.state()
                )))
            }
            Err(e) => return cycle.fail(CycleFailure::NoSnapshot(e.to_string())),
        };

        let graph = match self
            .resources
            .compiler
            .compile(&self.definition, snapshot.as_ref())
        {
            Ok(graph) => graph,
            Err(e) => return cycle.fail(CycleFailure::Compilation(e.to_string())),
        };

        cycle
            .execute(self.resources.executor.as_ref(), snapshot, graph)
            .map(|_| ())
    }

    fn retain(&self, cycle: &Arc<ViewCycle>) {
        self.resources
            .cycles
            .insert(cycle.id().clone(), cycle.clone());
        let mut retained = self.retained.lock();
        retained.push_back(cycle.id().clone());
        while retained.len() > self.resources.cycle_retention {
            if let Some(evicted) = retained.pop_front() {
                self.resources.cycles.remove(&evicted);
                debug!(process = %self.id, cycle = %evicted, "View cycle released");
            }
        }
    }
}

impl std::fmt::Debug for ViewProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewProcess")
            .field("id", &self.id)
            .field("view", &self.definition.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Next live tick; later ticks already queued are coalesced into it.
/// `None` once the tick stream closes. Pends forever without a stream.
async fn next_tick(ticks: &mut Option<broadcast::Receiver<MarketDataTick>>) -> Option<()> {
    let Some(rx) = ticks.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(_) => {}
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!("View process lagged by {} ticks", n);
        }
        Err(broadcast::error::RecvError::Closed) => return None,
    }
    while let Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) = rx.try_recv() {}
    Some(())
}

async fn next_interval(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{pv_graph, target};
    use crate::executor::SingleThreadedExecutor;
    use crate::function::{FnCalculationFunction, FunctionRepository};
    use crate::live_data::{FixedSnapshotSource, LiveDataSnapshotProvider, NoSnapshotSource};
    use crate::snapshot::Snapshot;
    use lattice_traits::{ComputationTarget, ComputationTargetKind, DataValue, MarketDataKey};

    fn resources(retention: usize) -> ProcessResources {
        let mut repo = FunctionRepository::new();
        repo.register(
            FnCalculationFunction::new("pv", [ComputationTargetKind::Position], ["PV"])
                .with_inputs(["Price"])
                .with_value_fn(|_, inputs, _| Ok(DataValue::Float(inputs.f64_by_name("Price")? * 10.0))),
        )
        .unwrap();
        ProcessResources {
            compiler: Arc::new(GraphCompiler::new(Arc::new(repo), 4)),
            executor: Arc::new(SingleThreadedExecutor::new()),
            cycles: Arc::new(DashMap::new()),
            cycle_retention: retention,
            cycle_notice_capacity: 16,
        }
    }

    fn definition() -> ViewDefinition {
        ViewDefinition::new("live-pv")
            .with_target(ComputationTarget::position("A"))
            .requesting("PV")
    }

    fn price_key() -> MarketDataKey {
        MarketDataKey::new(ComputationTarget::position("A"), "Price")
    }

    fn process(
        source: Arc<dyn SnapshotSource>,
        options: ViewProcessOptions,
        retention: usize,
    ) -> Arc<ViewProcess> {
        Arc::new(ViewProcess::new(
            ViewProcessId::generate(),
            definition(),
            source,
            options,
            resources(retention),
        ))
    }

    #[test]
    fn test_run_cycle_now_executes() {
        let live = Arc::new(LiveDataSnapshotProvider::default());
        live.publish(price_key(), DataValue::Float(2.0));
        let process = process(live, ViewProcessOptions::manual(), 5);

        let cycle = process.run_cycle_now(CycleTrigger::Manual).unwrap();
        assert_eq!(cycle.state(), ViewCycleState::Executed);
        let model = cycle.result_model().unwrap();
        assert_eq!(
            model.get(&ComputationTarget::position("A"), "PV").unwrap().value,
            DataValue::Float(20.0)
        );
        assert_eq!(process.cycles_run(), 1);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let live = Arc::new(LiveDataSnapshotProvider::default());
        live.publish(price_key(), DataValue::Float(2.0));
        let process = process(live, ViewProcessOptions::manual(), 2);

        let first = process.run_cycle_now(CycleTrigger::Manual).unwrap();
        process.run_cycle_now(CycleTrigger::Manual).unwrap();
        let third = process.run_cycle_now(CycleTrigger::Manual).unwrap();

        let retained = process.retained_cycles();
        assert_eq!(retained.len(), 2);
        assert!(!retained.contains(first.id()));
        assert!(!process.resources.cycles.contains_key(first.id()));
        assert_eq!(process.latest_cycle().unwrap().id(), third.id());
    }

    #[test]
    fn test_structural_failures() {
        let no_source = process(Arc::new(NoSnapshotSource), ViewProcessOptions::manual(), 5);
        let cycle = no_source.run_cycle_now(CycleTrigger::Manual).unwrap();
        assert_eq!(cycle.state(), ViewCycleState::ExecutionFailed);
        assert!(matches!(cycle.failure(), Some(CycleFailure::NoSnapshot(_))));

        let open = Arc::new(Snapshot::open_live());
        let unsealed = process(
            Arc::new(FixedSnapshotSource::new(open)),
            ViewProcessOptions::manual(),
            5,
        );
        let cycle = unsealed.run_cycle_now(CycleTrigger::Manual).unwrap();
        assert!(matches!(cycle.failure(), Some(CycleFailure::NoSnapshot(_))));

        let empty = Arc::new(LiveDataSnapshotProvider::default());
        let uncompilable = process(empty, ViewProcessOptions::manual(), 5);
        let cycle = uncompilable.run_cycle_now(CycleTrigger::Manual).unwrap();
        assert!(matches!(cycle.failure(), Some(CycleFailure::Compilation(_))));
        assert!(cycle.result_model().is_none());
    }

    #[test]
    fn test_fixed_source_with_prebuilt_fixture() {
        let (_, snapshot) = pv_graph(false);
        let process = Arc::new(ViewProcess::new(
            ViewProcessId::generate(),
            ViewDefinition::new("df-only")
                .with_target(target())
                .requesting("DF"),
            Arc::new(FixedSnapshotSource::new(Arc::new(snapshot))),
            ViewProcessOptions::manual(),
            resources(1),
        ));
        let cycle = process.run_cycle_now(CycleTrigger::Manual).unwrap();
        assert_eq!(cycle.result_model().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_loop() {
        let live = Arc::new(LiveDataSnapshotProvider::default());
        live.publish(price_key(), DataValue::Float(2.0));
        let process = process(live, ViewProcessOptions::manual().with_max_cycles(2), 5);
        let mut notices = process.subscribe();

        process.start().unwrap();
        process.trigger_cycle().unwrap();
        process.trigger_cycle().unwrap();

        let first = notices.recv().await.unwrap();
        let second = notices.recv().await.unwrap();
        assert_eq!(first.trigger, CycleTrigger::Manual);
        assert_eq!(second.state, ViewCycleState::Executed);
        assert_ne!(first.cycle_id, second.cycle_id);

        process.stopped().await;
        assert!(!process.is_running());
        assert!(process.start().is_err());
    }

    #[tokio::test]
    async fn test_live_ticks_trigger_cycles() {
        let live = Arc::new(LiveDataSnapshotProvider::default());
        live.publish(price_key(), DataValue::Float(1.0));
        let process = process(live.clone(), ViewProcessOptions::default().with_max_cycles(1), 5);
        let mut notices = process.subscribe();

        process.start().unwrap();
        live.publish(price_key(), DataValue::Float(3.0));

        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("cycle within timeout")
            .unwrap();
        assert_eq!(notice.trigger, CycleTrigger::LiveTick);
        process.stopped().await;
    }

    #[tokio::test]
    async fn test_interval_trigger_and_stop() {
        let live = Arc::new(LiveDataSnapshotProvider::default());
        live.publish(price_key(), DataValue::Float(1.0));
        let process = process(
            live,
            ViewProcessOptions::manual().with_interval(Duration::from_millis(10)),
            3,
        );
        let mut notices = process.subscribe();
        process.start().unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("cycle within timeout")
            .unwrap();
        assert_eq!(notice.trigger, CycleTrigger::Interval);

        process.stop();
        process.stopped().await;
        assert!(!process.is_running());
        assert!(process.retained_cycles().len() <= 3);
    }
}
