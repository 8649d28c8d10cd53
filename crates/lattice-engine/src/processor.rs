//! The view processor: registry of view processes and clients.
//!
//! Every registry change is pushed as a [`ViewProcessorEvent`] to each
//! subscriber's channel after the table operation completes. Senders never
//! block; subscriptions whose receiver is gone are pruned on the next send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lattice_traits::{
    BatchPersistence, EngineConfig, UserPrincipal, ViewClientId, ViewCycleId, ViewProcessId,
};

use crate::batch::BatchRunManager;
use crate::cycle::ViewCycle;
use crate::definition::ViewDefinition;
use crate::error::{EngineError, EngineResult};
use crate::graph::GraphCompiler;
use crate::live_data::SnapshotSource;
use crate::permission::ViewPermissionProvider;
use crate::process::{ProcessResources, ViewProcess, ViewProcessOptions};
use crate::result::ResultModel;

// =============================================================================
// EVENTS
// =============================================================================

/// Registry lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ViewProcessorEvent {
    /// A process was registered
    ViewProcessAdded(ViewProcessId),
    /// A process was removed
    ViewProcessRemoved(ViewProcessId),
    /// A client was registered
    ViewClientAdded(ViewClientId),
    /// A client was removed
    ViewClientRemoved(ViewClientId),
    /// The processor started
    ViewProcessorStarted,
    /// The processor stopped
    ViewProcessorStopped,
}

/// Callback-style listener. Every method defaults to doing nothing.
pub trait ViewProcessorEventListener: Send + Sync {
    /// A process was registered.
    fn notify_view_process_added(&self, _process_id: &ViewProcessId) {}

    /// A process was removed.
    fn notify_view_process_removed(&self, _process_id: &ViewProcessId) {}

    /// A client was registered.
    fn notify_view_client_added(&self, _client_id: &ViewClientId) {}

    /// A client was removed.
    fn notify_view_client_removed(&self, _client_id: &ViewClientId) {}

    /// The processor started.
    fn notify_view_processor_started(&self) {}

    /// The processor stopped.
    fn notify_view_processor_stopped(&self) {}
}

fn dispatch(listener: &dyn ViewProcessorEventListener, event: &ViewProcessorEvent) {
    match event {
        ViewProcessorEvent::ViewProcessAdded(id) => listener.notify_view_process_added(id),
        ViewProcessorEvent::ViewProcessRemoved(id) => listener.notify_view_process_removed(id),
        ViewProcessorEvent::ViewClientAdded(id) => listener.notify_view_client_added(id),
        ViewProcessorEvent::ViewClientRemoved(id) => listener.notify_view_client_removed(id),
        ViewProcessorEvent::ViewProcessorStarted => listener.notify_view_processor_started(),
        ViewProcessorEvent::ViewProcessorStopped => listener.notify_view_processor_stopped(),
    }
}

// =============================================================================
// CLIENTS
// =============================================================================

/// A consumer of view results.
#[derive(Debug)]
pub struct ViewClient {
    id: ViewClientId,
    user: UserPrincipal,
    attached: RwLock<Option<ViewProcessId>>,
    last_heartbeat: Mutex<Instant>,
}

impl ViewClient {
    fn new(user: UserPrincipal) -> Self {
        Self {
            id: ViewClientId::generate(),
            user,
            attached: RwLock::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
        }
    }

    /// Client id.
    pub fn id(&self) -> &ViewClientId {
        &self.id
    }

    /// User the client acts for.
    pub fn user(&self) -> &UserPrincipal {
        &self.user
    }

    /// Process the client observes.
    pub fn attached_process(&self) -> Option<ViewProcessId> {
        self.attached.read().clone()
    }

    /// Time since the last heartbeat.
    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }
}

// =============================================================================
// VIEW PROCESSOR
// =============================================================================

/// Registry of view processes and clients.
///
/// Build with [`crate::ViewProcessorBuilder`].
pub struct ViewProcessor {
    config: EngineConfig,
    resources: ProcessResources,
    permission: Arc<dyn ViewPermissionProvider>,
    processes: DashMap<ViewProcessId, Arc<ViewProcess>>,
    clients: DashMap<ViewClientId, Arc<ViewClient>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ViewProcessorEvent>>>,
    running: AtomicBool,
}

impl ViewProcessor {
    pub(crate) fn new(
        config: EngineConfig,
        resources: ProcessResources,
        permission: Arc<dyn ViewPermissionProvider>,
    ) -> Self {
        Self {
            config,
            resources,
            permission,
            processes: DashMap::new(),
            clients: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Graph compiler shared by every process.
    pub fn compiler(&self) -> &Arc<GraphCompiler> {
        &self.resources.compiler
    }

    /// Permission provider applied to client results.
    pub fn permission_provider(&self) -> &Arc<dyn ViewPermissionProvider> {
        &self.permission
    }

    /// Whether the processor is started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ViewProcessorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Drive a callback listener from a subscription. Must be called within a
    /// tokio runtime; the task ends when the processor is dropped.
    pub fn add_listener(&self, listener: Arc<dyn ViewProcessorEventListener>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(listener.as_ref(), &event);
            }
        })
    }

    fn emit(&self, event: ViewProcessorEvent) {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
        if listeners.len() < before {
            debug!(pruned = before - listeners.len(), "Closed event subscriptions pruned");
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start accepting processes.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(name = %self.config.name, executor = self.config.executor.name(), "Starting view processor");
        self.emit(ViewProcessorEvent::ViewProcessorStarted);
    }

    /// Stop and remove every process. Clients stay registered, detached.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<ViewProcessId> = self.processes.iter().map(|p| p.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.deregister_process(&id) {
                warn!(process = %id, error = %e, "Process already removed during stop");
            }
        }
        info!(name = %self.config.name, "View processor stopped");
        self.emit(ViewProcessorEvent::ViewProcessorStopped);
    }

    // -------------------------------------------------------------------------
    // Processes
    // -------------------------------------------------------------------------

    /// Register and start a process. Requires a started processor and a
    /// tokio runtime.
    pub fn register_process(
        &self,
        definition: ViewDefinition,
        source: Arc<dyn SnapshotSource>,
        options: ViewProcessOptions,
    ) -> EngineResult<Arc<ViewProcess>> {
        if !self.is_running() {
            return Err(EngineError::ProcessorNotRunning);
        }
        let process = Arc::new(ViewProcess::new(
            ViewProcessId::generate(),
            definition,
            source,
            options,
            self.resources.clone(),
        ));
        process.start()?;
        let id = process.id().clone();
        self.processes.insert(id.clone(), process.clone());
        self.emit(ViewProcessorEvent::ViewProcessAdded(id));
        Ok(process)
    }

    /// Stop and remove a process, dropping its cycles and detaching its clients.
    pub fn deregister_process(&self, process_id: &ViewProcessId) -> EngineResult<()> {
        let (_, process) = self
            .processes
            .remove(process_id)
            .ok_or_else(|| EngineError::ProcessNotFound(process_id.clone()))?;
        process.stop();
        process.release_cycles();

        for client in self.clients.iter() {
            let mut attached = client.attached.write();
            if attached.as_ref() == Some(process_id) {
                *attached = None;
            }
        }
        info!(process = %process_id, "View process removed");
        self.emit(ViewProcessorEvent::ViewProcessRemoved(process_id.clone()));
        Ok(())
    }

    /// Look up a process.
    pub fn process(&self, process_id: &ViewProcessId) -> EngineResult<Arc<ViewProcess>> {
        self.processes
            .get(process_id)
            .map(|p| p.clone())
            .ok_or_else(|| EngineError::ProcessNotFound(process_id.clone()))
    }

    /// Registered process ids.
    pub fn processes(&self) -> Vec<ViewProcessId> {
        let mut ids: Vec<_> = self.processes.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Request an immediate cycle from a process.
    pub fn trigger_cycle(&self, process_id: &ViewProcessId) -> EngineResult<()> {
        self.process(process_id)?.trigger_cycle()
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// Register a client acting for `user`.
    pub fn register_client(&self, user: UserPrincipal) -> Arc<ViewClient> {
        let client = Arc::new(ViewClient::new(user));
        let id = client.id().clone();
        self.clients.insert(id.clone(), client.clone());
        debug!(client = %id, user = %client.user(), "View client registered");
        self.emit(ViewProcessorEvent::ViewClientAdded(id));
        client
    }

    /// Remove a client.
    pub fn deregister_client(&self, client_id: &ViewClientId) -> EngineResult<()> {
        self.clients
            .remove(client_id)
            .ok_or_else(|| EngineError::ClientNotFound(client_id.clone()))?;
        debug!(client = %client_id, "View client removed");
        self.emit(ViewProcessorEvent::ViewClientRemoved(client_id.clone()));
        Ok(())
    }

    /// Look up a client.
    pub fn client(&self, client_id: &ViewClientId) -> EngineResult<Arc<ViewClient>> {
        self.clients
            .get(client_id)
            .map(|c| c.clone())
            .ok_or_else(|| EngineError::ClientNotFound(client_id.clone()))
    }

    /// Registered client ids.
    pub fn clients(&self) -> Vec<ViewClientId> {
        let mut ids: Vec<_> = self.clients.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Attach a client to a process, replacing any previous attachment.
    pub fn attach_client(&self, client_id: &ViewClientId, process_id: &ViewProcessId) -> EngineResult<()> {
        let client = self.client(client_id)?;
        self.process(process_id)?;
        *client.attached.write() = Some(process_id.clone());
        debug!(client = %client_id, process = %process_id, "View client attached");
        Ok(())
    }

    /// Detach a client from its process.
    pub fn detach_client(&self, client_id: &ViewClientId) -> EngineResult<()> {
        let client = self.client(client_id)?;
        *client.attached.write() = None;
        Ok(())
    }

    /// Record a heartbeat from a client.
    pub fn heartbeat(&self, client_id: &ViewClientId) -> EngineResult<()> {
        let client = self.client(client_id)?;
        *client.last_heartbeat.lock() = Instant::now();
        Ok(())
    }

    /// Remove clients without a heartbeat for longer than `max_age`.
    pub fn remove_stale_clients(&self, max_age: Duration) -> Vec<ViewClientId> {
        let stale: Vec<ViewClientId> = self
            .clients
            .iter()
            .filter(|c| c.idle_for() > max_age)
            .map(|c| c.key().clone())
            .collect();
        for id in &stale {
            if self.deregister_client(id).is_ok() {
                info!(client = %id, "Stale view client removed");
            }
        }
        stale
    }

    // -------------------------------------------------------------------------
    // Cycles and results
    // -------------------------------------------------------------------------

    /// Look up any retained cycle.
    pub fn cycle(&self, cycle_id: &ViewCycleId) -> EngineResult<Arc<ViewCycle>> {
        self.resources
            .cycles
            .get(cycle_id)
            .map(|c| c.clone())
            .ok_or_else(|| EngineError::CycleNotFound(cycle_id.clone()))
    }

    /// A cycle's result model as the client's user may see it.
    /// `None` if the cycle has no result model.
    pub fn client_result(
        &self,
        client_id: &ViewClientId,
        cycle_id: &ViewCycleId,
    ) -> EngineResult<Option<ResultModel>> {
        let client = self.client(client_id)?;
        let cycle = self.cycle(cycle_id)?;
        Ok(cycle
            .result_model()
            .map(|model| self.permission.filter(client.user(), &model)))
    }

    /// The latest cycle result of the client's attached process.
    pub fn latest_client_result(&self, client_id: &ViewClientId) -> EngineResult<Option<ResultModel>> {
        let client = self.client(client_id)?;
        let Some(process_id) = client.attached_process() else {
            return Ok(None);
        };
        let model = self
            .process(&process_id)?
            .latest_cycle()
            .and_then(|cycle| cycle.result_model());
        Ok(model.map(|model| self.permission.filter(client.user(), &model)))
    }

    /// Batch manager sharing this processor's compiler and executor.
    pub fn batch_manager(&self, persistence: Arc<dyn BatchPersistence>) -> BatchRunManager {
        BatchRunManager::new(
            self.resources.compiler.clone(),
            self.resources.executor.clone(),
            persistence,
        )
    }
}

impl std::fmt::Debug for ViewProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewProcessor")
            .field("name", &self.config.name)
            .field("running", &self.is_running())
            .field("processes", &self.processes.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}
