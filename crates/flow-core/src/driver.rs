//! Async driver pairing a session with a backend
//!
//! The session is synchronous; the driver performs the fetches and polls the
//! orchestrator, then feeds the results into the session under a short lock.
//! Locks are never held across an `.await`.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::backend::{
    DebugRequest, ExecutionSearchPage, ExecutionSearchRequest, StartRequest, WorkflowBackend,
};
use crate::error::{FlowError, Result};
use crate::execution::ExecutionRecord;
use crate::overlay::ChildScope;
use crate::poller::ExecutionPoller;
use crate::requests::{RequestKey, RequestTracker};
use crate::session::FlowSession;
use crate::version::{VersionChange, WorkflowVersion};

/// Session plus the async boundaries around it
pub struct FlowDriver {
    session: Arc<Mutex<FlowSession>>,
    backend: Arc<dyn WorkflowBackend>,
    poller: ExecutionPoller,
    requests: Mutex<RequestTracker<RequestKey>>,
    /// Key of the instance currently being polled
    watching: Mutex<Option<RequestKey>>,
}

impl FlowDriver {
    /// Take ownership of `session` and poll through `backend`
    pub fn new(session: FlowSession, backend: Arc<dyn WorkflowBackend>) -> Self {
        let poller = ExecutionPoller::new(backend.clone(), session.config().poll.clone());
        Self {
            session: Arc::new(Mutex::new(session)),
            backend,
            poller,
            requests: Mutex::new(RequestTracker::new()),
            watching: Mutex::new(None),
        }
    }

    /// Shared handle to the session
    pub fn session(&self) -> Arc<Mutex<FlowSession>> {
        self.session.clone()
    }

    /// The orchestrator the driver talks to
    pub fn backend(&self) -> &Arc<dyn WorkflowBackend> {
        &self.backend
    }

    /// Run `future` under `key`, superseding any request for the same key
    async fn tracked<T, F>(&self, key: RequestKey, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle: JoinHandle<Result<T>> = self.requests.lock().spawn(key.clone(), future);
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(FlowError::backend(format!(
                "request for {} was superseded",
                key
            ))),
            Err(e) => Err(FlowError::backend(format!("request for {} failed: {}", key, e))),
        }
    }

    /// Fetch a version and load it into the session
    ///
    /// A newer request for the same workflow and version supersedes this one.
    pub async fn load_workflow(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> Result<VersionChange> {
        let key = RequestKey::Workflow {
            workflow_id: workflow_id.to_string(),
            version,
        };
        let backend = self.backend.clone();
        let id = workflow_id.to_string();
        let workflow = self
            .tracked(key, async move { backend.get_workflow(&id, version).await })
            .await?;

        log::info!(
            "Loaded workflow '{}' version {}",
            workflow.workflow_id,
            workflow.version
        );
        self.session.lock().update_version(workflow)
    }

    /// Fetch tool definitions and merge them into the session's registry
    pub async fn load_tools(&self) -> Result<usize> {
        let backend = self.backend.clone();
        let tools = self
            .tracked(RequestKey::Tools, async move { backend.list_tools().await })
            .await?;
        let count = tools.len();
        self.session.lock().register_tools(tools)?;
        Ok(count)
    }

    /// Fetch workflows and expose them as sub-workflow tools
    ///
    /// Sub-workflow nodes calling them stop rendering as unsupported and can
    /// be restored from the fetched definitions.
    pub async fn load_sub_workflows(&self, workflow_ids: &[String]) -> Result<usize> {
        let mut workflows = Vec::with_capacity(workflow_ids.len());
        for workflow_id in workflow_ids {
            let backend = self.backend.clone();
            let id = workflow_id.clone();
            let workflow = self
                .tracked(RequestKey::SubWorkflow(workflow_id.clone()), async move {
                    backend.get_workflow(&id, None).await
                })
                .await?;
            workflows.push(workflow);
        }

        let count = workflows.len();
        self.session.lock().register_workflows(&workflows)?;
        log::info!("Registered {} sub-workflow definitions", count);
        Ok(count)
    }

    /// Load every sub-workflow the open workflow reaches, nested ones included
    pub async fn load_referenced_sub_workflows(&self) -> Result<usize> {
        let mut attempted = HashSet::new();
        let mut loaded = 0;
        loop {
            let missing: Vec<String> = self
                .session
                .lock()
                .unregistered_sub_workflows()
                .into_iter()
                .filter(|id| attempted.insert(id.clone()))
                .collect();
            if missing.is_empty() {
                return Ok(loaded);
            }
            loaded += self.load_sub_workflows(&missing).await?;
        }
    }

    /// Persist the session's task list as the active version
    pub async fn save(&self) -> Result<WorkflowVersion> {
        let workflow = self
            .session
            .lock()
            .to_workflow()
            .ok_or_else(|| FlowError::backend("no workflow version is loaded"))?;
        self.backend.save_workflow(&workflow).await?;
        log::info!(
            "Saved workflow '{}' version {}",
            workflow.workflow_id,
            workflow.version
        );
        Ok(workflow)
    }

    /// Start the active version and begin polling it
    ///
    /// The canvas locks before the request goes out and is rolled back if
    /// the backend rejects it.
    pub async fn start(&self, mut request: StartRequest) -> Result<String> {
        let workflow_id = {
            let mut session = self.session.lock();
            let (workflow_id, version) = active_version(&session)?;
            session.request_start()?;
            request.version.get_or_insert(version);
            workflow_id
        };

        let started = self.backend.start_execution(&workflow_id, &request).await;
        self.after_start(started.map(|s| s.workflow_instance_id))
    }

    /// Run the session's current, possibly unsaved, task list
    pub async fn debug(&self, input_data: Map<String, Value>) -> Result<String> {
        let (workflow_id, request) = {
            let mut session = self.session.lock();
            let (workflow_id, _) = active_version(&session)?;
            session.request_start()?;
            let request = DebugRequest {
                input_data,
                tasks: session.tasks().to_vec(),
            };
            (workflow_id, request)
        };

        let started = self.backend.debug_execution(&workflow_id, &request).await;
        self.after_start(started.map(|s| s.workflow_instance_id))
    }

    fn after_start(&self, started: Result<String>) -> Result<String> {
        match started {
            Ok(instance_id) => {
                log::info!("Started execution '{}'", instance_id);
                self.watch(&instance_id);
                Ok(instance_id)
            }
            Err(e) => {
                if let Err(rollback) = self.session.lock().start_failed(&e.to_string()) {
                    log::warn!("Failed to roll back canvas after rejected start: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Poll `instance_id` and feed every record into the session
    ///
    /// Replaces any instance already being watched.
    pub fn watch(&self, instance_id: &str) {
        let key = RequestKey::Execution(instance_id.to_string());
        let previous = self.watching.lock().replace(key.clone());
        let mut requests = self.requests.lock();
        if let Some(previous) = previous.filter(|previous| *previous != key) {
            requests.cancel(&previous);
        }

        let (handle, mut receiver) = self.poller.start(instance_id);
        let session = self.session.clone();
        let backend = self.backend.clone();
        let _forwarder = requests.spawn(key, async move {
            while let Some(reply) = receiver.recv().await {
                match reply {
                    Ok(record) => {
                        let children = {
                            let mut guard = session.lock();
                            let children = guard.child_executions(&record, None);
                            guard.apply_execution(record);
                            children
                        };
                        follow_children(&session, backend.as_ref(), children).await;
                    }
                    Err(FlowError::PollFailure {
                        key,
                        attempts,
                        message,
                    }) => {
                        session.lock().poll_failed(&key, attempts, &message);
                    }
                    Err(e) => log::warn!("Unexpected poll error: {}", e),
                }
            }
            // The handle lives in this task, so aborting it stops the poll loop
            log::debug!("Finished watching '{}'", handle.instance_id());
        });
    }

    /// Stop polling without touching the session
    pub fn stop_watching(&self) {
        if let Some(key) = self.watching.lock().take() {
            self.requests.lock().cancel(&key);
        }
    }

    /// A poll loop is still attached to the current instance
    pub fn is_watching(&self) -> bool {
        match self.watching.lock().as_ref() {
            Some(key) => self.requests.lock().is_pending(key),
            None => false,
        }
    }

    fn current_instance(&self) -> Result<String> {
        self.session
            .lock()
            .overlay()
            .instance_id()
            .map(str::to_string)
            .ok_or_else(|| FlowError::backend("no execution is active"))
    }

    /// Ask the orchestrator to stop the current instance
    ///
    /// Node states change only once a poll reports the new status.
    pub async fn terminate(&self) -> Result<()> {
        let instance_id = self.current_instance()?;
        self.backend.terminate_execution(&instance_id).await
    }

    /// Ask the orchestrator to pause the current instance
    pub async fn pause(&self) -> Result<()> {
        let instance_id = self.current_instance()?;
        self.backend.pause_execution(&instance_id).await
    }

    /// Ask the orchestrator to resume the current instance
    pub async fn resume(&self) -> Result<()> {
        let instance_id = self.current_instance()?;
        self.backend.resume_execution(&instance_id).await
    }

    /// Page through past executions
    pub async fn search_executions(
        &self,
        request: &ExecutionSearchRequest,
    ) -> Result<ExecutionSearchPage> {
        self.backend.search_executions(request).await
    }

    /// Show a past instance's node states; the canvas turns READONLY
    pub async fn inspect(&self, instance_id: &str) -> Result<()> {
        let record = self.backend.get_execution(instance_id).await?;
        self.session.lock().inspect_execution(record)
    }

    /// Leave inspection and return the canvas to its previous state
    pub fn close_inspection(&self) {
        self.session.lock().close_inspection();
    }
}

impl std::fmt::Debug for FlowDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDriver")
            .field("watching", &*self.watching.lock())
            .finish()
    }
}

/// Fetch child instances of restored sub-workflows, grandchildren included
async fn follow_children(
    session: &Mutex<FlowSession>,
    backend: &dyn WorkflowBackend,
    mut pending: Vec<(ChildScope, String)>,
) {
    while let Some((scope, instance_id)) = pending.pop() {
        let record: ExecutionRecord = match backend.get_execution(&instance_id).await {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Failed to fetch child execution '{}': {}", instance_id, e);
                continue;
            }
        };
        let mut guard = session.lock();
        pending.extend(guard.child_executions(&record, Some(&scope)));
        guard.apply_child_execution(scope, record);
    }
}

fn active_version(session: &FlowSession) -> Result<(String, u32)> {
    let active = session
        .versions()
        .active()
        .ok_or_else(|| FlowError::backend("no workflow version is loaded"))?;
    Ok((active.workflow_id.clone(), active.version))
}
