//! Session lifecycle driver.
//!
//! Walks one session through `Requested → Bound → Active → Completed`,
//! rebinding to a different worker on transport failures and worker
//! faults until the attempt budget runs out. Every attempt holds exactly
//! one reservation and releases it exactly once, whatever the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use gridhub_pool::PoolManager;
use gridhub_router::{RouteError, Router};
use gridhub_state::{
    PoolConfig, SessionId, SessionRecord, SessionState, StateError, StateStore, WorkerId,
};

use crate::client::{ClientError, Command, SessionResult, WorkerClient};

/// Errors returned when driving a session.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No Ready worker with spare capacity, even after routing retries.
    #[error("no healthy worker available")]
    NoHealthyWorker,

    /// The attempt budget was exhausted without a successful attempt.
    #[error("session {id} failed after {attempts} attempts: {reason}")]
    SessionFailed {
        id: SessionId,
        attempts: u32,
        reason: String,
    },

    /// The session was cancelled before it completed.
    #[error("session {0} cancelled")]
    Cancelled(SessionId),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Tunables for the dispatch controller.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempt budget per session.
    pub max_attempts: u32,
    /// Base delay before rebinding after a failed attempt. Doubles per
    /// failure.
    pub retry_backoff: Duration,
    /// Wall-clock bound on a single attempt. An attempt that exceeds it
    /// marks the worker failed and counts against the budget.
    pub session_timeout: Duration,
    /// Routing attempts per bind while the pool has no free slot.
    pub route_attempts: u32,
    /// Base delay between routing attempts.
    pub route_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            session_timeout: Duration::from_secs(300),
            route_attempts: 3,
            route_backoff: Duration::from_millis(100),
        }
    }
}

impl From<&PoolConfig> for DispatchConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            session_timeout: config.session_timeout(),
            ..Self::default()
        }
    }
}

/// Drives sessions from request to a terminal state.
pub struct DispatchController {
    router: Router,
    pool: Arc<PoolManager>,
    client: Arc<dyn WorkerClient>,
    state: StateStore,
    config: DispatchConfig,
    next_session: AtomicU64,
    /// Cancellation handles for sessions that have not yet reached a
    /// terminal state.
    active: RwLock<HashMap<SessionId, watch::Sender<bool>>>,
}

impl DispatchController {
    pub fn new(
        pool: Arc<PoolManager>,
        client: Arc<dyn WorkerClient>,
        state: StateStore,
        config: DispatchConfig,
    ) -> Self {
        Self {
            router: Router::new(pool.clone()),
            pool,
            client,
            state,
            config,
            next_session: AtomicU64::new(1),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session in `Requested` state and register it for
    /// cancellation. Returns the new session id.
    pub async fn create_session(&self) -> Result<SessionId, DispatchError> {
        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::Relaxed));
        let now = epoch_secs();
        let record = SessionRecord {
            id: id.clone(),
            worker_id: None,
            state: SessionState::Requested,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.state.put_session(&record)?;

        let (cancel_tx, _) = watch::channel(false);
        self.active.write().await.insert(id.clone(), cancel_tx);

        debug!(session_id = %id, "session created");
        Ok(id)
    }

    /// Create a session and drive it to a terminal state.
    pub async fn run_session(
        &self,
        commands: &[Command],
    ) -> Result<SessionResult, DispatchError> {
        let id = self.create_session().await?;
        self.run(&id, commands).await
    }

    /// Drive a previously created session to a terminal state.
    pub async fn run(
        &self,
        session_id: &str,
        commands: &[Command],
    ) -> Result<SessionResult, DispatchError> {
        let mut record = self
            .state
            .get_session(session_id)?
            .ok_or_else(|| DispatchError::UnknownSession(session_id.to_string()))?;
        if record.state.is_terminal() {
            return Err(match record.state {
                SessionState::Cancelled => DispatchError::Cancelled(record.id),
                _ => DispatchError::UnknownSession(record.id),
            });
        }

        let cancel_rx = {
            let active = self.active.read().await;
            active
                .get(session_id)
                .map(watch::Sender::subscribe)
                .ok_or_else(|| DispatchError::UnknownSession(session_id.to_string()))?
        };

        let outcome = self.drive(&mut record, commands, cancel_rx).await;
        self.active.write().await.remove(session_id);

        record.state = match &outcome {
            Ok(_) => SessionState::Completed,
            Err(DispatchError::Cancelled(_)) => SessionState::Cancelled,
            Err(_) => SessionState::Failed,
        };
        record.worker_id = None;
        record.updated_at = epoch_secs();
        self.state.put_session(&record)?;

        match &outcome {
            Ok(_) => info!(session_id = %record.id, attempts = record.retry_count + 1, "session completed"),
            Err(e) => warn!(session_id = %record.id, error = %e, "session ended without result"),
        }
        outcome
    }

    /// Request cancellation of a session.
    ///
    /// A running session releases its binding and ends with `Cancelled`;
    /// a created-but-never-run session is finalized here directly so its
    /// cancellation handle does not linger. Idempotent: cancelling a
    /// session that already reached a terminal state (or was never
    /// created) is a no-op.
    pub async fn cancel(&self, session_id: &str) {
        let mut active = self.active.write().await;
        let Some(tx) = active.get(session_id) else {
            return;
        };
        debug!(session_id, "cancellation requested");
        let _ = tx.send(true);

        // No runner subscribed: nothing will observe the signal or clean
        // up the registry entry, so finalize the session now.
        if tx.receiver_count() == 0 {
            active.remove(session_id);
            if let Ok(Some(mut record)) = self.state.get_session(session_id) {
                if !record.state.is_terminal() {
                    record.state = SessionState::Cancelled;
                    record.updated_at = epoch_secs();
                    if let Err(e) = self.state.put_session(&record) {
                        warn!(session_id, error = %e, "failed to record cancellation");
                    }
                }
            }
        }
    }

    /// Ids of sessions that have not reached a terminal state.
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        self.active.read().await.keys().cloned().collect()
    }

    /// Latest persisted record for a session.
    pub fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, DispatchError> {
        Ok(self.state.get_session(session_id)?)
    }

    async fn drive(
        &self,
        record: &mut SessionRecord,
        commands: &[Command],
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionResult, DispatchError> {
        // Only the most recent failed worker is avoided on rebind; older
        // failures may have recovered or left the pool.
        let mut excluded: Vec<WorkerId> = Vec::new();
        let mut backoff = self.config.retry_backoff;
        let mut last_failure = String::new();

        loop {
            if *cancel.borrow() {
                return Err(DispatchError::Cancelled(record.id.clone()));
            }

            let binding = match self
                .router
                .route_with_retry(&excluded, self.config.route_attempts, self.config.route_backoff)
                .await
            {
                Ok(binding) => binding,
                Err(RouteError::NoHealthyWorker) => return Err(DispatchError::NoHealthyWorker),
                Err(RouteError::Pool(e)) => {
                    return Err(DispatchError::SessionFailed {
                        id: record.id.clone(),
                        attempts: record.retry_count,
                        reason: e.to_string(),
                    });
                }
            };

            record.worker_id = Some(binding.worker_id().to_string());
            record.state = SessionState::Bound;
            record.updated_at = epoch_secs();
            self.state.put_session(record)?;

            record.state = SessionState::Active;
            self.state.put_session(record)?;
            debug!(
                session_id = %record.id,
                worker_id = %binding.worker_id(),
                attempt = record.retry_count + 1,
                "session attempt started"
            );

            let attempt = tokio::time::timeout(
                self.config.session_timeout,
                self.client.execute(binding.address(), commands),
            );

            tokio::select! {
                result = attempt => match result {
                    Ok(Ok(session_result)) => {
                        binding.release();
                        return Ok(session_result);
                    }
                    Ok(Err(e)) => {
                        warn!(
                            session_id = %record.id,
                            worker_id = %binding.worker_id(),
                            error = %e,
                            "session attempt failed"
                        );
                        last_failure = e.to_string();
                        let worker = binding.worker_id().to_string();
                        if matches!(e, ClientError::Transport(_)) {
                            // A worker we cannot reach is likely gone for
                            // everyone; stop routing onto it.
                            let _ = self.pool.mark_failed(&worker);
                        }
                        binding.release();
                        excluded = vec![worker];
                    }
                    Err(_) => {
                        warn!(
                            session_id = %record.id,
                            worker_id = %binding.worker_id(),
                            timeout_secs = self.config.session_timeout.as_secs(),
                            "worker unresponsive, marking failed"
                        );
                        last_failure = format!(
                            "worker unresponsive after {}s",
                            self.config.session_timeout.as_secs()
                        );
                        let worker = binding.worker_id().to_string();
                        let _ = self.pool.mark_failed(&worker);
                        binding.release();
                        excluded = vec![worker];
                    }
                },
                _ = cancel.changed() => {
                    binding.release();
                    return Err(DispatchError::Cancelled(record.id.clone()));
                }
            }

            record.retry_count += 1;
            record.worker_id = None;
            record.updated_at = epoch_secs();
            self.state.put_session(record)?;

            if record.retry_count >= self.config.max_attempts {
                return Err(DispatchError::SessionFailed {
                    id: record.id.clone(),
                    attempts: record.retry_count,
                    reason: last_failure,
                });
            }

            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

    /// Fails the first `fail_first` calls with a transport error, then
    /// succeeds. Records the address of every call.
    struct FlakyClient {
        fail_first: u32,
        calls: AtomicU32,
        addresses: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FlakyClient {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                addresses: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn slow(fail_first: u32, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(fail_first)
            }
        }

        fn addresses(&self) -> Vec<String> {
            self.addresses.lock().unwrap().clone()
        }
    }

    impl WorkerClient for FlakyClient {
        fn execute(
            &self,
            address: &str,
            commands: &[Command],
        ) -> BoxFuture<Result<SessionResult, ClientError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.addresses.lock().unwrap().push(address.to_string());
            let fail = call < self.fail_first;
            let delay = self.delay;
            let outcomes = commands
                .iter()
                .map(|c| crate::client::CommandOutcome {
                    name: c.name.clone(),
                    success: true,
                    detail: None,
                })
                .collect();

            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if fail {
                    Err(ClientError::Transport("connection reset".to_string()))
                } else {
                    Ok(SessionResult { outcomes })
                }
            })
        }
    }

    fn fast_config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            max_attempts,
            retry_backoff: Duration::from_millis(1),
            session_timeout: Duration::from_secs(5),
            route_attempts: 1,
            route_backoff: Duration::from_millis(1),
        }
    }

    fn controller_with(
        client: Arc<dyn WorkerClient>,
        config: DispatchConfig,
        addresses: &[&str],
    ) -> (Arc<DispatchController>, Arc<PoolManager>, Vec<String>) {
        let state = StateStore::open_in_memory().unwrap();
        let pool = Arc::new(
            PoolManager::new(PoolConfig::default(), state.clone()).unwrap(),
        );
        let mut ids = Vec::new();
        for address in addresses {
            let worker = pool.admit(address).unwrap();
            pool.mark_ready(&worker.id).unwrap();
            ids.push(worker.id);
        }
        let controller = Arc::new(DispatchController::new(pool.clone(), client, state, config));
        (controller, pool, ids)
    }

    fn commands() -> Vec<Command> {
        vec![Command::new("navigate"), Command::new("click")]
    }

    #[tokio::test]
    async fn successful_session_completes_and_frees_worker() {
        let client = Arc::new(FlakyClient::new(0));
        let (controller, pool, ids) = controller_with(client, fast_config(3), &["10.0.0.1:4444"]);

        let result = controller.run_session(&commands()).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.outcomes.len(), 2);
        assert_eq!(pool.get(&ids[0]).unwrap().current_load, 0);

        let record = controller.session("session-1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::Completed);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn transport_failure_rebinds_to_different_worker() {
        let client = Arc::new(FlakyClient::new(1));
        let (controller, pool, _) = controller_with(
            client.clone(),
            fast_config(3),
            &["10.0.0.1:4444", "10.0.0.2:4444"],
        );

        let result = controller.run_session(&commands()).await.unwrap();
        assert!(result.passed());

        // The retry went to the other worker.
        let seen = client.addresses();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);

        // Each attempt released its reservation exactly once.
        for worker in pool.snapshot() {
            assert_eq!(worker.current_load, 0);
        }
        let record = controller.session("session-1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::Completed);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_session() {
        let client = Arc::new(FlakyClient::new(u32::MAX));
        // Three workers so routing never runs dry before the budget does.
        let (controller, _, _) = controller_with(
            client.clone(),
            fast_config(2),
            &["10.0.0.1:4444", "10.0.0.2:4444", "10.0.0.3:4444"],
        );

        let err = controller.run_session(&commands()).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::SessionFailed { attempts: 2, .. }
        ));
        assert_eq!(client.addresses().len(), 2);

        let record = controller.session("session-1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::Failed);
        assert_eq!(record.retry_count, 2);
    }

    #[tokio::test]
    async fn empty_pool_is_no_healthy_worker() {
        let client = Arc::new(FlakyClient::new(0));
        let (controller, _, _) = controller_with(client, fast_config(3), &[]);

        let err = controller.run_session(&commands()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyWorker));

        let record = controller.session("session-1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn starting_workers_are_not_dispatched_to() {
        let client = Arc::new(FlakyClient::new(0));
        let state = StateStore::open_in_memory().unwrap();
        let pool = Arc::new(
            PoolManager::new(PoolConfig::default(), state.clone()).unwrap(),
        );
        pool.admit("10.0.0.1:4444").unwrap();
        let controller =
            DispatchController::new(pool, client, state, fast_config(3));

        let err = controller.run_session(&commands()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyWorker));
    }

    #[tokio::test]
    async fn timed_out_attempt_marks_worker_failed_and_rebinds() {
        let client = Arc::new(FlakyClient::slow(1, Duration::from_millis(50)));
        let config = DispatchConfig {
            session_timeout: Duration::from_millis(5),
            ..fast_config(2)
        };
        let (controller, pool, ids) = controller_with(
            client.clone(),
            config,
            &["10.0.0.1:4444", "10.0.0.2:4444"],
        );

        // Both attempts sleep 50ms against a 5ms bound, exhausting the
        // budget of 2.
        let err = controller.run_session(&commands()).await.unwrap_err();
        assert!(matches!(err, DispatchError::SessionFailed { .. }));

        // Both workers were marked failed and left the pool once their
        // reservations were released.
        assert_eq!(pool.member_count(), 0);
        assert!(pool.get(&ids[0]).is_none());
        assert!(pool.get(&ids[1]).is_none());
    }

    #[tokio::test]
    async fn cancellation_releases_binding_and_is_terminal() {
        let client = Arc::new(FlakyClient::slow(0, Duration::from_secs(30)));
        let (controller, pool, ids) =
            controller_with(client, fast_config(3), &["10.0.0.1:4444"]);

        let id = controller.create_session().await.unwrap();
        let runner = controller.clone();
        let run_id = id.clone();
        let handle = tokio::spawn(async move { runner.run(&run_id, &commands()).await });

        // Let the attempt bind before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.get(&ids[0]).unwrap().current_load, 1);

        controller.cancel(&id).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled(_)));

        assert_eq!(pool.get(&ids[0]).unwrap().current_load, 0);
        let record = controller.session(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let client = Arc::new(FlakyClient::new(0));
        let (controller, _, _) = controller_with(client, fast_config(3), &["10.0.0.1:4444"]);

        controller.run_session(&commands()).await.unwrap();
        controller.cancel("session-1").await;
        controller.cancel("session-1").await;

        let record = controller.session("session-1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn cancel_before_run_aborts_immediately() {
        let client = Arc::new(FlakyClient::new(0));
        let (controller, _, _) = controller_with(client.clone(), fast_config(3), &["10.0.0.1:4444"]);

        let id = controller.create_session().await.unwrap();
        controller.cancel(&id).await;

        let err = controller.run(&id, &commands()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled(_)));
        assert!(client.addresses().is_empty());
    }

    #[tokio::test]
    async fn cancel_of_unstarted_session_evicts_registry_entry() {
        let client = Arc::new(FlakyClient::new(0));
        let (controller, _, _) = controller_with(client, fast_config(3), &["10.0.0.1:4444"]);

        let id = controller.create_session().await.unwrap();
        assert_eq!(controller.active_sessions().await, vec![id.clone()]);

        controller.cancel(&id).await;

        // The cancellation handle is gone and the record is terminal.
        assert!(controller.active_sessions().await.is_empty());
        let record = controller.session(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Cancelled);

        // Repeat cancel stays a no-op.
        controller.cancel(&id).await;
        let record = controller.session(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Cancelled);
    }

    #[tokio::test]
    async fn run_on_unknown_session_errors() {
        let client = Arc::new(FlakyClient::new(0));
        let (controller, _, _) = controller_with(client, fast_config(3), &["10.0.0.1:4444"]);

        let err = controller.run("session-99", &commands()).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn failed_worker_is_removed_from_routing() {
        // Single worker, transport failure: the worker is marked failed,
        // and with nothing left to rebind to the session reports
        // NoHealthyWorker rather than hammering the dead worker.
        let client = Arc::new(FlakyClient::new(u32::MAX));
        let (controller, pool, _) =
            controller_with(client.clone(), fast_config(3), &["10.0.0.1:4444"]);

        let err = controller.run_session(&commands()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyWorker));
        assert_eq!(client.addresses().len(), 1);
        assert_eq!(pool.member_count(), 0);
    }
}
