//! Autoscaler — the control loop that sizes the worker pool.
//!
//! Each tick: sample utilization, decide a target count, converge the
//! pool toward it. The decision step is a pure function of the sample, so
//! it is testable without any real workers.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use gridhub_health::ReadinessMonitor;
use gridhub_pool::{PoolError, PoolManager, ProvisionRetry, Provisioner};
use gridhub_state::{StateStore, UtilizationSample};

/// Utilization samples kept as history in the state store.
const SAMPLE_HISTORY: usize = 100;

/// A scaling decision for one evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Steer the pool to the specified worker count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// The autoscaler evaluates pool utilization and converges membership
/// toward the desired count.
pub struct Autoscaler {
    pool: Arc<PoolManager>,
    provisioner: Arc<dyn Provisioner>,
    monitor: Arc<ReadinessMonitor>,
    state: StateStore,
    retry: ProvisionRetry,
    /// Cooldown tracking (unix seconds).
    last_scale_up: u64,
    last_scale_down: u64,
    /// Set while the provisioner cannot realize the desired count.
    degraded: bool,
}

impl Autoscaler {
    pub fn new(
        pool: Arc<PoolManager>,
        provisioner: Arc<dyn Provisioner>,
        monitor: Arc<ReadinessMonitor>,
        state: StateStore,
    ) -> Self {
        Self {
            pool,
            provisioner,
            monitor,
            state,
            retry: ProvisionRetry::default(),
            last_scale_up: 0,
            last_scale_down: 0,
            degraded: true, // Until the pool first reaches min_count.
        }
    }

    /// Override the provisioning retry policy.
    pub fn with_retry(mut self, retry: ProvisionRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the pool is currently below its desired count because
    /// provisioning keeps failing.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Decide a target count from one utilization sample.
    ///
    /// `desired = ceil(ready × aggregate / target)`, clamped to the pool
    /// bounds. Returns `NoChange` when no worker is Ready (there is nothing
    /// to measure; convergence toward `desired` still runs every tick) or
    /// while a cooldown window is open.
    pub fn evaluate(&mut self, sample: &UtilizationSample) -> ScaleDecision {
        let config = self.pool.config().clone();
        if sample.ready_count == 0 {
            return ScaleDecision::NoChange;
        }

        let current = sample.ready_count;
        let raw = (f64::from(current) * sample.aggregate / config.target_utilization).ceil();
        let desired = (raw as u32).clamp(config.min_count, config.max_count);

        let now = epoch_secs();
        if desired > current {
            if now - self.last_scale_up < config.scale_up_cooldown_secs {
                debug!(desired, current, "scale-up suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            self.last_scale_up = now;
            info!(
                from = current,
                to = desired,
                aggregate = sample.aggregate,
                target = config.target_utilization,
                "scaling up"
            );
            return ScaleDecision::ScaleTo(desired);
        }

        if desired < current {
            if now - self.last_scale_down < config.scale_down_cooldown_secs {
                debug!(desired, current, "scale-down suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            self.last_scale_down = now;
            info!(
                from = current,
                to = desired,
                aggregate = sample.aggregate,
                target = config.target_utilization,
                "scaling down"
            );
            return ScaleDecision::ScaleTo(desired);
        }

        ScaleDecision::NoChange
    }

    /// One evaluation tick: sample, decide, converge, retire.
    ///
    /// Never returns an error for provisioning failures — those flip the
    /// degraded flag and leave routing on the existing workers untouched.
    pub async fn reconcile(&mut self) -> anyhow::Result<ScaleDecision> {
        let sample = self.pool.sample();
        self.state.put_sample(&sample)?;
        self.state.prune_samples(SAMPLE_HISTORY)?;

        let decision = self.evaluate(&sample);
        if let ScaleDecision::ScaleTo(target) = decision {
            self.pool.set_desired(target);
        }

        self.converge().await?;
        self.retire().await;
        Ok(decision)
    }

    /// Converge membership toward the desired count.
    async fn converge(&mut self) -> anyhow::Result<()> {
        let desired = self.pool.desired_count();
        let members = self.pool.member_count();

        if members < desired {
            let missing = desired - members;
            debug!(members, desired, missing, "provisioning workers");
            for _ in 0..missing {
                match self.retry.provision(self.provisioner.as_ref()).await {
                    Ok(provisioned) => {
                        let worker = self.pool.admit(&provisioned.address)?;
                        self.monitor.watch(&worker.id, &worker.address).await;
                    }
                    Err(PoolError::ProvisioningFailure { attempts, source }) => {
                        warn!(
                            attempts,
                            error = %source,
                            members = self.pool.member_count(),
                            desired,
                            "pool degraded: cannot provision worker"
                        );
                        self.degraded = true;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            self.degraded = false;
        } else if members > desired {
            let excess = members - desired;
            let victims = self.pool.begin_drain(excess)?;
            debug!(members, desired, victims = victims.len(), "draining workers");
        } else if self.degraded {
            self.degraded = false;
        }

        Ok(())
    }

    /// Deprovision workers that finished draining or failed out.
    async fn retire(&self) {
        for node in self.pool.take_retired() {
            self.monitor.unwatch(&node.id).await;
            if let Err(e) = self.provisioner.deprovision(&node.address).await {
                warn!(worker_id = %node.id, error = %e, "deprovision failed");
            }
        }
    }

    /// Run the evaluation loop at a fixed interval until shutdown.
    ///
    /// Each tick is independent of routing: the pool lock is only taken
    /// for short critical sections inside sample/converge, never across
    /// an await.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile().await {
                        tracing::error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
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
    use gridhub_health::ProbeConfig;
    use gridhub_pool::StaticProvisioner;
    use gridhub_state::{NodeLoad, PoolConfig};

    fn test_config(min: u32, max: u32) -> PoolConfig {
        PoolConfig {
            min_count: min,
            max_count: max,
            target_utilization: 0.5,
            scale_up_cooldown_secs: 0,
            scale_down_cooldown_secs: 0,
            ..PoolConfig::default()
        }
    }

    fn test_scaler(config: PoolConfig, addresses: Vec<&str>) -> Autoscaler {
        let state = StateStore::open_in_memory().unwrap();
        let pool = Arc::new(PoolManager::new(config, state.clone()).unwrap());
        let provisioner = Arc::new(StaticProvisioner::new(
            addresses.into_iter().map(String::from).collect(),
        ));
        let monitor = Arc::new(ReadinessMonitor::new(pool.clone(), ProbeConfig::default()));
        Autoscaler::new(pool, provisioner, monitor, state).with_retry(ProvisionRetry {
            max_attempts: 1,
            base_backoff: Duration::from_millis(1),
        })
    }

    fn sample(ready: u32, aggregate: f64) -> UtilizationSample {
        UtilizationSample {
            epoch: 1000,
            per_node: (0..ready)
                .map(|i| NodeLoad {
                    worker_id: format!("worker-{i}"),
                    load_fraction: aggregate,
                })
                .collect(),
            aggregate,
            ready_count: ready,
        }
    }

    #[test]
    fn one_overloaded_replica_scales_to_two() {
        // 1 replica at 90% load with a 50% target: ceil(1 × 0.9 / 0.5) = 2.
        let mut scaler = test_scaler(test_config(1, 5), vec![]);
        assert_eq!(
            scaler.evaluate(&sample(1, 0.9)),
            ScaleDecision::ScaleTo(2)
        );
    }

    #[test]
    fn scale_up_clamped_to_max() {
        let mut scaler = test_scaler(test_config(1, 5), vec![]);
        // ceil(3 × 1.0 / 0.5) = 6, clamped to 5.
        assert_eq!(
            scaler.evaluate(&sample(3, 1.0)),
            ScaleDecision::ScaleTo(5)
        );
    }

    #[test]
    fn at_max_stays_put() {
        let mut scaler = test_scaler(test_config(1, 5), vec![]);
        // ceil(5 × 0.9 / 0.5) = 9, clamped to 5 = current.
        assert_eq!(scaler.evaluate(&sample(5, 0.9)), ScaleDecision::NoChange);
    }

    #[test]
    fn underloaded_pool_scales_down() {
        let mut scaler = test_scaler(test_config(1, 5), vec![]);
        // ceil(4 × 0.2 / 0.5) = 2.
        assert_eq!(
            scaler.evaluate(&sample(4, 0.2)),
            ScaleDecision::ScaleTo(2)
        );
    }

    #[test]
    fn scale_down_clamped_to_min() {
        let mut scaler = test_scaler(test_config(2, 5), vec![]);
        // Idle pool wants 0 workers, clamped to min 2.
        assert_eq!(
            scaler.evaluate(&sample(4, 0.0)),
            ScaleDecision::ScaleTo(2)
        );
    }

    #[test]
    fn balanced_pool_is_stable() {
        let mut scaler = test_scaler(test_config(1, 5), vec![]);
        // ceil(4 × 0.5 / 0.5) = 4 = current.
        assert_eq!(scaler.evaluate(&sample(4, 0.5)), ScaleDecision::NoChange);
    }

    #[test]
    fn no_ready_workers_is_no_change() {
        let mut scaler = test_scaler(test_config(1, 5), vec![]);
        assert_eq!(scaler.evaluate(&sample(0, 0.0)), ScaleDecision::NoChange);
    }

    #[test]
    fn cooldown_suppresses_repeat_scale_up() {
        let config = PoolConfig {
            scale_up_cooldown_secs: 3600,
            ..test_config(1, 5)
        };
        let mut scaler = test_scaler(config, vec![]);

        assert_eq!(
            scaler.evaluate(&sample(1, 0.9)),
            ScaleDecision::ScaleTo(2)
        );
        // Second overload within the window is held back.
        assert_eq!(scaler.evaluate(&sample(1, 0.9)), ScaleDecision::NoChange);
    }

    #[test]
    fn cooldown_suppresses_repeat_scale_down() {
        let config = PoolConfig {
            scale_down_cooldown_secs: 3600,
            ..test_config(1, 5)
        };
        let mut scaler = test_scaler(config, vec![]);

        assert_eq!(
            scaler.evaluate(&sample(4, 0.1)),
            ScaleDecision::ScaleTo(1)
        );
        assert_eq!(scaler.evaluate(&sample(4, 0.1)), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn reconcile_bootstraps_pool_to_min() {
        let mut scaler = test_scaler(
            test_config(2, 5),
            vec!["10.0.0.1:4444", "10.0.0.2:4444", "10.0.0.3:4444"],
        );

        scaler.reconcile().await.unwrap();

        assert_eq!(scaler.pool.member_count(), 2);
        assert!(!scaler.is_degraded());
        assert_eq!(scaler.monitor.watched().await.len(), 2);
        scaler.monitor.stop_all().await;
    }

    #[tokio::test]
    async fn reconcile_scales_up_under_load() {
        let mut scaler = test_scaler(
            test_config(1, 5),
            vec!["10.0.0.1:4444", "10.0.0.2:4444", "10.0.0.3:4444"],
        );

        // Bootstrap one worker and make it Ready and fully loaded.
        scaler.reconcile().await.unwrap();
        let worker = &scaler.pool.snapshot()[0];
        scaler.pool.mark_ready(&worker.id).unwrap();
        scaler.pool.reserve(&[]).unwrap();

        // Aggregate 1.0 against target 0.5: desired = 2.
        let decision = scaler.reconcile().await.unwrap();
        assert_eq!(decision, ScaleDecision::ScaleTo(2));
        assert_eq!(scaler.pool.member_count(), 2);
        scaler.monitor.stop_all().await;
    }

    #[tokio::test]
    async fn reconcile_drains_idle_excess() {
        let mut scaler = test_scaler(
            test_config(1, 5),
            vec!["10.0.0.1:4444", "10.0.0.2:4444", "10.0.0.3:4444"],
        );

        // Three Ready idle workers.
        scaler.pool.set_desired(3);
        scaler.reconcile().await.unwrap();
        for worker in scaler.pool.snapshot() {
            scaler.pool.mark_ready(&worker.id).unwrap();
        }

        // All idle: aggregate 0.0 wants min_count = 1.
        let decision = scaler.reconcile().await.unwrap();
        assert_eq!(decision, ScaleDecision::ScaleTo(1));
        assert_eq!(scaler.pool.member_count(), 1);
        // Drained workers were handed back to the provisioner.
        scaler.monitor.stop_all().await;
    }

    #[tokio::test]
    async fn provisioning_failure_degrades_but_does_not_error() {
        let mut scaler = test_scaler(test_config(1, 5), vec![]);

        let decision = scaler.reconcile().await.unwrap();
        assert_eq!(decision, ScaleDecision::NoChange);
        assert!(scaler.is_degraded());
        assert_eq!(scaler.pool.member_count(), 0);
    }

    #[tokio::test]
    async fn degraded_pool_recovers_when_platform_returns() {
        let state = StateStore::open_in_memory().unwrap();
        let pool = Arc::new(PoolManager::new(test_config(1, 5), state.clone()).unwrap());
        let provisioner = Arc::new(StaticProvisioner::new(vec![]));
        let monitor = Arc::new(ReadinessMonitor::new(pool.clone(), ProbeConfig::default()));
        let mut scaler = Autoscaler::new(
            pool.clone(),
            provisioner.clone(),
            monitor.clone(),
            state,
        )
        .with_retry(ProvisionRetry {
            max_attempts: 1,
            base_backoff: Duration::from_millis(1),
        });

        scaler.reconcile().await.unwrap();
        assert!(scaler.is_degraded());

        // Capacity appears on the platform.
        provisioner.deprovision("10.0.0.1:4444").await.unwrap();
        scaler.reconcile().await.unwrap();
        assert!(!scaler.is_degraded());
        assert_eq!(pool.member_count(), 1);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn reconcile_records_sample_history() {
        let mut scaler = test_scaler(test_config(1, 5), vec!["10.0.0.1:4444"]);
        scaler.reconcile().await.unwrap();
        scaler.reconcile().await.unwrap();

        let samples = scaler.state.recent_samples(10).unwrap();
        assert!(!samples.is_empty());
        scaler.monitor.stop_all().await;
    }
}
