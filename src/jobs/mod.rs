/// Background job scheduler: source refresh, cache cleanup and artifact sweep
use crate::{artifact::ArtifactMap, store::MetadataResolver};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod tasks;

/// Fallback retry delay when a refreshing source names none
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(300);

/// How often the periodic jobs run
#[derive(Debug, Clone, Copy)]
pub struct JobIntervals {
    pub resolver_cleanup: Duration,
    pub artifact_sweep: Duration,
}

impl Default for JobIntervals {
    fn default() -> Self {
        Self {
            resolver_cleanup: Duration::from_secs(30 * 60),
            artifact_sweep: Duration::from_secs(5 * 60),
        }
    }
}

/// Job scheduler for background tasks
///
/// Every job stops when the scheduler shuts down or when the resolver it
/// serves is destroyed.
pub struct JobScheduler {
    resolvers: Vec<Arc<MetadataResolver>>,
    artifacts: Option<Arc<dyn ArtifactMap>>,
    intervals: JobIntervals,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        resolvers: Vec<Arc<MetadataResolver>>,
        artifacts: Option<Arc<dyn ArtifactMap>>,
        intervals: JobIntervals,
    ) -> Self {
        Self {
            resolvers,
            artifacts,
            intervals,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Build a scheduler over everything the application context owns
    pub fn from_context(ctx: &crate::context::AppContext) -> Self {
        Self::new(
            vec![Arc::clone(&ctx.resolver)],
            Some(Arc::clone(&ctx.artifacts)),
            ctx.config.job_intervals(),
        )
    }

    /// Start all background jobs
    pub fn start(self: &Arc<Self>) {
        info!("Starting background job scheduler");
        let mut spawned = Vec::new();

        for resolver in &self.resolvers {
            spawned.push(tokio::spawn(Self::resolver_cleanup_job(
                Arc::clone(self),
                Arc::clone(resolver),
            )));

            // Only sources that reload on a schedule get a refresh loop
            if resolver.next_refresh_delay().is_some() || resolver.retry_delay().is_some() {
                spawned.push(tokio::spawn(Self::refresh_job(
                    Arc::clone(self),
                    Arc::clone(resolver),
                )));
            }
        }

        if let Some(artifacts) = &self.artifacts {
            spawned.push(tokio::spawn(Self::artifact_sweep_job(
                Arc::clone(self),
                Arc::clone(artifacts),
            )));
        }

        let count = spawned.len();
        match self.handles.lock() {
            Ok(mut handles) => handles.extend(spawned),
            Err(poisoned) => poisoned.into_inner().extend(spawned),
        }
        info!("Background jobs started ({} tasks)", count);
    }

    /// Cancel every job and wait for them to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background job ended abnormally: {}", e);
            }
        }
        info!("Background jobs stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Evict expired and idle records
    async fn resolver_cleanup_job(scheduler: Arc<Self>, resolver: Arc<MetadataResolver>) {
        let resolver_shutdown = resolver.shutdown_token();
        let mut interval = interval(scheduler.intervals.resolver_cleanup);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scheduler.shutdown.cancelled() => break,
                _ = resolver_shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let evicted = tasks::cleanup_resolver(&resolver);
            if evicted > 0 {
                info!("{}: cleanup evicted {} record(s)", resolver.id(), evicted);
            }
        }
        debug!("{}: cleanup job stopped", resolver.id());
    }

    /// Reload a full-pull source on the delay its last refresh asked for
    async fn refresh_job(scheduler: Arc<Self>, resolver: Arc<MetadataResolver>) {
        let resolver_shutdown = resolver.shutdown_token();
        let mut delay = resolver
            .next_refresh_delay()
            .or_else(|| resolver.retry_delay())
            .unwrap_or(DEFAULT_RETRY_DELAY);

        loop {
            debug!("{}: next refresh in {:?}", resolver.id(), delay);
            tokio::select! {
                _ = scheduler.shutdown.cancelled() => break,
                _ = resolver_shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }

            match tasks::refresh_resolver(&resolver).await {
                Ok(Some(next)) => delay = next,
                Ok(None) => {
                    debug!("{}: source no longer refreshes", resolver.id());
                    break;
                }
                Err(e) => {
                    error!("{}: refresh failed: {}", resolver.id(), e);
                    delay = resolver.retry_delay().unwrap_or(DEFAULT_RETRY_DELAY);
                }
            }
        }
        debug!("{}: refresh job stopped", resolver.id());
    }

    /// Sweep expired artifacts
    async fn artifact_sweep_job(scheduler: Arc<Self>, artifacts: Arc<dyn ArtifactMap>) {
        let mut interval = interval(scheduler.intervals.artifact_sweep);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scheduler.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match tasks::sweep_artifacts(artifacts.as_ref()).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Swept {} expired artifacts", count);
                    }
                }
                Err(e) => error!("Failed to sweep artifacts: {}", e),
            }
        }
        debug!("Artifact sweep job stopped");
    }
}
