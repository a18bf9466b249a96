// src/scheduler/mod.rs
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{error, info};

/// A background job run on a fixed interval. Each run gets a deadline.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, deadline: Instant) -> anyhow::Result<()>;
}

struct ScheduledJob {
    job: Arc<dyn PeriodicJob>,
    every: Duration,
    budget: Duration,
}

/// Runs each registered job once immediately, then every `every`.
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// `budget` bounds each run: the job receives `now + budget` as its deadline.
    pub fn register(mut self, job: Arc<dyn PeriodicJob>, every: Duration, budget: Duration) -> Self {
        self.jobs.push(ScheduledJob { job, every, budget });
        self
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.jobs
            .iter()
            .map(|scheduled| {
                let job = scheduled.job.clone();
                let every = scheduled.every;
                let budget = scheduled.budget;
                let shutdown_rx = self.shutdown_rx.clone();
                tokio::spawn(run_job(job, every, budget, shutdown_rx))
            })
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job(
    job: Arc<dyn PeriodicJob>,
    every: Duration,
    budget: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Starting {} with interval: {:?}", job.name(), every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let deadline = Instant::now() + budget;
                if let Err(e) = job.run(deadline).await {
                    // Retried on the next tick.
                    error!("{} run failed: {:#}", job.name(), e);
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("{} shutting down", job.name());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        runs: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, _deadline: Instant) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_on_interval() {
        let job = Arc::new(CountingJob { runs: AtomicU32::new(0), fail: false });
        let scheduler = Scheduler::new().register(job.clone(), Duration::from_secs(60), Duration::from_secs(30));

        let handles = scheduler.start();
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_are_retried_next_tick() {
        let job = Arc::new(CountingJob { runs: AtomicU32::new(0), fail: true });
        let scheduler = Scheduler::new().register(job.clone(), Duration::from_secs(10), Duration::from_secs(5));

        let handles = scheduler.start();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
        futures::future::join_all(handles).await;
    }
}
