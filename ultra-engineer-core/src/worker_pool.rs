//! Bounded concurrent executor with per-repo and global limits, and a
//! graceful-shutdown protocol that persists in-flight state before giving
//! up.
//!
//! No tokio: a fixed number of long-lived `std::thread::spawn` workers
//! pull jobs off an `mpsc` queue, one `IssueWorker::step` loop per job.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::model::{IssueState, Phase};
use crate::retry::Cancel;

/// `jobID = "<repo>-<number>"`, parsed by splitting on the last hyphen.
pub fn job_id(repo: &str, number: u64) -> String {
    format!("{repo}-{number}")
}

pub fn parse_job_id(id: &str) -> Option<(String, u64)> {
    let pos = id.rfind('-')?;
    let number = id[pos + 1..].parse::<u64>().ok()?;
    Some((id[..pos].to_string(), number))
}

/// One unit of work submitted to the pool. `state` is a live handle the
/// pool can read during graceful shutdown without waiting for the job to
/// finish; `run` is the job body, invoked on a worker thread with a cancel
/// handle scoped to this run.
pub struct Job {
    pub repo: String,
    pub number: u64,
    pub state: Arc<Mutex<IssueState>>,
    pub run: Box<dyn FnOnce(&Cancel) -> JobOutcome + Send>,
}

/// What a finished job reports back through the results channel.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub repo: String,
    pub number: u64,
    pub final_phase: Phase,
    pub error: Option<String>,
}

/// Why `try_submit` rejected a job — an ordinary outcome, not an error
/// the scheduler retries next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotAccepting,
    GlobalLimitReached,
    RepoLimitReached,
}

struct Counters {
    accepting: bool,
    total_active: usize,
    active_by_repo: HashMap<String, usize>,
}

/// Bounded concurrent executor.
pub struct WorkerPool {
    max_per_repo: usize,
    max_total: usize,
    counters: Mutex<Counters>,
    queue_tx: mpsc::Sender<Job>,
    results_rx: Mutex<mpsc::Receiver<JobOutcome>>,
    active_jobs: Arc<Mutex<HashMap<String, Arc<Mutex<IssueState>>>>>,
    cancel: Cancel,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns exactly `max_total` worker threads, each pulling jobs off the
    /// shared queue until it closes.
    pub fn new(max_per_repo: usize, max_total: usize, cancel: Cancel) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel::<Job>();
        let (results_tx, results_rx) = mpsc::channel::<JobOutcome>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let active_jobs = Arc::new(Mutex::new(HashMap::new()));

        let pool = Arc::new(Self {
            max_per_repo,
            max_total,
            counters: Mutex::new(Counters {
                accepting: true,
                total_active: 0,
                active_by_repo: HashMap::new(),
            }),
            queue_tx,
            results_rx: Mutex::new(results_rx),
            active_jobs: active_jobs.clone(),
            cancel: cancel.clone(),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(max_total);
        for _ in 0..max_total {
            let queue_rx = queue_rx.clone();
            let results_tx = results_tx.clone();
            let active_jobs = active_jobs.clone();
            let cancel = cancel.clone();
            handles.push(std::thread::spawn(move || loop {
                let job = {
                    let rx = queue_rx.lock().expect("worker queue mutex poisoned");
                    rx.recv()
                };
                let Ok(job) = job else {
                    return;
                };
                let id = job_id(&job.repo, job.number);
                active_jobs
                    .lock()
                    .expect("active jobs mutex poisoned")
                    .insert(id.clone(), job.state.clone());
                let outcome = (job.run)(&cancel);
                active_jobs
                    .lock()
                    .expect("active jobs mutex poisoned")
                    .remove(&id);
                let _ = results_tx.send(outcome);
            }));
        }
        *pool.handles.lock().expect("handles mutex poisoned") = handles;
        pool
    }

    /// Non-blocking, atomic: rejects per the pool's three admission conditions, else
    /// enqueues and increments counters under one lock acquisition.
    pub fn try_submit(&self, job: Job) -> Result<(), RejectReason> {
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        if !counters.accepting {
            return Err(RejectReason::NotAccepting);
        }
        if counters.total_active >= self.max_total {
            return Err(RejectReason::GlobalLimitReached);
        }
        let repo_active = counters.active_by_repo.get(&job.repo).copied().unwrap_or(0);
        if repo_active >= self.max_per_repo {
            return Err(RejectReason::RepoLimitReached);
        }
        counters.total_active += 1;
        *counters.active_by_repo.entry(job.repo.clone()).or_insert(0) += 1;
        self.queue_tx
            .send(job)
            .map_err(|_| RejectReason::NotAccepting)
    }

    /// Drains every outcome currently on the results channel without blocking.
    pub fn drain_results(&self) -> Vec<JobOutcome> {
        let rx = self.results_rx.lock().expect("results mutex poisoned");
        let mut out = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            out.push(outcome);
        }
        out
    }

    /// Releases the counters for `repo`. The caller MUST call this exactly
    /// once per result it consumes from `drain_results`.
    pub fn on_job_complete(&self, repo: &str) {
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        counters.total_active = counters.total_active.saturating_sub(1);
        if let Some(count) = counters.active_by_repo.get_mut(repo) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.active_by_repo.remove(repo);
            }
        }
    }

    pub fn active_total(&self) -> usize {
        self.counters.lock().expect("counters mutex poisoned").total_active
    }

    /// Joins every worker thread. Workers never exit on their own (the
    /// queue sender is held by the pool for its whole lifetime), so this
    /// only returns promptly once the process is tearing down the pool
    /// along with its one remaining `Sender`.
    pub fn join_all(&self) {
        let mut handles = self.handles.lock().expect("handles mutex poisoned");
        for h in handles.drain(..) {
            let _ = h.join();
        }
    }

    /// Graceful shutdown, in order:
    /// 1. stop accepting new jobs;
    /// 2. snapshot every live job's state and persist it via `persist`;
    /// 3. wait for workers up to `deadline`;
    /// 4. if the deadline elapses, cancel the root handle and report it.
    pub fn shutdown(
        &self,
        persist: impl Fn(&str, u64, &IssueState),
        deadline: Duration,
    ) -> Result<(), ()> {
        self.counters.lock().expect("counters mutex poisoned").accepting = false;

        let snapshot: Vec<(String, Arc<Mutex<IssueState>>)> = self
            .active_jobs
            .lock()
            .expect("active jobs mutex poisoned")
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        for (id, state) in snapshot {
            if let Some((repo, number)) = parse_job_id(&id) {
                let state = state.lock().expect("job state mutex poisoned").clone();
                persist(&repo, number, &state);
            }
        }

        let start = Instant::now();
        loop {
            if self.active_jobs.lock().expect("active jobs mutex poisoned").is_empty() {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                self.cancel.cancel();
                return Err(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Issue;
    use chrono::Utc;

    fn sample_state() -> IssueState {
        let issue = Issue {
            repo: "acme/widgets".to_string(),
            number: 7,
            title: "t".to_string(),
            body: "b".to_string(),
            labels: vec![],
            author: "a".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        IssueState::synthesize(&issue)
    }

    #[test]
    fn job_id_round_trips() {
        assert_eq!(job_id("acme/widgets", 7), "acme/widgets-7");
        assert_eq!(
            parse_job_id("acme/widgets-7"),
            Some(("acme/widgets".to_string(), 7))
        );
    }

    #[test]
    fn repo_limit_rejects_second_job_for_same_repo() {
        let pool = WorkerPool::new(1, 5, Cancel::new());
        let job1 = Job {
            repo: "acme/widgets".to_string(),
            number: 1,
            state: Arc::new(Mutex::new(sample_state())),
            run: Box::new(|_c| JobOutcome {
                repo: "acme/widgets".to_string(),
                number: 1,
                final_phase: Phase::Completed,
                error: None,
            }),
        };
        assert!(pool.try_submit(job1).is_ok());

        let job2 = Job {
            repo: "acme/widgets".to_string(),
            number: 2,
            state: Arc::new(Mutex::new(sample_state())),
            run: Box::new(|_c| JobOutcome {
                repo: "acme/widgets".to_string(),
                number: 2,
                final_phase: Phase::Completed,
                error: None,
            }),
        };
        assert_eq!(pool.try_submit(job2), Err(RejectReason::RepoLimitReached));
    }

    #[test]
    fn global_limit_rejects_beyond_max_total() {
        let pool = WorkerPool::new(5, 1, Cancel::new());
        let job1 = Job {
            repo: "acme/a".to_string(),
            number: 1,
            state: Arc::new(Mutex::new(sample_state())),
            run: Box::new(|_c| {
                std::thread::sleep(Duration::from_millis(200));
                JobOutcome {
                    repo: "acme/a".to_string(),
                    number: 1,
                    final_phase: Phase::Completed,
                    error: None,
                }
            }),
        };
        pool.try_submit(job1).unwrap();
        let job2 = Job {
            repo: "acme/b".to_string(),
            number: 2,
            state: Arc::new(Mutex::new(sample_state())),
            run: Box::new(|_c| JobOutcome {
                repo: "acme/b".to_string(),
                number: 2,
                final_phase: Phase::Completed,
                error: None,
            }),
        };
        assert_eq!(pool.try_submit(job2), Err(RejectReason::GlobalLimitReached));
    }

    #[test]
    fn completed_job_shows_up_in_results_and_releases_after_on_job_complete() {
        let pool = WorkerPool::new(5, 5, Cancel::new());
        let job = Job {
            repo: "acme/widgets".to_string(),
            number: 1,
            state: Arc::new(Mutex::new(sample_state())),
            run: Box::new(|_c| JobOutcome {
                repo: "acme/widgets".to_string(),
                number: 1,
                final_phase: Phase::Completed,
                error: None,
            }),
        };
        pool.try_submit(job).unwrap();

        let mut results = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while results.is_empty() && Instant::now() < deadline {
            results = pool.drain_results();
            if results.is_empty() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        assert_eq!(results.len(), 1);
        assert_eq!(pool.active_total(), 1);
        pool.on_job_complete(&results[0].repo);
        assert_eq!(pool.active_total(), 0);
    }

    #[test]
    fn zero_max_per_repo_never_schedules() {
        let pool = WorkerPool::new(0, 5, Cancel::new());
        let job = Job {
            repo: "acme/widgets".to_string(),
            number: 1,
            state: Arc::new(Mutex::new(sample_state())),
            run: Box::new(|_c| JobOutcome {
                repo: "acme/widgets".to_string(),
                number: 1,
                final_phase: Phase::Completed,
                error: None,
            }),
        };
        assert_eq!(pool.try_submit(job), Err(RejectReason::RepoLimitReached));
    }

    #[test]
    fn shutdown_persists_live_state_and_cancels_on_deadline() {
        let cancel = Cancel::new();
        let pool = WorkerPool::new(5, 5, cancel.clone());
        let state = Arc::new(Mutex::new(sample_state()));
        let job = Job {
            repo: "acme/widgets".to_string(),
            number: 1,
            state: state.clone(),
            run: Box::new(|c| {
                while !c.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(10));
                }
                JobOutcome {
                    repo: "acme/widgets".to_string(),
                    number: 1,
                    final_phase: Phase::Failed,
                    error: Some("cancelled".to_string()),
                }
            }),
        };
        pool.try_submit(job).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let persisted = Arc::new(Mutex::new(Vec::new()));
        let persisted_clone = persisted.clone();
        let result = pool.shutdown(
            move |repo, number, _state| {
                persisted_clone
                    .lock()
                    .unwrap()
                    .push((repo.to_string(), number));
            },
            Duration::from_millis(100),
        );
        assert!(result.is_err());
        assert!(cancel.is_cancelled());
        assert_eq!(
            persisted.lock().unwrap().as_slice(),
            &[("acme/widgets".to_string(), 1)]
        );
    }
}
