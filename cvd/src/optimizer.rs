// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Batch startup optimizer
//!
//! When a batch of containers must start, a fixed worker pool drains a
//! priority queue: service names hint at priority, dependency edges gate
//! readiness. Workers block on `work_available` and broadcast
//! `work_completed` on every terminal transition, so dependents wake
//! exactly when their gate opens.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_PARALLEL_LIMIT: usize = 4;
pub const DEFAULT_DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Service-name heuristics: databases first, observability last
pub fn priority_for(name: &str, explicit_high: &[String]) -> Priority {
    let lowered = name.to_lowercase();

    const CRITICAL: &[&str] = &["db", "database", "sql", "postgres", "mongo"];
    const HIGH: &[&str] = &["api", "gateway", "auth", "core"];
    const LOW: &[&str] = &["monitor", "log", "metric", "debug"];

    if CRITICAL.iter().any(|hint| lowered.contains(hint)) {
        Priority::Critical
    } else if explicit_high.iter().any(|n| n == name) || HIGH.iter().any(|hint| lowered.contains(hint)) {
        Priority::High
    } else if LOW.iter().any(|hint| lowered.contains(hint)) {
        Priority::Low
    } else {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

pub struct Task {
    pub name: String,
    pub depends_on: Vec<String>,
    pub start: Box<dyn FnOnce() -> Result<(), String> + Send>,
}

#[derive(Debug, Default)]
pub struct Report {
    /// Names in completion order
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Tasks whose dependencies never completed within the timeout
    pub abandoned: Vec<String>,
}

struct Entry {
    name: String,
    priority: Priority,
    depends_on: Vec<String>,
    status: Status,
    start: Option<Box<dyn FnOnce() -> Result<(), String> + Send>>,
}

struct State {
    entries: Vec<Entry>,
    completed: Vec<String>,
    failed: Vec<String>,
    shutdown: bool,
}

pub struct Optimizer {
    parallel_limit: usize,
    dependency_timeout: Duration,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            dependency_timeout: DEFAULT_DEPENDENCY_TIMEOUT,
        }
    }
}

impl Optimizer {
    pub fn new(parallel_limit: usize) -> Self {
        Self {
            parallel_limit: parallel_limit.max(1),
            ..Self::default()
        }
    }

    pub fn dependency_timeout(self, dependency_timeout: Duration) -> Self {
        Self {
            dependency_timeout,
            ..self
        }
    }

    /// Run the batch to completion and report what happened
    pub fn run(&self, tasks: Vec<Task>, explicit_high: &[String]) -> Report {
        let entries = tasks
            .into_iter()
            .map(|task| Entry {
                priority: priority_for(&task.name, explicit_high),
                name: task.name,
                depends_on: task.depends_on,
                status: Status::Pending,
                start: Some(task.start),
            })
            .collect::<Vec<_>>();

        let state = Mutex::new(State {
            entries,
            completed: vec![],
            failed: vec![],
            shutdown: false,
        });
        let work_available = Condvar::new();
        let work_completed = Condvar::new();

        std::thread::scope(|scope| {
            for _ in 0..self.parallel_limit {
                scope.spawn(|| self.worker(&state, &work_available, &work_completed));
            }
        });

        let state = state.into_inner().expect("optimizer state poisoned");

        let abandoned = state
            .entries
            .iter()
            .filter(|entry| entry.status == Status::Pending)
            .map(|entry| entry.name.clone())
            .collect::<Vec<_>>();

        for name in &abandoned {
            warn!("startup task {name} abandoned, dependencies never completed");
        }

        Report {
            completed: state.completed,
            failed: state.failed,
            abandoned,
        }
    }

    fn worker(&self, state: &Mutex<State>, work_available: &Condvar, work_completed: &Condvar) {
        let mut guard = state.lock().expect("optimizer state poisoned");

        loop {
            if guard.shutdown {
                return;
            }

            match next_ready(&mut guard) {
                Some(index) => {
                    let start = guard.entries[index].start.take().expect("pending task has its start fn");
                    guard.entries[index].status = Status::Running;
                    drop(guard);

                    let result = start();

                    guard = state.lock().expect("optimizer state poisoned");
                    let name = guard.entries[index].name.clone();
                    match result {
                        Ok(()) => {
                            guard.entries[index].status = Status::Completed;
                            guard.completed.push(name);
                        }
                        Err(reason) => {
                            warn!("startup task {} failed: {reason}", name);
                            guard.entries[index].status = Status::Failed;
                            guard.failed.push(name);
                        }
                    }

                    // Wake waiters in both roles: blocked workers and
                    // anything watching for terminal transitions
                    work_available.notify_all();
                    work_completed.notify_all();
                }
                None => {
                    if finished(&guard) {
                        // Everyone else is blocked on work_available too
                        guard.shutdown = true;
                        work_available.notify_all();
                        work_completed.notify_all();
                        return;
                    }

                    let (next, timeout) = work_available
                        .wait_timeout(guard, self.dependency_timeout)
                        .expect("optimizer state poisoned");
                    guard = next;

                    if timeout.timed_out() && !next_ready_exists(&guard) && !finished(&guard) {
                        // Nothing became ready within the window: the
                        // remaining pending tasks wait on failed or
                        // cyclic dependencies. Leave them pending.
                        guard.shutdown = true;
                        work_available.notify_all();
                        work_completed.notify_all();
                        return;
                    }
                }
            }
        }
    }
}

/// Highest-priority READY entry: every dependency completed, nothing
/// running it yet. Ties resolve by declaration order.
fn next_ready(state: &mut State) -> Option<usize> {
    let completed: BTreeSet<&str> = state
        .entries
        .iter()
        .filter(|e| e.status == Status::Completed)
        .map(|e| e.name.as_str())
        .collect();

    state
        .entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| {
            entry.status == Status::Pending && entry.depends_on.iter().all(|dep| completed.contains(dep.as_str()))
        })
        .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
        .map(|(index, _)| index)
}

fn next_ready_exists(state: &State) -> bool {
    let completed: BTreeSet<&str> = state
        .entries
        .iter()
        .filter(|e| e.status == Status::Completed)
        .map(|e| e.name.as_str())
        .collect();

    state.entries.iter().any(|entry| {
        entry.status == Status::Pending && entry.depends_on.iter().all(|dep| completed.contains(dep.as_str()))
    })
}

/// No pending or running work remains
fn finished(state: &State) -> bool {
    state
        .entries
        .iter()
        .all(|entry| matches!(entry.status, Status::Completed | Status::Failed))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    use super::*;

    fn task(name: &str, depends_on: &[&str]) -> Task {
        Task {
            name: name.to_owned(),
            depends_on: depends_on.iter().map(|s| (*s).to_owned()).collect(),
            start: Box::new(|| Ok(())),
        }
    }

    #[test]
    fn name_heuristics() {
        assert_eq!(priority_for("db", &[]), Priority::Critical);
        assert_eq!(priority_for("user-database", &[]), Priority::Critical);
        assert_eq!(priority_for("api", &[]), Priority::High);
        assert_eq!(priority_for("auth-svc", &[]), Priority::High);
        assert_eq!(priority_for("worker", &[]), Priority::Normal);
        assert_eq!(priority_for("monitor", &[]), Priority::Low);
        assert_eq!(priority_for("log-shipper", &[]), Priority::Low);
        assert_eq!(priority_for("worker", &["worker".to_owned()]), Priority::High);
    }

    #[test]
    fn single_worker_drains_by_priority() {
        let optimizer = Optimizer::new(1);

        let report = optimizer.run(
            vec![task("monitor", &[]), task("worker", &[]), task("api", &[]), task("db", &[])],
            &[],
        );

        assert_eq!(report.completed, vec!["db", "api", "worker", "monitor"]);
        assert!(report.failed.is_empty());
        assert!(report.abandoned.is_empty());
    }

    #[test]
    fn dependencies_gate_readiness() {
        let origin = Instant::now();

        let stamp = |clock: &Arc<AtomicU64>, origin: Instant| {
            clock.store(origin.elapsed().as_nanos() as u64, Ordering::SeqCst);
        };

        let db_done = Arc::new(AtomicU64::new(0));
        let api_started = Arc::new(AtomicU64::new(0));

        let report = Optimizer::new(4).run(
            vec![
                Task {
                    name: "api".into(),
                    depends_on: vec!["db".into()],
                    start: Box::new({
                        let api_started = Arc::clone(&api_started);
                        move || {
                            stamp(&api_started, origin);
                            Ok(())
                        }
                    }),
                },
                Task {
                    name: "db".into(),
                    depends_on: vec![],
                    start: Box::new({
                        let db_done = Arc::clone(&db_done);
                        move || {
                            std::thread::sleep(Duration::from_millis(20));
                            stamp(&db_done, origin);
                            Ok(())
                        }
                    }),
                },
            ],
            &[],
        );

        assert_eq!(report.completed, vec!["db", "api"]);
        assert!(api_started.load(Ordering::SeqCst) >= db_done.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_dependency_abandons_dependents() {
        let optimizer = Optimizer::new(2).dependency_timeout(Duration::from_millis(50));

        let report = optimizer.run(
            vec![
                Task {
                    name: "db".into(),
                    depends_on: vec![],
                    start: Box::new(|| Err("refused to start".into())),
                },
                task("api", &["db"]),
            ],
            &[],
        );

        assert_eq!(report.failed, vec!["db"]);
        assert_eq!(report.abandoned, vec!["api"]);
    }
}
