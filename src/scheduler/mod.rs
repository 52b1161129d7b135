//! Scheduler (C10): cron, interval, and one-shot triggers with
//! dependency-gated execution (spec.md §4.10).
//!
//! There's no `croniter`-equivalent crate in the stack, so cron expressions
//! are evaluated with a small hand-rolled 5-field matcher (minute, hour,
//! day-of-month, month, day-of-week), each field either `*` or a
//! comma-separated list of exact values. No step (`*/5`) or range (`1-5`)
//! syntax — out of scope for this kernel's internal scheduling needs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::priority::Priority;

#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(String),
    Interval(Duration),
    Once(chrono::DateTime<Utc>),
}

/// Parses one `*`-or-list field into the set of matching values, or `None`
/// for `*` (matches everything).
fn parse_field(field: &str) -> Option<HashSet<u32>> {
    if field == "*" {
        return None;
    }
    Some(
        field
            .split(',')
            .filter_map(|v| v.trim().parse::<u32>().ok())
            .collect(),
    )
}

struct CronSchedule {
    minute: Option<HashSet<u32>>,
    hour: Option<HashSet<u32>>,
    day_of_month: Option<HashSet<u32>>,
    month: Option<HashSet<u32>>,
    day_of_week: Option<HashSet<u32>>,
}

impl CronSchedule {
    fn parse(expr: &str) -> Option<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(Self {
            minute: parse_field(fields[0]),
            hour: parse_field(fields[1]),
            day_of_month: parse_field(fields[2]),
            month: parse_field(fields[3]),
            day_of_week: parse_field(fields[4]),
        })
    }

    fn matches(&self, at: chrono::DateTime<Utc>) -> bool {
        let check = |set: &Option<HashSet<u32>>, value: u32| {
            set.as_ref().map(|s| s.contains(&value)).unwrap_or(true)
        };
        check(&self.minute, at.minute())
            && check(&self.hour, at.hour())
            && check(&self.day_of_month, at.day())
            && check(&self.month, at.month())
            && check(&self.day_of_week, at.weekday().num_days_from_sunday())
    }

    /// Next minute-aligned instant strictly after `after` that matches.
    /// Bounded search: gives up after scanning 366 days of minutes.
    fn next_after(&self, after: chrono::DateTime<Utc>) -> Option<chrono::DateTime<Utc>> {
        let mut candidate = (after + chrono::Duration::minutes(1))
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap();
        let limit = after + chrono::Duration::days(366);
        while candidate < limit {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

pub struct ScheduledJob {
    pub job_id: String,
    pub name: String,
    pub priority: Priority,
    pub trigger: Trigger,
    pub dependencies: Vec<String>,
    pub enabled: bool,
    pub max_consecutive_failures: u32,
    cron: Option<CronSchedule>,
    next_run: Option<chrono::DateTime<Utc>>,
    consecutive_failures: u32,
    ran_once: bool,
}

type JobCallback = Arc<dyn Fn(&str) -> futures_result::BoxFuture + Send + Sync>;

// Avoids pulling in a separate future-boxing crate: a tiny local type alias
// matching the shape the pack's async-trait-heavy teacher already uses.
mod futures_result {
    use crate::error::Result;
    use std::future::Future;
    use std::pin::Pin;
    pub type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Drives scheduled jobs on a fixed tick, only running a job once every
/// dependency named in [`ScheduledJob::dependencies`] has completed at
/// least once in the current tick pass.
pub struct Scheduler {
    jobs: RwLock<HashMap<String, Mutex<ScheduledJob>>>,
    callbacks: RwLock<HashMap<String, JobCallback>>,
    tick_interval: Duration,
    completed_this_pass: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            tick_interval,
            completed_this_pass: Mutex::new(HashSet::new()),
        }
    }

    pub async fn add_job(
        &self,
        job_id: &str,
        name: &str,
        priority: Priority,
        trigger: Trigger,
        dependencies: Vec<String>,
        max_consecutive_failures: u32,
        callback: impl Fn(&str) -> futures_result::BoxFuture + Send + Sync + 'static,
    ) {
        let now = Utc::now();
        let cron = match &trigger {
            Trigger::Cron(expr) => CronSchedule::parse(expr),
            _ => None,
        };
        let next_run = match &trigger {
            Trigger::Cron(_) => cron.as_ref().and_then(|c| c.next_after(now)),
            Trigger::Interval(d) => Some(now + chrono::Duration::from_std(*d).unwrap_or_default()),
            Trigger::Once(at) => Some(*at),
        };

        let job = ScheduledJob {
            job_id: job_id.to_string(),
            name: name.to_string(),
            priority,
            trigger,
            dependencies,
            enabled: true,
            max_consecutive_failures,
            cron,
            next_run,
            consecutive_failures: 0,
            ran_once: false,
        };

        self.jobs
            .write()
            .await
            .insert(job_id.to_string(), Mutex::new(job));
        self.callbacks
            .write()
            .await
            .insert(job_id.to_string(), Arc::new(callback));
    }

    pub async fn remove_job(&self, job_id: &str) -> bool {
        self.callbacks.write().await.remove(job_id);
        self.jobs.write().await.remove(job_id).is_some()
    }

    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> bool {
        let jobs = self.jobs.read().await;
        let Some(job) = jobs.get(job_id) else {
            return false;
        };
        job.lock().await.enabled = enabled;
        true
    }

    /// Runs the tick loop forever. Each tick, every due, enabled,
    /// dependency-satisfied job is run inline.
    pub async fn run(&self) {
        info!("scheduler tick loop started");
        loop {
            tokio::time::sleep(self.tick_interval).await;
            self.tick().await;
        }
    }

    /// Jobs that complete on this tick may unblock a dependent that's also
    /// due this tick, regardless of `HashMap` iteration order, so due jobs
    /// are re-scanned until a pass makes no further progress. Completion is
    /// never reset between ticks (`completed_this_pass` is a running set,
    /// despite the name) — a dependency that ran once stays satisfied, per
    /// `task_scheduler.py`'s `self._completed_tasks`.
    async fn tick(&self) {
        let now = Utc::now();

        let mut due: Vec<String> = {
            let jobs = self.jobs.read().await;
            let mut ids = Vec::new();
            for (id, job) in jobs.iter() {
                let j = job.lock().await;
                if !j.enabled {
                    continue;
                }
                if matches!(j.trigger, Trigger::Once(_)) && j.ran_once {
                    continue;
                }
                if let Some(next) = j.next_run {
                    if next <= now {
                        ids.push(id.clone());
                    }
                }
            }
            ids
        };

        loop {
            let mut progressed = false;
            let mut still_waiting = Vec::new();
            for id in due {
                if self.dependencies_satisfied(&id).await {
                    self.run_job(&id, now).await;
                    progressed = true;
                } else {
                    still_waiting.push(id);
                }
            }
            due = still_waiting;
            if !progressed || due.is_empty() {
                break;
            }
        }
        for id in &due {
            debug!(job = %id, "skipping: dependencies not yet satisfied this pass");
        }
    }

    async fn dependencies_satisfied(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().await;
        let Some(job) = jobs.get(job_id) else {
            return false;
        };
        let deps = job.lock().await.dependencies.clone();
        if deps.is_empty() {
            return true;
        }
        let completed = self.completed_this_pass.lock().await;
        deps.iter().all(|d| completed.contains(d))
    }

    async fn run_job(&self, job_id: &str, now: chrono::DateTime<Utc>) {
        let callback = self.callbacks.read().await.get(job_id).cloned();
        let Some(callback) = callback else { return };

        let result = callback(job_id).await;

        let jobs = self.jobs.read().await;
        let Some(job) = jobs.get(job_id) else { return };
        let mut j = job.lock().await;

        match result {
            Ok(()) => {
                j.consecutive_failures = 0;
                self.completed_this_pass
                    .lock()
                    .await
                    .insert(job_id.to_string());
            }
            Err(e) => {
                j.consecutive_failures += 1;
                warn!(job = %job_id, error = %e, "scheduled job failed");
                if j.consecutive_failures >= j.max_consecutive_failures {
                    j.enabled = false;
                    error!(job = %job_id, "job disabled after too many consecutive failures");
                }
            }
        }

        j.next_run = match &j.trigger {
            Trigger::Cron(_) => j.cron.as_ref().and_then(|c| c.next_after(now)),
            Trigger::Interval(d) => {
                Some(now + chrono::Duration::from_std(*d).unwrap_or_default())
            }
            Trigger::Once(_) => {
                j.ran_once = true;
                None
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpiralError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ok_callback(counter: Arc<AtomicU32>) -> impl Fn(&str) -> futures_result::BoxFuture {
        move |_id| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn cron_matches_every_field() {
        let schedule = CronSchedule::parse("30 9 * * 1").unwrap();
        let at = chrono::DateTime::parse_from_rfc3339("2026-07-27T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(schedule.matches(at));
        let not_at = chrono::DateTime::parse_from_rfc3339("2026-07-27T09:31:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!schedule.matches(not_at));
    }

    #[test]
    fn invalid_cron_expression_returns_none() {
        assert!(CronSchedule::parse("not a cron").is_none());
    }

    #[tokio::test]
    async fn interval_job_runs_repeatedly() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job(
                "j1",
                "job one",
                Priority::Normal,
                Trigger::Interval(Duration::from_millis(5)),
                vec![],
                3,
                ok_callback(counter.clone()),
            )
            .await;

        for _ in 0..5 {
            scheduler.tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn once_job_runs_exactly_once() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job(
                "once",
                "one shot",
                Priority::Normal,
                Trigger::Once(Utc::now() - chrono::Duration::seconds(1)),
                vec![],
                3,
                ok_callback(counter.clone()),
            )
            .await;

        for _ in 0..5 {
            scheduler.tick().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dependent_job_waits_for_dependency_same_pass() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        let order1 = order.clone();
        scheduler
            .add_job(
                "base",
                "base",
                Priority::Normal,
                Trigger::Once(Utc::now() - chrono::Duration::seconds(1)),
                vec![],
                3,
                move |_id| {
                    let order1 = order1.clone();
                    Box::pin(async move {
                        order1.lock().await.push("base".to_string());
                        Ok(())
                    })
                },
            )
            .await;

        let order2 = order.clone();
        scheduler
            .add_job(
                "dependent",
                "dependent",
                Priority::Normal,
                Trigger::Once(Utc::now() - chrono::Duration::seconds(1)),
                vec!["base".to_string()],
                3,
                move |_id| {
                    let order2 = order2.clone();
                    Box::pin(async move {
                        order2.lock().await.push("dependent".to_string());
                        Ok(())
                    })
                },
            )
            .await;

        scheduler.tick().await;
        let recorded = order.lock().await.clone();
        assert_eq!(recorded, vec!["base".to_string(), "dependent".to_string()]);
    }

    #[tokio::test]
    async fn dependency_completion_persists_across_ticks() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        let order1 = order.clone();
        scheduler
            .add_job(
                "base",
                "base",
                Priority::Normal,
                Trigger::Once(Utc::now() - chrono::Duration::seconds(1)),
                vec![],
                3,
                move |_id| {
                    let order1 = order1.clone();
                    Box::pin(async move {
                        order1.lock().await.push("base".to_string());
                        Ok(())
                    })
                },
            )
            .await;
        scheduler.tick().await;
        assert_eq!(*order.lock().await, vec!["base".to_string()]);

        let order2 = order.clone();
        scheduler
            .add_job(
                "dependent",
                "dependent",
                Priority::Normal,
                Trigger::Once(Utc::now() - chrono::Duration::seconds(1)),
                vec!["base".to_string()],
                3,
                move |_id| {
                    let order2 = order2.clone();
                    Box::pin(async move {
                        order2.lock().await.push("dependent".to_string());
                        Ok(())
                    })
                },
            )
            .await;
        scheduler.tick().await;
        assert_eq!(
            *order.lock().await,
            vec!["base".to_string(), "dependent".to_string()]
        );
    }

    #[tokio::test]
    async fn job_disabled_after_max_consecutive_failures() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        scheduler
            .add_job(
                "flaky",
                "flaky",
                Priority::Normal,
                Trigger::Interval(Duration::from_millis(1)),
                vec![],
                2,
                |_id| Box::pin(async move { Err(SpiralError::agent("boom")) }),
            )
            .await;

        for _ in 0..3 {
            scheduler.tick().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let jobs = scheduler.jobs.read().await;
        let job = jobs.get("flaky").unwrap().lock().await;
        assert!(!job.enabled);
    }
}
