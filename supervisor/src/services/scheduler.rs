//! Daily start/stop triggers evaluated in the supervisor timezone.
//!
//! Each job is a tokio task that sleeps until its next fire time, runs its
//! action and computes the following fire time. Jobs are named
//! `start_<id>` / `stop_<id>`; scheduling an id again replaces both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared::{DayCode, ScheduleSpec, SupervisorClock};

/// Work run when a job fires. Built per job with the strategy id bound by value.
pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Longest single sleep, so wall-clock adjustments are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Start,
    Stop,
}

impl JobKind {
    pub fn job_id(self, strategy_id: &str) -> String {
        match self {
            JobKind::Start => format!("start_{}", strategy_id),
            JobKind::Stop => format!("stop_{}", strategy_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub strategy_id: String,
    pub kind: JobKind,
    pub time: String,
    pub days: Vec<DayCode>,
    pub next_run: Option<DateTime<FixedOffset>>,
}

struct Job {
    strategy_id: String,
    kind: JobKind,
    time: NaiveTime,
    days: Vec<DayCode>,
    action: JobAction,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    clock: SupervisorClock,
    jobs: Mutex<HashMap<String, Job>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(clock: SupervisorClock) -> Self {
        info!("Scheduler started in timezone {}", clock.tz());
        Self {
            clock,
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Install the jobs for `spec`, replacing any jobs `strategy_id` had.
    /// The stop job is only installed when the spec has a stop time.
    pub fn schedule(&self, strategy_id: &str, spec: &ScheduleSpec, on_start: JobAction, on_stop: JobAction) {
        if !self.is_running() {
            warn!("Scheduler is shut down, not scheduling {}", strategy_id);
            return;
        }

        let mut jobs = self.lock();
        for kind in [JobKind::Start, JobKind::Stop] {
            if let Some(old) = jobs.remove(&kind.job_id(strategy_id)) {
                old.task.abort();
            }
        }

        let mut wanted = vec![(JobKind::Start, spec.start_time, on_start)];
        if let Some(stop_time) = spec.stop_time {
            wanted.push((JobKind::Stop, stop_time, on_stop));
        }

        for (kind, time, action) in wanted {
            let job_id = kind.job_id(strategy_id);
            let task = spawn_job(self.clock, job_id.clone(), time, spec.days.clone(), action.clone());
            jobs.insert(
                job_id,
                Job {
                    strategy_id: strategy_id.to_string(),
                    kind,
                    time,
                    days: spec.days.clone(),
                    action,
                    task,
                },
            );
        }

        info!(
            "Scheduled strategy {}: {} - {} {} on {:?}",
            strategy_id,
            spec.start_time.format("%H:%M"),
            spec.stop_time
                .map(|t| t.format("%H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.clock.tz(),
            spec.days
        );
    }

    /// Remove both jobs of `strategy_id`. Returns how many were removed.
    pub fn unschedule(&self, strategy_id: &str) -> usize {
        let mut jobs = self.lock();
        let mut removed = 0;
        for kind in [JobKind::Start, JobKind::Stop] {
            if let Some(job) = jobs.remove(&kind.job_id(strategy_id)) {
                job.task.abort();
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Unscheduled strategy {}", strategy_id);
        }
        removed
    }

    pub fn has_job(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    /// All jobs, sorted by id, with their next fire time.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let now = self.clock.now();
        let mut infos: Vec<JobInfo> = self
            .lock()
            .iter()
            .map(|(id, job)| JobInfo {
                id: id.clone(),
                strategy_id: job.strategy_id.clone(),
                kind: job.kind,
                time: job.time.format("%H:%M").to_string(),
                days: job.days.clone(),
                next_run: next_fire(&now, job.time, &job.days).map(|t| t.fixed_offset()),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Fire a job immediately, outside its timetable.
    pub async fn run_job_now(&self, job_id: &str) -> bool {
        let action = self.lock().get(job_id).map(|job| job.action.clone());
        match action {
            Some(action) => {
                info!("⏰ Running job {} on demand", job_id);
                action().await;
                true
            }
            None => false,
        }
    }

    /// Cancel every job. Later `schedule` calls are ignored.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut jobs = self.lock();
        for (_, job) in jobs.drain() {
            job.task.abort();
        }
        info!("Scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, job) in self.lock().drain() {
            job.task.abort();
        }
    }
}

fn spawn_job(
    clock: SupervisorClock,
    job_id: String,
    time: NaiveTime,
    days: Vec<DayCode>,
    action: JobAction,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = next_fire(&clock.now(), time, &days) else {
                warn!("Job {} has no future fire time", job_id);
                return;
            };
            debug!("Job {} next fires at {}", job_id, clock.format(&next));

            let target = next.with_timezone(&Utc);
            loop {
                let remaining = target - Utc::now();
                if remaining <= ChronoDuration::zero() {
                    break;
                }
                let remaining = remaining.to_std().unwrap_or(MAX_SLEEP);
                tokio::time::sleep(remaining.min(MAX_SLEEP)).await;
            }

            info!("⏰ Running job {}", job_id);
            // Own task, so replacing the job never cancels a start or stop midway.
            if let Err(e) = tokio::spawn(action()).await {
                warn!("Job {} failed: {}", job_id, e);
            }
        }
    })
}

/// First instant strictly after `after` whose local time is `time` on one of
/// `days`. Local times skipped by a DST change are not fired that day.
pub fn next_fire(after: &DateTime<Tz>, time: NaiveTime, days: &[DayCode]) -> Option<DateTime<Tz>> {
    let tz = after.timezone();
    let today = after.date_naive();
    (0..=7)
        .filter_map(|offset| today.checked_add_signed(ChronoDuration::days(offset)))
        .filter(|date| days.iter().any(|d| d.weekday() == date.weekday()))
        .filter_map(|date| tz.from_local_datetime(&date.and_time(time)).earliest())
        .find(|candidate| candidate > after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn ist(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn counting_action(counter: Arc<AtomicUsize>) -> JobAction {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn test_next_fire_same_day() {
        // 2025-01-06 is a Monday
        let next = next_fire(&ist(2025, 1, 6, 9, 0), hm(9, 16), &DayCode::BUSINESS_DAYS).unwrap();
        assert_eq!(next, ist(2025, 1, 6, 9, 16));
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let next = next_fire(&ist(2025, 1, 6, 9, 16), hm(9, 16), &DayCode::BUSINESS_DAYS).unwrap();
        assert_eq!(next, ist(2025, 1, 7, 9, 16));
    }

    #[test]
    fn test_next_fire_skips_weekend() {
        // Friday after the stop time -> Monday
        let next = next_fire(&ist(2025, 1, 10, 16, 0), hm(15, 14), &DayCode::BUSINESS_DAYS).unwrap();
        assert_eq!(next, ist(2025, 1, 13, 15, 14));

        let next = next_fire(&ist(2025, 1, 6, 10, 0), hm(9, 0), &[DayCode::Sun]).unwrap();
        assert_eq!(next, ist(2025, 1, 12, 9, 0));
    }

    #[test]
    fn test_next_fire_empty_days() {
        assert!(next_fire(&ist(2025, 1, 6, 9, 0), hm(9, 16), &[]).is_none());
    }

    #[tokio::test]
    async fn test_schedule_replaces_jobs() {
        let scheduler = Scheduler::new(SupervisorClock::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let spec = ScheduleSpec::parse("09:16", Some("15:14"), &[]).unwrap();
        scheduler.schedule("s1", &spec, counting_action(first.clone()), counting_action(first.clone()));
        assert!(scheduler.has_job("start_s1"));
        assert!(scheduler.has_job("stop_s1"));

        let spec = ScheduleSpec::parse("10:00", None, &["mon"]).unwrap();
        scheduler.schedule("s1", &spec, counting_action(second.clone()), counting_action(second.clone()));
        assert!(scheduler.has_job("start_s1"));
        assert!(!scheduler.has_job("stop_s1"));
        assert_eq!(scheduler.jobs().len(), 1);
        assert_eq!(scheduler.jobs()[0].time, "10:00");

        assert!(scheduler.run_job_now("start_s1").await);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert_eq!(scheduler.unschedule("s1"), 1);
        assert!(!scheduler.run_job_now("start_s1").await);
    }

    #[tokio::test]
    async fn test_job_fires_on_wall_clock() {
        use chrono::Timelike;

        let clock = SupervisorClock::default();
        let scheduler = Scheduler::new(clock);
        let counter = Arc::new(AtomicUsize::new(0));
        let start_time = (clock.now() + ChronoDuration::seconds(2))
            .time()
            .with_nanosecond(0)
            .unwrap();
        let spec = ScheduleSpec {
            start_time,
            stop_time: None,
            days: vec![
                DayCode::Mon,
                DayCode::Tue,
                DayCode::Wed,
                DayCode::Thu,
                DayCode::Fri,
                DayCode::Sat,
                DayCode::Sun,
            ],
        };
        scheduler.schedule("s1", &spec, counting_action(counter.clone()), counting_action(counter.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
        while counter.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.has_job("start_s1"));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let scheduler = Scheduler::new(SupervisorClock::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let spec = ScheduleSpec::parse("09:16", Some("15:14"), &[]).unwrap();
        scheduler.schedule("s1", &spec, counting_action(counter.clone()), counting_action(counter.clone()));

        scheduler.shutdown();
        assert!(!scheduler.is_running());
        assert!(scheduler.jobs().is_empty());

        scheduler.schedule("s2", &spec, counting_action(counter.clone()), counting_action(counter));
        assert!(scheduler.jobs().is_empty());
    }
}
