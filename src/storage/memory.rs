use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{BackgroundJob, DistributedLockItem, Job, JobLog, JobStatus, Server};
use crate::storage::{DailyCount, ScheduleList, Storage};

fn job_key(id: Uuid) -> String {
    format!("Job:{id}")
}

fn background_job_key(id: Uuid) -> String {
    format!("BackgroundJob:{id}")
}

/// Per-job attempt list, newest first.
fn attempts_key(job_id: Uuid) -> String {
    format!("S:{job_id}")
}

fn queue_key(queue: &str) -> String {
    format!("Queue:{queue}")
}

fn queue_schedule_key(queue: &str) -> String {
    format!("QueueSchedule:{queue}")
}

fn latest_pulled_key(queue: &str) -> String {
    format!("LatestPulled:{queue}")
}

fn scoped_index_key(status: JobStatus, job_id: Uuid) -> String {
    format!("{}:{job_id}", status.index_key())
}

fn after_key(background_job_id: Uuid) -> String {
    format!("After:{background_job_id}")
}

fn logs_key(background_job_id: Uuid) -> String {
    format!("Logs:{background_job_id}")
}

fn recurring_name_key(name: &str) -> String {
    format!("RecurringJob:{name}")
}

fn server_key(id: Uuid) -> String {
    format!("Server:{id}")
}

fn processing_key(server_id: Uuid, queue: &str) -> String {
    format!("{server_id}:{queue}")
}

fn lock_fifo_key(key: &str) -> String {
    format!("DistLockKey:{key}")
}

fn lock_ticket_key(id: &str) -> String {
    format!("DistLock:{id}")
}

const SERVERS_KEY: &str = "Servers";

/// Heartbeats older than this are ignored when listing servers, even if
/// the record's time-to-live has not run out yet.
const SERVER_HEARTBEAT_HORIZON_SECS: i64 = 60;

/// The Redis-style keyspace behind [`MemoryStorage`]: strings, FIFO lists
/// and unordered sets, plus per-key expiries for server records.
#[derive(Default)]
struct Keyspace {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    expiries: HashMap<String, DateTime<Utc>>,
}

impl Keyspace {
    fn list_push_front(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn list_push_back(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
    }

    fn list_push_back_unique(&mut self, key: &str, value: &str) {
        let list = self.lists.entry(key.to_string()).or_default();
        if !list.iter().any(|v| v == value) {
            list.push_back(value.to_string());
        }
    }

    fn list_remove(&mut self, key: &str, value: &str) -> bool {
        match self.lists.get_mut(key) {
            Some(list) => {
                let before = list.len();
                list.retain(|v| v != value);
                list.len() != before
            }
            None => false,
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_add(&mut self, key: &str, value: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string());
    }

    fn set_contains(&self, key: &str, value: &str) -> bool {
        self.sets.get(key).is_some_and(|s| s.contains(value))
    }

    fn read_job(&self, id: Uuid) -> Result<Option<Job>> {
        match self.strings.get(&job_key(id)) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn read_background_job(&self, id: Uuid) -> Result<Option<BackgroundJob>> {
        match self.strings.get(&background_job_key(id)) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn write_job_record(&mut self, job: &Job) -> Result<()> {
        self.strings.insert(job_key(job.id), serde_json::to_string(job)?);
        Ok(())
    }

    fn mark_schedule_changed(&mut self, queue: &str) {
        self.sets.remove(&latest_pulled_key(queue));
    }

    /// Full background-job save semantics: record write plus every derived
    /// structure, including the dependents drain on terminal transitions.
    fn apply_background_job(&mut self, background_job: &BackgroundJob) -> Result<()> {
        let id = background_job.id.to_string();
        let old = self.read_background_job(background_job.id)?;
        let job = self.read_job(background_job.job_id)?;
        let is_new = old.is_none();
        let status_changed = old
            .as_ref()
            .is_none_or(|o| o.status != background_job.status);
        let scoped = job.as_ref().is_some_and(|j| j.is_pending_schedule());

        if status_changed {
            if let Some(old) = &old {
                self.list_remove(&old.status.index_key(), &id);
                if scoped {
                    self.list_remove(
                        &scoped_index_key(old.status, background_job.job_id),
                        &id,
                    );
                }
            }
            // Newest end first: terminal indices stay in descending
            // completion-time order.
            self.list_push_front(&background_job.status.index_key(), &id);
            if scoped {
                self.list_push_front(
                    &scoped_index_key(background_job.status, background_job.job_id),
                    &id,
                );
            }
        }

        if is_new {
            self.list_push_front(&attempts_key(background_job.job_id), &id);
        }

        if let Some(job) = &job {
            let was_enqueued = old.as_ref().is_some_and(|o| o.status == JobStatus::Enqueued);
            if background_job.status == JobStatus::Enqueued && !was_enqueued {
                self.list_push_back(&queue_key(&job.queue), &id);
            }
            if background_job.status == JobStatus::Processing {
                if let Some(server_id) = background_job.processed_by {
                    self.list_push_back_unique(&processing_key(server_id, &job.queue), &id);
                }
            } else if let Some(old) = &old {
                if old.status == JobStatus::Processing {
                    if let Some(server_id) = old.processed_by {
                        self.list_remove(&processing_key(server_id, &job.queue), &id);
                    }
                }
            }
        }

        self.strings.insert(
            background_job_key(background_job.id),
            serde_json::to_string(background_job)?,
        );

        if status_changed
            && matches!(background_job.status, JobStatus::Processed | JobStatus::Failed)
        {
            let dependents = self
                .sets
                .remove(&after_key(background_job.id))
                .unwrap_or_default();
            for dependent in dependents {
                if let Ok(job_id) = Uuid::parse_str(&dependent) {
                    self.promote_job(job_id)?;
                }
            }
        }
        Ok(())
    }

    /// Promotes a pending job to its queue: deactivates it, creates an
    /// Enqueued background job and clears its schedule entries.
    fn promote_job(&mut self, job_id: Uuid) -> Result<Option<Uuid>> {
        let Some(mut job) = self.read_job(job_id)? else {
            return Ok(None);
        };
        job.active = false;
        self.write_job_record(&job)?;
        let background_job = BackgroundJob::enqueued(job.id);
        self.apply_background_job(&background_job)?;
        self.clear_schedule_entries(&job);
        Ok(Some(background_job.id))
    }

    fn clear_schedule_entries(&mut self, job: &Job) {
        if job.is_recurring {
            // Recurring jobs stay in the snapshot for the next match.
            return;
        }
        let id = job.id.to_string();
        let mut changed = self.list_remove(ScheduleList::Scheduled.key(), &id);
        changed |= self.list_remove(ScheduleList::Waiting.key(), &id);
        changed |= self.list_remove(&queue_schedule_key(&job.queue), &id);
        if changed {
            self.mark_schedule_changed(&job.queue);
        }
    }

    /// Removes one background job and everything keyed on its id. The
    /// owning job record is left alone; callers decide about cascade.
    fn remove_background_job(&mut self, background_job: &BackgroundJob, job: Option<&Job>) {
        let id = background_job.id.to_string();
        self.list_remove(&background_job.status.index_key(), &id);
        if let Some(job) = job {
            self.list_remove(&scoped_index_key(background_job.status, job.id), &id);
            self.list_remove(&queue_key(&job.queue), &id);
            if let Some(server_id) = background_job.processed_by {
                self.list_remove(&processing_key(server_id, &job.queue), &id);
            }
        }
        self.list_remove(&attempts_key(background_job.job_id), &id);
        self.lists.remove(&logs_key(background_job.id));
        self.sets.remove(&after_key(background_job.id));
        self.strings.remove(&background_job_key(background_job.id));
    }

    /// Removes a job record and its schedule/name entries. Background jobs
    /// are not touched.
    fn remove_job_record(&mut self, job: &Job) {
        let id = job.id.to_string();
        self.list_remove(ScheduleList::Scheduled.key(), &id);
        self.list_remove(ScheduleList::Recurring.key(), &id);
        self.list_remove(ScheduleList::Waiting.key(), &id);
        if self.list_remove(&queue_schedule_key(&job.queue), &id) {
            self.mark_schedule_changed(&job.queue);
        }
        if let Some(name) = &job.name {
            let key = recurring_name_key(name);
            if self.strings.get(&key).is_some_and(|v| *v == id) {
                self.strings.remove(&key);
            }
        }
        self.strings.remove(&job_key(job.id));
    }

    /// Deletes a background job and, when it was the owning non-recurring
    /// inactive job's last attempt, the job record too.
    fn delete_background_job_cascading(&mut self, id: Uuid) -> Result<()> {
        let Some(background_job) = self.read_background_job(id)? else {
            return Ok(());
        };
        let job = self.read_job(background_job.job_id)?;
        self.remove_background_job(&background_job, job.as_ref());
        if let Some(job) = job {
            let orphaned = !job.is_recurring
                && !job.active
                && self.list(&attempts_key(job.id)).is_empty();
            if orphaned {
                self.remove_job_record(&job);
            }
        }
        Ok(())
    }

    fn read_server(&mut self, id: Uuid) -> Result<Option<Server>> {
        let key = server_key(id);
        if let Some(expiry) = self.expiries.get(&key) {
            if *expiry <= Utc::now() {
                self.strings.remove(&key);
                self.expiries.remove(&key);
                if let Some(set) = self.sets.get_mut(SERVERS_KEY) {
                    set.remove(&id.to_string());
                }
                return Ok(None);
            }
        }
        match self.strings.get(&key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn write_server(&mut self, server: &Server, ttl: Duration) -> Result<()> {
        let key = server_key(server.id);
        self.strings.insert(key.clone(), serde_json::to_string(server)?);
        self.expiries.insert(
            key,
            Utc::now()
                + chrono::Duration::from_std(ttl)
                    .map_err(|e| Error::Storage(format!("server ttl out of range: {e}")))?,
        );
        self.set_add(SERVERS_KEY, &server.id.to_string());
        Ok(())
    }

    fn read_lock_ticket(&self, id: &str) -> Result<Option<DistributedLockItem>> {
        match self.strings.get(&lock_ticket_key(id)) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn remove_lock_ticket(&mut self, id: &str, key: &str) {
        self.list_remove(&lock_fifo_key(key), id);
        self.strings.remove(&lock_ticket_key(id));
    }
}

/// In-memory hot store with Redis-style semantics: the reference
/// implementation of the [`Storage`] contract and the test backend.
///
/// All operations take one short-lived internal lock; nothing is held
/// across await points, so the store is safe to share across every loop
/// of a server process.
#[derive(Default)]
pub struct MemoryStorage {
    keyspace: Mutex<Keyspace>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_job(&self, job: &Job, force: bool) -> Result<Uuid> {
        let mut ks = self.keyspace();
        let mut job = job.clone();
        if job.is_recurring && !force {
            if let Some(name) = &job.name {
                if let Some(existing) = ks.strings.get(&recurring_name_key(name)) {
                    if let Ok(id) = Uuid::parse_str(existing) {
                        job.id = id;
                    }
                }
            }
        }
        let id = job.id.to_string();
        if job.is_recurring {
            if let Some(name) = &job.name {
                ks.strings
                    .insert(recurring_name_key(name), id.clone());
            }
            ks.list_push_back_unique(ScheduleList::Recurring.key(), &id);
            ks.list_push_back_unique(&queue_schedule_key(&job.queue), &id);
            ks.mark_schedule_changed(&job.queue);
        } else if job.active && job.start_at.is_some() {
            ks.list_push_back_unique(ScheduleList::Scheduled.key(), &id);
            ks.list_push_back_unique(&queue_schedule_key(&job.queue), &id);
            ks.mark_schedule_changed(&job.queue);
        }
        if job.after_background_job_ids.is_some() {
            ks.list_push_back_unique(ScheduleList::Waiting.key(), &id);
        }
        ks.write_job_record(&job)?;
        Ok(job.id)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.keyspace().read_job(id)
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let mut ks = self.keyspace();
        let Some(job) = ks.read_job(id)? else {
            return Ok(());
        };
        let attempts = ks.list(&attempts_key(id));
        ks.remove_job_record(&job);
        for attempt in attempts {
            if let Ok(background_job_id) = Uuid::parse_str(&attempt) {
                if let Some(background_job) = ks.read_background_job(background_job_id)? {
                    ks.remove_background_job(&background_job, Some(&job));
                }
            }
        }
        Ok(())
    }

    async fn save_background_job(&self, background_job: &BackgroundJob) -> Result<()> {
        self.keyspace().apply_background_job(background_job)
    }

    async fn get_background_job(&self, id: Uuid) -> Result<Option<BackgroundJob>> {
        self.keyspace().read_background_job(id)
    }

    async fn delete_background_job(&self, id: Uuid) -> Result<()> {
        self.keyspace().delete_background_job_cascading(id)
    }

    async fn latest_background_job(&self, job_id: Uuid) -> Result<Option<BackgroundJob>> {
        let ks = self.keyspace();
        match ks.list(&attempts_key(job_id)).first() {
            Some(id) => match Uuid::parse_str(id) {
                Ok(id) => ks.read_background_job(id),
                Err(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    async fn background_job_ids(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .keyspace()
            .list(&attempts_key(job_id))
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Uuid>> {
        let mut ks = self.keyspace();
        let Some(list) = ks.lists.get_mut(&queue_key(queue)) else {
            return Ok(None);
        };
        match list.pop_front() {
            Some(id) => Ok(Uuid::parse_str(&id).ok()),
            None => Ok(None),
        }
    }

    async fn job_enqueued(&self, job_id: Uuid, queue: &str) -> Result<()> {
        let mut ks = self.keyspace();
        if let Some(job) = ks.read_job(job_id)? {
            ks.clear_schedule_entries(&job);
        } else {
            let id = job_id.to_string();
            ks.list_remove(ScheduleList::Scheduled.key(), &id);
            ks.list_remove(ScheduleList::Waiting.key(), &id);
            if ks.list_remove(&queue_schedule_key(queue), &id) {
                ks.mark_schedule_changed(queue);
            }
        }
        Ok(())
    }

    async fn enqueue_after(&self, job_id: Uuid, background_job_id: Uuid) -> Result<bool> {
        let mut ks = self.keyspace();
        let antecedent = ks.read_background_job(background_job_id)?;
        let finished = antecedent
            .as_ref()
            .is_none_or(|a| a.status.is_terminal());
        if finished {
            ks.promote_job(job_id)?;
            Ok(true)
        } else {
            ks.set_add(&after_key(background_job_id), &job_id.to_string());
            Ok(false)
        }
    }

    async fn scheduled_jobs(
        &self,
        list: ScheduleList,
        from: usize,
        count: usize,
    ) -> Result<Vec<Job>> {
        let ks = self.keyspace();
        let mut jobs = Vec::new();
        for id in ks.list(list.key()).iter().skip(from).take(count) {
            if let Ok(id) = Uuid::parse_str(id) {
                if let Some(job) = ks.read_job(id)? {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    async fn scheduled_jobs_count(&self, list: ScheduleList) -> Result<usize> {
        Ok(self.keyspace().list(list.key()).len())
    }

    async fn queue_schedule(&self, server_id: Uuid, queue: &str) -> Result<Vec<Job>> {
        let mut ks = self.keyspace();
        let mut jobs = Vec::new();
        for id in ks.list(&queue_schedule_key(queue)) {
            if let Ok(id) = Uuid::parse_str(&id) {
                if let Some(job) = ks.read_job(id)? {
                    jobs.push(job);
                }
            }
        }
        ks.set_add(&latest_pulled_key(queue), &server_id.to_string());
        Ok(jobs)
    }

    async fn schedule_changed(&self, server_id: Uuid, queue: &str) -> Result<bool> {
        let ks = self.keyspace();
        Ok(!ks.set_contains(&latest_pulled_key(queue), &server_id.to_string()))
    }

    async fn recurring_job_id(&self, name: &str) -> Result<Option<Uuid>> {
        Ok(self
            .keyspace()
            .strings
            .get(&recurring_name_key(name))
            .and_then(|id| Uuid::parse_str(id).ok()))
    }

    async fn append_log(&self, background_job_id: Uuid, log: &JobLog) -> Result<()> {
        let raw = serde_json::to_string(log)?;
        self.keyspace()
            .list_push_back(&logs_key(background_job_id), &raw);
        Ok(())
    }

    async fn logs(&self, background_job_id: Uuid) -> Result<Vec<JobLog>> {
        self.keyspace()
            .list(&logs_key(background_job_id))
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }

    async fn save_server(&self, server: &Server, ttl: Duration) -> Result<()> {
        self.keyspace().write_server(server, ttl)
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>> {
        self.keyspace().read_server(id)
    }

    async fn servers(&self) -> Result<Vec<Server>> {
        let mut ks = self.keyspace();
        let ids: Vec<Uuid> = ks
            .sets
            .get(SERVERS_KEY)
            .map(|set| set.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
            .unwrap_or_default();
        let horizon = Utc::now() - chrono::Duration::seconds(SERVER_HEARTBEAT_HORIZON_SECS);
        let mut servers = Vec::new();
        for id in ids {
            if let Some(server) = ks.read_server(id)? {
                if server.last_activity >= horizon {
                    servers.push(server);
                }
            }
        }
        servers.sort_by_key(|s| s.started_at);
        Ok(servers)
    }

    async fn sync_server(&self, server: &Server, ttl: Duration) -> Result<Server> {
        let mut ks = self.keyspace();
        let mut merged = server.clone();
        if let Some(persisted) = ks.read_server(server.id)? {
            merged.status = persisted.status;
        }
        merged.last_activity = Utc::now();
        ks.write_server(&merged, ttl)?;
        Ok(merged)
    }

    async fn has_running_jobs(&self, server_id: Uuid) -> Result<bool> {
        let ks = self.keyspace();
        let prefix = format!("{server_id}:");
        Ok(ks
            .lists
            .iter()
            .any(|(key, list)| key.starts_with(&prefix) && !list.is_empty()))
    }

    async fn save_distributed_lock(&self, item: &DistributedLockItem) -> Result<()> {
        let mut ks = self.keyspace();
        ks.strings
            .insert(lock_ticket_key(&item.id), serde_json::to_string(item)?);
        ks.list_push_back_unique(&lock_fifo_key(&item.key), &item.id);
        Ok(())
    }

    async fn is_distributed_lock_entered(
        &self,
        key: &str,
        id: &str,
        inactive_timeout: Duration,
    ) -> Result<bool> {
        let mut ks = self.keyspace();
        let stale_before = Utc::now()
            - chrono::Duration::from_std(inactive_timeout)
                .map_err(|e| Error::Storage(format!("lock timeout out of range: {e}")))?;
        loop {
            let Some(head) = ks.list(&lock_fifo_key(key)).first().cloned() else {
                return Ok(false);
            };
            if head == id {
                return Ok(true);
            }
            let stale = match ks.read_lock_ticket(&head)? {
                Some(ticket) => ticket.last_activity <= stale_before,
                None => true,
            };
            if stale {
                ks.remove_lock_ticket(&head, key);
            } else {
                return Ok(false);
            }
        }
    }

    async fn delete_distributed_lock(&self, id: &str) -> Result<()> {
        let mut ks = self.keyspace();
        let key = match ks.read_lock_ticket(id)? {
            Some(ticket) => ticket.key,
            // Ticket ids are "<uuid>:<key>"; recover the key when the
            // record is already gone.
            None => id.splitn(2, ':').nth(1).unwrap_or_default().to_string(),
        };
        ks.remove_lock_ticket(id, &key);
        Ok(())
    }

    async fn evict_stale_locks(&self, inactive_timeout: Duration) -> Result<usize> {
        let mut ks = self.keyspace();
        let stale_before = Utc::now()
            - chrono::Duration::from_std(inactive_timeout)
                .map_err(|e| Error::Storage(format!("lock timeout out of range: {e}")))?;
        let stale: Vec<DistributedLockItem> = ks
            .strings
            .iter()
            .filter(|(key, _)| key.starts_with("DistLock:"))
            .filter_map(|(_, raw)| serde_json::from_str::<DistributedLockItem>(raw).ok())
            .filter(|ticket| ticket.last_activity <= stale_before)
            .collect();
        let count = stale.len();
        for ticket in stale {
            ks.remove_lock_ticket(&ticket.id, &ticket.key);
        }
        Ok(count)
    }

    async fn all_distributed_locks(&self) -> Result<Vec<DistributedLockItem>> {
        let ks = self.keyspace();
        let mut locks: Vec<DistributedLockItem> = ks
            .strings
            .iter()
            .filter(|(key, _)| key.starts_with("DistLock:"))
            .filter_map(|(_, raw)| serde_json::from_str(raw).ok())
            .collect();
        locks.sort_by_key(|l| l.started_at);
        Ok(locks)
    }

    async fn status_index(
        &self,
        status: JobStatus,
        from: usize,
        count: usize,
    ) -> Result<Vec<Uuid>> {
        Ok(self
            .keyspace()
            .list(&status.index_key())
            .iter()
            .skip(from)
            .take(count)
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    async fn background_jobs_count(&self, status: JobStatus) -> Result<usize> {
        Ok(self.keyspace().list(&status.index_key()).len())
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let ks = self.keyspace();
        let mut queues: Vec<String> = ks
            .lists
            .keys()
            .filter_map(|key| key.strip_prefix("Queue:"))
            .map(str::to_string)
            .collect();
        queues.sort();
        Ok(queues)
    }

    async fn queue_jobs_count(&self, queue: &str) -> Result<usize> {
        Ok(self.keyspace().list(&queue_key(queue)).len())
    }

    async fn daily_status(&self, since: NaiveDate) -> Result<Vec<DailyCount>> {
        let ks = self.keyspace();
        let mut days: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
        for status in [JobStatus::Processed, JobStatus::Failed] {
            // Terminal indices are newest-first, so the first entry older
            // than the window ends the scan.
            for id in ks.list(&status.index_key()) {
                let Ok(id) = Uuid::parse_str(&id) else { continue };
                let Some(background_job) = ks.read_background_job(id)? else {
                    continue;
                };
                let date = background_job
                    .completed_at
                    .unwrap_or(background_job.created_at)
                    .date_naive();
                if date < since {
                    break;
                }
                let entry = days.entry(date).or_insert((0, 0));
                match status {
                    JobStatus::Processed => entry.0 += 1,
                    _ => entry.1 += 1,
                }
            }
        }
        Ok(days
            .into_iter()
            .map(|(date, (processed, failed))| DailyCount {
                date,
                processed,
                failed,
            })
            .collect())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        let ks = self.keyspace();
        let mut keys: Vec<String> = ks
            .strings
            .keys()
            .chain(ks.lists.keys())
            .chain(ks.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut ks = self.keyspace();
        let mut deleted = 0;
        for status in [JobStatus::Processed, JobStatus::Failed, JobStatus::Interrupted] {
            // Oldest entries sit at the tail of the index; the first one
            // inside the cutoff ends the scan for this status.
            loop {
                let Some(id) = ks.list(&status.index_key()).last().cloned() else {
                    break;
                };
                let Ok(id) = Uuid::parse_str(&id) else {
                    ks.list_remove(&status.index_key(), &id);
                    continue;
                };
                let Some(background_job) = ks.read_background_job(id)? else {
                    ks.list_remove(&status.index_key(), &id.to_string());
                    continue;
                };
                let completed = background_job
                    .completed_at
                    .unwrap_or(background_job.created_at);
                if completed >= cutoff {
                    break;
                }
                ks.delete_background_job_cascading(id)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_all(&self) -> Result<()> {
        let mut ks = self.keyspace();
        ks.strings
            .retain(|key, _| key.starts_with("Server:") || key.starts_with("DistLock:"));
        ks.lists.retain(|key, _| key.starts_with("DistLockKey:"));
        ks.sets.retain(|key, _| key == SERVERS_KEY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Invocation;
    use crate::model::JobKind;
    use chrono::Duration as ChronoDuration;

    fn thread_job() -> Job {
        let invocation = Invocation::builder("noop").build().unwrap();
        Job::new(invocation, JobKind::Thread)
    }

    async fn enqueued(storage: &MemoryStorage) -> (Job, BackgroundJob) {
        let job = thread_job();
        storage.save_job(&job, false).await.unwrap();
        let background_job = BackgroundJob::enqueued(job.id);
        storage.save_background_job(&background_job).await.unwrap();
        (job, background_job)
    }

    #[tokio::test]
    async fn queues_are_fifo() {
        let storage = MemoryStorage::new();
        let (_, first) = enqueued(&storage).await;
        let (_, second) = enqueued(&storage).await;

        assert_eq!(storage.dequeue("jobs").await.unwrap(), Some(first.id));
        assert_eq!(storage.dequeue("jobs").await.unwrap(), Some(second.id));
        assert_eq!(storage.dequeue("jobs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn status_change_moves_id_between_indices_atomically() {
        let storage = MemoryStorage::new();
        let (_, mut background_job) = enqueued(&storage).await;

        background_job.status = JobStatus::Processing;
        storage.save_background_job(&background_job).await.unwrap();

        let enqueued_ids = storage
            .status_index(JobStatus::Enqueued, 0, 10)
            .await
            .unwrap();
        let processing_ids = storage
            .status_index(JobStatus::Processing, 0, 10)
            .await
            .unwrap();
        assert!(enqueued_ids.is_empty());
        assert_eq!(processing_ids, vec![background_job.id]);

        // Saving again without a status change must not duplicate the id.
        storage.save_background_job(&background_job).await.unwrap();
        assert_eq!(
            storage.background_jobs_count(JobStatus::Processing).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn terminal_index_is_newest_first() {
        let storage = MemoryStorage::new();
        let mut completed = Vec::new();
        for _ in 0..3 {
            let (_, mut background_job) = enqueued(&storage).await;
            background_job.complete();
            storage.save_background_job(&background_job).await.unwrap();
            completed.push(background_job.id);
        }
        completed.reverse();
        let index = storage
            .status_index(JobStatus::Processed, 0, 10)
            .await
            .unwrap();
        assert_eq!(index, completed);
    }

    #[tokio::test]
    async fn terminal_transition_drains_dependents() {
        let storage = MemoryStorage::new();
        let (_, mut antecedent) = enqueued(&storage).await;

        let mut dependent = thread_job();
        dependent = dependent.with_antecedent(antecedent.id);
        storage.save_job(&dependent, false).await.unwrap();
        let promoted = storage
            .enqueue_after(dependent.id, antecedent.id)
            .await
            .unwrap();
        assert!(!promoted);
        assert_eq!(
            storage.latest_background_job(dependent.id).await.unwrap(),
            None
        );

        antecedent.complete();
        storage.save_background_job(&antecedent).await.unwrap();

        let attempt = storage
            .latest_background_job(dependent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, JobStatus::Enqueued);
        let job = storage.get_job(dependent.id).await.unwrap().unwrap();
        assert!(!job.active);
    }

    #[tokio::test]
    async fn enqueue_after_terminal_antecedent_promotes_immediately() {
        let storage = MemoryStorage::new();
        let (_, mut antecedent) = enqueued(&storage).await;
        antecedent.complete();
        storage.save_background_job(&antecedent).await.unwrap();

        let dependent = thread_job().with_antecedent(antecedent.id);
        storage.save_job(&dependent, false).await.unwrap();
        assert!(storage
            .enqueue_after(dependent.id, antecedent.id)
            .await
            .unwrap());
        assert!(storage
            .latest_background_job(dependent.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn schedule_snapshot_flag_tracks_pulls_and_writes() {
        let storage = MemoryStorage::new();
        let server_id = Uuid::new_v4();
        let job = thread_job().with_start_at(Utc::now() + ChronoDuration::hours(1));
        storage.save_job(&job, false).await.unwrap();

        assert!(storage.schedule_changed(server_id, "jobs").await.unwrap());
        let snapshot = storage.queue_schedule(server_id, "jobs").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(!storage.schedule_changed(server_id, "jobs").await.unwrap());

        // Another scheduled write invalidates the snapshot for everyone.
        let other = thread_job().with_start_at(Utc::now() + ChronoDuration::hours(2));
        storage.save_job(&other, false).await.unwrap();
        assert!(storage.schedule_changed(server_id, "jobs").await.unwrap());
    }

    #[tokio::test]
    async fn recurring_name_is_reused_on_resubscribe() {
        let storage = MemoryStorage::new();
        let pattern = crate::pattern::RecurringPattern::new("0 * * * * *").unwrap();
        let first = thread_job().with_recurring_pattern("nightly", pattern.clone());
        let first_id = storage.save_job(&first, false).await.unwrap();

        let second = thread_job().with_recurring_pattern("nightly", pattern);
        let second_id = storage.save_job(&second, false).await.unwrap();

        assert_eq!(first_id, second_id);
        assert_eq!(
            storage.scheduled_jobs_count(ScheduleList::Recurring).await.unwrap(),
            1
        );
        assert_eq!(
            storage.recurring_job_id("nightly").await.unwrap(),
            Some(first_id)
        );
    }

    #[tokio::test]
    async fn deleting_last_background_job_deletes_inactive_job() {
        let storage = MemoryStorage::new();
        let (mut job, mut background_job) = enqueued(&storage).await;
        job.active = false;
        storage.save_job(&job, true).await.unwrap();
        background_job.complete();
        storage.save_background_job(&background_job).await.unwrap();

        storage.delete_background_job(background_job.id).await.unwrap();

        assert_eq!(storage.get_job(job.id).await.unwrap(), None);
        assert_eq!(
            storage.get_background_job(background_job.id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn delete_job_cascades_to_background_jobs() {
        let storage = MemoryStorage::new();
        let (job, background_job) = enqueued(&storage).await;

        storage.delete_job(job.id).await.unwrap();

        assert_eq!(storage.get_job(job.id).await.unwrap(), None);
        assert_eq!(
            storage.get_background_job(background_job.id).await.unwrap(),
            None
        );
        assert!(storage
            .status_index(JobStatus::Enqueued, 0, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_expired_stops_at_first_fresh_entry() {
        let storage = MemoryStorage::new();
        let (_, mut old) = enqueued(&storage).await;
        old.complete();
        old.completed_at = Some(Utc::now() - ChronoDuration::days(40));
        storage.save_background_job(&old).await.unwrap();

        let (_, mut fresh) = enqueued(&storage).await;
        fresh.complete();
        storage.save_background_job(&fresh).await.unwrap();

        let cutoff = Utc::now() - ChronoDuration::days(30);
        assert_eq!(storage.delete_expired(cutoff).await.unwrap(), 1);
        assert_eq!(storage.get_background_job(old.id).await.unwrap(), None);
        assert!(storage.get_background_job(fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_lock_head_is_evicted_for_next_waiter() {
        let storage = MemoryStorage::new();
        let mut stale = DistributedLockItem::new("resource");
        stale.last_activity = Utc::now() - ChronoDuration::seconds(120);
        storage.save_distributed_lock(&stale).await.unwrap();
        let waiter = DistributedLockItem::new("resource");
        storage.save_distributed_lock(&waiter).await.unwrap();

        let timeout = Duration::from_secs(15);
        assert!(storage
            .is_distributed_lock_entered("resource", &waiter.id, timeout)
            .await
            .unwrap());
        assert!(storage.read_ticket_gone(&stale.id).await);
    }

    #[tokio::test]
    async fn delete_all_preserves_server_registry() {
        let storage = MemoryStorage::new();
        enqueued(&storage).await;
        let server = Server::new("worker-1", vec![], 50);
        storage
            .save_server(&server, Duration::from_secs(60))
            .await
            .unwrap();

        storage.delete_all().await.unwrap();

        assert_eq!(storage.dequeue("jobs").await.unwrap(), None);
        assert_eq!(storage.servers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn daily_status_buckets_by_completion_day() {
        let storage = MemoryStorage::new();
        let (_, mut processed) = enqueued(&storage).await;
        processed.complete();
        storage.save_background_job(&processed).await.unwrap();

        let (_, mut failed) = enqueued(&storage).await;
        failed.error = Some(crate::error::JobError::new("boom"));
        failed.complete();
        storage.save_background_job(&failed).await.unwrap();

        let since = Utc::now().date_naive() - ChronoDuration::days(7);
        let days = storage.daily_status(since).await.unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].processed, 1);
        assert_eq!(days[0].failed, 1);
    }

    impl MemoryStorage {
        async fn read_ticket_gone(&self, id: &str) -> bool {
            self.keyspace().read_lock_ticket(id).unwrap().is_none()
        }
    }
}
