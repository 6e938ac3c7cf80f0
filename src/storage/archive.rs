use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{BackgroundJob, Job, JobLog, JobStatus};
use crate::storage::{ArchiveEntry, DailyCount, LongTermStorage};

/// In-memory cold store: the reference implementation of
/// [`LongTermStorage`] and the test backend for storage tiering.
///
/// Entries are keyed by background job id; the migration batch upsert
/// replaces existing entries, so re-running an interrupted migration is
/// harmless.
#[derive(Default)]
pub struct MemoryArchive {
    entries: Mutex<HashMap<Uuid, ArchiveEntry>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, ArchiveEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn completed(entry: &ArchiveEntry) -> DateTime<Utc> {
        entry
            .background_job
            .completed_at
            .unwrap_or(entry.background_job.created_at)
    }
}

#[async_trait]
impl LongTermStorage for MemoryArchive {
    async fn save_background_jobs(&self, batch: &[ArchiveEntry]) -> Result<()> {
        let mut entries = self.entries();
        for entry in batch {
            entries.insert(entry.background_job.id, entry.clone());
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .entries()
            .values()
            .find(|e| e.job.id == id)
            .map(|e| e.job.clone()))
    }

    async fn get_background_job(&self, id: Uuid) -> Result<Option<BackgroundJob>> {
        Ok(self.entries().get(&id).map(|e| e.background_job.clone()))
    }

    async fn latest_background_job(&self, job_id: Uuid) -> Result<Option<BackgroundJob>> {
        Ok(self
            .entries()
            .values()
            .filter(|e| e.job.id == job_id)
            .max_by_key(|e| Self::completed(e))
            .map(|e| e.background_job.clone()))
    }

    async fn background_jobs_count(&self, status: JobStatus) -> Result<usize> {
        Ok(self
            .entries()
            .values()
            .filter(|e| e.background_job.status == status)
            .count())
    }

    async fn list(
        &self,
        status: JobStatus,
        from: usize,
        count: usize,
    ) -> Result<Vec<BackgroundJob>> {
        let entries = self.entries();
        let mut matching: Vec<&ArchiveEntry> = entries
            .values()
            .filter(|e| e.background_job.status == status)
            .collect();
        matching.sort_by_key(|e| std::cmp::Reverse(Self::completed(e)));
        Ok(matching
            .into_iter()
            .skip(from)
            .take(count)
            .map(|e| e.background_job.clone())
            .collect())
    }

    async fn search(&self, term: &str) -> Result<Vec<BackgroundJob>> {
        let term = term.to_lowercase();
        let entries = self.entries();
        let mut matching: Vec<&ArchiveEntry> = entries
            .values()
            .filter(|e| {
                let job = &e.job;
                job.id.to_string().to_lowercase().contains(&term)
                    || e.background_job.id.to_string().to_lowercase().contains(&term)
                    || job
                        .name
                        .as_ref()
                        .is_some_and(|n| n.to_lowercase().contains(&term))
                    || job.invocation.target.to_lowercase().contains(&term)
                    || job
                        .invocation
                        .arguments
                        .iter()
                        .any(|a| a.value.to_string().to_lowercase().contains(&term))
            })
            .collect();
        matching.sort_by_key(|e| std::cmp::Reverse(Self::completed(e)));
        Ok(matching
            .into_iter()
            .map(|e| e.background_job.clone())
            .collect())
    }

    async fn daily_status(&self, since: NaiveDate) -> Result<Vec<DailyCount>> {
        let entries = self.entries();
        let mut days: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
        for entry in entries.values() {
            let date = Self::completed(entry).date_naive();
            if date < since {
                continue;
            }
            let counts = days.entry(date).or_insert((0, 0));
            match entry.background_job.status {
                JobStatus::Processed => counts.0 += 1,
                JobStatus::Failed => counts.1 += 1,
                _ => {}
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

    async fn logs(&self, background_job_id: Uuid) -> Result<Vec<JobLog>> {
        Ok(self
            .entries()
            .get(&background_job_id)
            .map(|e| e.logs.clone())
            .unwrap_or_default())
    }

    async fn delete_background_job(&self, id: Uuid) -> Result<()> {
        self.entries().remove(&id);
        Ok(())
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| Self::completed(e) >= cutoff);
        Ok(before - entries.len())
    }

    async fn delete_all(&self) -> Result<()> {
        self.entries().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Invocation;
    use crate::model::JobKind;
    use chrono::Duration as ChronoDuration;

    fn entry(target: &str, days_old: i64) -> ArchiveEntry {
        let invocation = Invocation::builder(target)
            .arg("region", &"eu-west")
            .unwrap()
            .build()
            .unwrap();
        let job = Job::new(invocation, JobKind::Thread);
        let mut background_job = BackgroundJob::enqueued(job.id);
        background_job.complete();
        background_job.completed_at = Some(Utc::now() - ChronoDuration::days(days_old));
        ArchiveEntry {
            job,
            background_job,
            logs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn batch_upsert_is_idempotent() {
        let archive = MemoryArchive::new();
        let batch = vec![entry("reports", 1)];
        archive.save_background_jobs(&batch).await.unwrap();
        archive.save_background_jobs(&batch).await.unwrap();
        assert_eq!(
            archive.background_jobs_count(JobStatus::Processed).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let archive = MemoryArchive::new();
        let old = entry("old", 5);
        let new = entry("new", 1);
        archive
            .save_background_jobs(&[old.clone(), new.clone()])
            .await
            .unwrap();

        let page = archive.list(JobStatus::Processed, 0, 1).await.unwrap();
        assert_eq!(page[0].id, new.background_job.id);
    }

    #[tokio::test]
    async fn search_matches_target_name_and_arguments() {
        let archive = MemoryArchive::new();
        archive
            .save_background_jobs(&[entry("reports.Nightly", 1)])
            .await
            .unwrap();

        assert_eq!(archive.search("nightly").await.unwrap().len(), 1);
        assert_eq!(archive.search("EU-WEST").await.unwrap().len(), 1);
        assert!(archive.search("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_by_cutoff() {
        let archive = MemoryArchive::new();
        archive
            .save_background_jobs(&[entry("old", 40), entry("new", 1)])
            .await
            .unwrap();

        let cutoff = Utc::now() - ChronoDuration::days(30);
        assert_eq!(archive.delete_expired(cutoff).await.unwrap(), 1);
        assert_eq!(
            archive.background_jobs_count(JobStatus::Processed).await.unwrap(),
            1
        );
    }
}
