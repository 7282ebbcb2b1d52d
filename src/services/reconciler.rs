//! Expiration sweep and orphan cleanup.
//!
//! A pass first reads every known record, then walks the incomplete multipart
//! handles under the object prefix. Handles no record points at are aborted
//! once they are older than the orphan grace period; records past their
//! expiration that never completed are terminated.

use crate::{
    backend::{BackendError, DEFAULT_PAGE_SIZE, multipart_uploads},
    models::upload::UploadRecord,
    services::{
        coordinator::MultipartCoordinator,
        error::{StoreError, StoreResult},
    },
};
use chrono::{DateTime, TimeDelta, Utc};
use futures::{TryStreamExt, future};
use std::{collections::HashSet, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default age below which an unreferenced handle is left alone.
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(60 * 60);

/// Outcome of one reconcile pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphans_aborted: usize,
    pub expired_purged: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.orphans_aborted + self.expired_purged
    }
}

#[derive(Clone)]
pub struct ExpirationReconciler {
    coordinator: MultipartCoordinator,
    orphan_grace: Duration,
    page_size: usize,
}

impl ExpirationReconciler {
    pub fn new(coordinator: MultipartCoordinator) -> Self {
        Self {
            coordinator,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Ids of incomplete uploads whose expiration is at or before `now`.
    pub async fn find_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        self.coordinator
            .state()
            .list()
            .try_filter_map(|record| future::ready(Ok(record.is_expired_at(now).then_some(record.id))))
            .try_collect()
            .await
    }

    /// Run one full pass. Failures on single handles or records are logged
    /// and skipped; listing failures and cancellation end the pass.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> StoreResult<ReconcileReport> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        let mut known = HashSet::new();
        let mut expired: Vec<UploadRecord> = Vec::new();
        let mut records = self.coordinator.state().list();
        loop {
            ensure_live(cancel)?;
            let Some(record) = records.try_next().await? else {
                break;
            };
            known.insert(record.upload_id.clone());
            if record.is_expired_at(now) {
                expired.push(record);
            }
        }

        // handles younger than this may belong to a record not visible yet
        let cutoff = TimeDelta::from_std(self.orphan_grace)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace));

        let backend = self.coordinator.backend().clone();
        let mut handles = multipart_uploads(
            backend.clone(),
            self.coordinator.object_prefix().to_string(),
            self.page_size,
        );
        loop {
            ensure_live(cancel)?;
            let Some(handle) = handles.try_next().await? else {
                break;
            };
            if known.contains(&handle.upload_id) {
                continue;
            }
            if !cutoff.is_some_and(|cutoff| handle.initiated <= cutoff) {
                debug!(key = %handle.key, upload_id = %handle.upload_id, "orphan handle within grace period");
                continue;
            }
            match backend
                .abort_multipart_upload(&handle.key, &handle.upload_id)
                .await
            {
                Ok(()) => {
                    info!(key = %handle.key, upload_id = %handle.upload_id, "aborted orphan multipart upload");
                    report.orphans_aborted += 1;
                }
                Err(BackendError::NoSuchUpload { .. }) => {
                    debug!(upload_id = %handle.upload_id, "orphan handle already gone");
                }
                Err(err) => {
                    warn!(key = %handle.key, upload_id = %handle.upload_id, error = %err, "failed to abort orphan multipart upload");
                }
            }
        }

        for record in expired {
            ensure_live(cancel)?;
            match self.coordinator.terminate(&record).await {
                Ok(()) => report.expired_purged += 1,
                Err(err) => {
                    warn!(id = %record.id, error = %err, "failed to purge expired upload");
                }
            }
        }

        info!(
            orphans_aborted = report.orphans_aborted,
            expired_purged = report.expired_purged,
            "reconcile pass finished"
        );
        Ok(report)
    }

    /// Reconcile every `interval` until `shutdown` fires.
    pub async fn run_periodic(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.reconcile(&shutdown).await {
                Ok(_) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => warn!(error = %err, "reconcile pass failed"),
            }
        }
        info!("expiration sweeper stopped");
    }
}

fn ensure_live(cancel: &CancellationToken) -> StoreResult<()> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{ObjectBackend, memory::MemoryBackend},
        services::state_store::UploadStateStore,
    };
    use bytes::Bytes;
    use std::sync::Arc;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        coordinator: MultipartCoordinator,
        reconciler: ExpirationReconciler,
    }

    fn fixture(grace: Duration) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let state = UploadStateStore::new(backend.clone(), "state/").with_page_size(2);
        let coordinator = MultipartCoordinator::new(backend.clone(), state, "files/");
        let reconciler = ExpirationReconciler::new(coordinator.clone())
            .with_orphan_grace(grace)
            .with_page_size(2);
        Fixture {
            backend,
            coordinator,
            reconciler,
        }
    }

    async fn create(f: &Fixture, id: &str, size: i64, expires: Option<DateTime<Utc>>) -> UploadRecord {
        let upload_id = f.coordinator.initiate(id).await.unwrap();
        let mut record = UploadRecord::new(id.into(), upload_id, size, String::new());
        record.expires = expires;
        f.coordinator.state().create(&record).await.unwrap();
        record
    }

    fn an_hour_ago() -> DateTime<Utc> {
        Utc::now() - TimeDelta::hours(1)
    }

    #[tokio::test]
    async fn aborts_only_unreferenced_handles() {
        let f = fixture(Duration::ZERO);
        let known = create(&f, "a", 10, None).await;
        let orphan = f.backend.create_multipart_upload("files/b").await.unwrap();

        let report = f.reconciler.reconcile(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.orphans_aborted, 1);
        assert_eq!(report.expired_purged, 0);
        assert_eq!(f.backend.aborts(), 1);
        assert!(!f.backend.has_upload(&orphan));
        assert!(f.backend.has_upload(&known.upload_id));
    }

    #[tokio::test]
    async fn young_orphans_survive_grace_period() {
        let f = fixture(Duration::from_secs(600));
        let fresh = f.backend.create_multipart_upload("files/fresh").await.unwrap();
        let stale = f.backend.create_multipart_upload("files/stale").await.unwrap();
        f.backend.backdate_upload(&stale, an_hour_ago());

        let report = f.reconciler.reconcile(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.orphans_aborted, 1);
        assert!(f.backend.has_upload(&fresh));
        assert!(!f.backend.has_upload(&stale));
    }

    #[tokio::test]
    async fn handles_outside_object_prefix_are_ignored() {
        let f = fixture(Duration::ZERO);
        let foreign = f.backend.create_multipart_upload("elsewhere/x").await.unwrap();
        let report = f.reconciler.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(f.backend.has_upload(&foreign));
    }

    #[tokio::test]
    async fn find_expired_excludes_completed_and_unexpired() {
        let f = fixture(Duration::ZERO);
        create(&f, "stale", 10, Some(an_hour_ago())).await;
        create(&f, "deferred", -1, Some(an_hour_ago())).await;
        create(&f, "fresh", 10, Some(Utc::now() + TimeDelta::hours(1))).await;
        create(&f, "forever", 10, None).await;
        let mut done = create(&f, "done", 3, Some(an_hour_ago())).await;
        f.coordinator
            .upload_part(&mut done, Bytes::from_static(b"abc"), None)
            .await
            .unwrap();

        let mut ids = f.reconciler.find_expired(Utc::now()).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["deferred", "stale"]);
    }

    #[tokio::test]
    async fn purges_expired_uploads() {
        let f = fixture(Duration::from_secs(3600));
        let stale = create(&f, "stale", 10, Some(an_hour_ago())).await;
        create(&f, "fresh", 10, None).await;

        let report = f.reconciler.reconcile(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.expired_purged, 1);
        assert_eq!(report.total(), 1);
        assert!(!f.coordinator.state().exists("stale").await.unwrap());
        assert!(f.coordinator.state().exists("fresh").await.unwrap());
        assert!(!f.backend.has_upload(&stale.upload_id));
    }

    #[tokio::test]
    async fn cancelled_pass_reports_cancelled() {
        let f = fixture(Duration::ZERO);
        create(&f, "a", 10, Some(an_hour_ago())).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = f.reconciler.reconcile(&token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(f.coordinator.state().exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_records_do_not_stop_the_pass() {
        let f = fixture(Duration::ZERO);
        create(&f, "stale", 10, Some(an_hour_ago())).await;
        f.backend
            .put_object("state/torn.info", Bytes::from_static(b"{"))
            .await
            .unwrap();

        let report = f.reconciler.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.expired_purged, 1);
    }

    #[tokio::test]
    async fn periodic_sweep_stops_on_shutdown() {
        let f = fixture(Duration::ZERO);
        let shutdown = CancellationToken::new();
        let reconciler = f.reconciler.clone();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { reconciler.run_periodic(Duration::from_millis(10), shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
