/// QueueCore: single-owner event loop for the download queue.
///
/// The core owns the `QueueStore`, every open `JobChannel` and the
/// `JobPoller`; no other task touches them, so nothing here needs a lock.
/// Network work (enqueue calls, push subscriptions, polls, retry requests)
/// runs in spawned tasks that report back as `QueueEvent`s on one mpsc
/// channel.  Events are applied strictly in arrival order.
///
/// After each event that changed the store the core runs one admission
/// pass, opens or closes job channels, starts or stops the poller, publishes
/// a fresh `QueueSnapshot` on a watch channel and broadcasts
/// `QueueBroadcast::Changed`.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use tunegrab_proto::config::{Config, RetryParams};
use tunegrab_proto::protocol::{JobUpdate, JobsSnapshot, PlaylistVideo, RetryRequest};

use crate::admission;
use crate::channel::JobChannel;
use crate::client::JobBackend;
use crate::enqueue;
use crate::entry::{
    EntryFailure, EntryId, EntryPatch, EntryStatus, ErrorKind, NewEntry, Provenance, QueueEntry,
    SourceRef, StatusOrigin, TransformParams,
};
use crate::error::{ClientError, QueueError, StoreError};
use crate::poller::JobPoller;
use crate::reconcile::reconcile;
use crate::store::{QueueStore, StatusCounts};

// ── QueueEvent ────────────────────────────────────────────────────────────────

/// All inputs into the QueueCore loop.
#[derive(Debug)]
pub enum QueueEvent {
    /// A command from a `QueueHandle` (UI, HTTP API).
    Command(QueueCommand),
    /// An enqueue call finished.
    Enqueued {
        id: EntryId,
        result: Result<String, ClientError>,
    },
    /// A job channel delivered an update.
    Observed {
        id: EntryId,
        job_id: String,
        update: JobUpdate,
    },
    /// The global poller fetched the job map.
    Snapshot(JobsSnapshot),
    /// A job channel gave up on its job.
    ChannelFailed {
        id: EntryId,
        job_id: String,
        error: ClientError,
    },
    /// The backend answered a retry request.
    RetryAccepted {
        template: NewEntry,
        result: Result<(), ClientError>,
        reply: oneshot::Sender<Result<EntryId, QueueError>>,
    },
    /// Shutdown requested.
    Shutdown,
}

#[derive(Debug)]
pub enum QueueCommand {
    Add {
        items: Vec<NewEntry>,
        reply: oneshot::Sender<Vec<EntryId>>,
    },
    Remove {
        id: EntryId,
        reply: oneshot::Sender<Result<QueueEntry, StoreError>>,
    },
    Clear {
        reply: oneshot::Sender<usize>,
    },
    Retry {
        id: EntryId,
        reply: oneshot::Sender<Result<EntryId, QueueError>>,
    },
    RetryItem {
        item: PlaylistVideo,
        playlist_id: String,
        reply: oneshot::Sender<Result<EntryId, QueueError>>,
    },
}

/// Notifications for UI listeners.
#[derive(Debug, Clone)]
pub enum QueueBroadcast {
    /// The store changed; read the new snapshot from the watch channel.
    Changed { rev: u64 },
    /// An entry reached `completed` or `error`.
    Terminal {
        id: EntryId,
        status: EntryStatus,
        title: String,
        error: Option<String>,
    },
    /// A WARN/ERROR log line.
    Log(String),
}

/// Read-only view of the queue, published after every change.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub rev: u64,
    pub entries: Arc<Vec<QueueEntry>>,
    pub counts: StatusCounts,
}

impl QueueSnapshot {
    pub fn get(&self, id: EntryId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.unique_id == id)
    }
}

// ── QueueHandle ───────────────────────────────────────────────────────────────

/// Cloneable command side of the core.
#[derive(Clone)]
pub struct QueueHandle {
    event_tx: mpsc::Sender<QueueEvent>,
    snapshot_rx: watch::Receiver<QueueSnapshot>,
    broadcast_tx: broadcast::Sender<QueueBroadcast>,
}

impl QueueHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(QueueEvent::Command(command(reply)))
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Append entries; they are admitted in order as slots free up.
    pub async fn add(&self, items: Vec<NewEntry>) -> Result<Vec<EntryId>, QueueError> {
        self.request(|reply| QueueCommand::Add { items, reply }).await
    }

    pub async fn remove(&self, id: EntryId) -> Result<QueueEntry, QueueError> {
        Ok(self
            .request(|reply| QueueCommand::Remove { id, reply })
            .await??)
    }

    /// Drop every entry that holds no slot; returns how many went.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        self.request(|reply| QueueCommand::Clear { reply }).await
    }

    /// Queue a fresh copy of a finished or failed entry.
    pub async fn retry(&self, id: EntryId) -> Result<EntryId, QueueError> {
        self.request(|reply| QueueCommand::Retry { id, reply })
            .await?
    }

    /// Queue a playlist item the backend already downloaded.
    pub async fn retry_item(
        &self,
        item: PlaylistVideo,
        playlist_id: String,
    ) -> Result<EntryId, QueueError> {
        self.request(|reply| QueueCommand::RetryItem {
            item,
            playlist_id,
            reply,
        })
        .await?
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueBroadcast> {
        self.broadcast_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.event_tx.send(QueueEvent::Shutdown).await;
    }
}

// ── QueueCore ─────────────────────────────────────────────────────────────────

pub struct QueueCore {
    config: Config,
    backend: Arc<dyn JobBackend>,
    store: QueueStore,
    /// Open job channels, keyed by the entry they feed.
    channels: HashMap<EntryId, JobChannel>,
    poller: JobPoller,
    event_tx: mpsc::Sender<QueueEvent>,
    broadcast_tx: broadcast::Sender<QueueBroadcast>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
}

impl QueueCore {
    pub fn new(
        config: Config,
        backend: Arc<dyn JobBackend>,
        broadcast_tx: broadcast::Sender<QueueBroadcast>,
        event_tx: mpsc::Sender<QueueEvent>,
    ) -> Self {
        let poller = JobPoller::new(
            Arc::clone(&backend),
            event_tx.clone(),
            config.queue.poll_interval(),
        );
        let (snapshot_tx, _) = watch::channel(QueueSnapshot::default());
        Self {
            config,
            backend,
            store: QueueStore::new(),
            channels: HashMap::new(),
            poller,
            event_tx,
            broadcast_tx,
            snapshot_tx,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            event_tx: self.event_tx.clone(),
            snapshot_rx: self.snapshot_tx.subscribe(),
            broadcast_tx: self.broadcast_tx.clone(),
        }
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or the event channel is closed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<QueueEvent>) -> anyhow::Result<()> {
        info!(
            "QueueCore: starting event loop (concurrency {})",
            self.config.queue.concurrency_limit
        );

        loop {
            let Some(evt) = event_rx.recv().await else {
                info!("QueueCore: event channel closed, shutting down");
                break;
            };
            let rev = self.store.rev();

            match evt {
                QueueEvent::Shutdown => {
                    info!("QueueCore: shutdown requested");
                    break;
                }
                QueueEvent::Command(cmd) => self.handle_command(cmd),
                QueueEvent::Enqueued { id, result } => self.on_enqueued(id, result),
                QueueEvent::Observed { id, job_id, update } => {
                    self.on_observed(id, &job_id, &update)
                }
                QueueEvent::Snapshot(jobs) => self.on_snapshot(&jobs),
                QueueEvent::ChannelFailed { id, job_id, error } => {
                    self.on_channel_failed(id, &job_id, error)
                }
                QueueEvent::RetryAccepted {
                    template,
                    result,
                    reply,
                } => match result {
                    Ok(()) => {
                        let id = self.add_retry(template);
                        let _ = reply.send(Ok(id));
                    }
                    Err(e) => {
                        warn!("QueueCore: backend refused retry: {}", e);
                        let _ = reply.send(Err(QueueError::Backend(e)));
                    }
                },
            }

            if self.store.rev() != rev {
                self.after_change();
            }
        }

        self.cleanup();
        Ok(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Add { items, reply } => {
                let ids = self.store.add(items);
                info!("QueueCore: added {} entries", ids.len());
                let _ = reply.send(ids);
            }
            QueueCommand::Remove { id, reply } => {
                let result = self.store.remove(id);
                match &result {
                    Ok(entry) => info!("QueueCore: removed {} \"{}\"", id, entry.title),
                    Err(e) => debug!("QueueCore: remove refused: {}", e),
                }
                let _ = reply.send(result);
            }
            QueueCommand::Clear { reply } => {
                let removed = self.store.clear().len();
                info!("QueueCore: cleared {} entries", removed);
                let _ = reply.send(removed);
            }
            QueueCommand::Retry { id, reply } => match self.store.get(id) {
                None => {
                    let _ = reply.send(Err(StoreError::NotFound(id).into()));
                }
                Some(entry) if !entry.status.is_terminal() => {
                    let _ = reply.send(Err(QueueError::NotRetryable {
                        id,
                        status: entry.status,
                    }));
                }
                Some(entry) => {
                    let params = match self.config.queue.retry_params {
                        RetryParams::Original => entry.params.clone(),
                        RetryParams::Current => self.current_params(),
                    };
                    let template = entry.retry_template(params);
                    info!("QueueCore: retry {} \"{}\"", id, entry.title);
                    self.begin_retry(template, reply);
                }
            },
            QueueCommand::RetryItem {
                item,
                playlist_id,
                reply,
            } => {
                info!("QueueCore: retry playlist item {} \"{}\"", item.id, item.title);
                let template = NewEntry::new(SourceRef::from_video(&item), self.current_params())
                    .with_provenance(Provenance::playlist_item(&playlist_id, &item.id));
                self.begin_retry(template, reply);
            }
        }
    }

    fn current_params(&self) -> TransformParams {
        TransformParams::from_defaults(&self.config.defaults)
    }

    /// Playlist items have to be released on the backend before they can be
    /// downloaded again; everything else goes straight back into the queue.
    fn begin_retry(
        &mut self,
        template: NewEntry,
        reply: oneshot::Sender<Result<EntryId, QueueError>>,
    ) {
        let Some((playlist_id, video_id)) = template.provenance.retry_key() else {
            let id = self.add_retry(template);
            let _ = reply.send(Ok(id));
            return;
        };

        let request = RetryRequest {
            playlist_id: playlist_id.to_string(),
            video_id: video_id.to_string(),
        };
        let backend = Arc::clone(&self.backend);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = backend.retry(request).await;
            let _ = event_tx
                .send(QueueEvent::RetryAccepted {
                    template,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn add_retry(&mut self, template: NewEntry) -> EntryId {
        let id = self.store.push(template);
        info!("QueueCore: retry queued as {}", id);
        id
    }

    // ── backend observations ──────────────────────────────────────────────────

    fn on_enqueued(&mut self, id: EntryId, result: Result<String, ClientError>) {
        let Some(entry) = self.store.get(id) else {
            if let Ok(job_id) = result {
                warn!("QueueCore: job {} enqueued for vanished entry {}", job_id, id);
            }
            return;
        };

        match result {
            Ok(job_id) => {
                if entry.job_id.is_some() {
                    warn!("QueueCore: {} already bound, ignoring job {}", id, job_id);
                    return;
                }
                info!("QueueCore: {} bound to job {}", id, job_id);
                self.patch_entry(id, &EntryPatch::bind_job(job_id));
            }
            Err(e) => {
                error!("QueueCore: enqueue failed for {}: {}", id, e);
                self.patch_entry(
                    id,
                    &EntryPatch::failed(
                        EntryFailure::new(ErrorKind::Admission, None),
                        StatusOrigin::Local,
                    ),
                );
            }
        }
    }

    fn on_observed(&mut self, id: EntryId, job_id: &str, update: &JobUpdate) {
        let Some(entry) = self.store.get(id) else {
            return;
        };
        if entry.job_id.as_deref() != Some(job_id) {
            debug!("QueueCore: dropping update from job {} for {}", job_id, id);
            return;
        }
        if let Some(patch) = reconcile(entry, update) {
            self.patch_entry(id, &patch);
        }
    }

    fn on_snapshot(&mut self, jobs: &JobsSnapshot) {
        let patches: Vec<(EntryId, EntryPatch)> = self
            .store
            .live_jobs()
            .filter_map(|(id, job_id)| {
                let job = jobs.get(job_id)?;
                let entry = self.store.get(id)?;
                reconcile(entry, &JobUpdate::from(job.clone())).map(|patch| (id, patch))
            })
            .collect();
        for (id, patch) in patches {
            self.patch_entry(id, &patch);
        }
    }

    fn on_channel_failed(&mut self, id: EntryId, job_id: &str, error: ClientError) {
        self.channels.remove(&id);
        let Some(entry) = self.store.get(id) else {
            return;
        };
        if entry.job_id.as_deref() != Some(job_id) || entry.status.is_terminal() {
            return;
        }
        warn!("QueueCore: lost job {} for {}: {}", job_id, id, error);
        self.patch_entry(
            id,
            &EntryPatch::failed(
                EntryFailure::new(ErrorKind::Channel, None),
                StatusOrigin::Local,
            ),
        );
    }

    /// Apply a patch and announce the entry if it just finished.
    fn patch_entry(&mut self, id: EntryId, patch: &EntryPatch) {
        let was_terminal = self.store.get(id).map(|e| e.status.is_terminal());
        if !self.store.update(id, patch) {
            return;
        }
        let Some(entry) = self.store.get(id) else {
            return;
        };
        if was_terminal == Some(false) && entry.status.is_terminal() {
            info!("QueueCore: {} \"{}\" {}", id, entry.title, entry.status);
            let _ = self.broadcast_tx.send(QueueBroadcast::Terminal {
                id,
                status: entry.status,
                title: entry.title.clone(),
                error: entry.error.as_ref().map(|f| f.message.clone()),
            });
        }
    }

    // ── after every change ────────────────────────────────────────────────────

    fn after_change(&mut self) {
        self.admit();
        self.sync_channels();
        self.sync_poller();
        self.publish();
    }

    /// Mark the chosen entries `queued` first, then fire their enqueue calls.
    fn admit(&mut self) {
        let ids = admission::select(&self.store.entries(), self.config.queue.concurrency_limit);
        if ids.is_empty() {
            return;
        }
        self.store.update_many(
            &ids,
            &EntryPatch::status(EntryStatus::Queued, StatusOrigin::Local),
        );
        debug!("QueueCore: admitted {:?}", ids);

        let entries = self.store.entries();
        for entry in entries.iter().filter(|e| ids.contains(&e.unique_id)) {
            enqueue::spawn(Arc::clone(&self.backend), entry, self.event_tx.clone());
        }
    }

    /// One channel per live job: close the ones whose entry went away,
    /// finished or changed job, open the missing ones.
    fn sync_channels(&mut self) {
        let store = &self.store;
        self.channels.retain(|id, channel| match store.get(*id) {
            Some(entry) => {
                !entry.status.is_terminal() && entry.job_id.as_deref() == Some(channel.job_id())
            }
            None => false,
        });

        let missing: Vec<(EntryId, String)> = self
            .store
            .live_jobs()
            .filter(|(id, _)| !self.channels.contains_key(id))
            .map(|(id, job_id)| (id, job_id.to_string()))
            .collect();
        let fallback = self.config.queue.channel_fallback_interval();
        for (id, job_id) in missing {
            let channel = JobChannel::open(
                Arc::clone(&self.backend),
                id,
                job_id,
                self.event_tx.clone(),
                fallback,
            );
            self.channels.insert(id, channel);
        }
    }

    fn sync_poller(&mut self) {
        if self.store.live_jobs().next().is_some() {
            self.poller.start();
        } else {
            self.poller.stop();
        }
    }

    fn publish(&mut self) {
        let rev = self.store.rev();
        let counts = self.store.counts();
        debug!(
            "Queue rev {}: {} entries, {} in flight",
            rev,
            counts.total(),
            counts.in_flight
        );
        self.snapshot_tx.send_replace(QueueSnapshot {
            rev,
            entries: self.store.entries(),
            counts,
        });
        let _ = self.broadcast_tx.send(QueueBroadcast::Changed { rev });
    }

    fn cleanup(&mut self) {
        info!(
            "QueueCore: cleanup, closing {} job channels",
            self.channels.len()
        );
        self.channels.clear();
        self.poller.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tests::new_entry;
    use crate::fake::FakeBackend;
    use std::time::Duration;
    use tunegrab_proto::protocol::{JobStatus, PlaylistItemStatus};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.queue.poll_interval_ms = 50;
        config.queue.channel_fallback_interval_ms = 10;
        config
    }

    fn start(fake: &Arc<FakeBackend>, config: Config) -> QueueHandle {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (broadcast_tx, _) = broadcast::channel(256);
        let core = QueueCore::new(config, fake.clone(), broadcast_tx, event_tx);
        let handle = core.handle();
        tokio::spawn(core.run(event_rx));
        handle
    }

    async fn wait_until(
        handle: &QueueHandle,
        what: &str,
        pred: impl Fn(&QueueSnapshot) -> bool,
    ) -> QueueSnapshot {
        let mut rx = handle.watch();
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.expect("queue core stopped");
            }
        })
        .await;
        waited.unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    fn bound(snapshot: &QueueSnapshot) -> usize {
        snapshot.entries.iter().filter(|e| e.job_id.is_some()).count()
    }

    fn job_of(snapshot: &QueueSnapshot, id: EntryId) -> String {
        snapshot.get(id).and_then(|e| e.job_id.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_six_entries_fill_four_slots_then_refill() {
        let fake = Arc::new(FakeBackend::new());
        let handle = start(&fake, test_config());

        let ids = handle
            .add((0..6).map(|i| new_entry(&format!("v{}", i))).collect())
            .await
            .unwrap();
        let snapshot = wait_until(&handle, "four bound jobs", |s| bound(s) == 4).await;
        assert_eq!(snapshot.counts.pending, 2);
        assert_eq!(snapshot.counts.in_flight, 4);
        // FIFO: the first four were admitted
        assert!(ids[..4].iter().all(|id| snapshot.get(*id).unwrap().job_id.is_some()));
        assert_eq!(fake.enqueued().len(), 4);

        let job = job_of(&snapshot, ids[1]);
        fake.push(&job, r#"{"status": "completed", "progress": 100}"#);

        let snapshot = wait_until(&handle, "refill", |s| bound(s) == 5).await;
        assert_eq!(snapshot.get(ids[1]).unwrap().status, EntryStatus::Completed);
        assert!(snapshot.get(ids[4]).unwrap().job_id.is_some());
        assert_eq!(snapshot.get(ids[5]).unwrap().status, EntryStatus::Pending);
        assert_eq!(snapshot.counts.in_flight, 4);
        assert_eq!(fake.enqueued().len(), 5);
    }

    #[tokio::test]
    async fn test_enqueue_failure_isolated_to_its_entry() {
        let fake = Arc::new(FakeBackend::new());
        fake.fail_enqueue("https://www.youtube.com/watch?v=bad");
        let handle = start(&fake, test_config());

        let ids = handle
            .add(vec![new_entry("ok1"), new_entry("bad"), new_entry("ok2")])
            .await
            .unwrap();
        let snapshot = wait_until(&handle, "enqueue outcomes", |s| {
            bound(s) == 2 && s.counts.error == 1
        })
        .await;

        let failed = snapshot.get(ids[1]).unwrap();
        assert_eq!(failed.status, EntryStatus::Error);
        assert!(failed.job_id.is_none());
        let failure = failed.error.clone().unwrap();
        assert_eq!(failure.kind, ErrorKind::Admission);
        assert_eq!(failure.message, "Failed to enqueue download");

        handle.remove(ids[1]).await.unwrap();
        assert!(handle.snapshot().get(ids[0]).unwrap().job_id.is_some());
    }

    #[tokio::test]
    async fn test_authoritative_update_beats_stale_poll() {
        let fake = Arc::new(FakeBackend::new());
        let handle = start(&fake, test_config());
        let ids = handle.add(vec![new_entry("a")]).await.unwrap();
        let snapshot = wait_until(&handle, "job bound", |s| bound(s) == 1).await;
        let job = job_of(&snapshot, ids[0]);

        // the poller keeps reporting `queued` for this job
        fake.push(&job, r#"{"status": "downloading", "progress": 12}"#);
        wait_until(&handle, "downloading", |s| {
            s.get(ids[0]).unwrap().status == EntryStatus::Downloading
        })
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let entry = handle.snapshot().get(ids[0]).cloned().unwrap();
        assert_eq!(entry.status, EntryStatus::Downloading);
        assert_eq!(entry.progress, 12.0);
    }

    #[tokio::test]
    async fn test_poller_drives_entries_without_push() {
        let fake = Arc::new(FakeBackend::new().without_push());
        let mut config = test_config();
        // only the global poller observes
        config.queue.channel_fallback_interval_ms = 60_000;
        let handle = start(&fake, config);
        let ids = handle.add(vec![new_entry("a")]).await.unwrap();
        let snapshot = wait_until(&handle, "job bound", |s| bound(s) == 1).await;
        let job = job_of(&snapshot, ids[0]);

        fake.set_job(&job, JobStatus::Running, 55.0);
        wait_until(&handle, "progress from poll", |s| {
            let e = s.get(ids[0]).unwrap();
            e.status == EntryStatus::Downloading && e.progress == 55.0
        })
        .await;

        fake.set_job(&job, JobStatus::Done, 100.0);
        wait_until(&handle, "completion from poll", |s| {
            s.get(ids[0]).unwrap().status == EntryStatus::Completed
        })
        .await;
    }

    #[tokio::test]
    async fn test_failed_polls_keep_last_known_state() {
        let fake = Arc::new(FakeBackend::new().without_push());
        let handle = start(&fake, test_config());
        let ids = handle.add(vec![new_entry("a")]).await.unwrap();
        let snapshot = wait_until(&handle, "job bound", |s| bound(s) == 1).await;
        let job = job_of(&snapshot, ids[0]);

        fake.set_job(&job, JobStatus::Downloading, 40.0);
        wait_until(&handle, "downloading 40", |s| {
            let e = s.get(ids[0]).unwrap();
            e.status == EntryStatus::Downloading && e.progress == 40.0
        })
        .await;

        fake.set_offline(true);
        fake.set_job(&job, JobStatus::Done, 100.0);
        tokio::time::timeout(Duration::from_secs(5), async {
            while fake.failed_polls() < 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let entry = handle.snapshot().get(ids[0]).cloned().unwrap();
        assert_eq!(entry.status, EntryStatus::Downloading);
        assert_eq!(entry.progress, 40.0);
        assert!(entry.error.is_none());
        assert_eq!(entry.job_id.as_deref(), Some(job.as_str()));

        fake.set_offline(false);
        wait_until(&handle, "completion after recovery", |s| {
            s.get(ids[0]).unwrap().status == EntryStatus::Completed
        })
        .await;
    }

    #[tokio::test]
    async fn test_lost_job_surfaces_as_channel_error() {
        let fake = Arc::new(FakeBackend::new().without_push());
        let handle = start(&fake, test_config());
        let mut events = handle.subscribe();
        let ids = handle.add(vec![new_entry("a")]).await.unwrap();
        let snapshot = wait_until(&handle, "job bound", |s| bound(s) == 1).await;

        fake.forget(&job_of(&snapshot, ids[0]));
        let snapshot = wait_until(&handle, "channel error", |s| s.counts.error == 1).await;
        let entry = snapshot.get(ids[0]).unwrap();
        assert_eq!(entry.error.as_ref().unwrap().kind, ErrorKind::Channel);

        let terminal = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(QueueBroadcast::Terminal { id, status, .. }) = events.recv().await {
                    return (id, status);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(terminal, (ids[0], EntryStatus::Error));
    }

    #[tokio::test]
    async fn test_in_flight_entry_cannot_be_removed() {
        let fake = Arc::new(FakeBackend::new());
        let handle = start(&fake, test_config());
        let ids = handle.add(vec![new_entry("a")]).await.unwrap();
        wait_until(&handle, "job bound", |s| bound(s) == 1).await;

        let err = handle.remove(ids[0]).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Store(StoreError::InFlight { .. })
        ));
        assert_eq!(handle.snapshot().entries.len(), 1);

        assert!(matches!(
            handle.retry(ids[0]).await,
            Err(QueueError::NotRetryable { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_completed_playlist_entry() {
        let fake = Arc::new(FakeBackend::new());
        let handle = start(&fake, test_config());
        let ids = handle
            .add(vec![new_entry("a").with_provenance(Provenance::playlist_item("PL", "a"))])
            .await
            .unwrap();
        let snapshot = wait_until(&handle, "job bound", |s| bound(s) == 1).await;
        let first_job = job_of(&snapshot, ids[0]);
        fake.push(&first_job, r#"{"status": "done", "filename": "a.mp3"}"#);
        let done = wait_until(&handle, "completed", |s| s.counts.completed == 1).await;
        let original = done.get(ids[0]).cloned().unwrap();

        let retried = handle.retry(ids[0]).await.unwrap();
        assert_ne!(retried, ids[0]);
        let retries = fake.retries();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].playlist_id, "PL");
        assert_eq!(retries[0].video_id, "a");

        let snapshot = wait_until(&handle, "retry bound", |s| bound(s) == 2).await;
        assert_eq!(snapshot.get(ids[0]), Some(&original));
        let copy = snapshot.get(retried).unwrap();
        assert_ne!(copy.job_id.as_deref(), Some(first_job.as_str()));
        assert_eq!(copy.source, original.source);
    }

    #[tokio::test]
    async fn test_rejected_retry_adds_nothing() {
        let fake = Arc::new(FakeBackend::new());
        fake.reject_retry();
        let handle = start(&fake, test_config());

        let item = PlaylistVideo {
            index: 1,
            id: "a".into(),
            title: "Song".into(),
            thumbnail: None,
            duration: None,
            duration_string: None,
            uploader: None,
            url: None,
            status: PlaylistItemStatus::Downloaded,
        };
        let err = handle.retry_item(item, "PL".into()).await.unwrap_err();
        assert!(matches!(err, QueueError::Backend(_)));
        assert!(handle.snapshot().entries.is_empty());
    }

    #[tokio::test]
    async fn test_retry_item_queues_a_fresh_entry() {
        let fake = Arc::new(FakeBackend::new());
        let mut config = test_config();
        config.queue.concurrency_limit = 0;
        let handle = start(&fake, config);

        let item = PlaylistVideo {
            index: 4,
            id: "xyz".into(),
            title: "Song".into(),
            thumbnail: None,
            duration: None,
            duration_string: None,
            uploader: Some("Band".into()),
            url: None,
            status: PlaylistItemStatus::Downloaded,
        };
        let id = handle.retry_item(item, "PL".into()).await.unwrap();
        let snapshot = wait_until(&handle, "retried entry", |s| s.get(id).is_some()).await;
        let entry = snapshot.get(id).unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(entry.job_id.is_none());
        assert_eq!(entry.provenance.retry_key(), Some(("PL", "xyz")));
        assert_eq!(fake.retries().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_in_flight_and_shutdown_closes_handle() {
        let fake = Arc::new(FakeBackend::new());
        let mut config = test_config();
        config.queue.concurrency_limit = 1;
        let handle = start(&fake, config);
        handle
            .add(vec![new_entry("a"), new_entry("b"), new_entry("c")])
            .await
            .unwrap();
        wait_until(&handle, "job bound", |s| bound(s) == 1).await;

        assert_eq!(handle.clear().await.unwrap(), 2);
        assert_eq!(handle.snapshot().entries.len(), 1);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(handle.clear().await, Err(QueueError::Closed)));
    }
}
