//! Repository backend over a content-addressed gateway with storage deals.
//!
//! Objects are written into a local staging tree, uploaded in one request,
//! submitted for a storage deal, and then linked into the gateway's mutable
//! namespace under the repository root. Writes are grouped into batches so
//! that many small objects share a single upload and a single deal.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use tokio::io::AsyncReadExt;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use dealstore_common::layout::{self, Layout, DEFAULT_LAYOUT};
use dealstore_common::{Backend, FileInfo, Handle, ListFn, ObjectReader, ObjectType};

use crate::api::{
    ApiError, ApplyOptions, ContentId, ContentStore, DealApi, DealJobState, Entry,
    HttpContentStore, HttpDealApi, JobId, Session, StagedContent,
};
use crate::batch::{BatchOutcome, Batcher, PendingWrite, SealedBatch};
use crate::config::Config;
use crate::error::{BackendError, InitPhase};
use crate::limiter::Limiter;
use crate::staging::StagedTree;

const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Closed,
}

pub struct DealBackend {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    layout: Box<dyn Layout>,
    session: Session,
    store: Arc<dyn ContentStore>,
    deals: Arc<dyn DealApi>,
    limiter: Limiter,
    batcher: Batcher,
    state: Mutex<State>,
    location: String,
    /// Batch flushes act for every writer in the batch, so no single
    /// caller's token may abort one.
    flush_token: CancellationToken,
    ticker_stop: CancellationToken,
    tasks: TaskTracker,
}

impl DealBackend {
    /// Connect to the gateway and deal API named in `config`. Nothing remote
    /// is touched. Must be called from within a Tokio runtime.
    pub fn open(config: Config) -> Result<Self, BackendError> {
        let store = HttpContentStore::new(&config.gateway_addr)?;
        let deals = HttpDealApi::new(&config.server_addr)?;
        let location = format!("dealstore:{}{}", store.base_url(), config.backup_root);
        Self::build(config, Arc::new(store), Arc::new(deals), location)
    }

    /// Like [`DealBackend::open`], with caller-provided service clients.
    pub fn with_clients(
        config: Config,
        store: Arc<dyn ContentStore>,
        deals: Arc<dyn DealApi>,
    ) -> Result<Self, BackendError> {
        let location = format!("dealstore:{}{}", config.gateway_addr, config.backup_root);
        Self::build(config, store, deals, location)
    }

    fn build(
        config: Config,
        store: Arc<dyn ContentStore>,
        deals: Arc<dyn DealApi>,
        location: String,
    ) -> Result<Self, BackendError> {
        let layout = layout::resolve(&config.layout, DEFAULT_LAYOUT)?;
        let inner = Arc::new(Inner {
            session: Session::new(config.token.clone()),
            limiter: Limiter::new(config.connections),
            batcher: Batcher::new(config.batch.clone()),
            state: Mutex::new(State::Ready),
            flush_token: CancellationToken::new(),
            ticker_stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
            location,
            layout,
            config,
            store,
            deals,
        });
        spawn_ticker(&inner);
        info!(
            location = %inner.location,
            layout = inner.layout.name(),
            connections = inner.limiter.capacity(),
            "Backend opened"
        );
        Ok(Self { inner })
    }

    /// Open the backend and initialize a fresh repository at the configured root.
    pub async fn create(config: Config, cancel: &CancellationToken) -> Result<(Self, JobId), BackendError> {
        let backend = Self::open(config)?;
        match backend.init_repository(cancel).await {
            Ok(job) => Ok((backend, job)),
            Err(e) => {
                let _ = backend.close().await;
                Err(e)
            }
        }
    }

    /// Stage the empty layout, submit it for a deal and link it at the root.
    ///
    /// Fails with [`BackendError::AlreadyInitialized`] if anything exists at
    /// the root already, unless the existence probe is bypassed. A probe that
    /// cannot tell either way fails the whole call.
    pub async fn init_repository(&self, cancel: &CancellationToken) -> Result<JobId, BackendError> {
        self.ensure_ready()?;
        let inner = &self.inner;
        let root = inner.config.backup_root.as_str();

        if inner.config.bypass_init_check {
            warn!(root, "Skipping repository existence check");
        } else {
            match inner.call(cancel, "ls", root, inner.store.ls(&inner.session, root)).await {
                Ok(_) => return Err(BackendError::AlreadyInitialized(root.to_string())),
                Err(e) if e.is_not_found() => debug!(root, "No repository at root"),
                Err(e) => return Err(BackendError::init(InitPhase::Probe, e)),
            }
        }

        let tree = StagedTree::with_layout(inner.config.staging_dir.as_deref(), inner.layout.as_ref())
            .map_err(|e| BackendError::init(InitPhase::Stage, e.into()))?;
        let staged = inner
            .call(cancel, "stage", root, inner.store.stage(&inner.session, tree.path()))
            .await
            .map_err(|e| BackendError::init(InitPhase::Stage, e))?;
        drop(tree);
        debug!(root, content = %staged.root, "Layout staged");

        let job = inner
            .apply(cancel, &staged.root)
            .await
            .map_err(|e| BackendError::init(InitPhase::DealApply, e))?;
        inner
            .call(cancel, "link", root, inner.store.link(&inner.session, &staged.root, root))
            .await
            .map_err(|e| BackendError::init(InitPhase::Link, e))?;

        info!(root, content = %staged.root, job_id = %job, "Repository initialized");
        Ok(job)
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Absolute namespace path of the object behind `h`.
    pub fn object_path(&self, h: &Handle) -> String {
        self.inner.path_for(h)
    }

    /// Whether `h` exists. A check that does not answer within the
    /// configured timeout reports the object as absent.
    pub async fn test(&self, cancel: &CancellationToken, h: &Handle) -> Result<bool, BackendError> {
        self.ensure_ready()?;
        check_handle(h)?;
        let inner = &self.inner;
        let path = inner.path_for(h);
        let check = inner.call(cancel, "stat", &path, inner.store.stat(&inner.session, &path));
        match time::timeout(inner.config.test_timeout(), check).await {
            Err(_) => {
                debug!(path = %path, "Existence check timed out");
                Ok(false)
            }
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) if e.is_not_found() => Ok(false),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Store `data` under `h`, returning once the batch holding it has been
    /// uploaded, submitted for a deal and linked.
    pub async fn save(&self, cancel: &CancellationToken, h: &Handle, data: Bytes) -> Result<(), BackendError> {
        self.ensure_ready()?;
        check_handle(h)?;
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let inner = &self.inner;
        let write = PendingWrite::new(h.clone(), inner.layout.filename(h), data);
        let enqueued = inner.batcher.push(write)?;
        if let Some(batch) = enqueued.sealed {
            inner.spawn_flush(batch);
        }
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            res = enqueued.waiter.wait() => res?,
        };
        debug!(handle = %h, job_id = %job, "Saved");
        Ok(())
    }

    /// Read `h`. A `length` of 0 reads from `offset` to the end.
    pub async fn load(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        length: usize,
        offset: u64,
    ) -> Result<ObjectReader, BackendError> {
        self.ensure_ready()?;
        check_handle(h)?;
        let inner = &self.inner;
        let path = inner.path_for(h);
        let limit = (length > 0).then_some(length as u64);
        let reader = inner
            .call(cancel, "read", &path, inner.store.read(&inner.session, &path, offset, limit))
            .await?;
        // The gateway may ignore `count`; never hand out more than asked for.
        if let Some(limit) = limit {
            return Ok(Box::new(reader.take(limit)));
        }
        Ok(reader)
    }

    pub async fn stat(&self, cancel: &CancellationToken, h: &Handle) -> Result<FileInfo, BackendError> {
        self.ensure_ready()?;
        check_handle(h)?;
        let inner = &self.inner;
        let path = inner.path_for(h);
        let stat = inner
            .call(cancel, "stat", &path, inner.store.stat(&inner.session, &path))
            .await?;
        if stat.is_dir {
            return Err(BackendError::NotFound(path));
        }
        Ok(FileInfo {
            name: h.name.clone(),
            size: stat.size,
        })
    }

    /// Remove `h`. Removing an object that does not exist succeeds.
    pub async fn remove(&self, cancel: &CancellationToken, h: &Handle) -> Result<(), BackendError> {
        self.ensure_ready()?;
        check_handle(h)?;
        let inner = &self.inner;
        let path = inner.path_for(h);
        match inner
            .call(cancel, "rm", &path, inner.store.remove(&inner.session, &path))
            .await
        {
            Ok(()) => debug!(handle = %h, "Removed"),
            Err(e) if e.is_not_found() => debug!(handle = %h, "Already absent"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Call `f` for every object of type `t`. Entries whose names do not
    /// parse as objects of that type are skipped. Stops at the first
    /// callback error or when `cancel` fires.
    pub async fn list(
        &self,
        cancel: &CancellationToken,
        t: ObjectType,
        f: &mut ListFn<'_>,
    ) -> Result<(), BackendError> {
        self.ensure_ready()?;
        let inner = &self.inner;

        if t == ObjectType::Config {
            return match self.stat(cancel, &Handle::config()).await {
                Ok(info) => {
                    if cancel.is_cancelled() {
                        return Err(BackendError::Cancelled);
                    }
                    f(info).map_err(BackendError::Callback)
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            };
        }

        let dir = inner.layout.dirname(t);
        let entries = inner.ls_relative(cancel, dir).await?;
        if !inner.layout.is_sharded(t) {
            return inner.dispatch(cancel, t, dir, entries, f);
        }
        for shard in entries {
            if !shard.is_dir {
                debug!(dir, name = %shard.name, "Skipping file outside shard directories");
                continue;
            }
            let shard_dir = format!("{}/{}", dir, shard.name);
            let files = inner.ls_relative(cancel, &shard_dir).await?;
            inner.dispatch(cancel, t, &shard_dir, files, f)?;
        }
        Ok(())
    }

    /// Remove the whole repository. Pending writes are flushed first.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.ensure_ready()?;
        let inner = &self.inner;
        if let Some(batch) = inner.batcher.take() {
            if let Err(e) = inner.flush_batch(batch).await {
                warn!(error = %e, "Pending writes failed before delete");
            }
        }
        let root = inner.config.backup_root.as_str();
        match inner.call(cancel, "rm", root, inner.store.remove(&inner.session, root)).await {
            Ok(()) => info!(root, "Repository deleted"),
            Err(e) if e.is_not_found() => debug!(root, "Nothing to delete"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Seal and flush whatever is pending now. Returns the deal job of the
    /// flushed batch, if there was one.
    pub async fn flush(&self) -> Result<Option<JobId>, BackendError> {
        self.ensure_ready()?;
        match self.inner.batcher.take() {
            None => Ok(None),
            Some(batch) => self.inner.flush_batch(batch).await.map(Some).map_err(BackendError::Batch),
        }
    }

    /// Current state of a deal job started by this backend.
    pub async fn deal_status(
        &self,
        cancel: &CancellationToken,
        job: &JobId,
    ) -> Result<DealJobState, BackendError> {
        self.ensure_ready()?;
        let inner = &self.inner;
        inner
            .call(cancel, "job", &job.0, inner.deals.job_status(&inner.session, job))
            .await
    }

    /// Flush pending writes and stop background work. Later calls return
    /// [`BackendError::Closed`]; closing twice is a no-op.
    pub async fn close(&self) -> Result<(), BackendError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == State::Closed {
                return Ok(());
            }
            *state = State::Closed;
        }
        inner.ticker_stop.cancel();

        let result = match inner.batcher.shutdown() {
            Some(batch) => inner
                .flush_batch(batch)
                .await
                .map(drop)
                .map_err(BackendError::Batch),
            None => Ok(()),
        };
        inner.tasks.close();
        inner.tasks.wait().await;
        info!(location = %inner.location, "Backend closed");
        result
    }

    fn ensure_ready(&self) -> Result<(), BackendError> {
        match self.state() {
            State::Ready => Ok(()),
            State::Closed => Err(BackendError::Closed),
        }
    }
}

impl Drop for DealBackend {
    fn drop(&mut self) {
        self.inner.ticker_stop.cancel();
    }
}

impl Inner {
    fn path_for(&self, h: &Handle) -> String {
        layout::join(&self.config.backup_root, &self.layout.filename(h))
    }

    /// Run one remote call under a limiter slot, racing it against `cancel`.
    async fn call<T>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        path: &str,
        fut: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            permit = self.limiter.acquire() => permit?,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            res = fut => res.map_err(|e| BackendError::remote(op, path, e)),
        }
    }

    async fn apply(&self, cancel: &CancellationToken, content: &ContentId) -> Result<JobId, BackendError> {
        let options = ApplyOptions { override_config: true };
        self.call(cancel, "apply", &content.0, self.deals.apply(&self.session, content, options))
            .await
    }

    /// List a directory relative to the root. A missing directory is empty.
    async fn ls_relative(&self, cancel: &CancellationToken, relative: &str) -> Result<Vec<Entry>, BackendError> {
        let path = layout::join(&self.config.backup_root, relative);
        match self.call(cancel, "ls", &path, self.store.ls(&self.session, &path)).await {
            Ok(entries) => Ok(entries),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn dispatch(
        &self,
        cancel: &CancellationToken,
        t: ObjectType,
        dir: &str,
        entries: Vec<Entry>,
        f: &mut ListFn<'_>,
    ) -> Result<(), BackendError> {
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            if entry.is_dir {
                continue;
            }
            let relative = format!("{}/{}", dir, entry.name);
            let Some(handle) = self.layout.parse(t, &relative) else {
                debug!(path = %relative, "Skipping entry that is not an object name");
                continue;
            };
            f(FileInfo {
                name: handle.name,
                size: entry.size,
            })
            .map_err(BackendError::Callback)?;
        }
        Ok(())
    }

    fn spawn_flush(self: &Arc<Self>, batch: SealedBatch) {
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let _ = inner.flush_batch(batch).await;
        });
    }

    async fn flush_batch(&self, batch: SealedBatch) -> BatchOutcome {
        let objects = batch.len();
        let bytes = batch.bytes();
        let outcome = self.submit(batch.writes()).await.map_err(Arc::new);
        match &outcome {
            Ok(job) => info!(objects, bytes, job_id = %job, "Batch stored"),
            Err(e) => warn!(objects, bytes, error = %e, "Batch failed"),
        }
        batch.complete(outcome.clone());
        outcome
    }

    async fn submit(&self, writes: &[PendingWrite]) -> Result<JobId, BackendError> {
        let cancel = &self.flush_token;
        let root = self.config.backup_root.as_str();

        let tree = StagedTree::create(self.config.staging_dir.as_deref())?;
        for write in writes {
            tree.add_file(&write.relative, &write.data)?;
        }
        let staged = self
            .call(cancel, "stage", root, self.store.stage(&self.session, tree.path()))
            .await?;
        drop(tree);

        // Every target is checked before the deal so a conflict fails the
        // batch without submitting anything.
        let plans = try_join_all(writes.iter().map(|w| self.plan_link(cancel, w, &staged))).await?;
        let job = self.apply(cancel, &staged.root).await?;
        try_join_all(plans.iter().flatten().map(|(content, path)| {
            self.call(cancel, "link", path, self.store.link(&self.session, content, path))
        }))
        .await?;
        Ok(job)
    }

    /// Where `write` still has to be linked, or `None` if the same content
    /// is already stored there.
    async fn plan_link(
        &self,
        cancel: &CancellationToken,
        write: &PendingWrite,
        staged: &StagedContent,
    ) -> Result<Option<(ContentId, String)>, BackendError> {
        let content = staged.entries.get(&write.relative).cloned().ok_or_else(|| {
            BackendError::remote(
                "stage",
                &write.relative,
                ApiError::Decode(format!("no content id for {}", write.relative)),
            )
        })?;
        let path = self.path_for(&write.handle);
        match self.call(cancel, "stat", &path, self.store.stat(&self.session, &path)).await {
            Ok(existing) if existing.hash == content => {
                debug!(handle = %write.handle, "Identical object already stored");
                Ok(None)
            }
            Ok(existing) => {
                warn!(
                    handle = %write.handle,
                    stored = %existing.hash,
                    staged = %content,
                    digest = %write.digest_hex(),
                    "Refusing to replace object with different content"
                );
                Err(BackendError::ContentMismatch(write.handle.clone()))
            }
            Err(e) if e.is_not_found() => Ok(Some((content, path))),
            Err(e) => Err(e),
        }
    }
}

/// Reject handles whose name cannot map to a path for their type.
fn check_handle(h: &Handle) -> Result<(), BackendError> {
    if h.is_valid() {
        Ok(())
    } else {
        Err(BackendError::InvalidHandle(h.clone()))
    }
}

/// Seal windows that outlived the batch age limit.
fn spawn_ticker(inner: &Arc<Inner>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let stop = inner.ticker_stop.clone();
    let period = (inner.config.batch.max_age() / 2).max(MIN_TICK);
    inner.tasks.spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    if let Some(batch) = inner.batcher.take_expired(Instant::now()) {
                        debug!(objects = batch.len(), "Batch window expired");
                        inner.spawn_flush(batch);
                    }
                }
            }
        }
    });
}

#[async_trait]
impl Backend for DealBackend {
    fn location(&self) -> String {
        self.inner.location.clone()
    }

    fn is_not_exist(&self, err: &anyhow::Error) -> bool {
        err.downcast_ref::<BackendError>()
            .is_some_and(BackendError::is_not_found)
    }

    async fn test(&self, cancel: &CancellationToken, h: &Handle) -> anyhow::Result<bool> {
        Ok(DealBackend::test(self, cancel, h).await?)
    }

    async fn save(&self, cancel: &CancellationToken, h: &Handle, data: Bytes) -> anyhow::Result<()> {
        Ok(DealBackend::save(self, cancel, h, data).await?)
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        length: usize,
        offset: u64,
    ) -> anyhow::Result<ObjectReader> {
        Ok(DealBackend::load(self, cancel, h, length, offset).await?)
    }

    async fn stat(&self, cancel: &CancellationToken, h: &Handle) -> anyhow::Result<FileInfo> {
        Ok(DealBackend::stat(self, cancel, h).await?)
    }

    async fn remove(&self, cancel: &CancellationToken, h: &Handle) -> anyhow::Result<()> {
        Ok(DealBackend::remove(self, cancel, h).await?)
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        t: ObjectType,
        f: &mut ListFn<'_>,
    ) -> anyhow::Result<()> {
        Ok(DealBackend::list(self, cancel, t, f).await?)
    }

    async fn delete(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(DealBackend::delete(self, cancel).await?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(DealBackend::close(self).await?)
    }
}
