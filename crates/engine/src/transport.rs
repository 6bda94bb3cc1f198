//! Run a [`VectorDb`] on its own thread and talk to it by message passing.
//!
//! [`DbWorker::spawn`] starts an OS thread with a current-thread tokio
//! runtime that owns the database. The returned [`DbProxy`] assigns each
//! request a correlation id from a monotonically increasing counter and keeps
//! a pending table of completion handles, resolved by a dispatcher task as
//! responses come back. Batch progress is delivered out of band on a
//! per-request channel. Cancelling a request sends an explicit `Cancel{id}`
//! message; the worker cancels that request's token.

use crate::config::{CollectionOptions, DbConfig};
use crate::db::{
    Collection, CollectionStats, DbStats, DocumentUpdate, HybridQuery, HybridResult,
    SearchOptions, SearchResult, VectorDb,
};
use crate::error::{DbError, DbResult, SyncError};
use crate::storage::CollectionRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vecstore_core::{Document, FilterClause};

#[derive(Debug, Clone)]
pub enum RequestKind {
    CreateCollection { name: String, options: CollectionOptions },
    DeleteCollection { name: String },
    ListCollections,
    Add { document: Document },
    AddMany { documents: Vec<Document> },
    Get { id: String },
    Update { id: String, update: DocumentUpdate },
    Delete { id: String },
    DeleteMany { ids: Vec<String> },
    DeleteWhere { filter: FilterClause },
    Search { vector: Vec<f32>, options: SearchOptions },
    KeywordSearch { query: String, k: usize, filter: Option<FilterClause> },
    HybridSearch { query: HybridQuery },
    CollectionStats,
    ClearCollection,
    Export,
    Import { bytes: Vec<u8>, name: Option<String> },
    PersistIndex,
    RebuildIndex,
    Stats,
    Clear,
    /// Close the database and stop the worker.
    Close,
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::CreateCollection { .. } => "create_collection",
            RequestKind::DeleteCollection { .. } => "delete_collection",
            RequestKind::ListCollections => "list_collections",
            RequestKind::Add { .. } => "add",
            RequestKind::AddMany { .. } => "add_many",
            RequestKind::Get { .. } => "get",
            RequestKind::Update { .. } => "update",
            RequestKind::Delete { .. } => "delete",
            RequestKind::DeleteMany { .. } => "delete_many",
            RequestKind::DeleteWhere { .. } => "delete_where",
            RequestKind::Search { .. } => "search",
            RequestKind::KeywordSearch { .. } => "keyword_search",
            RequestKind::HybridSearch { .. } => "hybrid_search",
            RequestKind::CollectionStats => "collection_stats",
            RequestKind::ClearCollection => "clear_collection",
            RequestKind::Export => "export",
            RequestKind::Import { .. } => "import",
            RequestKind::PersistIndex => "persist_index",
            RequestKind::RebuildIndex => "rebuild_index",
            RequestKind::Stats => "stats",
            RequestKind::Clear => "clear",
            RequestKind::Close => "close",
        }
    }
}

/// A request addressed to `collection`, or to the default collection when `None`.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub kind: RequestKind,
    pub collection: Option<String>,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Request(Request),
    Cancel { id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Unit,
    Bool(bool),
    Count(usize),
    Document(Option<Document>),
    Updated(Document),
    Collection(CollectionRecord),
    Collections(Vec<CollectionRecord>),
    Results(Vec<SearchResult>),
    Hybrid(Vec<HybridResult>),
    CollectionStats(CollectionStats),
    Stats(DbStats),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
pub enum WorkerEvent {
    Response {
        id: u64,
        result: Result<ResponsePayload, SyncError>,
    },
    Progress {
        id: u64,
        completed: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

fn remote(err: &DbError) -> SyncError {
    SyncError::Remote {
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}

/// Handle to the worker thread.
#[derive(Debug)]
pub struct DbWorker {
    thread: Option<JoinHandle<()>>,
}

impl DbWorker {
    /// Start the worker, open the database on it and return a proxy once it is ready.
    pub async fn spawn(config: DbConfig) -> Result<(DbWorker, DbProxy), SyncError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("vecstore-worker".into())
            .spawn(move || run_worker(config, request_rx, event_tx, ready_tx))
            .map_err(|e| SyncError::Startup(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SyncError::Startup(
                    "worker exited during startup".to_string(),
                ))
            }
        }

        let pending: Arc<Mutex<HashMap<u64, PendingRequest>>> = Arc::default();
        tokio::spawn(dispatch(event_rx, pending.clone()));
        let proxy = DbProxy {
            inner: Arc::new(ProxyInner {
                next_id: AtomicU64::new(1),
                requests: request_tx,
                pending,
            }),
        };
        Ok((
            DbWorker {
                thread: Some(thread),
            },
            proxy,
        ))
    }

    /// Wait for the worker thread to exit. It exits after a `Close` request
    /// or once every proxy has been dropped.
    pub async fn join(mut self) -> Result<(), SyncError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| SyncError::Startup(e.to_string()))?
            .map_err(|_| SyncError::Startup("worker panicked".to_string()))
    }
}

fn run_worker(
    config: DbConfig,
    requests: mpsc::UnboundedReceiver<WorkerMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    ready: oneshot::Sender<Result<(), SyncError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(SyncError::Startup(e.to_string())));
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let db = match VectorDb::open(config).await {
            Ok(db) => db,
            Err(e) => {
                let _ = ready.send(Err(SyncError::Startup(e.to_string())));
                return;
            }
        };
        if ready.send(Ok(())).is_err() {
            let _ = db.close().await;
            return;
        }
        tracing::info!("database worker started");
        serve(db, requests, events).await;
        tracing::info!("database worker stopped");
    });
}

async fn serve(
    db: VectorDb,
    mut requests: mpsc::UnboundedReceiver<WorkerMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let tokens: Arc<Mutex<HashMap<u64, CancellationToken>>> = Arc::default();

    while let Some(message) = requests.recv().await {
        let request = match message {
            WorkerMessage::Cancel { id } => {
                match tokens.lock().get(&id) {
                    Some(token) => token.cancel(),
                    None => tracing::debug!(id, "cancel for finished request"),
                }
                continue;
            }
            WorkerMessage::Request(request) => request,
        };

        if matches!(request.kind, RequestKind::Close) {
            let result = db.close().await.map(|()| ResponsePayload::Unit);
            let _ = events.send(WorkerEvent::Response {
                id: request.id,
                result: result.map_err(|e| remote(&e)),
            });
            break;
        }

        let id = request.id;
        let token = CancellationToken::new();
        tokens.lock().insert(id, token.clone());
        let db = db.clone();
        let events = events.clone();
        let tokens = tokens.clone();
        tokio::task::spawn_local(async move {
            tracing::debug!(id, kind = request.kind.name(), "request started");
            let result = execute(&db, request, &token, &events).await;
            tokens.lock().remove(&id);
            if let Err(e) = &result {
                tracing::debug!(id, error = %e, "request failed");
            }
            let _ = events.send(WorkerEvent::Response {
                id,
                result: result.map_err(|e| remote(&e)),
            });
        });
    }

    requests.close();
    while let Ok(message) = requests.try_recv() {
        if let WorkerMessage::Request(request) = message {
            let _ = events.send(WorkerEvent::Response {
                id: request.id,
                result: Err(SyncError::Disconnected),
            });
        }
    }
    if !db.is_closed() {
        if let Err(e) = db.close().await {
            tracing::warn!(error = %e, "close on worker shutdown failed");
        }
    }
}

async fn target(db: &VectorDb, name: Option<&str>) -> DbResult<Collection> {
    match name {
        Some(name) => db.collection(name).await,
        None => db.default_collection().await,
    }
}

async fn execute(
    db: &VectorDb,
    request: Request,
    token: &CancellationToken,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> DbResult<ResponsePayload> {
    let Request {
        id,
        kind,
        collection,
    } = request;
    let name = collection.as_deref();

    let payload = match kind {
        RequestKind::CreateCollection { name, options } => {
            let created = db.create_collection(&name, options).await?;
            ResponsePayload::Collection(created.record().clone())
        }
        RequestKind::DeleteCollection { name } => {
            ResponsePayload::Bool(db.delete_collection(&name).await?)
        }
        RequestKind::ListCollections => ResponsePayload::Collections(db.list_collections().await?),
        RequestKind::Add { document } => {
            target(db, name).await?.add(document).await?;
            ResponsePayload::Unit
        }
        RequestKind::AddMany { documents } => {
            let events = events.clone();
            let progress = move |completed: usize, total: usize| {
                let _ = events.send(WorkerEvent::Progress {
                    id,
                    completed,
                    total,
                });
            };
            let written = target(db, name)
                .await?
                .add_many_cancellable(documents, Some(&progress), token)
                .await?;
            ResponsePayload::Count(written)
        }
        RequestKind::Get { id } => ResponsePayload::Document(target(db, name).await?.get(&id).await?),
        RequestKind::Update { id, update } => {
            ResponsePayload::Updated(target(db, name).await?.update(&id, update).await?)
        }
        RequestKind::Delete { id } => ResponsePayload::Bool(target(db, name).await?.delete(&id).await?),
        RequestKind::DeleteMany { ids } => {
            ResponsePayload::Count(
                target(db, name)
                    .await?
                    .delete_many_cancellable(ids, token)
                    .await?,
            )
        }
        RequestKind::DeleteWhere { filter } => {
            ResponsePayload::Count(
                target(db, name)
                    .await?
                    .delete_where_cancellable(&filter, token)
                    .await?,
            )
        }
        RequestKind::Search { vector, options } => {
            ResponsePayload::Results(target(db, name).await?.search(&vector, options).await?)
        }
        RequestKind::KeywordSearch { query, k, filter } => ResponsePayload::Results(
            target(db, name)
                .await?
                .keyword_search(&query, k, filter.as_ref())
                .await?,
        ),
        RequestKind::HybridSearch { query } => {
            ResponsePayload::Hybrid(target(db, name).await?.hybrid_search(query).await?)
        }
        RequestKind::CollectionStats => {
            ResponsePayload::CollectionStats(target(db, name).await?.stats().await?)
        }
        RequestKind::ClearCollection => {
            target(db, name).await?.clear_cancellable(token).await?;
            ResponsePayload::Unit
        }
        RequestKind::Export => ResponsePayload::Bytes(target(db, name).await?.export().await?),
        RequestKind::Import { bytes, name } => {
            let imported = db
                .import_cancellable(&bytes, name.as_deref(), token)
                .await?;
            ResponsePayload::Collection(imported.record().clone())
        }
        RequestKind::PersistIndex => {
            target(db, name).await?.persist_index().await?;
            ResponsePayload::Unit
        }
        RequestKind::RebuildIndex => {
            ResponsePayload::Count(
                target(db, name)
                    .await?
                    .rebuild_index_cancellable(token)
                    .await?,
            )
        }
        RequestKind::Stats => ResponsePayload::Stats(db.stats().await?),
        RequestKind::Clear => {
            db.clear().await?;
            ResponsePayload::Unit
        }
        RequestKind::Close => {
            db.close().await?;
            ResponsePayload::Unit
        }
    };
    Ok(payload)
}

#[derive(Debug)]
struct PendingRequest {
    respond: oneshot::Sender<Result<ResponsePayload, SyncError>>,
    progress: Option<mpsc::UnboundedSender<BatchProgress>>,
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Response { id, result } => match pending.lock().remove(&id) {
                Some(request) => {
                    let _ = request.respond.send(result);
                }
                None => tracing::warn!(id, "response for unknown request"),
            },
            WorkerEvent::Progress {
                id,
                completed,
                total,
            } => {
                if let Some(tx) = pending.lock().get(&id).and_then(|p| p.progress.as_ref()) {
                    let _ = tx.send(BatchProgress { completed, total });
                }
            }
        }
    }
    for (_, request) in pending.lock().drain() {
        let _ = request.respond.send(Err(SyncError::Disconnected));
    }
}

#[derive(Debug)]
struct ProxyInner {
    next_id: AtomicU64,
    requests: mpsc::UnboundedSender<WorkerMessage>,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
}

/// An in-flight request.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    response: oneshot::Receiver<Result<ResponsePayload, SyncError>>,
    progress: Option<mpsc::UnboundedReceiver<BatchProgress>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Progress updates, for requests submitted with progress enabled.
    pub fn take_progress(&mut self) -> Option<mpsc::UnboundedReceiver<BatchProgress>> {
        self.progress.take()
    }

    pub async fn wait(self) -> Result<ResponsePayload, SyncError> {
        self.response.await.unwrap_or(Err(SyncError::Disconnected))
    }
}

/// Caller-side handle to a [`DbWorker`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DbProxy {
    inner: Arc<ProxyInner>,
}

impl DbProxy {
    /// Send a request without waiting for it.
    pub fn submit(
        &self,
        kind: RequestKind,
        collection: Option<&str>,
        with_progress: bool,
    ) -> Result<PendingCall, SyncError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (respond, response) = oneshot::channel();
        let (progress_tx, progress_rx) = if with_progress {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.inner.pending.lock().insert(
            id,
            PendingRequest {
                respond,
                progress: progress_tx,
            },
        );
        let request = Request {
            id,
            kind,
            collection: collection.map(str::to_string),
        };
        if self
            .inner
            .requests
            .send(WorkerMessage::Request(request))
            .is_err()
        {
            self.inner.pending.lock().remove(&id);
            return Err(SyncError::Disconnected);
        }
        Ok(PendingCall {
            id,
            response,
            progress: progress_rx,
        })
    }

    /// Send a request and wait for its response.
    pub async fn call(
        &self,
        kind: RequestKind,
        collection: Option<&str>,
    ) -> Result<ResponsePayload, SyncError> {
        self.submit(kind, collection, false)?.wait().await
    }

    /// Ask the worker to cancel request `id`. Requests that already finished
    /// are unaffected.
    pub fn cancel(&self, id: u64) -> Result<(), SyncError> {
        self.inner
            .requests
            .send(WorkerMessage::Cancel { id })
            .map_err(|_| SyncError::Disconnected)
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub async fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<CollectionRecord, SyncError> {
        let kind = RequestKind::CreateCollection {
            name: name.to_string(),
            options,
        };
        let call = self.submit(kind, None, false)?;
        let request = call.id();
        match call.wait().await? {
            ResponsePayload::Collection(record) => Ok(record),
            _ => Err(SyncError::UnexpectedResponse(request)),
        }
    }

    pub async fn add(&self, collection: Option<&str>, document: Document) -> Result<(), SyncError> {
        self.call(RequestKind::Add { document }, collection).await?;
        Ok(())
    }

    /// Start a batch insert. Progress is available from the returned call.
    pub fn add_many(
        &self,
        collection: Option<&str>,
        documents: Vec<Document>,
    ) -> Result<PendingCall, SyncError> {
        self.submit(RequestKind::AddMany { documents }, collection, true)
    }

    pub async fn get(&self, collection: Option<&str>, id: &str) -> Result<Option<Document>, SyncError> {
        let call = self.submit(RequestKind::Get { id: id.to_string() }, collection, false)?;
        let request = call.id();
        match call.wait().await? {
            ResponsePayload::Document(doc) => Ok(doc),
            _ => Err(SyncError::UnexpectedResponse(request)),
        }
    }

    pub async fn delete(&self, collection: Option<&str>, id: &str) -> Result<bool, SyncError> {
        let call = self.submit(RequestKind::Delete { id: id.to_string() }, collection, false)?;
        let request = call.id();
        match call.wait().await? {
            ResponsePayload::Bool(deleted) => Ok(deleted),
            _ => Err(SyncError::UnexpectedResponse(request)),
        }
    }

    pub async fn search(
        &self,
        collection: Option<&str>,
        vector: Vec<f32>,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>, SyncError> {
        let call = self.submit(RequestKind::Search { vector, options }, collection, false)?;
        let request = call.id();
        match call.wait().await? {
            ResponsePayload::Results(results) => Ok(results),
            _ => Err(SyncError::UnexpectedResponse(request)),
        }
    }

    pub async fn stats(&self) -> Result<DbStats, SyncError> {
        let call = self.submit(RequestKind::Stats, None, false)?;
        let request = call.id();
        match call.wait().await? {
            ResponsePayload::Stats(stats) => Ok(stats),
            _ => Err(SyncError::UnexpectedResponse(request)),
        }
    }

    /// Close the database. The worker exits afterwards.
    pub async fn close(&self) -> Result<(), SyncError> {
        self.call(RequestKind::Close, None).await?;
        Ok(())
    }
}
