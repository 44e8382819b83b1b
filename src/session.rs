//! Session facade and transports.
//!
//! [`SessionFacade`] is the only way application code creates tasks. Every
//! creation method funnels through one intercept-then-delegate path; the
//! transport only ever sees requests the interceptor has already handled.
//! Resuming a download is the one exception: it carries no request to attest.

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::{StatusCode, Url};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::attestation::{AttestationClient, HttpAttestationClient};
use crate::audit;
use crate::config::AttestConfig;
use crate::error::{Error, Result, TransportError};
use crate::interceptor::RequestInterceptor;
use crate::pinning::PinningValidator;
use crate::request::RequestDescriptor;
use crate::store::TokenStore;
use crate::tls::{self, PinnedCertVerifier};
use crate::token::{Clock, SystemClock};

/// What a task does with its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Data,
    Download,
    UploadFromFile(PathBuf),
    UploadFromData(Bytes),
    /// Upload the request body as a chunked stream.
    StreamedUpload,
    WebSocket,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Data => "data",
            TaskKind::Download => "download",
            TaskKind::UploadFromFile(_) => "upload_file",
            TaskKind::UploadFromData(_) => "upload_data",
            TaskKind::StreamedUpload => "streamed_upload",
            TaskKind::WebSocket => "websocket",
        }
    }
}

/// The underlying HTTP machinery a [`SessionFacade`] delegates to.
///
/// Completion handlers are opaque to the facade and handed over untouched.
pub trait Transport: Send + Sync {
    type Task: Send;
    type Completion: Send;

    fn create_task(
        &self,
        kind: TaskKind,
        request: RequestDescriptor,
        completion: Option<Self::Completion>,
    ) -> std::result::Result<Self::Task, TransportError>;

    fn resume_download(
        &self,
        resume_data: Bytes,
        completion: Option<Self::Completion>,
    ) -> std::result::Result<Self::Task, TransportError>;

    /// Let running tasks finish, then refuse new ones.
    fn finish_tasks_and_invalidate(&self);

    /// Cancel running tasks and refuse new ones.
    fn invalidate_and_cancel(&self);

    fn flush(&self);

    fn reset(&self);

    fn all_tasks(&self) -> Vec<Self::Task>;
}

/// Routes every task through the [`RequestInterceptor`] before the transport.
pub struct SessionFacade<T: Transport> {
    interceptor: Arc<RequestInterceptor>,
    transport: T,
}

impl<T: Transport> fmt::Debug for SessionFacade<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFacade")
            .field("interceptor", &self.interceptor)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> SessionFacade<T> {
    pub fn new(interceptor: Arc<RequestInterceptor>, transport: T) -> Self {
        Self {
            interceptor,
            transport,
        }
    }

    pub fn interceptor(&self) -> &Arc<RequestInterceptor> {
        &self.interceptor
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn store(&self) -> &TokenStore {
        self.interceptor.store()
    }

    pub fn pinning(&self) -> &Arc<PinningValidator> {
        self.interceptor.pinning()
    }

    pub fn bind_header(&self) -> Option<HeaderName> {
        self.interceptor.bind_header().get()
    }

    pub fn set_bind_header(&self, name: Option<&str>) -> Result<()> {
        self.interceptor.bind_header().set(name)
    }

    /// Start fetching a token ahead of the first request.
    pub fn prefetch(&self) -> bool {
        self.interceptor.prefetch()
    }

    async fn create(
        &self,
        kind: TaskKind,
        request: RequestDescriptor,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        let intercepted = self.interceptor.intercept(request).await?;
        debug!(kind = kind.name(), status = %intercepted.status(), "creating task");
        Ok(self
            .transport
            .create_task(kind, intercepted.into_request(), completion)?)
    }

    pub async fn data_task(
        &self,
        request: RequestDescriptor,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.create(TaskKind::Data, request, completion).await
    }

    pub async fn data_task_with_url(
        &self,
        url: &str,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.data_task(RequestDescriptor::get(url)?, completion).await
    }

    pub async fn download_task(
        &self,
        request: RequestDescriptor,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.create(TaskKind::Download, request, completion).await
    }

    pub async fn download_task_with_url(
        &self,
        url: &str,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.download_task(RequestDescriptor::get(url)?, completion)
            .await
    }

    /// Resume an interrupted download.
    ///
    /// Not attested: the resume blob replays the original request as the
    /// transport recorded it, so there is nothing to attach a token to.
    pub fn download_task_with_resume_data(
        &self,
        resume_data: Bytes,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        audit::log_unprotected("download_resume");
        Ok(self.transport.resume_download(resume_data, completion)?)
    }

    pub async fn upload_task_from_file(
        &self,
        request: RequestDescriptor,
        path: impl Into<PathBuf>,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.create(TaskKind::UploadFromFile(path.into()), request, completion)
            .await
    }

    pub async fn upload_task_from_data(
        &self,
        request: RequestDescriptor,
        data: impl Into<Bytes>,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.create(TaskKind::UploadFromData(data.into()), request, completion)
            .await
    }

    pub async fn streamed_upload_task(
        &self,
        request: RequestDescriptor,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.create(TaskKind::StreamedUpload, request, completion)
            .await
    }

    pub async fn websocket_task(
        &self,
        request: RequestDescriptor,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.create(TaskKind::WebSocket, request, completion).await
    }

    pub async fn websocket_task_with_url(
        &self,
        url: &str,
        completion: Option<T::Completion>,
    ) -> Result<T::Task> {
        self.websocket_task(RequestDescriptor::get(url)?, completion)
            .await
    }

    pub fn finish_tasks_and_invalidate(&self) {
        self.transport.finish_tasks_and_invalidate()
    }

    pub fn invalidate_and_cancel(&self) {
        self.transport.invalidate_and_cancel()
    }

    pub fn flush(&self) {
        self.transport.flush()
    }

    pub fn reset(&self) {
        self.transport.reset()
    }

    pub fn all_tasks(&self) -> Vec<T::Task> {
        self.transport.all_tasks()
    }
}

/// Where a finished task's response body ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskBody {
    Bytes(Bytes),
    /// Download tasks write the body to a file.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct TaskResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: TaskBody,
}

pub type TaskResult = std::result::Result<TaskResponse, TransportError>;

/// Completion handler for [`ReqwestTransport`] tasks. Cancelled tasks never
/// call it.
pub type Completion = Box<dyn FnOnce(TaskResult) + Send + 'static>;

/// A running or finished [`ReqwestTransport`] task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    kind: &'static str,
    url: Url,
    abort: Arc<AbortHandle>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn cancel(&self) {
        self.abort.abort()
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

const UPLOAD_CHUNK: usize = 16 * 1024;

/// Transport running each task on the tokio runtime with a reqwest client.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    download_dir: PathBuf,
    tasks: Mutex<Vec<TaskHandle>>,
    invalidated: AtomicBool,
    next_id: AtomicU64,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
            tasks: Mutex::new(Vec::new()),
            invalidated: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    fn cancel_all(&self) {
        for task in self.tasks.lock().drain(..) {
            task.cancel();
        }
    }
}

impl Transport for ReqwestTransport {
    type Task = TaskHandle;
    type Completion = Completion;

    fn create_task(
        &self,
        kind: TaskKind,
        request: RequestDescriptor,
        completion: Option<Completion>,
    ) -> std::result::Result<TaskHandle, TransportError> {
        if self.is_invalidated() {
            return Err(TransportError::Invalidated);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::Aborted("no tokio runtime".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = kind.name();
        let url = request.url.clone();
        let client = self.client.clone();
        let download_dir = self.download_dir.clone();

        let join = runtime.spawn(async move {
            let result = run_task(&client, kind, request, &download_dir).await;
            if let Err(ref e) = result {
                debug!(id, kind = name, error = %e, "task failed");
            }
            if let Some(completion) = completion {
                completion(result);
            }
        });

        let handle = TaskHandle {
            id,
            kind: name,
            url,
            abort: Arc::new(join.abort_handle()),
        };
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.clone());
        Ok(handle)
    }

    fn resume_download(
        &self,
        _resume_data: Bytes,
        _completion: Option<Completion>,
    ) -> std::result::Result<TaskHandle, TransportError> {
        Err(TransportError::Unsupported("download resume"))
    }

    fn finish_tasks_and_invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    fn invalidate_and_cancel(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.cancel_all();
    }

    fn flush(&self) {
        self.tasks.lock().retain(|t| !t.is_finished());
    }

    fn reset(&self) {
        self.cancel_all();
    }

    fn all_tasks(&self) -> Vec<TaskHandle> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.clone()
    }
}

async fn run_task(
    client: &reqwest::Client,
    kind: TaskKind,
    request: RequestDescriptor,
    download_dir: &Path,
) -> TaskResult {
    let mut builder = request.to_reqwest(client);
    match &kind {
        TaskKind::Data | TaskKind::Download => {}
        TaskKind::UploadFromFile(path) => {
            let file = tokio::fs::File::open(path).await?;
            builder = builder.body(reqwest::Body::from(file));
        }
        TaskKind::UploadFromData(data) => builder = builder.body(data.clone()),
        TaskKind::StreamedUpload => {
            builder = builder.body(chunked(request.body.clone().unwrap_or_default()));
        }
        TaskKind::WebSocket => return Err(TransportError::Unsupported("websocket")),
    }

    let response = builder.send().await.map_err(classify_send_error)?;
    let status = response.status();
    let headers = response.headers().clone();

    let body = match kind {
        TaskKind::Download => {
            let path = download_dir.join(format!("{}.download", uuid::Uuid::new_v4()));
            if let Err(e) = save_download(response, &path).await {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
            TaskBody::File(path)
        }
        _ => TaskBody::Bytes(response.bytes().await?),
    };

    Ok(TaskResponse {
        status,
        headers,
        body,
    })
}

async fn save_download(
    response: reqwest::Response,
    path: &Path,
) -> std::result::Result<(), TransportError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Pin rejections are reported as such, not as generic HTTP failures.
fn classify_send_error(e: reqwest::Error) -> TransportError {
    match tls::find_pinning_rejection(&e) {
        Some(rejected) => TransportError::Pinning(rejected),
        None => TransportError::Http(e),
    }
}

fn chunked(body: Bytes) -> reqwest::Body {
    let chunks: Vec<std::io::Result<Bytes>> = (0..body.len())
        .step_by(UPLOAD_CHUNK)
        .map(|start| Ok(body.slice(start..(start + UPLOAD_CHUNK).min(body.len()))))
        .collect();
    reqwest::Body::wrap_stream(futures::stream::iter(chunks))
}

/// A session over reqwest with attestation and pinning wired in.
pub type AttestedSession = SessionFacade<ReqwestTransport>;

impl SessionFacade<ReqwestTransport> {
    pub fn builder(config: AttestConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }
}

/// Assembles the token store, pin validator, interceptor and transport.
pub struct SessionBuilder {
    config: AttestConfig,
    client: Option<Arc<dyn AttestationClient>>,
    clock: Option<Arc<dyn Clock>>,
    roots: Option<rustls::RootCertStore>,
    download_dir: Option<PathBuf>,
}

impl SessionBuilder {
    pub fn new(config: AttestConfig) -> Self {
        Self {
            config,
            client: None,
            clock: None,
            roots: None,
            download_dir: None,
        }
    }

    /// Use `client` instead of the HTTP client built from `attestation_url`.
    pub fn attestation_client(mut self, client: Arc<dyn AttestationClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Trust `roots` instead of the bundled web PKI roots.
    pub fn root_certificates(mut self, roots: rustls::RootCertStore) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Directory download tasks write into (default: the system temp dir).
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<AttestedSession> {
        self.config.validate()?;

        let client: Arc<dyn AttestationClient> = match self.client {
            Some(client) => client,
            None => {
                let url = self.config.attestation_url.as_deref().ok_or_else(|| {
                    Error::Config("attestation_url is required without a custom client".into())
                })?;
                Arc::new(HttpAttestationClient::new(url)?)
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = TokenStore::with_clock(client, &self.config, clock);

        let pinning = Arc::new(PinningValidator::new(
            self.config.pin_set.clone(),
            self.config.default_host_policy,
        ));
        let verifier = match self.roots {
            Some(roots) => PinnedCertVerifier::with_roots(Arc::clone(&pinning), roots)?,
            None => PinnedCertVerifier::new(Arc::clone(&pinning))?,
        };
        let http = tls::create_pinned_client(Arc::new(verifier))?;

        let interceptor = RequestInterceptor::new(&self.config, store, pinning)?;
        let transport = ReqwestTransport::new(
            http,
            self.download_dir.unwrap_or_else(std::env::temp_dir),
        );

        tracing::info!(
            pinned_hosts = self.config.pin_set.len(),
            fail_policy = ?self.config.fail_policy,
            "attested session ready"
        );
        Ok(SessionFacade::new(Arc::new(interceptor), transport))
    }
}
