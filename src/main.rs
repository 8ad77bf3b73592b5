use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{
        HeaderMap, HeaderValue, StatusCode, Uri,
        header::{
            CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE,
            X_CONTENT_TYPE_OPTIONS,
        },
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    process::Command,
    time::{Duration, interval},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const ARTIFACT_EXT: &str = "mp4";
const ARTIFACT_MEDIA_TYPE: &str = "video/mp4";
const DEFAULT_ARTIFACT_RETENTION_SECONDS: u64 = 20 * 60;
const GC_SWEEP_INTERVAL_SECONDS: u64 = 5 * 60;

const METADATA_FIELDS: [&str; 8] = [
    "title",
    "description",
    "uploader",
    "duration",
    "view_count",
    "like_count",
    "comment_count",
    "upload_date",
];

#[derive(Clone)]
struct AppState {
    store: DownloadStore,
    extractor: Arc<dyn MediaExtractor>,
    static_dir: PathBuf,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    #[serde(default = "default_save_metadata")]
    save_metadata: bool,
}

fn default_save_metadata() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    download_url: String,
    filename: String,
    file_exists: bool,
    file_size: u64,
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct BatchItemResult {
    url: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchDownloadResponse {
    success: bool,
    download_urls: Vec<String>,
    results: Vec<BatchItemResult>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    message: &'static str,
    started_at: DateTime<Utc>,
    downloads_dir: String,
    downloads_dir_exists: bool,
    downloads_dir_writable: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn download_failed(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: format!("Download failed: {message}"),
        }
    }

    fn server_error(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: format!("Server error: {message}"),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

#[derive(Debug)]
struct ExtractError {
    message: String,
}

impl ExtractError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExtractError {}

#[async_trait]
trait MediaExtractor: Send + Sync {
    async fn extract(&self, url: &str, output_path: &Path) -> Result<Value, ExtractError>;
}

struct YtDlp;

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn extract(&self, url: &str, output_path: &Path) -> Result<Value, ExtractError> {
        let output = Command::new("yt-dlp")
            .arg("-f")
            .arg("best")
            .arg("-o")
            .arg(output_path)
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--print-json")
            .arg(url)
            .output()
            .await
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ExtractError::new(
                        "yt-dlp is not installed on this system. Install yt-dlp and restart the backend.",
                    )
                } else {
                    ExtractError::new(format!("could not run yt-dlp: {error}"))
                }
            })?;

        if !output.status.success() {
            return Err(ExtractError::new(extractor_error_message(&output.stderr)));
        }

        Ok(parse_info_json(&output.stdout))
    }
}

fn extractor_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp did not complete the operation")
        .to_string()
}

fn parse_info_json(stdout: &[u8]) -> Value {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .and_then(|line| serde_json::from_str(line).ok())
        .unwrap_or(Value::Null)
}

#[derive(Clone)]
struct DownloadStore {
    root: PathBuf,
}

impl DownloadStore {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn artifact_path(&self, id: Uuid) -> PathBuf {
        self.entry_dir(id).join(format!("{id}.{ARTIFACT_EXT}"))
    }

    fn metadata_path(&self, id: Uuid) -> PathBuf {
        self.entry_dir(id).join(format!("{id}_metadata.json"))
    }

    async fn create_entry(&self, id: Uuid) -> std::io::Result<PathBuf> {
        let dir = self.entry_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn remove_entry(&self, id: Uuid) {
        let dir = self.entry_dir(id);
        if let Err(error) = tokio::fs::remove_dir_all(&dir).await
            && error.kind() != ErrorKind::NotFound
        {
            info!("could not clean up download entry {:?}: {error}", dir);
        }
    }

    async fn sweep_older_than(&self, max_age: Duration) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("could not open downloads directory for sweep: {error}");
                }
                return;
            }
        };

        let now = std::time::SystemTime::now();

        loop {
            let maybe_entry = match entries.next_entry().await {
                Ok(value) => value,
                Err(error) => {
                    warn!("could not iterate downloads directory for sweep: {error}");
                    break;
                }
            };

            let Some(entry) = maybe_entry else {
                break;
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("could not read metadata of {:?}: {error}", path);
                    continue;
                }
            };

            let modified_at = match metadata.modified() {
                Ok(value) => value,
                Err(error) => {
                    warn!("could not read modification time of {:?}: {error}", path);
                    continue;
                }
            };

            let age = match now.duration_since(modified_at) {
                Ok(value) => value,
                Err(_) => Duration::from_secs(0),
            };

            if age < max_age {
                continue;
            }

            debug!("sweeping expired download entry {:?}", path);
            if metadata.is_dir() {
                if let Err(error) = tokio::fs::remove_dir_all(&path).await
                    && error.kind() != ErrorKind::NotFound
                {
                    warn!("could not remove expired entry {:?}: {error}", path);
                }
            } else if let Err(error) = tokio::fs::remove_file(&path).await
                && error.kind() != ErrorKind::NotFound
            {
                warn!("could not remove stray file {:?}: {error}", path);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vidgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("{}", error.detail);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let static_dir = root.join("static");
    let downloads_dir = std::env::var("DOWNLOADS_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| root.join("downloads"));

    tokio::fs::create_dir_all(&static_dir)
        .await
        .map_err(|error| {
            ApiError::server_error(format!("could not create static directory: {error}"))
        })?;
    tokio::fs::create_dir_all(&downloads_dir)
        .await
        .map_err(|error| {
            ApiError::server_error(format!("could not create downloads directory: {error}"))
        })?;

    let retention_seconds = read_usize_env("ARTIFACT_RETENTION_SECONDS")
        .filter(|value| *value > 0)
        .map(|value| value as u64)
        .unwrap_or(DEFAULT_ARTIFACT_RETENTION_SECONDS);

    let store = DownloadStore::new(downloads_dir);
    let state = AppState {
        store: store.clone(),
        extractor: Arc::new(YtDlp),
        static_dir,
        started_at: Utc::now(),
    };

    store
        .sweep_older_than(Duration::from_secs(retention_seconds))
        .await;
    spawn_gc_task(store, retention_seconds);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(landing_page))
        .route("/api/status", get(status))
        .route("/api/download", post(download))
        .route("/api/batch-download", post(batch_download))
        .route("/api/file/{id}/{filename}", get(get_file))
        .fallback(not_found_fallback)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::server_error(format!("could not bind {addr}: {error}")))?;

    info!("vidgrab backend listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::server_error(format!("HTTP server error: {error}")))
}

fn spawn_gc_task(store: DownloadStore, retention_seconds: u64) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(GC_SWEEP_INTERVAL_SECONDS));
        // first tick fires immediately; startup already swept
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store
                .sweep_older_than(Duration::from_secs(retention_seconds))
                .await;
        }
    });
}

async fn download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let response = download_one(&state, payload.url.trim(), payload.save_metadata).await?;
    Ok(Json(response))
}

async fn batch_download(
    State(state): State<AppState>,
    Json(urls): Json<Vec<String>>,
) -> Json<BatchDownloadResponse> {
    let mut download_urls = Vec::new();
    let mut results = Vec::with_capacity(urls.len());

    for url in urls {
        match download_one(&state, url.trim(), true).await {
            Ok(response) => {
                download_urls.push(response.download_url.clone());
                results.push(BatchItemResult {
                    url,
                    success: true,
                    download_url: Some(response.download_url),
                    error: None,
                });
            }
            Err(error) => {
                warn!(url = %url, "batch entry failed: {}", error.detail);
                results.push(BatchItemResult {
                    url,
                    success: false,
                    download_url: None,
                    error: Some(error.detail),
                });
            }
        }
    }

    Json(BatchDownloadResponse {
        success: true,
        download_urls,
        results,
    })
}

async fn download_one(
    state: &AppState,
    url: &str,
    save_metadata: bool,
) -> Result<DownloadResponse, ApiError> {
    let id = Uuid::new_v4();
    state.store.create_entry(id).await.map_err(|error| {
        ApiError::server_error(format!("could not prepare download entry: {error}"))
    })?;

    info!(%id, url = %url, "starting download");

    let result = run_download(state, id, url, save_metadata).await;
    if result.is_err() {
        state.store.remove_entry(id).await;
    }

    result
}

async fn run_download(
    state: &AppState,
    id: Uuid,
    url: &str,
    save_metadata: bool,
) -> Result<DownloadResponse, ApiError> {
    let artifact_path = state.store.artifact_path(id);

    let info = state
        .extractor
        .extract(url, &artifact_path)
        .await
        .map_err(ApiError::download_failed)?;

    let file_size = match tokio::fs::metadata(&artifact_path).await {
        Ok(metadata) => metadata.len(),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::download_failed("file not created"));
        }
        Err(error) => {
            return Err(ApiError::server_error(format!(
                "could not read downloaded file: {error}"
            )));
        }
    };

    let title = info.get("title").and_then(Value::as_str);
    let filename = build_display_filename(title, id);

    if save_metadata && !info.is_null() {
        let payload = serde_json::to_string_pretty(&metadata_record(&info)).map_err(|error| {
            ApiError::server_error(format!("could not serialize metadata: {error}"))
        })?;
        tokio::fs::write(state.store.metadata_path(id), payload)
            .await
            .map_err(|error| {
                ApiError::server_error(format!("could not save metadata: {error}"))
            })?;
    }

    let download_url = format!("/api/file/{id}/{}", urlencoding::encode(&filename));

    info!(%id, file_size, "download complete");

    Ok(DownloadResponse {
        success: true,
        download_url,
        filename,
        file_exists: true,
        file_size,
        metadata: save_metadata.then(|| info),
    })
}

fn metadata_record(info: &Value) -> Value {
    let mut record = serde_json::Map::with_capacity(METADATA_FIELDS.len());
    for field in METADATA_FIELDS {
        let value = info
            .get(field)
            .filter(|value| !value.is_null())
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
        record.insert(field.to_string(), value);
    }
    Value::Object(record)
}

fn build_display_filename(title: Option<&str>, id: Uuid) -> String {
    let base = title
        .map(sanitize_display_name)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| id.to_string());
    format!("{base}.{ARTIFACT_EXT}")
}

fn sanitize_display_name(value: &str) -> String {
    value
        .chars()
        .filter(|&character| {
            character.is_alphanumeric() || matches!(character, ' ' | '-' | '_')
        })
        .collect::<String>()
        .trim_end()
        .to_string()
}

async fn get_file(
    State(state): State<AppState>,
    AxumPath((id, filename)): AxumPath<(String, String)>,
) -> Result<Response, ApiError> {
    // non-UUID keys cannot name a store entry, which also keeps the lookup
    // free of path traversal
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::not_found("File not found"))?;
    let artifact_path = state.store.artifact_path(id);

    let metadata = match tokio::fs::metadata(&artifact_path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(ApiError::not_found("File not found")),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::server_error(format!(
                "could not read stored file: {error}"
            )));
        }
    };

    let file = tokio::fs::File::open(&artifact_path)
        .await
        .map_err(|error| ApiError::server_error(format!("could not open stored file: {error}")))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(ARTIFACT_MEDIA_TYPE));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::server_error("could not build content length header"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::server_error("could not build content disposition header"))?,
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));

    Ok((headers, body).into_response())
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let downloads_dir = state.store.root().to_path_buf();
    let downloads_dir_exists = tokio::fs::metadata(&downloads_dir)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false);
    let downloads_dir_writable = downloads_dir_exists && probe_writable(&downloads_dir).await;

    Json(StatusResponse {
        status: "ok",
        message: "vidgrab API is running",
        started_at: state.started_at,
        downloads_dir: downloads_dir.to_string_lossy().into_owned(),
        downloads_dir_exists,
        downloads_dir_writable,
    })
}

async fn probe_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".probe-{}", Uuid::new_v4().simple()));
    match tokio::fs::write(&probe, b"").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            true
        }
        Err(_) => false,
    }
}

async fn landing_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let index_path = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&index_path).await {
        Ok(contents) => Ok(Html(contents)),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            Err(ApiError::not_found("Landing page not found"))
        }
        Err(error) => Err(ApiError::server_error(format!(
            "could not read landing page: {error}"
        ))),
    }
}

async fn not_found_fallback(uri: Uri) -> ApiError {
    ApiError::not_found(format!("Path {} not found", uri.path()))
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        format!("download.{ARTIFACT_EXT}")
    } else {
        compact.to_string()
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
