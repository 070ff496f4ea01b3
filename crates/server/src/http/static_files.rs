//! Static file serving for the HTTPS listener
//!
//! Files live under `<web-root>/<domain>/<path>`. The domain comes from the
//! `Host` header and must be whitelisted; requests without one are served
//! from the `nodomain` directory.
//!
//! Files up to `max-cacheable-file-size` are loaded into memory before the
//! worker is jailed. With `serve-files-not-in-cache` the disk is consulted on
//! every request: changed files refresh the cache, larger files are read per
//! request, and when the disk is unreachable the cached copy is served.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use http::{header, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use mime_guess::from_path;
use regex::Regex;
use tokio::fs;
use tracing::{debug, error, info, trace, warn};
use warden_config::{Config, FilesConfig, HeadersConfig};

use super::{request_host, status_response, strip_port, Body};
use crate::domain::DomainWhitelist;

/// Directory used for requests without a `Host` header
pub const NO_DOMAIN: &str = "nodomain";

/// Accepted request paths: plain segments ending in a file extension
const PATH_PATTERN: &str = r"^(/[a-zA-Z0-9_-]+)+(\.[a-zA-Z0-9]+)+$";

/// Cached file entry
#[derive(Debug, Clone)]
struct CachedFile {
    content: Bytes,
    modified: SystemTime,
    etag: String,
}

impl CachedFile {
    fn new(content: Bytes, modified: SystemTime) -> Self {
        let etag = generate_etag(content.len() as u64, modified);
        Self {
            content,
            modified,
            etag,
        }
    }
}

/// Static file handler shared by all HTTPS connections.
pub struct StaticFiles {
    whitelist: Arc<DomainWhitelist>,
    /// Directory holding the per-domain folders; rebased after the jail
    root: ArcSwap<PathBuf>,
    /// `<domain>/<path>` -> file
    cache: DashMap<String, CachedFile>,
    headers: Vec<(HeaderName, HeaderValue)>,
    path_pattern: Regex,
    max_cacheable_file_size: u64,
    serve_files_not_in_cache: bool,
}

impl StaticFiles {
    pub fn new(
        files: &FilesConfig,
        headers: &HeadersConfig,
        whitelist: Arc<DomainWhitelist>,
    ) -> Result<Self, regex::Error> {
        let headers = headers
            .enabled()
            .into_iter()
            .filter_map(|(name, value)| match HeaderValue::from_str(value) {
                Ok(value) => Some((HeaderName::from_static(name), value)),
                Err(_) => {
                    warn!(header = name, "Ignoring header with invalid value");
                    None
                }
            })
            .collect();

        Ok(Self {
            whitelist,
            root: ArcSwap::from_pointee(files.web_root.clone()),
            cache: DashMap::new(),
            headers,
            path_pattern: Regex::new(PATH_PATTERN)?,
            max_cacheable_file_size: files.max_cacheable_file_size,
            serve_files_not_in_cache: files.serve_files_not_in_cache,
        })
    }

    pub fn from_config(config: &Config, whitelist: Arc<DomainWhitelist>) -> Result<Self, regex::Error> {
        Self::new(&config.files, &config.headers, whitelist)
    }

    /// Current root directory for disk lookups
    pub fn root(&self) -> Arc<PathBuf> {
        self.root.load_full()
    }

    /// Point disk lookups at a new root, e.g. the web root as seen from
    /// inside the jail.
    pub fn rebase(&self, root: PathBuf) {
        info!(root = %root.display(), "Static file root rebased");
        self.root.store(Arc::new(root));
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Load every regular file under the root into memory.
    ///
    /// Symlinks and files above the cacheable size are skipped. Returns the
    /// number of cached files.
    pub fn fill_cache(&self) -> std::io::Result<usize> {
        let root = self.root();
        let mut count = 0;
        self.fill_dir(&root, &root, &mut count)?;
        info!(files = count, root = %root.display(), "Filled static file cache");
        Ok(count)
    }

    fn fill_dir(&self, root: &Path, dir: &Path, count: &mut usize) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path)?;

            if meta.file_type().is_symlink() {
                info!(path = %path.display(), "Skipping symlink, not supported");
                continue;
            }
            if meta.is_dir() {
                self.fill_dir(root, &path, count)?;
                continue;
            }
            if !meta.is_file() {
                continue;
            }

            let Some(key) = cache_key(root, &path) else {
                continue;
            };
            if meta.len() > self.max_cacheable_file_size {
                warn!(file = %key, size = meta.len(), "File too large for caching");
                continue;
            }

            let content = std::fs::read(&path)?;
            let modified = meta.modified()?;
            debug!(file = %key, "Cached file");
            self.cache
                .insert(key, CachedFile::new(Bytes::from(content), modified));
            *count += 1;
        }
        Ok(())
    }

    /// Serve a static file request
    pub async fn serve<B>(&self, req: &Request<B>) -> Response<Body> {
        match self.try_serve(req).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Failed to build response");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn try_serve<B>(&self, req: &Request<B>) -> Result<Response<Body>, http::Error> {
        match req.method() {
            &Method::GET | &Method::HEAD => {}
            _ => {
                return Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .header(header::ALLOW, "GET, HEAD")
                    .body(Full::new(Bytes::new()));
            }
        }

        let Some(domain) = self.resolve_domain(req) else {
            return Ok(status_response(StatusCode::NOT_FOUND));
        };
        let Some(path) = self.clean_path(req.uri().path()) else {
            trace!(path = %req.uri().path(), "Rejected request path");
            return Ok(status_response(StatusCode::NOT_FOUND));
        };

        let key = format!("{}{}", domain, path);
        let Some(file) = self.lookup(&key).await else {
            return Ok(status_response(StatusCode::NOT_FOUND));
        };

        if let Some(response) = self.check_conditional_headers(req, &file)? {
            return Ok(response);
        }

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, get_content_type(&path))
            .header(header::CONTENT_LENGTH, file.content.len())
            .header(header::ETAG, &file.etag)
            .header(header::LAST_MODIFIED, httpdate::fmt_http_date(file.modified));
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let body = if req.method() == Method::HEAD {
            Bytes::new()
        } else {
            file.content
        };
        builder.body(Full::new(body))
    }

    /// ASCII domain directory for the request, or `None` when not allowed.
    fn resolve_domain<B>(&self, req: &Request<B>) -> Option<String> {
        let Some(host) = request_host(req) else {
            return Some(NO_DOMAIN.to_string());
        };
        match self.whitelist.check(strip_port(host)) {
            Ok(domain) => Some(domain),
            Err(e) => {
                debug!(host = %host, error = %e, "Rejected request host");
                None
            }
        }
    }

    /// Find a file by cache key, consulting the disk when configured.
    async fn lookup(&self, key: &str) -> Option<CachedFile> {
        let cached = self.cache.get(key).map(|entry| entry.clone());

        if !self.serve_files_not_in_cache {
            if cached.is_none() {
                trace!(file = %key, "File not cached and disk reads disabled");
            }
            return cached;
        }

        let path = self.root().join(key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                if cached.is_some() {
                    debug!(file = %key, "Cannot stat file, returning cached entry");
                }
                return cached;
            }
        };

        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if let Some(entry) = &cached {
            if entry.modified == modified {
                return cached;
            }
        }

        let content = match fs::read(&path).await {
            Ok(content) => Bytes::from(content),
            Err(e) => {
                debug!(file = %key, error = %e, "Cannot read file");
                return cached;
            }
        };

        let file = CachedFile::new(content, modified);
        if meta.len() <= self.max_cacheable_file_size {
            info!(file = %key, "Updating cache with new file");
            self.cache.insert(key.to_string(), file.clone());
        }
        Some(file)
    }

    fn check_conditional_headers<B>(
        &self,
        req: &Request<B>,
        file: &CachedFile,
    ) -> Result<Option<Response<Body>>, http::Error> {
        // Check If-None-Match (ETag)
        if let Some(if_none_match) = req.headers().get(header::IF_NONE_MATCH) {
            if let Ok(if_none_match_str) = if_none_match.to_str() {
                let matches = if_none_match_str == "*"
                    || if_none_match_str
                        .split(',')
                        .any(|tag| tag.trim().trim_matches('"') == file.etag.trim_matches('"'));

                if matches {
                    return self.not_modified(file).map(Some);
                }
                // If-Modified-Since is ignored when If-None-Match is present
                return Ok(None);
            }
        }

        // Check If-Modified-Since
        let if_modified_since = req
            .headers()
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok());
        if let Some(if_modified_time) = if_modified_since {
            // HTTP dates have second precision
            if unix_secs(file.modified) <= unix_secs(if_modified_time) {
                return self.not_modified(file).map(Some);
            }
        }

        Ok(None)
    }

    /// Validate a request path, mapping `/` to `/index.html`.
    fn clean_path(&self, path: &str) -> Option<String> {
        let path = if path == "/" { "/index.html" } else { path };
        self.path_pattern.is_match(path).then(|| path.to_string())
    }

    fn not_modified(&self, file: &CachedFile) -> Result<Response<Body>, http::Error> {
        let mut builder = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &file.etag)
            .header(header::LAST_MODIFIED, httpdate::fmt_http_date(file.modified));
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder.body(Full::new(Bytes::new()))
    }
}

/// Cache key of a file below the root: `<domain>/<path>` with `/` separators.
fn cache_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn get_content_type(path: &str) -> String {
    from_path(path).first_or_octet_stream().to_string()
}

/// Generate ETag from file metadata (without hashing content)
fn generate_etag(size: u64, modified: SystemTime) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    size.hash(&mut hasher);
    modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    format!("\"{:x}\"", hasher.finish())
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
