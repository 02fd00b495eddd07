//! Image reference resolution — roster values to validated image bytes.
//!
//! A roster cell may hold a local path, a remote URL, or a spreadsheet
//! HYPERLINK formula. Classification is one explicit step producing a
//! tagged [`ImageReference`], so downstream resolution is an exhaustive
//! match rather than ad-hoc string sniffing.

use rollcall_core::extract::{validate_raster, ExtractError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File extensions a remote fetch may be cached under.
const KNOWN_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];
const DEFAULT_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("image not reachable: {0}")]
    NotFound(String),
    #[error("bytes do not decode as an image: {0}")]
    InvalidImage(String),
    #[error("unsupported image format (expected JPEG, PNG, BMP, or GIF)")]
    UnsupportedFormat,
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExtractError> for ResolveError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::DecodeFailure(msg) => ResolveError::InvalidImage(msg),
            ExtractError::UnsupportedFormat => ResolveError::UnsupportedFormat,
        }
    }
}

/// A classified roster image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    LocalPath(PathBuf),
    RemoteUrl(String),
    /// Spreadsheet hyperlink: the embedded target plus its display text.
    HyperlinkTarget {
        target: String,
        display: String,
    },
}

impl ImageReference {
    /// Classify a raw roster cell value by syntactic inspection.
    ///
    /// A scheme prefix means URL, a HYPERLINK formula means hyperlink, and
    /// anything else is treated as a local path (which fails downstream as
    /// `NotFound` if it does not exist).
    pub fn classify(raw: &str) -> ImageReference {
        let trimmed = raw.trim();

        if let Some((target, display)) = parse_hyperlink_formula(trimmed) {
            return ImageReference::HyperlinkTarget { target, display };
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return ImageReference::RemoteUrl(trimmed.to_string());
        }
        ImageReference::LocalPath(PathBuf::from(trimmed))
    }
}

/// Parse `=HYPERLINK("target", "display")`, case-insensitively.
fn parse_hyperlink_formula(cell: &str) -> Option<(String, String)> {
    let rest = cell.strip_prefix('=')?;
    if !rest.get(..9)?.eq_ignore_ascii_case("HYPERLINK") {
        return None;
    }
    let args = rest[9..].trim().strip_prefix('(')?.strip_suffix(')')?;

    let parts = parse_quoted_args(args)?;
    match parts.as_slice() {
        [target] => Some((target.clone(), target.clone())),
        [target, display] => Some((target.clone(), display.clone())),
        _ => None,
    }
}

/// Split a quoted argument list. Arguments are quoted strings, so a comma
/// inside a display text never splits the list.
fn parse_quoted_args(args: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut rest = args.trim();
    while !rest.is_empty() {
        rest = rest.strip_prefix('"')?;
        let end = rest.find('"')?;
        parts.push(rest[..end].to_string());
        rest = rest[end + 1..].trim_start();
        match rest.strip_prefix(',') {
            Some(after) => rest = after.trim_start(),
            None if rest.is_empty() => break,
            None => return None,
        }
    }
    Some(parts)
}

/// Rewrite share-page URLs into direct-download URLs.
///
/// Google Drive and Dropbox links from a roster spreadsheet usually point
/// at an HTML viewer page; fetching that page would cache an HTML document
/// instead of the photo.
fn direct_download_url(url: &str) -> String {
    if url.contains("drive.google.com") {
        let file_id = url
            .split_once("/d/")
            .map(|(_, rest)| rest.split(['/', '?']).next().unwrap_or(""))
            .or_else(|| {
                url.split_once("id=")
                    .map(|(_, rest)| rest.split('&').next().unwrap_or(""))
            });
        if let Some(id) = file_id.filter(|id| !id.is_empty()) {
            return format!("https://drive.google.com/uc?export=download&id={id}");
        }
    }
    if url.contains("dropbox.com") {
        if url.contains("dl=0") {
            return url.replace("dl=0", "dl=1");
        }
        let sep = if url.contains('?') { '&' } else { '?' };
        return format!("{url}{sep}dl=1");
    }
    url.to_string()
}

/// Resolves classified references into validated raster image bytes.
///
/// Remote fetches are cached under `cache_dir/<student_id>.<ext>` so
/// re-ingestion does not hit the network unless explicitly forced.
pub struct ImageResolver {
    cache_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl ImageResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, fetch_timeout: Duration) -> Result<Self, ResolveError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| ResolveError::NotFound(e.to_string()))?;
        Ok(Self { cache_dir, client })
    }

    /// Resolve a reference to validated image bytes.
    ///
    /// `force` bypasses the local cache for remote references.
    pub fn resolve(
        &self,
        student_id: &str,
        reference: &ImageReference,
        force: bool,
    ) -> Result<Vec<u8>, ResolveError> {
        match reference {
            ImageReference::LocalPath(path) => self.read_local(path),
            ImageReference::RemoteUrl(url) => self.fetch_remote(student_id, url, force),
            ImageReference::HyperlinkTarget { target, display } => {
                // The embedded target is authoritative; the display text is
                // only a fallback when the target itself is not a URL.
                let candidate = if target.starts_with("http://") || target.starts_with("https://") {
                    target
                } else if display.starts_with("http://") || display.starts_with("https://") {
                    display
                } else {
                    return self.read_local(Path::new(target));
                };
                self.fetch_remote(student_id, candidate, force)
            }
        }
    }

    fn read_local(&self, path: &Path) -> Result<Vec<u8>, ResolveError> {
        if !path.exists() {
            return Err(ResolveError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        validate_raster(&bytes)?;
        Ok(bytes)
    }

    fn fetch_remote(&self, student_id: &str, url: &str, force: bool) -> Result<Vec<u8>, ResolveError> {
        let url = direct_download_url(url);
        let cached = self.cache_path(student_id, &url);

        if !force && cached.exists() {
            tracing::debug!(student_id, path = %cached.display(), "image cache hit");
            let bytes = std::fs::read(&cached)?;
            validate_raster(&bytes)?;
            return Ok(bytes);
        }

        tracing::debug!(student_id, url = %url, "fetching roster image");
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ResolveError::NotFound(format!("{url}: {e}")))?;
        let bytes = response
            .bytes()
            .map_err(|e| ResolveError::NotFound(format!("{url}: {e}")))?
            .to_vec();

        // Validate before caching so an HTML error page never poisons the
        // cache.
        validate_raster(&bytes)?;

        // Write to a temp file first, then rename, so a concurrent reader
        // never observes a partial image.
        let temp = cached.with_extension("part");
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(&bytes)?;
        file.flush()?;
        drop(file);
        std::fs::rename(&temp, &cached)?;

        Ok(bytes)
    }

    /// Cache location for a student's image: id plus the URL's extension.
    fn cache_path(&self, student_id: &str, url: &str) -> PathBuf {
        let ext = url
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.split(['?', '&']).next().unwrap_or(ext))
            .map(str::to_ascii_lowercase)
            .filter(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        self.cache_dir.join(format!("{student_id}.{ext}"))
    }
}
