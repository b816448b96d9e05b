//! Remote image fetching for upload actions.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{UploadConfig, MAX_UPLOAD_IMAGES};
use crate::dom::{Dom, FilePayload, NodeId};
use crate::inspect::find_element;
use crate::{http_url, Result};

const FILE_INPUT_SELECTOR: &str = "input[type=\"file\"]";

/// Image URLs from an upload action's value: a JSON array of strings, or
/// URLs separated by whitespace or commas. Non-http(s) entries and
/// duplicates are dropped; at most `cap` are kept.
pub fn parse_image_urls(value: &str, cap: usize) -> Vec<String> {
    let value = value.trim();
    let candidates: Vec<String> = match serde_json::from_str::<Value>(value) {
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
            .collect(),
        Ok(Value::String(s)) => vec![s.trim().to_string()],
        _ => value
            .split(|c: char| c.is_whitespace() || c == ',')
            .map(str::to_string)
            .collect(),
    };
    let mut urls: Vec<String> = Vec::new();
    for url in candidates {
        if urls.len() >= cap.min(MAX_UPLOAD_IMAGES) {
            break;
        }
        let Some(url) = http_url(&url) else {
            continue;
        };
        let url = String::from(url);
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

/// The file input to attach to: the action's selector when it points at
/// one, else the first file input on the page. File inputs are often
/// visually hidden behind a styled drop zone, so visibility is not required.
pub(super) async fn file_input<D: Dom + ?Sized>(dom: &D, selector: Option<&str>) -> Option<NodeId> {
    if let Some(selector) = selector {
        if let Some(found) = find_element(dom, selector).await {
            let el = &found.element;
            if el.tag == "input" && el.input_type().as_deref() == Some("file") {
                return Some(found.node);
            }
            debug!(selector, tag = %el.tag, "upload selector is not a file input");
        }
    }
    match dom.query_all(None, FILE_INPUT_SELECTOR).await {
        Ok(nodes) => nodes.first().copied(),
        Err(e) => {
            debug!(error = %e, "file input query failed");
            None
        }
    }
}

/// Downloads images one by one, tolerating individual failures.
pub struct ImageFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_images: usize,
}

impl ImageFetcher {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            timeout: Duration::from_millis(config.fetch_timeout_ms),
            max_images: config.max_images.min(MAX_UPLOAD_IMAGES),
        })
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    /// Fetch every URL; only `image/*` responses with a body survive.
    pub async fn fetch_all(&self, urls: &[String]) -> Vec<FilePayload> {
        let mut files = Vec::with_capacity(urls.len());
        for (i, url) in urls.iter().enumerate() {
            match self.fetch(url, i).await {
                Ok(Some(file)) => files.push(file),
                Ok(None) => {}
                Err(e) => warn!(url = %url, error = %e, "image fetch failed"),
            }
        }
        files
    }

    async fn fetch(&self, url: &str, index: usize) -> Result<Option<FilePayload>> {
        let response = self.client.get(url).timeout(self.timeout).send().await?;
        if !response.status().is_success() {
            warn!(url, status = %response.status(), "image fetch rejected");
            return Ok(None);
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if !mime.starts_with("image/") {
            warn!(url, mime = %mime, "not an image");
            return Ok(None);
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            warn!(url, "empty image body");
            return Ok(None);
        }
        Ok(Some(FilePayload {
            name: file_name(url, &mime, index),
            mime,
            bytes: bytes.to_vec(),
        }))
    }
}

/// Last path segment of the URL when it looks like a file name, otherwise
/// `image-{n}.{ext}` from the MIME subtype.
fn file_name(url: &str, mime: &str, index: usize) -> String {
    let segment = http_url(url).and_then(|u| {
        u.path_segments()
            .and_then(|mut s| s.next_back())
            .map(str::to_string)
    });
    if let Some(segment) = segment.filter(|s| s.contains('.')) {
        return segment;
    }
    let ext = match mime.strip_prefix("image/").unwrap_or("jpeg") {
        "jpeg" | "pjpeg" => "jpg",
        "svg+xml" => "svg",
        other => other,
    };
    format!("image-{}.{}", index + 1, ext)
}
