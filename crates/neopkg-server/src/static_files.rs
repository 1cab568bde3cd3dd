use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mime::Mime;

const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    pub content_type: Mime,
    pub bytes: Vec<u8>,
}

/// Turns a URL path into a relative filesystem path. `None` for `..`,
/// backslashes, and (unless `allow_hidden`) any dot-prefixed component.
pub fn safe_relative_path(raw: &str, allow_hidden: bool) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in raw.split('/') {
        if component.is_empty() || component == "." {
            continue;
        }
        if component == ".." || component.contains('\\') || component.contains('\0') {
            return None;
        }
        if !allow_hidden && component.starts_with('.') {
            return None;
        }
        relative.push(component);
    }
    Some(relative)
}

/// Reads `raw` below `root`. Directories resolve to their `index.html` when
/// `index` is set. `Ok(None)` covers refused paths and missing files alike.
pub async fn read_file(root: &Path, raw: &str, allow_hidden: bool, index: bool) -> Result<Option<StaticFile>> {
    let Some(relative) = safe_relative_path(raw, allow_hidden) else {
        return Ok(None);
    };
    let mut path = root.join(relative);
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => {
            if !index {
                return Ok(None);
            }
            path.push(INDEX_FILE);
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed reading {}", path.display())),
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(StaticFile {
            content_type: content_type(&path),
            bytes,
        })),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
    }
}

/// Writes `bytes` to `raw` below `root`, creating parent directories.
/// `Ok(None)` when the path is refused.
pub async fn write_file(root: &Path, raw: &str, allow_hidden: bool, bytes: &[u8]) -> Result<Option<PathBuf>> {
    let Some(relative) = safe_relative_path(raw, allow_hidden) else {
        return Ok(None);
    };
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("failed writing {}", path.display()))?;
    Ok(Some(path))
}

pub fn content_type(path: &Path) -> Mime {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => mime::TEXT_HTML_UTF_8,
        "css" => mime::TEXT_CSS_UTF_8,
        "js" | "mjs" => mime::APPLICATION_JAVASCRIPT_UTF_8,
        "json" | "map" => mime::APPLICATION_JSON,
        "txt" | "md" | "tql" => mime::TEXT_PLAIN_UTF_8,
        "csv" => mime::TEXT_CSV_UTF_8,
        "xml" => mime::TEXT_XML,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "svg" => mime::IMAGE_SVG,
        "bmp" => mime::IMAGE_BMP,
        "woff" => mime::FONT_WOFF,
        "woff2" => mime::FONT_WOFF2,
        "pdf" => mime::APPLICATION_PDF,
        "wasm" => "application/wasm"
            .parse()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM),
        "ico" => "image/x-icon"
            .parse()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM),
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}
