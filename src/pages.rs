// src/pages.rs

use axum::body::Body;
use axum::response::Response;
use http::{StatusCode, header};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const TOKEN_PLACEHOLDER: &str = "TOKEN_PLACEHOLDER";
pub const PSTR_PLACEHOLDER: &str = "PSTR_PLACEHOLDER";
pub const KEY_PLACEHOLDER: &str = "KEY_PLACEHOLDER";
pub const PLAYERS_PLACEHOLDER: &str = "PLAYERS_PLACEHOLDER";

/// Default CSP profile for every served page.
pub const DEFAULT_CSP: &str = "script-src 'self' https://www.recaptcha.net/recaptcha/ https://www.gstatic.com/recaptcha/; img-src 'self'; frame-src 'self' https://www.recaptcha.net/recaptcha/; connect-src 'self' https://fonts.googleapis.com/ https://fonts.gstatic.com/; style-src 'self' https://fonts.googleapis.com/; default-src 'self' https://fonts.gstatic.com/; frame-ancestors 'self';";

/// Pages that instantiate WebAssembly need `'unsafe-eval'` in `script-src`.
pub const WASM_CSP: &str = "script-src 'unsafe-eval' 'self' https://www.recaptcha.net/recaptcha/ https://www.gstatic.com/recaptcha/; img-src 'self'; frame-src 'self' https://www.recaptcha.net/recaptcha/; connect-src 'self' https://fonts.googleapis.com/ https://fonts.gstatic.com/; style-src 'self' https://fonts.googleapis.com/; default-src 'self' https://fonts.gstatic.com/; frame-ancestors 'self';";

/// Files rewritten when captcha is disabled in `--test` mode.
pub const NO_CAPTCHA_REWRITE_FILES: [&str; 2] = ["script/index.js", "index.html"];

#[derive(Debug, Error)]
pub enum PageError {
    #[error("page not found")]
    NotFound,
    #[error("failed to build page response")]
    Internal,
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|extension| extension.to_str())? {
        "css" => Some("text/css"),
        "html" => Some("text/html; charset=utf-8"),
        "txt" => Some("text/plain"),
        "ico" => Some("image/x-icon"),
        "png" => Some("image/png"),
        "js" => Some("text/javascript"),
        "json" => Some("application/json"),
        "wasm" => Some("application/wasm"),
        _ => None,
    }
}

/// Normalizes a client-supplied relative path, refusing anything that could
/// escape the web root.
fn sanitize(rel_path: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

fn apply_substitutions(mut body: Vec<u8>, substitutions: &[(&str, &str)]) -> Vec<u8> {
    for (key, value) in substitutions {
        body = replace_bytes(&body, key.as_bytes(), value.as_bytes());
    }
    body
}

/// Reads a file under `web_root`, substitutes the placeholder keys literally
/// in its bytes, and builds the response with the content type and CSP
/// profile the page calls for.
pub async fn render(
    web_root: &Path,
    rel_path: &str,
    substitutions: &[(&str, &str)],
    wasm: bool,
) -> Result<Response, PageError> {
    let rel = sanitize(rel_path).ok_or(PageError::NotFound)?;
    let full_path = web_root.join(rel);
    let content_type = content_type_for(&full_path).ok_or(PageError::NotFound)?;
    let bytes = tokio::fs::read(&full_path)
        .await
        .map_err(|_| PageError::NotFound)?;
    let body = apply_substitutions(bytes, substitutions);

    let csp = if wasm { WASM_CSP } else { DEFAULT_CSP };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_SECURITY_POLICY, csp)
        .body(Body::from(body))
        .map_err(|_| PageError::Internal)
}
