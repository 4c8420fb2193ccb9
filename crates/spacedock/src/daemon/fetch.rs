//! Fetch routing: path resolution, bypass classification, payload shaping.
//!
//! Everything here is pure; the store round-trips live in the request
//! handlers. Paths outside this daemon's authority are never answered with
//! a synthesized 404 - they pass through unmodified.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::ops::OpError;
use crate::store::FileContent;

/// A request path resolved into bundle space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    pub bundle_id: String,
    pub app_slug: String,
    pub relative_path: String,
}

/// What to do with an intercepted request.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchDecision {
    /// Outside our authority; pass through unmodified.
    Bypass,
    /// Root-scope request: clear the cached bundle/app-slug record.
    Reset,
    Serve(ResolvedPath),
}

/// Extract the pathname from a full URL or bare path.
pub fn pathname_of(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(idx) => {
            let after_scheme = &url[idx + 3..];
            match after_scheme.find('/') {
                Some(slash) => &after_scheme[slash..],
                None => "/",
            }
        }
        None => url,
    };
    match rest.find(['?', '#']) {
        Some(idx) => &rest[..idx],
        None => rest,
    }
}

/// Resolve a pathname against the registration scope.
///
/// `/{scope}/<bundleId>/<appSlug>/<rest...>`; empty rest or a trailing
/// slash defaults to `index.html`. Total and side-effect free.
pub fn resolve(pathname: &str, scope: &str) -> Option<ResolvedPath> {
    let scope = scope.trim_end_matches('/');
    let rest = pathname.strip_prefix(scope)?;
    let rest = rest.strip_prefix('/')?;

    let mut segments = rest.split('/');
    let bundle_id = segments.next().filter(|s| !s.is_empty())?;
    let app_slug = segments.next().filter(|s| !s.is_empty())?;

    let tail: Vec<&str> = segments.collect();
    let relative_path = if tail.is_empty() || tail.iter().all(|s| s.is_empty()) {
        "index.html".to_string()
    } else {
        tail.join("/")
    };

    Some(ResolvedPath {
        bundle_id: bundle_id.to_string(),
        app_slug: app_slug.to_string(),
        relative_path,
    })
}

/// Classify an intercepted request.
pub fn classify(
    url: &str,
    scope: &str,
    reserved: &[String],
    upgrade: Option<&str>,
) -> FetchDecision {
    if upgrade.is_some_and(|u| u.eq_ignore_ascii_case("websocket")) {
        return FetchDecision::Bypass;
    }

    let pathname = pathname_of(url);
    let scope_trimmed = scope.trim_end_matches('/');
    if pathname == scope_trimmed || pathname == format!("{scope_trimmed}/") {
        return FetchDecision::Reset;
    }

    if let Some(rest) = pathname
        .strip_prefix(scope_trimmed)
        .and_then(|r| r.strip_prefix('/'))
        && reserved.iter().any(|asset| rest.starts_with(asset.as_str()))
    {
        return FetchDecision::Bypass;
    }

    match resolve(pathname, scope) {
        Some(resolved) => FetchDecision::Serve(resolved),
        None => FetchDecision::Bypass,
    }
}

/// Content type for a served path, by extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Materialize a read payload into response bytes, decoding base64-encoded
/// binary content when present.
pub fn body_bytes(file: FileContent) -> Result<Vec<u8>, OpError> {
    if let Some(bytes) = file.bytes {
        return Ok(bytes);
    }
    if file.base64 {
        return BASE64
            .decode(file.content.as_bytes())
            .map_err(|e| OpError::InvalidRequest {
                field: None,
                reason: format!("undecodable base64 payload: {e}"),
            });
    }
    Ok(file.content.into_bytes())
}

/// Diagnostic page rendered on any serve failure. In a headless
/// fetch-interception context this page is the user's only feedback
/// channel, so it must never be swallowed.
pub fn error_page(bundle_id: &str, path: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>spacedock error</title></head>\n<body>\n\
         <h1>Failed to serve file</h1>\n\
         <p><b>Bundle:</b> {}</p>\n\
         <p><b>Path:</b> {}</p>\n\
         <p><b>Error:</b> {}</p>\n\
         </body>\n</html>\n",
        escape(bundle_id),
        escape(path),
        escape(message)
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCOPE: &str = "/space";

    #[test]
    fn resolve_full_path() {
        assert_eq!(
            resolve("/space/b1/app1/notes.txt", SCOPE),
            Some(ResolvedPath {
                bundle_id: "b1".to_string(),
                app_slug: "app1".to_string(),
                relative_path: "notes.txt".to_string(),
            })
        );
    }

    #[test]
    fn resolve_nested_path() {
        let resolved = resolve("/space/b1/app1/static/js/main.js", SCOPE).expect("resolve");
        assert_eq!(resolved.relative_path, "static/js/main.js");
    }

    #[test]
    fn resolve_trailing_slash_defaults_to_index() {
        assert_eq!(
            resolve("/space/b1/app1/", SCOPE).expect("resolve").relative_path,
            "index.html"
        );
        assert_eq!(
            resolve("/space/b1/app1", SCOPE).expect("resolve").relative_path,
            "index.html"
        );
    }

    #[test]
    fn resolve_requires_two_segments() {
        assert_eq!(resolve("/space/b1", SCOPE), None);
        assert_eq!(resolve("/space/b1/", SCOPE), None);
        assert_eq!(resolve("/space/", SCOPE), None);
        assert_eq!(resolve("/elsewhere/b1/app1/x", SCOPE), None);
    }

    #[test]
    fn pathname_extraction() {
        assert_eq!(
            pathname_of("https://host.example/space/b1/app1/x?q=1#frag"),
            "/space/b1/app1/x"
        );
        assert_eq!(pathname_of("/space/b1/app1/x"), "/space/b1/app1/x");
        assert_eq!(pathname_of("https://host.example"), "/");
    }

    #[test]
    fn classify_websocket_upgrade_bypasses() {
        assert_eq!(
            classify("/space/b1/app1/x", SCOPE, &[], Some("websocket")),
            FetchDecision::Bypass
        );
    }

    #[test]
    fn classify_root_scope_is_reset() {
        assert_eq!(classify("/space", SCOPE, &[], None), FetchDecision::Reset);
        assert_eq!(classify("/space/", SCOPE, &[], None), FetchDecision::Reset);
    }

    #[test]
    fn classify_reserved_assets_bypass() {
        let reserved = vec!["runtime/".to_string(), "sw.js".to_string()];
        assert_eq!(
            classify("/space/runtime/boot.js", SCOPE, &reserved, None),
            FetchDecision::Bypass
        );
        assert_eq!(
            classify("/space/sw.js", SCOPE, &reserved, None),
            FetchDecision::Bypass
        );
        // A bundle named like an asset prefix is still served.
        assert!(matches!(
            classify("/space/runtimeX/app1/x", SCOPE, &reserved, None),
            FetchDecision::Serve(_)
        ));
    }

    #[test]
    fn classify_foreign_paths_bypass() {
        assert_eq!(
            classify("/other/b1/app1/x", SCOPE, &[], None),
            FetchDecision::Bypass
        );
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("a/b/main.js"), "text/javascript; charset=utf-8");
        assert_eq!(content_type_for("logo.png"), "image/png");
        assert_eq!(content_type_for("engine.wasm"), "application/wasm");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn body_bytes_decodes_base64_payloads() {
        let file = FileContent {
            content: "aGVsbG8=".to_string(),
            bytes: None,
            base64: true,
        };
        assert_eq!(body_bytes(file).expect("decode"), b"hello");

        let file = FileContent::text("plain");
        assert_eq!(body_bytes(file).expect("text"), b"plain");
    }

    #[test]
    fn error_page_carries_context_and_escapes() {
        let page = error_page("b1", "/app1/<x>.txt", "store exploded & died");
        assert!(page.contains("b1"));
        assert!(page.contains("/app1/&lt;x&gt;.txt"));
        assert!(page.contains("store exploded &amp; died"));
    }
}
