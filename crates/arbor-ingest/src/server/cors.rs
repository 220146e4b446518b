use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::ServerConfig;

/// Cross-origin policy for browser callers. A `*` entry allows any origin;
/// entries that are not valid header values are skipped with a warning.
pub fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let origin = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(origin = %origin, error = %err, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    let headers: Vec<HeaderName> = config
        .allowed_headers
        .iter()
        .filter_map(|name| match HeaderName::from_bytes(name.trim().as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(header = %name, error = %err, "ignoring invalid CORS header");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS]))
        .allow_headers(AllowHeaders::list(headers))
}

/// Preflight answers carry no body, so report them as 204.
pub async fn preflight_no_content(req: Request, next: Next) -> Response {
    let preflight = req.method() == Method::OPTIONS;
    let mut response = next.run(req).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use axum::routing::get;
    use axum::{middleware, Router};
    use tower::ServiceExt;

    fn app(origins: &[&str]) -> Router {
        let config = ServerConfig {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        };
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(build_cors_layer(&config))
            .layer(middleware::from_fn(preflight_no_content))
    }

    async fn allowed_origin(app: Router, method: Method, origin: &str) -> (StatusCode, Option<String>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri("/ping")
                    .header(header::ORIGIN, origin)
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let allowed = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .map(|v| v.to_str().unwrap().to_string());
        (response.status(), allowed)
    }

    #[tokio::test]
    async fn test_wildcard_origin() {
        let (status, allowed) = allowed_origin(app(&["*"]), Method::GET, "https://kb.example").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(allowed.as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn test_listed_origin_is_echoed() {
        let listed = app(&["https://app.example"]);
        let (_, allowed) = allowed_origin(listed.clone(), Method::GET, "https://app.example").await;
        assert_eq!(allowed.as_deref(), Some("https://app.example"));

        let (_, allowed) = allowed_origin(listed, Method::GET, "https://evil.example").await;
        assert!(allowed.is_none());
    }

    #[tokio::test]
    async fn test_preflight_is_no_content() {
        let (status, allowed) = allowed_origin(app(&["*"]), Method::OPTIONS, "https://kb.example").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(allowed.as_deref(), Some("*"));
    }
}
