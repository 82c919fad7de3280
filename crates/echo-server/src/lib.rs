//! formprobe echo server
//!
//! A small stand-in for a generated application: it serves a two-field
//! form, echoes submissions back into `#submittedData`, and announces its
//! port on stdout in the line the harness waits for.
//!
//! Routes:
//! - `GET /` form posting to `/submit` (navigating submit)
//! - `POST /submit` success page with the submitted values
//! - `GET /spa` same form handled in-page, no navigation
//! - `GET /stale` success text is on the page before anything is submitted
//! - `GET /health` liveness probe

use std::future::Future;

use axum::{
    extract::Form,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Printed on stdout once the listener is bound
pub fn readiness_line(port: u16) -> String {
    format!("Server is running on http://localhost:{}", port)
}

/// Create router
pub fn router() -> Router {
    Router::new()
        .route("/", get(form_handler))
        .route("/submit", post(submit_handler))
        .route("/spa", get(spa_handler))
        .route("/stale", get(stale_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router()).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: String,
}

const FORM_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Echo Form</title></head>
<body>
  <h1>Echo Form</h1>
  <form id="echo" method="post" action="/submit">
    <label for="name">Name</label>
    <input id="name" name="name" type="text">
    <label for="data">Data</label>
    <input id="data" name="data" type="text">
    <button type="submit">Submit</button>
  </form>
</body>
</html>
"#;

const SPA_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Echo Form (in-page)</title></head>
<body>
  <h1>Echo Form</h1>
  <form id="echo">
    <label for="name">Name</label>
    <input id="name" name="name" type="text">
    <label for="data">Data</label>
    <input id="data" name="data" type="text">
    <button type="submit">Submit</button>
  </form>
  <div id="result" data-message="Form submitted successfully"></div>
  <script>
    document.getElementById('echo').addEventListener('submit', function (event) {
      event.preventDefault();
      var result = document.getElementById('result');
      result.innerHTML = '';
      var heading = document.createElement('h2');
      heading.textContent = result.dataset.message;
      var data = document.createElement('p');
      data.id = 'submittedData';
      data.textContent = document.getElementById('data').value;
      result.appendChild(heading);
      result.appendChild(data);
    });
  </script>
</body>
</html>
"#;

// Submitting does nothing; only the banner matches the indicator.
const STALE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Echo Form (stale banner)</title></head>
<body>
  <p class="banner">Form submitted successfully</p>
  <form id="echo">
    <input id="name" name="name" type="text">
    <input id="data" name="data" type="text">
    <button type="submit">Submit</button>
  </form>
  <script>
    document.getElementById('echo').addEventListener('submit', function (event) {
      event.preventDefault();
    });
  </script>
</body>
</html>
"#;

async fn form_handler() -> Html<&'static str> {
    Html(FORM_PAGE)
}

async fn spa_handler() -> Html<&'static str> {
    Html(SPA_PAGE)
}

async fn stale_handler() -> Html<&'static str> {
    Html(STALE_PAGE)
}

async fn submit_handler(Form(submission): Form<Submission>) -> Html<String> {
    info!(name = %submission.name, bytes = submission.data.len(), "form submitted");
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Submitted</title></head>
<body>
  <h1>Form submitted successfully</h1>
  <p>Thanks, <span id="submittedName">{name}</span>.</p>
  <p id="submittedData">{data}</p>
  <a href="/">Back</a>
</body>
</html>
"#,
        name = escape_html(&submission.name),
        data = escape_html(&submission.data),
    ))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "formprobe-echo"
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Html("<h1>Not Found</h1>"))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn get(uri: &str) -> (StatusCode, String) {
        let response = router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, body_text(response).await)
    }

    #[tokio::test]
    async fn test_form_page() {
        let (status, body) = get("/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"<form id="echo" method="post" action="/submit">"#));
        assert!(body.contains(r#"id="name""#));
        assert!(body.contains(r#"id="data""#));
    }

    #[tokio::test]
    async fn test_submit_echoes_escaped_data() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/submit")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("name=Ada&data=%3Cb%3Etest-data-123%3C%2Fb%3E"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        assert!(body.contains("Form submitted successfully"));
        assert!(body.contains(r#"<p id="submittedData">&lt;b&gt;test-data-123&lt;/b&gt;</p>"#));
        assert!(body.contains(r#"<span id="submittedName">Ada</span>"#));
    }

    #[tokio::test]
    async fn test_submit_missing_fields_defaults_to_empty() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/submit")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(""))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_text(response).await;
        assert!(body.contains(r#"<p id="submittedData"></p>"#));
    }

    #[tokio::test]
    async fn test_spa_and_stale_pages() {
        let (status, spa) = get("/spa").await;
        assert_eq!(status, StatusCode::OK);
        assert!(spa.contains("event.preventDefault()"));
        assert!(!spa.contains("<h2>Form submitted successfully"));

        let (_, stale) = get("/stale").await;
        assert!(stale.contains(r#"<p class="banner">Form submitted successfully</p>"#));
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get("/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get("/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_readiness_line() {
        assert_eq!(readiness_line(3000), "Server is running on http://localhost:3000");
    }
}
