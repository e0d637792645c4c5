//! A local HTTP server answering with canned responses, for tests of the HTTP backends

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Clone)]
pub struct CannedResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: String,
}

impl CannedResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).expect("Valid status code"),
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.into(),
        }
    }

    pub fn text(status: u16, content_type: &str, body: impl Into<String>) -> Self {
        Self {
            headers: vec![("content-type".into(), content_type.into())],
            ..Self::json(status, body)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A request as the server received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
}

impl RecordedRequest {
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query.as_bytes()).into_owned().collect()
    }

    pub fn query_value(&self, name: &str) -> Option<String> {
        self.query_pairs().into_iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    /// Values of an `application/x-www-form-urlencoded` body
    pub fn form_value(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

struct Canned {
    responses: Vec<CannedResponse>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Answers the n-th request with the n-th response. The last response is repeated.
pub struct TestServer {
    url: Url,
    canned: Arc<Canned>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(responses: Vec<CannedResponse>) -> Self {
        assert!(!responses.is_empty(), "A test server needs at least one response");

        let canned = Arc::new(Canned { responses, requests: Mutex::new(Vec::new()) });
        let app = Router::new()
            .fallback(answer)
            .with_state(canned.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Bind test server");
        let address = listener.local_addr().expect("Test server address");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Test server failed");
        });

        Self {
            url: Url::parse(&format!("http://{address}")).expect("Test server URL"),
            canned,
            handle,
        }
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.canned.requests.lock().expect("Requests lock").clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn answer(State(canned): State<Arc<Canned>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default();

    let index = {
        let mut requests = canned.requests.lock().expect("Requests lock");
        requests.push(RecordedRequest {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
        requests.len() - 1
    };
    let canned = &canned.responses[index.min(canned.responses.len() - 1)];

    let mut response = Response::builder().status(canned.status);
    for (name, value) in &canned.headers {
        response = response.header(name.as_str(), value.as_str());
    }
    response.body(Body::from(canned.body.clone())).expect("Valid canned response")
}
