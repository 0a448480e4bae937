//! HTTP server fakes for tests.
//!
//! [`FakeServer`] answers each request with the response chosen by a handler
//! and records the request line, so tests can drive the Kubernetes and S3
//! clients without a real endpoint.

use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A request received by the server.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Raw query string, empty if none.
    pub query: String,
    /// Header block with lowercased names and values.
    pub headers: String,
}

/// A canned response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }

    /// A Kubernetes `Status` failure.
    pub fn kube_error(status: u16, reason: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": reason,
                "reason": reason,
                "code": status,
            })
            .to_string(),
        }
    }
}

type Handler = dyn Fn(&Request) -> Response + Send + Sync;

/// Serves one request per connection until dropped with the runtime.
pub struct FakeServer {
    pub url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = Arc::clone(&handler);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(serve(stream, handler, recorded));
            }
        });

        Self { url, requests }
    }

    /// Request lines received so far, as "METHOD /path".
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Writes a kubeconfig using this server into `dir`.
    pub fn kubeconfig(&self, dir: &Path, file: &str) -> PathBuf {
        let path = dir.join(file);
        let yaml = format!(
            "apiVersion: v1
kind: Config
clusters:
- name: fake
  cluster:
    server: {}
contexts:
- name: admin
  context:
    cluster: fake
    user: admin
current-context: admin
users:
- name: admin
  user:
    token: not-a-real-token
",
            self.url
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }
}

async fn serve(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    recorded: Arc<Mutex<Vec<String>>>,
) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    }

    let raw = String::from_utf8_lossy(&raw).to_string();
    let (line, headers) = raw.split_once("\r\n").unwrap_or((raw.as_str(), ""));
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let request = Request {
        method,
        path: path.to_string(),
        query: query.to_string(),
        headers: headers.to_lowercase(),
    };
    recorded
        .lock()
        .unwrap()
        .push(format!("{} {}", request.method, request.path));

    let response = handler(&request);
    let reason = StatusCode::from_u16(response.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    let mut out = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\
         connection: close\r\n\r\n",
        response.status,
        reason,
        response.body.len()
    );
    if request.method != "HEAD" {
        out.push_str(&response.body);
    }
    let _ = stream.write_all(out.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Kubernetes discovery documents.
pub mod discovery {
    /// `/api`: core group with version v1.
    pub const CORE_VERSIONS: &str =
        r#"{"kind":"APIVersions","versions":["v1"],"serverAddressByClientCIDRs":[]}"#;

    /// `/api/v1` listing configmaps and secrets.
    pub const CORE_RESOURCES: &str = r#"{"kind":"APIResourceList","groupVersion":"v1","resources":[
        {"name":"configmaps","singularName":"configmap","namespaced":true,
         "kind":"ConfigMap","verbs":["get","list"]},
        {"name":"secrets","singularName":"secret","namespaced":true,
         "kind":"Secret","verbs":["get","list"]}
    ]}"#;

    /// `/apis` for a cluster without extra groups.
    pub const NO_GROUPS: &str = r#"{"kind":"APIGroupList","apiVersion":"v1","groups":[]}"#;

    /// `/apis` for an OpenShift cluster.
    pub const OPENSHIFT_GROUPS: &str = r#"{"kind":"APIGroupList","apiVersion":"v1","groups":[
        {"name":"config.openshift.io",
         "versions":[{"groupVersion":"config.openshift.io/v1","version":"v1"}],
         "preferredVersion":{"groupVersion":"config.openshift.io/v1","version":"v1"}}
    ]}"#;
}
