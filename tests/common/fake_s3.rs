use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::StreamExt;

const MAX_BODY: usize = 64 * 1024 * 1024;

/// GET on this key sends a first chunk and then stalls forever.
pub const STALLED_KEY: &str = "slow/stalled.tar";
/// HEAD on this key answers 200 without an ETag, like some S3 compatible stores.
pub const GHOST_KEY: &str = "minio/ghost.tar";
/// Uploading part 2 of this key is rejected.
pub const REJECTED_PART_KEY: &str = "broken/multipart.tar";
/// Uploading part 2 of this key never gets a response.
pub const STALLED_PART_KEY: &str = "slow/multipart.tar";
/// HEAD on this key is refused with 403.
pub const DENIED_KEY: &str = "private/denied.tar";

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub key: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), Vec<u8>>,
    uploads: HashMap<String, BTreeMap<i32, Vec<u8>>>,
    requests: Vec<RecordedRequest>,
    next_upload: u64,
}

type Shared = Arc<Mutex<Inner>>;

/// Minimal path style S3 endpoint backed by memory.
pub struct FakeS3 {
    pub endpoint: String,
    state: Shared,
}

impl FakeS3 {
    pub async fn start() -> Self {
        let state = Shared::default();
        let app = Router::new()
            .route("/:bucket/*key", any(handle))
            .layer(DefaultBodyLimit::max(MAX_BODY))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        FakeS3 { endpoint, state }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_for(&self, method: Method, key: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method && request.key == key)
            .collect()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let inner = self.state.lock().unwrap();
        inner.objects.get(&(bucket.to_owned(), key.to_owned())).cloned()
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Waits until a request matching `method` and `key` arrived, up to `timeout`.
    pub async fn wait_for(&self, method: Method, key: &str, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.requests_for(method.clone(), key).is_empty() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }
}

fn xml(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

fn error(status: StatusCode, code: &str, key: &str) -> Response {
    xml(
        status,
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>{}</Code><Message>{}</Message><Key>{}</Key><RequestId>fake</RequestId></Error>",
            code, code, key
        ),
    )
}

fn etag(data: &[u8]) -> String {
    format!("\"{:x}-{}\"", data.iter().map(|b| *b as u64).sum::<u64>(), data.len())
}

async fn handle(
    State(state): State<Shared>,
    method: Method,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.lock().unwrap().requests.push(RecordedRequest {
        method: method.clone(),
        key: key.clone(),
        query: query.clone(),
        headers,
    });

    if method == Method::PUT
        && key == STALLED_PART_KEY
        && query.get("partNumber").map(String::as_str) == Some("2")
    {
        futures::future::pending::<()>().await;
    }

    let mut inner = state.lock().unwrap();

    let object_id = (bucket.clone(), key.clone());

    match method {
        Method::GET if key == STALLED_KEY => {
            let stream = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"partial"))])
                .chain(futures::stream::pending());
            Response::new(Body::from_stream(stream))
        }
        Method::GET => match inner.objects.get(&object_id) {
            Some(data) => (StatusCode::OK, [(header::ETAG, etag(data))], data.clone()).into_response(),
            None => error(StatusCode::NOT_FOUND, "NoSuchKey", &key),
        },
        Method::HEAD if key == GHOST_KEY => StatusCode::OK.into_response(),
        Method::HEAD if key == DENIED_KEY => StatusCode::FORBIDDEN.into_response(),
        Method::HEAD => match inner.objects.get(&object_id) {
            Some(data) => (StatusCode::OK, [(header::ETAG, etag(data))]).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::PUT => match (query.get("uploadId"), query.get("partNumber")) {
            (Some(upload_id), Some(part_number)) => {
                let part_number: i32 = part_number.parse().unwrap();
                if key == REJECTED_PART_KEY && part_number == 2 {
                    return error(StatusCode::BAD_REQUEST, "InvalidRequest", &key);
                }
                let tag = etag(&body);
                match inner.uploads.get_mut(upload_id) {
                    Some(parts) => {
                        parts.insert(part_number, body.to_vec());
                        (StatusCode::OK, [(header::ETAG, tag)]).into_response()
                    }
                    None => error(StatusCode::NOT_FOUND, "NoSuchUpload", &key),
                }
            }
            _ => {
                let tag = etag(&body);
                inner.objects.insert(object_id, body.to_vec());
                (StatusCode::OK, [(header::ETAG, tag)]).into_response()
            }
        },
        Method::POST if query.contains_key("uploads") => {
            inner.next_upload += 1;
            let upload_id = format!("upload-{}", inner.next_upload);
            inner.uploads.insert(upload_id.clone(), BTreeMap::new());
            xml(
                StatusCode::OK,
                format!(
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                     <InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key>\
                     <UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                    bucket, key, upload_id
                ),
            )
        }
        Method::POST if query.contains_key("uploadId") => {
            let parts = match inner.uploads.remove(&query["uploadId"]) {
                Some(parts) => parts,
                None => return error(StatusCode::NOT_FOUND, "NoSuchUpload", &key),
            };
            let listed = String::from_utf8_lossy(&body).matches("<PartNumber>").count();
            if listed != parts.len() {
                return error(StatusCode::BAD_REQUEST, "InvalidPart", &key);
            }
            let data: Vec<u8> = parts.into_values().flatten().collect();
            let tag = etag(&data);
            inner.objects.insert(object_id, data);
            xml(
                StatusCode::OK,
                format!(
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                     <CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key>\
                     <ETag>{}</ETag></CompleteMultipartUploadResult>",
                    bucket,
                    key,
                    tag.replace('"', "&quot;")
                ),
            )
        }
        Method::DELETE => {
            match query.get("uploadId") {
                Some(upload_id) => {
                    inner.uploads.remove(upload_id);
                }
                None => {
                    inner.objects.remove(&object_id);
                }
            }
            StatusCode::NO_CONTENT.into_response()
        }
        _ => error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", &key),
    }
}
