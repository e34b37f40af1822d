use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::catalog::{catalog, tool_schemas};
use crate::config::ServerConfig;
use crate::error::PipelineErrorCode;
use crate::pipeline::TaskPipeline;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

enum RequestRead {
    Complete(HttpRequest),
    TooLarge,
    Closed,
}

/// HTTP/1.1 boundary in front of the task pipeline.
pub struct TaskServer {
    config: ServerConfig,
    pipeline: Arc<TaskPipeline>,
}

impl TaskServer {
    pub fn new(config: ServerConfig, pipeline: Arc<TaskPipeline>) -> Self {
        Self { config, pipeline }
    }

    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("failed binding task listener on {}", self.config.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("task server listening on http://{bound_addr}");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("task server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            let max_request_bytes = self.config.max_request_bytes;
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, pipeline, max_request_bytes).await {
                                    warn!(%remote_addr, "task connection failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => warn!("task listener accept failed: {err}"),
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    pipeline: Arc<TaskPipeline>,
    max_request_bytes: usize,
) -> Result<()> {
    let request = match read_http_request(&mut stream, max_request_bytes).await? {
        RequestRead::Complete(request) => request,
        RequestRead::Closed => return Ok(()),
        RequestRead::TooLarge => {
            let payload = json!({
                "status": "error",
                "message": format!("request exceeds {max_request_bytes} bytes"),
            });
            return write_http_json_response(&mut stream, 413, &payload).await;
        }
    };
    debug!(method = %request.method, path = %request.path, "http request");

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => {
            let payload = json!({
                "message": "taskdesk agent is running. POST /run?task=... to execute a task, GET /read?path=... to read a file."
            });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("GET", "/health") => {
            let payload = json!({ "ok": true, "operations": catalog().len() });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("GET", "/operations") => {
            let tools = tool_schemas(catalog());
            let payload = json!({ "ok": true, "count": tools.len(), "tools": tools });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("POST", "/run") => {
            let task = task_from_request(&request).unwrap_or_default();
            let envelope = pipeline.run(&task).await;
            write_http_json_response(&mut stream, envelope.http_status(), &envelope.to_document())
                .await
        }
        ("GET", "/read") => handle_read(&mut stream, &pipeline, &request).await,
        (_, "/" | "/health" | "/operations" | "/run" | "/read") => {
            let payload = json!({
                "status": "error",
                "message": format!("method {} not allowed on {}", request.method, request.path),
            });
            write_http_json_response(&mut stream, 405, &payload).await
        }
        _ => {
            let payload = json!({
                "status": "error",
                "message": "not found",
                "path": request.path,
            });
            write_http_json_response(&mut stream, 404, &payload).await
        }
    }
}

/// Query `task` wins over a JSON body `{"task": ...}`.
fn task_from_request(request: &HttpRequest) -> Option<String> {
    if let Some(task) = request.query_param("task") {
        if !task.trim().is_empty() {
            return Some(task.to_owned());
        }
    }
    if request.body.is_empty() {
        return None;
    }
    let body: Value = serde_json::from_slice(&request.body).ok()?;
    body.get("task")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

async fn handle_read(
    stream: &mut TcpStream,
    pipeline: &TaskPipeline,
    request: &HttpRequest,
) -> Result<()> {
    let Some(raw) = request
        .query_param("path")
        .filter(|raw| !raw.trim().is_empty())
    else {
        let payload = json!({ "status": "error", "message": "path is required" });
        return write_http_json_response(stream, 400, &payload).await;
    };

    let path = match pipeline.guard().resolve(raw) {
        Ok(path) => path,
        Err(err) => {
            let status = if err.code == PipelineErrorCode::SandboxViolation {
                warn!("read refused: {}", err.message);
                403
            } else {
                400
            };
            let payload = json!({ "status": "error", "message": err.message });
            return write_http_json_response(stream, status, &payload).await;
        }
    };

    let is_file = tokio::fs::metadata(path.as_path())
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        let payload = json!({ "status": "error", "message": format!("file not found: {path}") });
        return write_http_json_response(stream, 404, &payload).await;
    }

    match tokio::fs::read(path.as_path()).await {
        Ok(bytes) => write_http_response(stream, 200, content_type_for(raw), &bytes).await,
        Err(err) => {
            warn!("failed reading {path}: {err}");
            let payload = json!({ "status": "error", "message": format!("failed reading {path}") });
            write_http_json_response(stream, 500, &payload).await
        }
    }
}

fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "json" => "application/json; charset=utf-8",
        "txt" | "log" | "md" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2))
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Ok(parsed) = value.trim().parse::<usize>() {
                    return Some(parsed);
                }
            }
        }
    }
    None
}

async fn read_http_request(stream: &mut TcpStream, max_bytes: usize) -> Result<RequestRead> {
    let mut buffer = Vec::with_capacity(READ_CHUNK_BYTES);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut request_end_seen: Option<usize> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading http request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > max_bytes {
            return Ok(RequestRead::TooLarge);
        }

        if request_end_seen.is_none() {
            if let Some((header_end, separator_len)) = find_http_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_http_content_length(&headers).unwrap_or(0);
                let body_start = header_end + separator_len;
                let Some(request_end) = body_start
                    .checked_add(content_length)
                    .filter(|end| *end <= max_bytes)
                else {
                    return Ok(RequestRead::TooLarge);
                };
                request_end_seen = Some(request_end);
            }
        }

        if request_end_seen.is_some_and(|request_end| buffer.len() >= request_end) {
            break;
        }
    }

    if buffer.is_empty() {
        return Ok(RequestRead::Closed);
    }

    let (header_end, separator_len) = find_http_header_terminator(&buffer)
        .ok_or_else(|| anyhow::anyhow!("invalid http request: missing header terminator"))?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid http request line");
    }
    let target = segments.next().unwrap_or("/").trim();
    let (path, raw_query) = target.split_once('?').unwrap_or((target, ""));
    let query = url::form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect();

    let content_length = parse_http_content_length(&headers).unwrap_or(0);
    let body_start = header_end + separator_len;
    let Some(body) = body_start
        .checked_add(content_length)
        .and_then(|body_end| buffer.get(body_start..body_end))
    else {
        anyhow::bail!("truncated http request body");
    };
    let body = body.to_vec();
    Ok(RequestRead::Complete(HttpRequest {
        method,
        path: path.to_owned(),
        query,
        body,
    }))
}

async fn write_http_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing http JSON body")?;
    write_http_response(
        stream,
        status_code,
        "application/json; charset=utf-8",
        &body,
    )
    .await
}

async fn write_http_response(
    stream: &mut TcpStream,
    status_code: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing http headers")?;
    stream
        .write_all(body)
        .await
        .context("failed writing http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Map;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::dispatcher::Dispatcher;
    use crate::error::{PipelineError, PipelineResult};
    use crate::operations::testing::context;
    use crate::pipeline::testing::StubResolver;
    use crate::resolver::Plan;
    use crate::sandbox::SandboxGuard;

    struct Running {
        bind: String,
        guard: SandboxGuard,
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<Result<()>>,
    }

    impl Running {
        async fn stop(mut self) {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
        }
    }

    fn reserve_bind() -> Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(addr.to_string())
    }

    fn plan(name: &str, arguments: Value) -> Plan {
        Plan::new(name, arguments.as_object().cloned().unwrap_or_else(Map::new))
    }

    async fn start(tag: &str, answer: PipelineResult<Plan>, max_request_bytes: usize) -> Running {
        let bind = reserve_bind().expect("reserve bind");
        let dispatcher = Dispatcher::new(context(tag), &RuntimeConfig::default());
        let pipeline = Arc::new(TaskPipeline::new(
            Arc::new(StubResolver::new(answer)),
            dispatcher,
        ));
        let guard = pipeline.guard().clone();
        let server = TaskServer::new(
            ServerConfig {
                bind: bind.clone(),
                max_request_bytes,
            },
            pipeline,
        );
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });
        for _ in 0..50 {
            if TcpStream::connect(&bind).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Running {
            bind,
            guard,
            shutdown: Some(tx),
            task,
        }
    }

    fn split_response(raw: &[u8]) -> Result<(u16, &[u8])> {
        let idx = raw
            .windows(4)
            .position(|chunk| chunk == b"\r\n\r\n")
            .ok_or_else(|| anyhow::anyhow!("missing HTTP body"))?;
        let head = String::from_utf8_lossy(&raw[..idx]);
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("missing status code"))?;
        Ok((status, &raw[idx + 4..]))
    }

    async fn http_raw(bind: &str, method: &str, path: &str, body: &[u8]) -> Result<(u16, Vec<u8>)> {
        let mut stream = TcpStream::connect(bind).await?;
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {bind}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let mut payload = request.into_bytes();
        payload.extend_from_slice(body);
        stream.write_all(&payload).await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        let (status, body) = split_response(&raw)?;
        Ok((status, body.to_vec()))
    }

    async fn http_json(bind: &str, method: &str, path: &str, body: &[u8]) -> Result<(u16, Value)> {
        let (status, body) = http_raw(bind, method, path, body).await?;
        Ok((status, serde_json::from_slice(&body)?))
    }

    #[tokio::test]
    async fn health_and_operations_describe_the_catalog() {
        let running = start("server-health", Err(PipelineError::unknown_operation("x")), 64 * 1024).await;
        let (status, health) = http_json(&running.bind, "GET", "/health", b"").await.expect("health");
        assert_eq!(status, 200);
        assert_eq!(health["operations"], json!(catalog().len()));

        let (status, tools) = http_json(&running.bind, "GET", "/operations", b"").await.expect("operations");
        assert_eq!(status, 200);
        assert_eq!(tools["count"], json!(10));
        assert_eq!(tools["tools"][0]["type"], json!("function"));

        let (status, welcome) = http_json(&running.bind, "GET", "/", b"").await.expect("welcome");
        assert_eq!(status, 200);
        assert!(welcome["message"].as_str().is_some_and(|text| !text.is_empty()));
        running.stop().await;
    }

    #[tokio::test]
    async fn run_via_query_writes_file_readable_over_read() {
        let running = start(
            "server-run",
            Ok(plan(
                "count_weekday",
                json!({
                    "input_file_path": "data/dates.txt",
                    "weekday_to_count": "Monday",
                    "output_file_path": "data/out.txt"
                }),
            )),
            64 * 1024,
        )
        .await;
        let dates = running.guard.resolve("dates.txt").expect("dates");
        std::fs::write(dates.as_path(), "2024-01-01\n2024-01-08\n2024-01-09\n").expect("seed");

        let (status, doc) = http_json(
            &running.bind,
            "POST",
            "/run?task=count%20Mondays%20in%20dates.txt",
            b"",
        )
        .await
        .expect("run");
        assert_eq!(status, 200, "{doc}");
        assert_eq!(doc["status"], json!("success"));
        assert_eq!(doc["count"], json!(2));

        let (status, body) = http_raw(&running.bind, "GET", "/read?path=data/out.txt", b"")
            .await
            .expect("read");
        assert_eq!(status, 200);
        assert_eq!(body, b"2");
        running.stop().await;
    }

    #[tokio::test]
    async fn run_accepts_json_body_and_reports_errors_as_400() {
        let running = start(
            "server-run-body",
            Err(PipelineError::classification_unavailable("status=503")),
            64 * 1024,
        )
        .await;
        let (status, doc) = http_json(
            &running.bind,
            "POST",
            "/run",
            br#"{"task": "sort the contacts"}"#,
        )
        .await
        .expect("run");
        assert_eq!(status, 400);
        assert_eq!(doc["status"], json!("error"));

        let (status, doc) = http_json(&running.bind, "POST", "/run", b"").await.expect("run empty");
        assert_eq!(status, 400);
        assert_eq!(doc["message"], json!("task is required"));
        running.stop().await;
    }

    #[tokio::test]
    async fn read_maps_failures_to_status_codes() {
        let running = start("server-read", Err(PipelineError::unknown_operation("x")), 64 * 1024).await;
        let cases = [
            ("/read", 400),
            ("/read?path=../../etc/passwd", 403),
            ("/read?path=data/missing.txt", 404),
        ];
        for (path, expected) in cases {
            let (status, _) = http_raw(&running.bind, "GET", path, b"").await.expect("read");
            assert_eq!(status, expected, "{path}");
        }
        running.stop().await;
    }

    #[tokio::test]
    async fn unknown_routes_and_methods() {
        let running = start("server-routes", Err(PipelineError::unknown_operation("x")), 64 * 1024).await;
        let (status, _) = http_json(&running.bind, "GET", "/nope", b"").await.expect("404");
        assert_eq!(status, 404);
        let (status, _) = http_json(&running.bind, "GET", "/run", b"").await.expect("405");
        assert_eq!(status, 405);
        let (status, _) = http_json(&running.bind, "DELETE", "/read", b"").await.expect("405");
        assert_eq!(status, 405);
        running.stop().await;
    }

    #[tokio::test]
    async fn oversized_requests_are_refused() {
        let running = start("server-oversize", Err(PipelineError::unknown_operation("x")), 512).await;
        let body = vec![b'a'; 1024];
        let (status, _) = http_json(&running.bind, "POST", "/run", &body).await.expect("413");
        assert_eq!(status, 413);
        running.stop().await;
    }

    #[tokio::test]
    async fn overflowing_content_length_is_refused() {
        let running = start("server-overflow", Err(PipelineError::unknown_operation("x")), 64 * 1024).await;
        let mut stream = TcpStream::connect(&running.bind).await.expect("connect");
        let request = format!(
            "POST /run HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            running.bind,
            usize::MAX
        );
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.expect("read");
        let (status, _) = split_response(&raw).expect("response");
        assert_eq!(status, 413);
        running.stop().await;
    }

    #[test]
    fn header_terminator_accepts_bare_newlines() {
        assert_eq!(find_http_header_terminator(b"GET / HTTP/1.1\r\n\r\nbody"), Some((14, 4)));
        assert_eq!(find_http_header_terminator(b"GET / HTTP/1.1\n\n"), Some((14, 2)));
        assert_eq!(find_http_header_terminator(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(parse_http_content_length("POST /run HTTP/1.1\r\ncontent-length: 12"), Some(12));
    }
}
