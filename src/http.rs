//! Blocking HTTP/1.1 front end: one thread per connection, `Connection:
//! close` on every response, JSON bodies and one SSE endpoint.

use crate::error::TaskError;
use crate::fanout::{FanoutEvent, Next};
use crate::lifecycle::{CreateTaskRequest, STOP_MESSAGE, TaskManager};
use crate::log_cursor;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use url::Url;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 1024 * 1024;
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static TASK_ROUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/api/tasks/(\d+)(/logs|/logs/all|/stop|/stream)?/?$")
        .expect("constant regex pattern is valid")
});

struct RequestContext {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
    request_id: String,
}

/// Accepts connections forever, one handler thread each.
pub fn serve(listener: TcpListener, manager: Arc<TaskManager>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let manager = Arc::clone(&manager);
                let spawned = thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &manager) {
                            tracing::warn!(peer = %peer, error = %err, "connection-failed");
                        }
                    });
                if let Err(err) = spawned {
                    tracing::error!(peer = %peer, error = %err, "connection-thread-spawn-failed");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                // avoid busy loop on fatal errors
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn handle_connection(stream: TcpStream, manager: &TaskManager) -> Result<(), String> {
    let started_at = Instant::now();
    let request_id = next_request_id();
    stream
        .set_nodelay(true)
        .map_err(|e| format!("set_nodelay failed: {e}"))?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|e| format!("set_read_timeout failed: {e}"))?;
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|e| format!("failed to clone stream: {e}"))?,
    );
    let mut out = stream;

    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|e| e.to_string())?;
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    let (method, raw_target) = parse_request_line(&request_line);
    if method.is_empty() || raw_target.is_empty() {
        let status = respond_error(&mut out, 400, "BadRequest", "bad-request", "bad request line")?;
        access_log(&request_id, &method, &raw_target, status, started_at);
        return Ok(());
    }

    let (path, raw_query) = match parse_target(&raw_target) {
        Ok(parts) => parts,
        Err(e) => {
            let status = respond_error(&mut out, 400, "BadRequest", "bad-request", &e)?;
            access_log(&request_id, &method, &raw_target, status, started_at);
            return Ok(());
        }
    };

    let headers = read_headers(&mut reader)?;
    let content_length = match headers.get("content-length").map(|v| v.trim().parse::<usize>()) {
        None => None,
        Some(Ok(len)) => Some(len),
        Some(Err(_)) => {
            let status = respond_error(
                &mut out,
                400,
                "BadRequest",
                "bad-request",
                "invalid Content-Length header",
            )?;
            access_log(&request_id, &method, &path, status, started_at);
            return Ok(());
        }
    };
    let chunked = headers
        .get("transfer-encoding")
        .map(|enc| enc.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    // Only read a body the client explicitly announced; reading to EOF would
    // deadlock on clients that keep the socket open.
    let mut body = Vec::new();
    if let Some(len) = content_length {
        if len > MAX_BODY_BYTES {
            let status = respond_error(
                &mut out,
                413,
                "PayloadTooLarge",
                "validation",
                "request body too large",
            )?;
            access_log(&request_id, &method, &path, status, started_at);
            return Ok(());
        }
        body.resize(len, 0);
        reader
            .read_exact(&mut body)
            .map_err(|e| format!("failed to read body: {e}"))?;
    } else if chunked {
        body = read_chunked_body(&mut reader)?;
    }

    let ctx = RequestContext {
        method,
        path,
        query: parse_query(raw_query.as_deref()),
        body,
        request_id,
    };
    let status = route(&ctx, manager, &mut out)?;
    access_log(&ctx.request_id, &ctx.method, &ctx.path, status, started_at);
    Ok(())
}

fn access_log(request_id: &str, method: &str, path: &str, status: u16, started_at: Instant) {
    tracing::info!(
        request_id,
        method,
        path,
        status,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "request"
    );
}

fn route<W: Write>(ctx: &RequestContext, manager: &TaskManager, out: &mut W) -> Result<u16, String> {
    if ctx.path == "/health" {
        return match ctx.method.as_str() {
            "GET" => handle_health(manager, out),
            _ => method_not_allowed(out),
        };
    }
    if ctx.path == "/api/config" || ctx.path == "/api/config/" {
        return handle_config_api(ctx, manager, out);
    }
    if ctx.path == "/api/tasks" || ctx.path == "/api/tasks/" {
        return match ctx.method.as_str() {
            "GET" => handle_list_tasks(ctx, manager, out),
            "POST" => handle_create_task(ctx, manager, out),
            _ => method_not_allowed(out),
        };
    }
    if let Some(caps) = TASK_ROUTE.captures(&ctx.path) {
        let Ok(id) = caps[1].parse::<i64>() else {
            return respond_error(out, 404, "NotFound", "not-found", "task not found");
        };
        let action = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        return match (ctx.method.as_str(), action) {
            ("GET", "") => respond_result(out, 200, "OK", manager.get_task(id)),
            ("DELETE", "") => respond_result(
                out,
                200,
                "OK",
                manager.delete_task(id).map(|()| json!({ "deleted": id })),
            ),
            ("GET", "/logs") => {
                let page = log_cursor::parse_after_id(&ctx.query).and_then(|after_id| {
                    log_cursor::fetch(manager.store(), id, after_id, manager.stale_after())
                });
                respond_result(out, 200, "OK", page)
            }
            ("GET", "/logs/all") => {
                respond_result(out, 200, "OK", log_cursor::fetch_all(manager.store(), id))
            }
            ("POST", "/stop") => respond_result(
                out,
                200,
                "OK",
                manager.stop_task(id).map(|task| {
                    json!({ "id": task.id, "status": task.status, "message": STOP_MESSAGE })
                }),
            ),
            ("GET", "/stream") => handle_task_stream(ctx, manager, id, out),
            _ => method_not_allowed(out),
        };
    }
    respond_error(out, 404, "NotFound", "not-found", "not found")
}

fn handle_health<W: Write>(manager: &TaskManager, out: &mut W) -> Result<u16, String> {
    let db_error = manager.store().ping().err().map(|e| e.to_string());
    let healthy = db_error.is_none();
    let payload = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "db": { "url": manager.store().url(), "error": db_error },
        "workers": {
            "capacity": manager.capacity(),
            "outstanding": manager.outstanding(),
        },
    });
    if healthy {
        respond_json(out, 200, "OK", &payload)
    } else {
        respond_json(out, 503, "ServiceUnavailable", &payload)
    }
}

fn handle_config_api<W: Write>(
    ctx: &RequestContext,
    manager: &TaskManager,
    out: &mut W,
) -> Result<u16, String> {
    match ctx.method.as_str() {
        "GET" => respond_result(
            out,
            200,
            "OK",
            manager.device_config().map(|config| config.to_json()),
        ),
        "POST" => {
            let result = parse_json_body::<Map<String, Value>>(ctx).and_then(|update| {
                let mut config = manager.device_config()?;
                config.apply_update(&update).map_err(TaskError::Validation)?;
                manager.store().save_device_config(&config)?;
                tracing::info!(
                    upgrade_types = config.upgrade_types.len(),
                    work_types = config.work_types.len(),
                    environments = config.environments.len(),
                    "device config updated"
                );
                Ok(config.to_json())
            });
            respond_result(out, 200, "OK", result)
        }
        _ => method_not_allowed(out),
    }
}

fn handle_list_tasks<W: Write>(
    ctx: &RequestContext,
    manager: &TaskManager,
    out: &mut W,
) -> Result<u16, String> {
    let limit = match ctx.query.get("limit").map(|raw| raw.trim()) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<usize>().map(Some).map_err(|_| {
            TaskError::Validation(format!("limit must be a positive integer, got {raw:?}"))
        }),
    };
    respond_result(
        out,
        200,
        "OK",
        limit.and_then(|limit| manager.list_tasks(limit)),
    )
}

fn handle_create_task<W: Write>(
    ctx: &RequestContext,
    manager: &TaskManager,
    out: &mut W,
) -> Result<u16, String> {
    let result = parse_json_body::<CreateTaskRequest>(ctx)
        .and_then(|request| manager.create_task(&request));
    if let Err(err) = &result {
        tracing::warn!(request_id = %ctx.request_id, kind = err.kind(), error = %err, "create-task-rejected");
    }
    respond_result(out, 201, "Created", result)
}

/// Replays stored entries after the client's cursor, then relays live
/// events until the task reaches a terminal status.
fn handle_task_stream<W: Write>(
    ctx: &RequestContext,
    manager: &TaskManager,
    id: i64,
    out: &mut W,
) -> Result<u16, String> {
    let after_id = match log_cursor::parse_after_id(&ctx.query) {
        Ok(after_id) => after_id,
        Err(err) => return respond_task_error(out, &err),
    };
    if let Err(err) = manager.get_task(id) {
        return respond_task_error(out, &err);
    }

    // Subscribe before reading the backlog so nothing falls in between.
    let subscription = manager.notifier().subscribe(id);
    if let Err(err) = write_sse_headers(out) {
        return client_gone(err);
    }

    let mut last_id = after_id;
    match stream_catch_up(manager, id, &mut last_id, out) {
        Ok(Some(status)) if status.is_terminal() => {
            return finish_stream(out, &FanoutEvent::Status { status });
        }
        Ok(_) => {}
        Err(err) => return client_gone(err),
    }

    loop {
        let sent = match subscription.next_timeout(SSE_KEEPALIVE) {
            Next::Event(FanoutEvent::Log { id: log_id, .. }) if log_id <= last_id => Ok(()),
            Next::Event(event @ FanoutEvent::Log { id: log_id, .. }) => {
                last_id = log_id;
                write_sse_event(out, event.name(), Some(log_id), &event.to_json().to_string())
            }
            Next::Event(FanoutEvent::Status { status }) => {
                if let Err(err) = stream_catch_up(manager, id, &mut last_id, out) {
                    return client_gone(err);
                }
                if status.is_terminal() {
                    return finish_stream(out, &FanoutEvent::Status { status });
                }
                let event = FanoutEvent::Status { status };
                write_sse_event(out, event.name(), None, &event.to_json().to_string())
            }
            Next::Idle => out.write_all(b": keep-alive\n\n").and_then(|()| out.flush()),
            Next::Closed => {
                // Closed by a terminal transition, or the task was deleted.
                return match stream_catch_up(manager, id, &mut last_id, out) {
                    Ok(Some(status)) => finish_stream(out, &FanoutEvent::Status { status }),
                    Ok(None) => Ok(200),
                    Err(err) => client_gone(err),
                };
            }
        };
        if let Err(err) = sent {
            return client_gone(err);
        }
    }
}

/// Writes stored entries newer than `last_id` and returns the task's current
/// status, or `None` once the task is gone.
fn stream_catch_up<W: Write>(
    manager: &TaskManager,
    id: i64,
    last_id: &mut i64,
    out: &mut W,
) -> io::Result<Option<crate::store::TaskStatus>> {
    let backlog = manager.store().logs_after(id, *last_id);
    let task = manager.store().get_task(id);
    let (Ok(backlog), Ok(task)) = (backlog, task) else {
        tracing::warn!(task_id = id, "stream catch-up read failed");
        return Ok(None);
    };
    for entry in backlog {
        *last_id = (*last_id).max(entry.id);
        let event = FanoutEvent::from_entry(&entry);
        write_sse_event(out, event.name(), Some(entry.id), &event.to_json().to_string())?;
    }
    Ok(task.map(|task| task.status))
}

fn finish_stream<W: Write>(out: &mut W, event: &FanoutEvent) -> Result<u16, String> {
    match write_sse_event(out, event.name(), None, &event.to_json().to_string()) {
        Ok(()) => Ok(200),
        Err(err) => client_gone(err),
    }
}

fn client_gone(err: io::Error) -> Result<u16, String> {
    if is_disconnect(&err) {
        Ok(200)
    } else {
        Err(format!("stream write failed: {err}"))
    }
}

fn parse_json_body<T: serde::de::DeserializeOwned>(ctx: &RequestContext) -> Result<T, TaskError> {
    let body: &[u8] = if ctx.body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &ctx.body
    };
    serde_json::from_slice(body).map_err(|e| TaskError::Validation(format!("invalid JSON body: {e}")))
}

fn parse_request_line(request_line: &str) -> (String, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    (method, target)
}

fn parse_target(raw_target: &str) -> Result<(String, Option<String>), String> {
    if raw_target.is_empty() {
        return Err("empty target".into());
    }

    // Support both absolute-form and origin-form targets.
    let url = if raw_target.starts_with("http://") || raw_target.starts_with("https://") {
        Url::parse(raw_target).map_err(|e| e.to_string())?
    } else {
        Url::parse(&format!("http://dummy{raw_target}")).map_err(|e| e.to_string())?
    };

    Ok((url.path().to_string(), url.query().map(str::to_string)))
}

fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    raw.map(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    })
    .unwrap_or_default()
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| format!("failed to read header: {e}"))?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if read == 0 || trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, String> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        let read = reader
            .read_line(&mut size_line)
            .map_err(|e| format!("failed to read chunk size: {e}"))?;
        if read == 0 {
            return Err("unexpected end of chunked body".into());
        }
        // Chunk extensions (";name=value") are ignored.
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        if size_str.is_empty() {
            continue;
        }

        let size = usize::from_str_radix(size_str, 16)
            .map_err(|e| format!("invalid chunk size '{size_str}': {e}"))?;

        if size == 0 {
            loop {
                let mut trailer = String::new();
                let read = reader
                    .read_line(&mut trailer)
                    .map_err(|e| format!("failed to read chunk trailer: {e}"))?;
                if read == 0 || trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Err("chunked body too large".into());
        }

        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .map_err(|e| format!("failed to read chunk body: {e}"))?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .map_err(|e| format!("failed to read chunk terminator: {e}"))?;
    }

    Ok(body)
}

fn write_payload_response<W: Write>(
    out: &mut W,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    write!(out, "HTTP/1.1 {status} {reason}\r\n")?;
    write!(out, "Content-Type: {content_type}\r\n")?;
    write!(out, "Content-Length: {}\r\n", body.len())?;
    out.write_all(b"Connection: close\r\n")?;
    out.write_all(b"\r\n")?;
    out.write_all(body)?;
    out.flush()
}

fn write_sse_headers<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(b"HTTP/1.1 200 OK\r\n")?;
    out.write_all(b"Content-Type: text/event-stream\r\n")?;
    out.write_all(b"Cache-Control: no-cache\r\n")?;
    out.write_all(b"Connection: close\r\n")?;
    out.write_all(b"\r\n")?;
    out.write_all(b"retry: 15000\n\n")?;
    out.flush()
}

fn write_sse_event<W: Write>(out: &mut W, event: &str, id: Option<i64>, data: &str) -> io::Result<()> {
    if let Some(id) = id {
        writeln!(out, "id: {id}")?;
    }
    writeln!(out, "event: {event}")?;
    for line in data.lines() {
        writeln!(out, "data: {line}")?;
    }
    out.write_all(b"\n")?;
    out.flush()
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

fn send_payload<W: Write>(
    out: &mut W,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> Result<u16, String> {
    match write_payload_response(out, status, reason, content_type, body) {
        Ok(()) => Ok(status),
        Err(err) if is_disconnect(&err) => Ok(status),
        Err(err) => Err(format!("failed to write response: {err}")),
    }
}

fn respond_json<W: Write>(out: &mut W, status: u16, reason: &str, payload: &Value) -> Result<u16, String> {
    let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
    send_payload(out, status, reason, "application/json; charset=utf-8", &body)
}

fn respond_error<W: Write>(
    out: &mut W,
    status: u16,
    reason: &str,
    kind: &str,
    message: &str,
) -> Result<u16, String> {
    respond_json(out, status, reason, &json!({ "error": kind, "message": message }))
}

fn respond_task_error<W: Write>(out: &mut W, err: &TaskError) -> Result<u16, String> {
    if let TaskError::Store(inner) = err {
        tracing::error!(error = %inner, "request-persistence-failure");
    }
    let (status, reason) = err.status();
    respond_error(out, status, reason, err.kind(), &err.to_string())
}

fn respond_result<W: Write, T: Serialize>(
    out: &mut W,
    status: u16,
    reason: &str,
    result: Result<T, TaskError>,
) -> Result<u16, String> {
    match result {
        Ok(value) => {
            let payload = serde_json::to_value(value).map_err(|e| e.to_string())?;
            respond_json(out, status, reason, &payload)
        }
        Err(err) => respond_task_error(out, &err),
    }
}

fn method_not_allowed<W: Write>(out: &mut W) -> Result<u16, String> {
    respond_error(
        out,
        405,
        "MethodNotAllowed",
        "method-not-allowed",
        "method not allowed",
    )
}

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    format!("{ts:x}-{seq:04x}")
}
