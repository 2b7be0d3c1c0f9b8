use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const MOCK_TOOL: &str = r#"#!/bin/sh
echo "mock-tool $*"
case "$*" in
  *fail*)
    echo "device rejected image" >&2
    exit 1
    ;;
  *slow*)
    i=0
    while [ "$i" -lt 100 ]; do
      echo "tick $i"
      sleep 0.1
      i=$((i + 1))
    done
    ;;
esac
echo "upgrade applied"
exit 0
"#;

#[tokio::test(flavor = "multi_thread")]
async fn e2e_full_suite() -> AnyResult<()> {
    scenario_cli_maintenance().await?;
    scenario_upgrade_success().await?;
    scenario_failure_and_stop().await?;
    scenario_config_and_strict_mode().await?;
    scenario_error_paths().await?;
    Ok(())
}

async fn scenario_cli_maintenance() -> AnyResult<()> {
    let env = TestEnv::new()?;

    let mut cmd = env.command();
    cmd.arg("migrate");
    let output = env.run_command(cmd)?;
    assert!(output.status.success(), "migrate failed: {}", output.stderr);
    assert!(output.stdout.contains("migrations applied"));

    let pool = env.connect_db().await?;
    let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(&pool)
        .await?;
    assert_eq!(tasks, 0);

    let mut cmd = env.command();
    cmd.arg("no-such-command");
    let output = env.run_command(cmd)?;
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stderr.contains("unknown command"));

    let mut cmd = env.command();
    cmd.arg("http-server").env("NEUP_WORKERS", "many");
    let output = env.run_command(cmd)?;
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stderr.contains("NEUP_WORKERS"));

    Ok(())
}

async fn scenario_upgrade_success() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = env.start_server(|_| {})?;

    let created = server.send(HttpRequest::post_json(
        "/api/tasks",
        &json!({
            "upgrade_type": "force",
            "work_type": "single_process",
            "target_address": "200.200.18.101",
            "version_path": "/builds/v1.2.3",
        }),
    ))?;
    assert_eq!(created.status, 201, "create: {}", created.body_text());
    let task = created.json_body()?;
    assert_eq!(task["status"], "in_progress");
    let id = task["id"].as_i64().unwrap();

    // Follow the task through the incremental cursor only.
    let mut cursor = 0;
    let mut seen: Vec<Value> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let page = server
            .send(HttpRequest::get(&format!("/api/tasks/{id}/logs?after_id={cursor}")))?
            .json_body()?;
        let logs = page["logs"].as_array().cloned().unwrap_or_default();
        cursor = page["last_log_id"].as_i64().unwrap();
        let done = page["status"] != "in_progress";
        seen.extend(logs);
        if done {
            // One more poll picks up anything written with the terminal status.
            let tail = server
                .send(HttpRequest::get(&format!("/api/tasks/{id}/logs?after_id={cursor}")))?
                .json_body()?;
            seen.extend(tail["logs"].as_array().cloned().unwrap_or_default());
            assert_eq!(tail["status"], "success");
            break;
        }
        assert!(Instant::now() < deadline, "task {id} did not finish");
        std::thread::sleep(Duration::from_millis(100));
    }

    let first = seen[0]["message"].as_str().unwrap();
    for value in ["force", "single_process", "200.200.18.101", "/builds/v1.2.3"] {
        assert!(first.contains(value), "initial entry lacks {value}: {first}");
    }
    assert!(seen.iter().any(|entry| {
        entry["message"]
            .as_str()
            .is_some_and(|m| m.contains("--ne-ip 200.200.18.101 --version-path /builds/v1.2.3"))
    }));
    let last = seen.last().unwrap();
    assert_eq!(last["log_type"], "success");

    let all = server
        .send(HttpRequest::get(&format!("/api/tasks/{id}/logs/all")))?
        .json_body()?;
    let all_ids: Vec<i64> = all["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_i64().unwrap())
        .collect();
    let seen_ids: Vec<i64> = seen.iter().map(|e| e["id"].as_i64().unwrap()).collect();
    assert_eq!(seen_ids, all_ids, "cursor polling must see every entry once");

    let listed = server.send(HttpRequest::get("/api/tasks"))?.json_body()?;
    assert_eq!(listed[0]["id"], id);

    let pool = env.connect_db().await?;
    let status: String = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(status, "success");

    Ok(())
}

async fn scenario_failure_and_stop() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = env.start_server(|cmd| {
        cmd.env("NEUP_TOOL_STOP_GRACE_SECS", "1");
    })?;

    let failing = server.create_task("10.1.0.1", "/builds/fail")?;
    let task = server.wait_for_terminal(failing)?;
    assert_eq!(task["status"], "failed");
    let logs = server
        .send(HttpRequest::get(&format!("/api/tasks/{failing}/logs/all")))?
        .json_body()?;
    let entries = logs["logs"].as_array().unwrap();
    assert!(
        entries
            .iter()
            .any(|e| e["message"] == "device rejected image")
    );
    assert_eq!(entries.last().unwrap()["log_type"], "error");

    let slow = server.create_task("10.1.0.2", "/builds/slow")?;
    std::thread::sleep(Duration::from_millis(400));
    let stopped = server.send(HttpRequest::post(&format!("/api/tasks/{slow}/stop")))?;
    assert_eq!(stopped.status, 200);
    assert_eq!(stopped.json_body()?["status"], "stopped");

    // The tool is terminated; nothing may flip the status back.
    std::thread::sleep(Duration::from_millis(1500));
    let task = server
        .send(HttpRequest::get(&format!("/api/tasks/{slow}")))?
        .json_body()?;
    assert_eq!(task["status"], "stopped");
    let logs = server
        .send(HttpRequest::get(&format!("/api/tasks/{slow}/logs/all")))?
        .json_body()?;
    let last = logs["logs"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["log_type"], "warning");
    assert_eq!(last["message"], "upgrade task stopped manually");

    let missing = server.send(HttpRequest::post("/api/tasks/999/stop"))?;
    assert_eq!(missing.status, 404);

    let deleted = server.send(HttpRequest::new("DELETE", &format!("/api/tasks/{slow}")))?;
    assert_eq!(deleted.status, 200);
    assert_eq!(deleted.json_body()?["deleted"], slow);

    let pool = env.connect_db().await?;
    let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_logs WHERE task_id = ?")
        .bind(slow)
        .fetch_one(&pool)
        .await?;
    assert_eq!(orphans, 0);

    Ok(())
}

async fn scenario_config_and_strict_mode() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = env.start_server(|cmd| {
        cmd.env("NEUP_STRICT_CONFIG", "1");
    })?;

    let updated = server.send(HttpRequest::post_json(
        "/api/config",
        &json!({
            "upgrade_type": "force\nnormal",
            "work_type": ["single_process"],
            "environments": json!([
                { "ne_env": "lab", "ne_ip_list": ["10.2.0.1", "10.2.0.2"] }
            ])
            .to_string(),
        }),
    ))?;
    assert_eq!(updated.status, 200, "config update: {}", updated.body_text());

    let config = server.send(HttpRequest::get("/api/config"))?.json_body()?;
    assert_eq!(config["upgrade_type"], json!(["force", "normal"]));
    assert_eq!(config["environments"][0]["ne_ip_list"][1], "10.2.0.2");

    let accepted = server.create_task("10.2.0.1", "/builds/ok")?;
    assert_eq!(server.wait_for_terminal(accepted)?["status"], "success");

    let rejected = server.send(HttpRequest::post_json(
        "/api/tasks",
        &json!({
            "upgrade_type": "force",
            "work_type": "single_process",
            "ne_ip": "10.9.9.9",
            "version_path": "/builds/ok",
        }),
    ))?;
    assert_eq!(rejected.status, 400);
    assert_eq!(rejected.json_body()?["error"], "validation");

    Ok(())
}

async fn scenario_error_paths() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let server = env.start_server(|_| {})?;

    let health = server.send(HttpRequest::get("/health"))?;
    assert_eq!(health.status, 200);
    assert_eq!(health.json_body()?["status"], "ok");

    let unknown_logs = server.send(HttpRequest::get("/api/tasks/999/logs"))?;
    assert_eq!(unknown_logs.status, 404);
    assert_eq!(unknown_logs.json_body()?["error"], "not-found");

    let missing_fields = server.send(HttpRequest::post_json(
        "/api/tasks",
        &json!({ "upgrade_type": "force", "target_address": "" }),
    ))?;
    assert_eq!(missing_fields.status, 400);
    let message = missing_fields.json_body()?["message"].to_string();
    for field in ["work_type", "target_address", "version_path"] {
        assert!(message.contains(field), "{message} should name {field}");
    }

    let bad_cursor = server.send(HttpRequest::get("/api/tasks/1/logs?last_log_id=abc"))?;
    assert_eq!(bad_cursor.status, 400);

    let bad_limit = server.send(HttpRequest::get("/api/tasks?limit=-1"))?;
    assert_eq!(bad_limit.status, 400);

    let wrong_method = server.send(HttpRequest::new("PATCH", "/api/config"))?;
    assert_eq!(wrong_method.status, 405);

    let not_found = server.send(HttpRequest::get("/api/unknown"))?;
    assert_eq!(not_found.status, 404);

    let pool = env.connect_db().await?;
    let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(&pool)
        .await?;
    assert_eq!(tasks, 0, "rejected requests must not write rows");

    Ok(())
}

fn free_local_addr() -> AnyResult<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}

struct TestEnv {
    #[allow(dead_code)]
    temp: TempDir,
    state_dir: PathBuf,
    db_path: PathBuf,
    bin_path: PathBuf,
    tool_path: PathBuf,
}

impl TestEnv {
    fn new() -> AnyResult<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().to_path_buf();
        let state_dir = root.join("state");
        fs::create_dir_all(&state_dir)?;
        let db_path = root.join("db/ne-upgrade-orchestrator.db");
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&db_path)?;
        let tool_path = write_executable_script(&root, "mock-ssh-cli", MOCK_TOOL)?;
        let bin_path = PathBuf::from(env!("CARGO_BIN_EXE_ne-upgrade-orchestrator"));
        Ok(Self {
            temp,
            state_dir,
            db_path,
            bin_path,
            tool_path,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("NEUP_ENV", "test");
        cmd.env("NEUP_STATE_DIR", &self.state_dir);
        cmd.env("NEUP_DB_URL", self.db_url());
        cmd.env("NEUP_EXECUTOR", "command");
        cmd.env("NEUP_TOOL_CMD", &self.tool_path);
        cmd.env("NEUP_LOG_LEVEL", "warn");
        cmd.env_remove("RUST_LOG");
        cmd.stdin(Stdio::null());
        cmd
    }

    fn db_url(&self) -> String {
        format!("sqlite://{}", self.db_path.display())
    }

    fn run_command(&self, mut cmd: Command) -> AnyResult<CommandResult> {
        let output = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).output()?;
        Ok(CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn connect_db(&self) -> AnyResult<SqlitePool> {
        Ok(SqlitePool::connect(&self.db_url()).await?)
    }

    fn start_server<F>(&self, configure: F) -> AnyResult<ServerGuard>
    where
        F: FnOnce(&mut Command),
    {
        let addr = free_local_addr()?;
        let mut cmd = self.command();
        cmd.arg("http-server");
        cmd.env("NEUP_HTTP_ADDR", &addr);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        configure(&mut cmd);
        let child = cmd.spawn()?;
        let server = ServerGuard { child, addr };

        // Give the server a short window to start listening.
        let mut last_err: Option<String> = None;
        for _ in 0..50 {
            match server.send(HttpRequest::get("/health")) {
                Ok(response) if response.status == 200 => return Ok(server),
                Ok(response) => last_err = Some(format!("status {}", response.status)),
                Err(err) => last_err = Some(err.to_string()),
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(format!(
            "http-server did not start on {} in time: last_err={last_err:?}",
            server.addr
        )
        .into())
    }
}

fn write_executable_script(dir: &Path, name: &str, body: &str) -> AnyResult<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, body)?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms)?;
    Ok(path)
}

struct ServerGuard {
    child: Child,
    addr: String,
}

impl ServerGuard {
    fn send(&self, request: HttpRequest) -> AnyResult<HttpResponse> {
        let mut stream = TcpStream::connect(&self.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.write_all(&request.into_bytes())?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        HttpResponse::parse(&buf)
    }

    fn create_task(&self, target: &str, version_path: &str) -> AnyResult<i64> {
        let response = self.send(HttpRequest::post_json(
            "/api/tasks",
            &json!({
                "upgrade_type": "force",
                "work_type": "single_process",
                "target_address": target,
                "version_path": version_path,
            }),
        ))?;
        if response.status != 201 {
            return Err(format!("create failed: {}", response.body_text()).into());
        }
        response.json_body()?["id"]
            .as_i64()
            .ok_or_else(|| "task id missing".into())
    }

    fn wait_for_terminal(&self, id: i64) -> AnyResult<Value> {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let task = self
                .send(HttpRequest::get(&format!("/api/tasks/{id}")))?
                .json_body()?;
            if task["status"] != "in_progress" {
                return Ok(task);
            }
            if Instant::now() >= deadline {
                return Err(format!("task {id} did not finish").into());
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct CommandResult {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

struct HttpRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    fn post(path: &str) -> Self {
        Self::new("POST", path)
    }

    fn post_json(path: &str, payload: &Value) -> Self {
        Self::post(path)
            .header("content-type", "application/json")
            .body(payload.to_string().into_bytes())
    }

    fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            headers: vec![("host".into(), "localhost".into())],
            body: Vec::new(),
        }
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut lines = Vec::new();
        lines.push(format!("{} {} HTTP/1.1\r\n", self.method, self.path));
        for (name, value) in &self.headers {
            lines.push(format!("{name}: {value}\r\n"));
        }
        lines.push(format!("Content-Length: {}\r\n", self.body.len()));
        lines.push("Connection: close\r\n".into());
        lines.push("\r\n".into());

        let mut payload: Vec<u8> = lines.into_iter().flat_map(|s| s.into_bytes()).collect();
        payload.extend_from_slice(&self.body);
        payload
    }
}

struct HttpResponse {
    status: u16,
    #[allow(dead_code)]
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn parse(raw: &[u8]) -> AnyResult<Self> {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .ok_or_else(|| io::Error::other("invalid HTTP response"))?;
        let (head, body) = raw.split_at(split + 4);
        let head_str = String::from_utf8_lossy(head);
        let mut lines = head_str.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| io::Error::other("missing status line"))?;
        let status = status_line
            .split(' ')
            .nth(1)
            .ok_or_else(|| io::Error::other("missing status code"))?
            .parse::<u16>()?;

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    fn json_body(&self) -> AnyResult<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}
