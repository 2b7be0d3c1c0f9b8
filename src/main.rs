mod device_config;
mod error;
mod executor;
mod fanout;
mod http;
mod lifecycle;
mod log_cursor;
mod settings;
mod store;
mod telemetry;
mod tool_host;
mod worker_pool;

use crate::executor::build_executor;
use crate::fanout::Notifier;
use crate::lifecycle::TaskManager;
use crate::settings::{Settings, apply_env_profile_defaults};
use crate::store::Store;
use crate::telemetry::{LogOptions, init_logging};
use std::env;
use std::net::TcpListener;
use std::sync::Arc;

const BIN_NAME: &str = "ne-upgrade-orchestrator";

fn main() {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| BIN_NAME.into());
    let Some(raw_cmd) = args.next() else {
        print_usage(&exe);
        std::process::exit(1);
    };

    apply_env_profile_defaults();

    let command = normalize_command(&raw_cmd);
    match command.as_str() {
        "http-server" | "server" => run_http_server_cli(),
        "migrate" => run_migrate_cli(),
        "version" => {
            println!("{}", release_tag());
            std::process::exit(0);
        }
        "help" | "h" => {
            print_usage(&exe);
            std::process::exit(0);
        }
        _ => {
            eprintln!("unknown command: {raw_cmd}");
            print_usage(&exe);
            std::process::exit(2);
        }
    }
}

fn normalize_command(raw: &str) -> String {
    raw.trim_start_matches('-').to_lowercase()
}

fn release_tag() -> String {
    if let Some(tag) = option_env!("NEUP_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let version = option_env!("NEUP_BUILD_VERSION")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(env!("CARGO_PKG_VERSION"));
    format!("v{version}")
}

fn init_logging_or_exit() {
    if let Err(err) = init_logging(&LogOptions::from_env()) {
        eprintln!("failed to initialise logging: {err}");
        std::process::exit(1);
    }
}

fn load_settings_or_exit() -> Settings {
    Settings::load().unwrap_or_else(|err| {
        tracing::error!(error = %err, "invalid configuration");
        eprintln!("invalid configuration: {err}");
        std::process::exit(2);
    })
}

fn open_store_or_exit(url: &str) -> Store {
    Store::open(url).unwrap_or_else(|err| {
        tracing::error!(error = %err, "database unavailable");
        eprintln!("failed to open database: {err}");
        std::process::exit(1);
    })
}

fn run_migrate_cli() -> ! {
    init_logging_or_exit();
    let settings = load_settings_or_exit();
    let store = open_store_or_exit(&settings.db_url);
    println!("migrations applied to {}", store.url());
    std::process::exit(0);
}

fn run_http_server_cli() -> ! {
    init_logging_or_exit();
    let settings = load_settings_or_exit();
    let store = open_store_or_exit(&settings.db_url);

    let executor = build_executor(settings.executor, &settings.tool).unwrap_or_else(|err| {
        tracing::error!(error = %err, "invalid upgrade tool configuration");
        eprintln!("invalid upgrade tool configuration: {err}");
        std::process::exit(2);
    });

    let manager = Arc::new(TaskManager::new(
        store,
        executor,
        Notifier::new(),
        settings.lifecycle.clone(),
        settings.task_list_limit,
    ));

    let addr = settings.http_addr.clone();
    let listener = TcpListener::bind(&addr).unwrap_or_else(|err| {
        eprintln!("failed to bind HTTP address {addr}: {err}");
        std::process::exit(1);
    });
    tracing::info!(
        addr = %addr,
        profile = %settings.profile,
        executor = settings.executor.as_str(),
        "listening"
    );

    http::serve(listener, manager);
    std::process::exit(0);
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {exe} <command>\n");
    eprintln!("Commands:");
    eprintln!("  http-server    Run the HTTP API bound to NEUP_HTTP_ADDR");
    eprintln!("  migrate        Apply database migrations and exit");
    eprintln!("  version        Print the release tag");
    eprintln!("  help           Show this message");
}
