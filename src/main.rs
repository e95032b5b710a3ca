// src/main.rs

//! The main entry point for the ahad server and its provisioning tool.

use ahad::client;
use ahad::config::CellConfig;
use ahad::core::urls::UrlInfo;
use anyhow::Result;
use serde_json::{Value, json};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("ahad version {VERSION}");
        return Ok(());
    }

    if args.len() > 1 && args[1] == "--provision" {
        // --- Provisioning tool mode ---
        init_logging("warn");
        let code = run_provision_tool(&args[2..]).await;
        std::process::exit(code);
    }

    if args.len() > 1 && args[1] == "--enroll" {
        // --- User enrollment mode ---
        init_logging("info");
        if args.len() != 4 {
            eprintln!("Usage: ahad --enroll <one-time-url> <dir>");
            std::process::exit(1);
        }
        if let Err(e) = client::bootstrap::enroll_user(Path::new(&args[3]), &args[2]).await {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
        return Ok(());
    }

    // --- Server mode ---
    let dirn = match args.get(1) {
        Some(dirn) if !dirn.starts_with("--") => Path::new(dirn).to_path_buf(),
        _ => {
            eprintln!("Usage: ahad <celldir> [--auth-passwd <passwd>]");
            std::process::exit(1);
        }
    };

    let mut conf = match CellConfig::from_dir(&dirn) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{}\": {e}", dirn.display());
            std::process::exit(1);
        }
    };

    if let Some(i) = args.iter().position(|arg| arg == "--auth-passwd") {
        match args.get(i + 1) {
            Some(passwd) => conf.auth_passwd = Some(passwd.clone()),
            None => {
                eprintln!("--auth-passwd flag requires a value");
                std::process::exit(1);
            }
        }
    }

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| conf.log_level.clone());
    init_logging(&log_level);

    if let Err(e) = ahad::server::run(&dirn, conf).await {
        error!("Server runtime error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::new(env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_ansi(true)
        .init();
}

/// `ahad --provision --url <aha-url> <name> [--mirror <leader>]
///  [--dmon-port N] [--https-port N] [--cellconf <toml>] [--only-url]`
///
/// Prints the one-time URL on success. Exits 1 with an `ERROR:` line on
/// invalid ports or a network mismatch.
async fn run_provision_tool(args: &[String]) -> i32 {
    let mut url = None;
    let mut name = None;
    let mut mirror = None;
    let mut dmon_port = None;
    let mut https_port = None;
    let mut cellconf = None;
    let mut only_url = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--url" => url = iter.next().cloned(),
            "--mirror" => mirror = iter.next().cloned(),
            "--dmon-port" => dmon_port = iter.next().cloned(),
            "--https-port" => https_port = iter.next().cloned(),
            "--cellconf" => cellconf = iter.next().cloned(),
            "--only-url" => only_url = true,
            other if !other.starts_with("--") && name.is_none() => {
                name = Some(other.to_string());
            }
            other => {
                eprintln!("ERROR: unknown argument: {other}");
                return 1;
            }
        }
    }

    let (Some(url), Some(name)) = (url, name) else {
        eprintln!("Usage: ahad --provision --url <aha-url> <name> [options]");
        return 1;
    };

    let mut provinfo = serde_json::Map::new();

    if let Some(text) = dmon_port {
        match text.parse::<u16>() {
            Ok(port) => {
                provinfo.insert("dmon:port".to_string(), json!(port));
            }
            Err(_) => {
                eprintln!("ERROR: Invalid dmon port: {text}");
                return 1;
            }
        }
    }
    if let Some(text) = https_port {
        match text.parse::<u16>() {
            Ok(port) => {
                provinfo.insert("https:port".to_string(), json!(port));
            }
            Err(_) => {
                eprintln!("ERROR: Invalid HTTPS port: {text}");
                return 1;
            }
        }
    }
    if let Some(leader) = mirror {
        provinfo.insert("mirror".to_string(), json!(leader));
    }
    if let Some(path) = cellconf {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("ERROR: could not read {path}: {e}");
                return 1;
            }
        };
        let table: toml::Table = match toml::from_str(&text) {
            Ok(table) => table,
            Err(e) => {
                eprintln!("ERROR: could not parse {path}: {e}");
                return 1;
            }
        };
        let conf: Value = match serde_json::to_value(&table) {
            Ok(conf) => conf,
            Err(e) => {
                eprintln!("ERROR: could not convert {path}: {e}");
                return 1;
            }
        };
        provinfo.insert("conf".to_string(), conf);
    }

    // Sanity-check the AHA URL shape before dialing.
    if let Err(e) = UrlInfo::chop(&url) {
        eprintln!("ERROR: {e}");
        return 1;
    }

    let timeout = Duration::from_secs(30);
    let proxy = match client::open_url(&url).await {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };

    let params = json!({
        "name": name,
        "provinfo": if provinfo.is_empty() { Value::Null } else { Value::Object(provinfo) },
    });
    match proxy.call("addAhaSvcProv", params, timeout).await {
        Ok(value) => {
            let provurl = value.as_str().unwrap_or_default();
            if only_url {
                println!("{provurl}");
            } else {
                println!("one-time use URL: {provurl}");
            }
            proxy.fini().await;
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            proxy.fini().await;
            1
        }
    }
}
