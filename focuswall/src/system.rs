use crate::command::Options;
use crate::utils::format_utils::format_duration;
use crate::utils::process_utils::run_command;
use anyhow::Context;
use log::{info, warn, LevelFilter};
use std::env;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::str::FromStr;

// ---- 日志 ----
pub fn init_logging(options: &Options) -> Result<(), anyhow::Error> {
    let level = LevelFilter::from_str(options.log_level())
        .map_err(|_| anyhow::anyhow!("Invalid log level '{}'", options.log_level()))?;

    let mut builder = env_logger::Builder::new();
    builder.filter(None, level).format_timestamp_secs();

    match options.log_file() {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(env_logger::Target::Stdout);
        }
    }

    builder.try_init().context("Logger already initialized")?;
    Ok(())
}

// ---- 权限 ----
#[cfg(unix)]
pub fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(windows)]
pub fn is_elevated() -> bool {
    // `net session` only succeeds from an elevated token
    run_command("net", &["session"])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_elevated() -> bool {
    false
}

// ---- DNS 缓存 ----
/// Flush the OS name-resolution cache so redirects and unblocks take effect
/// immediately. Best effort: a missing tool is logged, not returned.
pub fn flush_dns_cache() -> Result<(), anyhow::Error> {
    let attempts: &[(&str, &[&str])] = if cfg!(windows) {
        &[("ipconfig", &["/flushdns"][..])]
    } else if cfg!(target_os = "macos") {
        &[("dscacheutil", &["-flushcache"][..])]
    } else {
        &[
            ("resolvectl", &["flush-caches"][..]),
            ("systemd-resolve", &["--flush-caches"][..]),
        ]
    };

    for (program, args) in attempts {
        match run_command(program, args) {
            Ok(output) if output.status.success() => {
                log::debug!("Flushed DNS cache with {}", program);
                return Ok(());
            }
            Ok(output) => log::debug!("{} exited with {}", program, output.status),
            Err(e) => log::debug!("{}", e),
        }
    }
    Err(anyhow::anyhow!("No DNS cache flush tool succeeded"))
}

// ---- 启动诊断信息 ----
fn read_first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

fn hostname() -> Option<String> {
    if let Some(h) = read_first_line("/proc/sys/kernel/hostname") {
        return Some(h);
    }
    if let Ok(h) = env::var("COMPUTERNAME") {
        return Some(h);
    }
    run_command("hostname", &[])
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
}

pub fn log_startup_info(options: &Options) {
    let app_version = env!("CARGO_PKG_VERSION");
    let cwd = env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(|s| s.to_string()))
        .unwrap_or_default();
    let host = hostname().unwrap_or_else(|| "unknown".to_string());

    info!("focuswall v{} started", app_version);
    info!("Host: {}", host);
    info!("OS: {} ({})", env::consts::OS, env::consts::ARCH);
    info!("Working directory: {}", cwd);
    if !is_elevated() {
        warn!("Not running with administrative rights; enforcement backends will fail");
    }
    info!("Data directory: {}", options.data_dir());
    info!("Hosts file: {}", options.hosts_file());
    info!("Log level: {}", options.log_level());
    info!(
        "Tick: {}, policy reload: {}, watchdog tick: {}",
        format_duration(options.tick_interval()),
        format_duration(options.reload_interval()),
        format_duration(options.watchdog_interval())
    );

    let mut enabled = Vec::new();
    if options.enable_hosts() {
        enabled.push("hosts override");
    }
    if options.enable_rule_filter() {
        enabled.push("rule filter");
    }
    if options.enable_packet_filter() {
        enabled.push("packet filter");
    }
    if enabled.is_empty() {
        warn!("Enabled enforcement backends: None");
    } else {
        info!("Enabled enforcement backends ({}):", enabled.len());
        for name in enabled {
            info!("  • {}", name);
        }
    }

    if !Path::new(options.data_dir()).exists() {
        warn!(
            "Data directory does not exist and will be created during runtime: {}",
            options.data_dir()
        );
    }
}
