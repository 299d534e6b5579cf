use crate::enforce::{attach_orchestrator, build_orchestrator};
use crate::monitor::{platform_service_control, ReconciliationLoop, ServiceSpec, Watchdog};
use crate::storage::PolicyStore;
use crate::system::{init_logging, log_startup_info};
use crate::utils::format_utils::format_duration;
use crate::utils::shutdown_utils::Shutdown;
use anyhow::Context;
use chrono::Local;
use clap::{ArgAction, Args, Parser, Subcommand};
use focuswall_common::schedule::{parse_time, parse_weekday, parse_weekdays};
use focuswall_common::{BlockList, BlockSession, ScheduleItem};
use log::{info, LevelFilter};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = if cfg!(windows) {
    "C:\\ProgramData\\focuswall"
} else {
    "/var/lib/focuswall"
};

const DEFAULT_HOSTS_FILE: &str = if cfg!(windows) {
    "C:\\Windows\\System32\\drivers\\etc\\hosts"
} else {
    "/etc/hosts"
};

/// Common arguments shared by all commands
#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    #[clap(
        long,
        global = true,
        default_value = DEFAULT_DATA_DIR,
        help = "Data directory (the policy file is stored here)"
    )]
    pub data_dir: String,

    #[clap(
        long,
        global = true,
        default_value = DEFAULT_HOSTS_FILE,
        help = "Hosts file used for name overrides"
    )]
    pub hosts_file: String,

    #[clap(
        long,
        global = true,
        default_value = "info",
        help = "Log level: error, warn, info, debug or trace"
    )]
    pub log_level: String,

    #[clap(long, global = true, help = "Append log records to this file instead of stdout")]
    pub log_file: Option<String>,
}

/// Enforcement backend arguments
#[derive(Debug, Args, Clone)]
pub struct BackendArgs {
    #[clap(
        long = "hosts",
        global = true,
        default_value = "true",
        action = ArgAction::Set,
        help = "Enable the hosts file override backend (enabled by default)"
    )]
    pub enable_hosts: bool,

    #[clap(
        long = "rule-filter",
        global = true,
        default_value = "true",
        action = ArgAction::Set,
        help = "Enable the firewall rule backend (enabled by default)"
    )]
    pub enable_rule_filter: bool,

    #[clap(
        long = "packet-filter",
        global = true,
        default_value = "false",
        action = ArgAction::Set,
        help = "Enable the packet interception backend (disabled by default, inspects all IPv4 TCP traffic)"
    )]
    pub enable_packet_filter: bool,
}

/// Loop timing arguments
#[derive(Debug, Args, Clone)]
pub struct TimingArgs {
    #[clap(long, global = true, default_value = "5", help = "Enforcement tick interval (seconds)")]
    pub tick_secs: u64,

    #[clap(long, global = true, default_value = "5", help = "Policy reload interval (seconds)")]
    pub reload_secs: u64,

    #[clap(long, global = true, default_value = "15", help = "Watchdog tick interval (seconds)")]
    pub watchdog_tick_secs: u64,

    #[clap(long, global = true, default_value = "3000", help = "Per-domain name resolution timeout (milliseconds)")]
    pub resolve_timeout_ms: u64,

    #[clap(long, global = true, default_value = "focuswall", help = "Name of the enforcing system service")]
    pub service_name: String,
}

#[derive(Debug, Subcommand, Clone)]
pub enum SitesAction {
    /// Add domains to the always-blocked list
    Add { domains: Vec<String> },
    /// Remove domains from the always-blocked list
    Remove { domains: Vec<String> },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ListsAction {
    /// Show all block lists
    Show,
    /// Create a block list
    Create {
        name: String,
        #[clap(long = "site")]
        sites: Vec<String>,
    },
    /// Replace the sites of a user block list
    Update {
        id: String,
        #[clap(long = "site")]
        sites: Vec<String>,
    },
    /// Delete a user block list
    Delete { id: String },
}

#[derive(Debug, Subcommand, Clone)]
pub enum SessionAction {
    /// Start a one-time session now
    Start {
        #[clap(long = "list", required = true)]
        lists: Vec<String>,
        #[clap(long, default_value = "120")]
        minutes: u64,
        #[clap(long, default_value = "Quick block")]
        name: String,
    },
    /// Add a weekly recurring session
    Recurring {
        #[clap(long = "list", required = true)]
        lists: Vec<String>,
        #[clap(long, help = "Weekdays, e.g. mon,tue,fri or 1,2,5")]
        days: String,
        #[clap(long, help = "Window start, HH:MM")]
        from: String,
        #[clap(long, help = "Window end, HH:MM (inclusive)")]
        to: String,
        #[clap(long, default_value = "Recurring block")]
        name: String,
    },
    /// Delete a session
    Stop { id: String },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ScheduleAction {
    /// Add a weekly window
    Add { day: String, start: String, end: String },
    /// Remove every window
    Clear,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the enforcing reconciliation loop
    Service,
    /// Keep the enforcing service alive and re-apply blocking if needed
    Watchdog,
    /// Remove all blocking now and set the emergency override
    Restore,
    /// Show the current policy state
    Status,
    /// Turn blocking on
    Enable {
        #[clap(long, help = "Maximum blocking duration in minutes")]
        minutes: Option<u64>,
    },
    /// Turn blocking off
    Disable,
    /// Manage the always-blocked sites
    Sites {
        #[clap(subcommand)]
        action: SitesAction,
    },
    /// Manage block lists
    Lists {
        #[clap(subcommand)]
        action: ListsAction,
    },
    /// Manage blocking sessions
    Session {
        #[clap(subcommand)]
        action: SessionAction,
    },
    /// Manage the weekly blocking schedule
    Schedule {
        #[clap(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Debug, Parser, Clone)]
#[clap(name = "focuswall")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Scheduled website blocking with hosts, firewall and packet filter enforcement")]
pub struct Options {
    #[clap(flatten)]
    pub common: CommonArgs,

    #[clap(flatten)]
    pub backends: BackendArgs,

    #[clap(flatten)]
    pub timing: TimingArgs,

    #[clap(subcommand)]
    pub command: Command,
}

impl Options {
    /// Get data_dir from common args
    pub fn data_dir(&self) -> &str {
        &self.common.data_dir
    }

    /// Get hosts_file from common args
    pub fn hosts_file(&self) -> &str {
        &self.common.hosts_file
    }

    /// Get log_level from common args
    pub fn log_level(&self) -> &str {
        &self.common.log_level
    }

    /// Get log_file from common args
    pub fn log_file(&self) -> Option<&str> {
        self.common.log_file.as_deref()
    }

    pub fn enable_hosts(&self) -> bool {
        self.backends.enable_hosts
    }

    pub fn enable_rule_filter(&self) -> bool {
        self.backends.enable_rule_filter
    }

    pub fn enable_packet_filter(&self) -> bool {
        self.backends.enable_packet_filter
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.timing.tick_secs)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.timing.reload_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.timing.watchdog_tick_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.resolve_timeout_ms)
    }

    pub fn service_name(&self) -> &str {
        &self.timing.service_name
    }

    /// Arguments that make an installed service run with the same configuration.
    pub fn service_args(&self) -> Vec<String> {
        let mut args = vec![
            "--data-dir".to_string(),
            self.data_dir().to_string(),
            "--hosts-file".to_string(),
            self.hosts_file().to_string(),
            "--log-level".to_string(),
            self.log_level().to_string(),
            "--hosts".to_string(),
            self.enable_hosts().to_string(),
            "--rule-filter".to_string(),
            self.enable_rule_filter().to_string(),
            "--packet-filter".to_string(),
            self.enable_packet_filter().to_string(),
            "--tick-secs".to_string(),
            self.timing.tick_secs.to_string(),
            "--reload-secs".to_string(),
            self.timing.reload_secs.to_string(),
            "--resolve-timeout-ms".to_string(),
            self.timing.resolve_timeout_ms.to_string(),
        ];
        if let Some(log_file) = self.log_file() {
            args.push("--log-file".to_string());
            args.push(log_file.to_string());
        }
        args.push("service".to_string());
        args
    }
}

// Validate arguments
fn validate_arguments(opt: &Options) -> Result<(), anyhow::Error> {
    if LevelFilter::from_str(opt.log_level()).is_err() {
        return Err(anyhow::anyhow!("Invalid log level '{}'", opt.log_level()));
    }

    if opt.timing.tick_secs == 0 {
        return Err(anyhow::anyhow!("tick_secs must be greater than 0"));
    }

    if opt.timing.watchdog_tick_secs == 0 {
        return Err(anyhow::anyhow!("watchdog_tick_secs must be greater than 0"));
    }

    if opt.timing.resolve_timeout_ms == 0 {
        return Err(anyhow::anyhow!("resolve_timeout_ms must be greater than 0"));
    }

    if opt.service_name().is_empty() {
        return Err(anyhow::anyhow!("service_name cannot be empty"));
    }

    Ok(())
}

fn run_service(options: &Options) -> Result<(), anyhow::Error> {
    let shutdown = Shutdown::new();
    shutdown.install_signal_handler()?;

    let store = PolicyStore::new(options.data_dir());
    let orchestrator = build_orchestrator(options)?;
    let mut reconciler = ReconciliationLoop::new(
        store,
        orchestrator,
        options.tick_interval(),
        options.reload_interval(),
    );
    reconciler.run(&shutdown);

    info!("Enforcer stopped, program exiting");
    Ok(())
}

fn run_watchdog(options: &Options) -> Result<(), anyhow::Error> {
    let shutdown = Shutdown::new();
    shutdown.install_signal_handler()?;

    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let control = platform_service_control(ServiceSpec {
        name: options.service_name().to_string(),
        exe,
        args: options.service_args(),
    });

    let store = PolicyStore::new(options.data_dir());
    let orchestrator = attach_orchestrator(options)?;
    let mut watchdog = Watchdog::new(control, store, orchestrator, options.watchdog_interval());
    watchdog.run(&shutdown);

    info!("Watchdog stopped, program exiting");
    Ok(())
}

fn run_restore(options: &Options) -> Result<(), anyhow::Error> {
    let store = PolicyStore::new(options.data_dir());
    // Persist first so a running enforcer does not re-apply
    store.update(|p| p.enable_emergency_mode())?;

    let mut orchestrator = attach_orchestrator(options)?;
    if orchestrator.emergency_restore() {
        println!("All blocking removed. Emergency override is set; run `focuswall enable` to resume.");
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Some blocking could not be removed, see the log for details"
        ))
    }
}

fn print_status(options: &Options) -> Result<(), anyhow::Error> {
    let store = PolicyStore::new(options.data_dir());
    let policy = store.load();
    let now = Local::now();

    println!("Policy file:        {}", store.path().display());
    println!("Blocking enabled:   {}", policy.active);
    println!("Emergency override: {}", policy.emergency_override);
    println!("Enforced now:       {}", policy.should_be_active_at(&now));
    if let Some(enabled_at) = policy.enabled_at {
        println!("Enabled at:         {}", enabled_at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(remaining) = policy.remaining_at(&now) {
        println!("Auto-disable in:    {}", format_duration(remaining));
    }

    if !policy.schedule.is_empty() {
        println!("Schedule:");
        for item in &policy.schedule {
            println!(
                "  {} {}-{}{}",
                item.day,
                item.start.format("%H:%M"),
                item.end.format("%H:%M"),
                if item.enabled { "" } else { " (disabled)" }
            );
        }
    }

    if !policy.sessions.is_empty() {
        println!("Sessions:");
        for session in &policy.sessions {
            let state = if session.is_effective_at(&now) {
                "effective"
            } else {
                "idle"
            };
            match session.remaining_at(&now) {
                Some(left) => println!(
                    "  {} {} [{}] {} left",
                    session.id,
                    session.name,
                    state,
                    format_duration(left)
                ),
                None => println!("  {} {} [{}] recurring", session.id, session.name, state),
            }
        }
    }

    let domains = policy.effective_domains_at(&now);
    println!("Effective domains ({}):", domains.len());
    for domain in domains {
        println!("  {}", domain);
    }
    Ok(())
}

fn run_sites(store: &PolicyStore, action: &SitesAction) -> Result<(), anyhow::Error> {
    match action {
        SitesAction::Add { domains } => {
            let added = store.update(|p| domains.iter().filter(|d| p.add_site(d)).count())?;
            println!("Added {} site(s)", added);
        }
        SitesAction::Remove { domains } => {
            let removed = store.update(|p| domains.iter().filter(|d| p.remove_site(d)).count())?;
            println!("Removed {} site(s)", removed);
        }
    }
    Ok(())
}

fn run_lists(store: &PolicyStore, action: &ListsAction) -> Result<(), anyhow::Error> {
    let now = Local::now();
    match action {
        ListsAction::Show => {
            let policy = store.update(|p| {
                p.ensure_builtin_lists(now);
                p.clone()
            })?;
            for list in &policy.block_lists {
                println!(
                    "{} {}{} ({} sites)",
                    list.id,
                    list.name,
                    if list.builtin { " [builtin]" } else { "" },
                    list.sites.len()
                );
                for site in &list.sites {
                    println!("    {}", site);
                }
            }
        }
        ListsAction::Create { name, sites } => {
            let id = store.update(|p| p.add_block_list(BlockList::new(name, sites, now)))?;
            println!("Created block list {}", id);
        }
        ListsAction::Update { id, sites } => {
            store.update(|p| p.update_list_sites(id, sites, now))??;
            println!("Updated block list {}", id);
        }
        ListsAction::Delete { id } => {
            store.update(|p| p.remove_block_list(id))??;
            println!("Deleted block list {}", id);
        }
    }
    Ok(())
}

fn run_session(store: &PolicyStore, action: &SessionAction) -> Result<(), anyhow::Error> {
    let now = Local::now();
    match action {
        SessionAction::Start {
            lists,
            minutes,
            name,
        } => {
            let duration = Duration::from_secs(minutes.saturating_mul(60));
            let session = BlockSession::quick(name, lists.clone(), duration, now);
            let id = store.update(|p| p.add_session(session))?;
            println!("Started session {} for {}", id, format_duration(duration));
        }
        SessionAction::Recurring {
            lists,
            days,
            from,
            to,
            name,
        } => {
            let days = parse_weekdays(days).ok_or_else(|| anyhow::anyhow!("Invalid days '{}'", days))?;
            let from = parse_time(from).ok_or_else(|| anyhow::anyhow!("Invalid time '{}'", from))?;
            let to = parse_time(to).ok_or_else(|| anyhow::anyhow!("Invalid time '{}'", to))?;
            let session = BlockSession::recurring(name, lists.clone(), days, from, to, now);
            let id = store.update(|p| p.add_session(session))?;
            println!("Added recurring session {}", id);
        }
        SessionAction::Stop { id } => {
            store.update(|p| p.remove_session(id))??;
            println!("Removed session {}", id);
        }
    }
    Ok(())
}

fn run_schedule(store: &PolicyStore, action: &ScheduleAction) -> Result<(), anyhow::Error> {
    match action {
        ScheduleAction::Add { day, start, end } => {
            let day = parse_weekday(day).ok_or_else(|| anyhow::anyhow!("Invalid day '{}'", day))?;
            let start = parse_time(start).ok_or_else(|| anyhow::anyhow!("Invalid time '{}'", start))?;
            let end = parse_time(end).ok_or_else(|| anyhow::anyhow!("Invalid time '{}'", end))?;
            if start > end {
                return Err(anyhow::anyhow!("Window start must not be after its end"));
            }
            store.update(|p| p.schedule.push(ScheduleItem::new(day, start, end)))?;
            println!("Added schedule window {} {}-{}", day, start.format("%H:%M"), end.format("%H:%M"));
        }
        ScheduleAction::Clear => {
            store.update(|p| p.schedule.clear())?;
            println!("Schedule cleared; blocking applies whenever enabled");
        }
    }
    Ok(())
}

pub fn run(options: Options) -> Result<(), anyhow::Error> {
    // Validate arguments
    validate_arguments(&options)?;

    // Set up logging
    init_logging(&options)?;

    let store = PolicyStore::new(options.data_dir());
    match &options.command {
        Command::Service => {
            log_startup_info(&options);
            run_service(&options)
        }
        Command::Watchdog => {
            log_startup_info(&options);
            run_watchdog(&options)
        }
        Command::Restore => run_restore(&options),
        Command::Status => print_status(&options),
        Command::Enable { minutes } => {
            store.update(|p| {
                if let Some(minutes) = minutes {
                    p.max_active_secs = minutes.saturating_mul(60);
                }
                p.enable_blocking(Local::now());
            })?;
            println!("Blocking enabled");
            Ok(())
        }
        Command::Disable => {
            store.update(|p| p.disable_blocking())?;
            println!("Blocking disabled");
            Ok(())
        }
        Command::Sites { action } => run_sites(&store, action),
        Command::Lists { action } => run_lists(&store, action),
        Command::Session { action } => run_session(&store, action),
        Command::Schedule { action } => run_schedule(&store, action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("focuswall").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = parse(&["service"]);
        assert!(options.enable_hosts());
        assert!(options.enable_rule_filter());
        assert!(!options.enable_packet_filter());
        assert_eq!(options.tick_interval(), Duration::from_secs(5));
        assert!(options.watchdog_interval() > options.tick_interval());
        assert!(validate_arguments(&options).is_ok());
    }

    #[test]
    fn test_backend_toggles_after_subcommand() {
        let options = parse(&["service", "--hosts", "false", "--packet-filter", "true"]);
        assert!(!options.enable_hosts());
        assert!(options.enable_packet_filter());
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        assert!(validate_arguments(&parse(&["--tick-secs", "0", "service"])).is_err());
        assert!(validate_arguments(&parse(&["--log-level", "loud", "status"])).is_err());
    }

    #[test]
    fn test_service_args_round_trip() {
        let options = parse(&["--data-dir", "/tmp/fw", "--packet-filter", "true", "watchdog"]);
        let args = options.service_args();
        assert_eq!(args.last().map(|s| s.as_str()), Some("service"));

        let reparsed = Options::try_parse_from(std::iter::once("focuswall".to_string()).chain(args)).unwrap();
        assert_eq!(reparsed.data_dir(), "/tmp/fw");
        assert!(reparsed.enable_packet_filter());
        assert!(matches!(reparsed.command, Command::Service));
    }

    #[test]
    fn test_policy_commands_edit_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().to_str().unwrap());

        run_sites(&store, &SitesAction::Add { domains: vec!["https://www.x.com/".to_string()] }).unwrap();
        run_lists(&store, &ListsAction::Create { name: "mine".to_string(), sites: vec!["y.com".to_string()] }).unwrap();
        let list_id = store.load().block_lists[0].id.clone();
        run_session(
            &store,
            &SessionAction::Start { lists: vec![list_id.clone()], minutes: 30, name: "focus".to_string() },
        )
        .unwrap();
        run_schedule(
            &store,
            &ScheduleAction::Add { day: "mon".to_string(), start: "09:00".to_string(), end: "17:00".to_string() },
        )
        .unwrap();

        let policy = store.load();
        assert_eq!(policy.blocked_sites, vec!["x.com".to_string()]);
        assert_eq!(policy.sessions.len(), 1);
        assert_eq!(policy.schedule.len(), 1);

        assert!(run_lists(&store, &ListsAction::Delete { id: "builtin-social".to_string() }).is_err());
        assert!(run_schedule(
            &store,
            &ScheduleAction::Add { day: "mon".to_string(), start: "18:00".to_string(), end: "09:00".to_string() },
        )
        .is_err());
    }
}
