use crate::utils::process_utils::{run_checked, run_command};
use anyhow::Context;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotInstalled,
    Unknown,
}

impl Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::NotInstalled => write!(f, "not installed"),
            ServiceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Process lifecycle of the enforcing service.
pub trait ServiceControl: Send {
    fn status(&self) -> ServiceStatus;
    fn start(&self) -> Result<(), anyhow::Error>;
    fn install(&self) -> Result<(), anyhow::Error>;
}

/// What gets installed: the service name and the command line it runs.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub exe: PathBuf,
    pub args: Vec<String>,
}

impl ServiceSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(self.exe.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|arg| quote_arg(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(char::is_whitespace) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

pub fn platform_service_control(spec: ServiceSpec) -> Box<dyn ServiceControl> {
    if cfg!(windows) {
        Box::new(ScControl { spec })
    } else {
        Box::new(SystemdControl::new(spec))
    }
}

// ---- systemd ----

/// Map `LoadState` / `ActiveState` to a status.
pub fn parse_systemd_state(load_state: &str, active_state: &str) -> ServiceStatus {
    if load_state.trim() == "not-found" {
        return ServiceStatus::NotInstalled;
    }
    match active_state.trim() {
        "active" | "activating" | "reloading" => ServiceStatus::Running,
        "inactive" | "failed" | "deactivating" => ServiceStatus::Stopped,
        _ => ServiceStatus::Unknown,
    }
}

pub fn render_unit(spec: &ServiceSpec) -> String {
    format!(
        "[Unit]\n\
         Description=focuswall site blocking enforcer\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        spec.command_line()
    )
}

pub struct SystemdControl {
    spec: ServiceSpec,
    unit_dir: PathBuf,
}

impl SystemdControl {
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }

    fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(format!("{}.service", self.spec.name))
    }

    fn show(&self, property: &str) -> Option<String> {
        run_checked(
            "systemctl",
            &["show", "-p", property, "--value", self.spec.name.as_str()],
        )
        .ok()
    }
}

impl ServiceControl for SystemdControl {
    fn status(&self) -> ServiceStatus {
        match (self.show("LoadState"), self.show("ActiveState")) {
            (Some(load), Some(active)) => parse_systemd_state(&load, &active),
            _ => ServiceStatus::Unknown,
        }
    }

    fn start(&self) -> Result<(), anyhow::Error> {
        run_checked("systemctl", &["start", self.spec.name.as_str()])?;
        Ok(())
    }

    fn install(&self) -> Result<(), anyhow::Error> {
        let path = self.unit_path();
        fs::write(&path, render_unit(&self.spec))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        run_checked("systemctl", &["daemon-reload"])?;
        run_checked("systemctl", &["enable", self.spec.name.as_str()])?;
        Ok(())
    }
}

// ---- Windows service control manager ----

const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// Map `sc query` output and exit code to a status.
pub fn parse_sc_query(output: &str, exit_code: Option<i32>) -> ServiceStatus {
    if exit_code == Some(ERROR_SERVICE_DOES_NOT_EXIST) || output.contains("1060") {
        return ServiceStatus::NotInstalled;
    }
    let state = output
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"))
        .unwrap_or("");
    if state.contains("RUNNING") || state.contains("START_PENDING") {
        ServiceStatus::Running
    } else if state.contains("STOPPED") || state.contains("STOP_PENDING") || state.contains("PAUSED") {
        ServiceStatus::Stopped
    } else {
        ServiceStatus::Unknown
    }
}

pub struct ScControl {
    spec: ServiceSpec,
}

impl ServiceControl for ScControl {
    fn status(&self) -> ServiceStatus {
        match run_command("sc", &["query", self.spec.name.as_str()]) {
            Ok(output) => parse_sc_query(&String::from_utf8_lossy(&output.stdout), output.status.code()),
            Err(e) => {
                log::warn!("{:#}", e);
                ServiceStatus::Unknown
            }
        }
    }

    fn start(&self) -> Result<(), anyhow::Error> {
        run_checked("sc", &["start", self.spec.name.as_str()])?;
        Ok(())
    }

    fn install(&self) -> Result<(), anyhow::Error> {
        let bin_path = self.spec.command_line();
        run_checked(
            "sc",
            &[
                "create",
                self.spec.name.as_str(),
                "binPath=",
                bin_path.as_str(),
                "start=",
                "auto",
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "focuswall".to_string(),
            exe: PathBuf::from("/usr/local/bin/focuswall"),
            args: vec![
                "--data-dir".to_string(),
                "/var/lib/my data".to_string(),
                "service".to_string(),
            ],
        }
    }

    #[test]
    fn test_command_line_quotes_spaces() {
        assert_eq!(
            spec().command_line(),
            "/usr/local/bin/focuswall --data-dir \"/var/lib/my data\" service"
        );
    }

    #[test]
    fn test_render_unit() {
        let unit = render_unit(&spec());
        assert!(unit.contains("ExecStart=/usr/local/bin/focuswall --data-dir"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_parse_systemd_state() {
        assert_eq!(parse_systemd_state("loaded\n", "active\n"), ServiceStatus::Running);
        assert_eq!(parse_systemd_state("loaded", "failed"), ServiceStatus::Stopped);
        assert_eq!(parse_systemd_state("not-found", "inactive"), ServiceStatus::NotInstalled);
        assert_eq!(parse_systemd_state("loaded", "maintenance"), ServiceStatus::Unknown);
    }

    #[test]
    fn test_parse_sc_query() {
        let running = "SERVICE_NAME: focuswall\r\n        TYPE               : 10  WIN32_OWN_PROCESS\r\n        STATE              : 4  RUNNING\r\n";
        assert_eq!(parse_sc_query(running, Some(0)), ServiceStatus::Running);

        let stopped = "SERVICE_NAME: focuswall\r\n        STATE              : 1  STOPPED\r\n";
        assert_eq!(parse_sc_query(stopped, Some(0)), ServiceStatus::Stopped);

        let missing = "[SC] EnumQueryServicesStatus:OpenService FAILED 1060:\r\n\r\nThe specified service does not exist as an installed service.\r\n";
        assert_eq!(parse_sc_query(missing, Some(1060)), ServiceStatus::NotInstalled);
        assert_eq!(parse_sc_query("", Some(5)), ServiceStatus::Unknown);
    }
}
