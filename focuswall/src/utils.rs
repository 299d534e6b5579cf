pub mod format_utils {
    use std::net::IpAddr;
    use std::time::Duration;

    // Format a duration as "1h 05m 09s"
    pub fn format_duration(d: Duration) -> String {
        let total = d.as_secs();
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;

        if hours > 0 {
            format!("{}h {:02}m {:02}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {:02}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    // Comma separated address list for log lines
    pub fn format_ips(ips: &[IpAddr]) -> String {
        ips.iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

}

pub mod process_utils {
    use anyhow::Context;
    use std::process::{Command, Output};

    /// Run an external tool and wait for it.
    pub fn run_command(program: &str, args: &[&str]) -> Result<Output, anyhow::Error> {
        log::debug!("exec: {} {}", program, args.join(" "));
        Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {}", program))
    }

    /// Run an external tool and return its stdout, failing on a non-zero exit status.
    pub fn run_checked(program: &str, args: &[&str]) -> Result<String, anyhow::Error> {
        let output = run_command(program, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub mod shutdown_utils {
    use anyhow::Context;
    use std::sync::{Arc, Condvar, Mutex, PoisonError};
    use std::time::Duration;

    /// Process-wide stop flag that doubles as an interruptible sleep.
    #[derive(Clone, Default)]
    pub struct Shutdown {
        inner: Arc<(Mutex<bool>, Condvar)>,
    }

    impl Shutdown {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn trigger(&self) {
            let (lock, cvar) = &*self.inner;
            *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
            cvar.notify_all();
        }

        /// Sleep up to `timeout`. Returns true if shutdown was requested.
        pub fn wait_timeout(&self, timeout: Duration) -> bool {
            let (lock, cvar) = &*self.inner;
            let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let (guard, _) = cvar
                .wait_timeout_while(guard, timeout, |stop| !*stop)
                .unwrap_or_else(PoisonError::into_inner);
            *guard
        }

        /// Trigger on Ctrl-C / SIGTERM.
        pub fn install_signal_handler(&self) -> Result<(), anyhow::Error> {
            let shutdown = self.clone();
            ctrlc::set_handler(move || {
                log::info!("Received shutdown signal, gracefully shutting down...");
                shutdown.trigger();
            })
            .context("Failed to install signal handler")
        }
    }

}
