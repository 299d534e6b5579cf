use super::{BackendKind, EnforcementBackend};
use anyhow::Context;
use focuswall_common::clean_domains;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

pub const BLOCK_START_MARKER: &str = "# >>> focuswall block >>>";
pub const BLOCK_END_MARKER: &str = "# <<< focuswall block <<<";

const REDIRECT_ADDRESS: &str = "127.0.0.1";

/// Byte range of the first marked block, including one trailing line break.
fn block_span(content: &str) -> Option<(usize, usize)> {
    let start = content.find(BLOCK_START_MARKER)?;
    let end_rel = content[start..].find(BLOCK_END_MARKER)?;
    let mut end = start + end_rel + BLOCK_END_MARKER.len();

    let rest = &content[end..];
    if rest.starts_with("\r\n") {
        end += 2;
    } else if rest.starts_with('\n') {
        end += 1;
    }
    Some((start, end))
}

/// `content` with the marked block removed. Unchanged if no complete block exists.
pub fn strip_block(content: &str) -> String {
    match block_span(content) {
        Some((start, end)) => {
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            out
        }
        None => content.to_string(),
    }
}

/// The marked block redirecting each domain and its `www.` form to loopback.
pub fn render_block(domains: &BTreeSet<String>) -> String {
    let mut block = String::new();
    block.push_str(BLOCK_START_MARKER);
    block.push('\n');
    for domain in domains {
        block.push_str(&format!("{} {}\n", REDIRECT_ADDRESS, domain));
        block.push_str(&format!("{} www.{}\n", REDIRECT_ADDRESS, domain));
    }
    block.push_str(BLOCK_END_MARKER);
    block.push('\n');
    block
}

/// Replace any existing block with one for `domains`.
///
/// The block goes at the top of the file so that stripping it restores the
/// previous content byte for byte, whatever its line endings.
pub fn with_block(content: &str, domains: &BTreeSet<String>) -> String {
    let base = strip_block(content);
    let mut out = render_block(domains);
    out.push_str(&base);
    out
}

/// Name-override backend: redirects blocked domains to loopback in the hosts file.
pub struct HostsBackend {
    path: PathBuf,
    flush_cache: fn() -> Result<(), anyhow::Error>,
}

impl HostsBackend {
    pub fn new(path: &str, flush_cache: fn() -> Result<(), anyhow::Error>) -> Self {
        Self {
            path: PathBuf::from(path),
            flush_cache,
        }
    }

    fn read(&self) -> Result<String, anyhow::Error> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }

    /// Write `updated` if it differs from `current`. Returns whether anything changed.
    fn write_if_changed(&self, current: &str, updated: &str) -> Result<bool, anyhow::Error> {
        if current == updated {
            return Ok(false);
        }
        fs::write(&self.path, updated)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        if let Err(e) = (self.flush_cache)() {
            log::warn!("Failed to flush DNS cache: {}", e);
        }
        Ok(true)
    }

    fn try_apply(&self, domains: &BTreeSet<String>) -> Result<bool, anyhow::Error> {
        let current = self.read()?;
        let updated = with_block(&current, &clean_domains(domains));
        self.write_if_changed(&current, &updated)
    }

    fn try_remove(&self) -> Result<bool, anyhow::Error> {
        let current = self.read()?;
        let updated = strip_block(&current);
        self.write_if_changed(&current, &updated)
    }
}

impl EnforcementBackend for HostsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HostsOverride
    }

    fn apply(&mut self, domains: &BTreeSet<String>) -> bool {
        match self.try_apply(domains) {
            Ok(changed) => {
                if changed {
                    log::info!("Hosts override updated: {} domain(s) redirected", domains.len());
                }
                true
            }
            Err(e) => {
                log::error!("Hosts override apply failed: {:#}", e);
                false
            }
        }
    }

    fn remove(&mut self) -> bool {
        match self.try_remove() {
            Ok(changed) => {
                if changed {
                    log::info!("Hosts override removed");
                }
                true
            }
            Err(e) => {
                log::error!("Hosts override removal failed: {:#}", e);
                false
            }
        }
    }
}
