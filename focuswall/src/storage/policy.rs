use anyhow::Context;
use focuswall_common::PolicyState;
use std::fs;
use std::path::{Path, PathBuf};

pub const POLICY_FILE_NAME: &str = "policy.json";

/// 获取策略文件的路径
pub fn policy_path(base_dir: &str) -> PathBuf {
    Path::new(base_dir).join(POLICY_FILE_NAME)
}

/// JSON-backed policy persistence shared by the enforcer, the watchdog and the CLI.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    path: PathBuf,
}

impl PolicyStore {
    pub fn new(data_dir: &str) -> Self {
        Self {
            path: policy_path(data_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the policy. A missing or unreadable file yields the default policy.
    pub fn load(&self) -> PolicyState {
        match self.try_load() {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                log::debug!("No policy file at {}, using defaults", self.path.display());
                PolicyState::default()
            }
            Err(e) => {
                log::warn!("Ignoring unreadable policy file: {:#}", e);
                PolicyState::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<PolicyState>, anyhow::Error> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let policy = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(Some(policy))
    }

    /// Write the policy atomically (temp file + rename).
    pub fn save(&self, policy: &PolicyState) -> Result<(), anyhow::Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let content = serde_json::to_string_pretty(policy).context("Failed to serialize policy")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        log::debug!("Saved policy to {}", self.path.display());
        Ok(())
    }

    /// Load, mutate and save in one step.
    ///
    /// Unlike [`load`](Self::load) this refuses to work on an unreadable file,
    /// so a corrupt policy is never replaced by a default one.
    pub fn update<R>(&self, f: impl FnOnce(&mut PolicyState) -> R) -> Result<R, anyhow::Error> {
        let mut policy = self
            .try_load()
            .with_context(|| {
                format!(
                    "Refusing to modify {}, fix or remove it first",
                    self.path.display()
                )
            })?
            .unwrap_or_default();
        let result = f(&mut policy);
        self.save(&policy)?;
        Ok(result)
    }
}
