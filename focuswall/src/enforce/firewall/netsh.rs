use super::{BlockRule, RuleDirection, RuleFilter, RULE_PREFIX};
use crate::utils::process_utils::run_checked;

/// Windows Defender Firewall through `netsh advfirewall`.
pub struct NetshRuleFilter;

/// Rule names from `netsh advfirewall firewall show rule name=all` output.
pub fn parse_rule_names(output: &str) -> Vec<String> {
    let mut names: Vec<String> = output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() != "Rule Name" {
                return None;
            }
            Some(value.trim().to_string())
        })
        .filter(|name| name.starts_with(RULE_PREFIX))
        .collect();
    names.sort();
    names.dedup();
    names
}

impl RuleFilter for NetshRuleFilter {
    fn add_rule(&self, rule: &BlockRule) -> Result<(), anyhow::Error> {
        let dir = match rule.direction {
            RuleDirection::Outbound => "dir=out",
            RuleDirection::Inbound => "dir=in",
        };
        let name = format!("name={}", rule.name);
        let remote = format!("remoteip={}", rule.remote);
        run_checked(
            "netsh",
            &[
                "advfirewall", "firewall", "add", "rule", name.as_str(), dir, "action=block", remote.as_str(),
                "enable=yes",
            ],
        )?;
        Ok(())
    }

    fn remove_rule(&self, name: &str) -> Result<(), anyhow::Error> {
        let name = format!("name={}", name);
        run_checked("netsh", &["advfirewall", "firewall", "delete", "rule", name.as_str()])?;
        Ok(())
    }

    fn rule_names(&self) -> Result<Vec<String>, anyhow::Error> {
        let out = run_checked(
            "netsh",
            &["advfirewall", "firewall", "show", "rule", "name=all"],
        )?;
        Ok(parse_rule_names(&out))
    }
}
