use super::{BlockRule, RuleDirection, RuleFilter, RULE_PREFIX};
use crate::utils::process_utils::run_checked;
use std::io::ErrorKind;
use std::net::IpAddr;

const IPV4_TOOL: &str = "iptables";
const IPV6_TOOL: &str = "ip6tables";

/// netfilter rules tagged with `-m comment --comment <name>`.
pub struct IptablesRuleFilter;

fn tool_for(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => IPV4_TOOL,
        IpAddr::V6(_) => IPV6_TOOL,
    }
}

/// Split one line of `iptables -S` output into arguments, honoring double quotes.
pub fn split_rule_spec(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Value of `--comment` in a split rule spec.
pub fn rule_comment(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "--comment")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// Appended rules (`-A ...`) from `iptables -S` output.
pub fn parse_rule_specs(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .map(split_rule_spec)
        .filter(|args| args.first().map(|a| a == "-A").unwrap_or(false))
        .collect()
}

/// The executable itself could not be found.
fn is_missing_tool(e: &anyhow::Error) -> bool {
    e.root_cause()
        .downcast_ref::<std::io::Error>()
        .map(|io| io.kind() == ErrorKind::NotFound)
        .unwrap_or(false)
}

/// Combine both listings. An IPv4 failure is fatal; an absent `ip6tables`
/// just means there are no IPv6 rules.
pub fn merge_listings(
    v4: Result<String, anyhow::Error>,
    v6: Result<String, anyhow::Error>,
) -> Result<Vec<(&'static str, Vec<Vec<String>>)>, anyhow::Error> {
    let mut listings = vec![(IPV4_TOOL, parse_rule_specs(&v4?))];
    match v6 {
        Ok(out) => listings.push((IPV6_TOOL, parse_rule_specs(&out))),
        Err(e) if is_missing_tool(&e) => log::debug!("{} not available: {:#}", IPV6_TOOL, e),
        Err(e) => return Err(e),
    }
    Ok(listings)
}

impl IptablesRuleFilter {
    fn list_specs() -> Result<Vec<(&'static str, Vec<Vec<String>>)>, anyhow::Error> {
        merge_listings(
            run_checked(IPV4_TOOL, &["-w", "-S"]),
            run_checked(IPV6_TOOL, &["-w", "-S"]),
        )
    }
}

impl RuleFilter for IptablesRuleFilter {
    fn add_rule(&self, rule: &BlockRule) -> Result<(), anyhow::Error> {
        let (chain, match_flag) = match rule.direction {
            RuleDirection::Outbound => ("OUTPUT", "-d"),
            RuleDirection::Inbound => ("INPUT", "-s"),
        };
        let remote = rule.remote.to_string();
        run_checked(
            tool_for(&rule.remote),
            &[
                "-w", "-A", chain, match_flag, remote.as_str(), "-m", "comment", "--comment", rule.name.as_str(),
                "-j", "DROP",
            ],
        )?;
        Ok(())
    }

    fn remove_rule(&self, name: &str) -> Result<(), anyhow::Error> {
        for (tool, specs) in Self::list_specs()? {
            for mut args in specs {
                if rule_comment(&args) != Some(name) {
                    continue;
                }
                args[0] = "-D".to_string();
                let mut full: Vec<&str> = vec!["-w"];
                full.extend(args.iter().map(|a| a.as_str()));
                run_checked(tool, &full)?;
            }
        }
        Ok(())
    }

    fn rule_names(&self) -> Result<Vec<String>, anyhow::Error> {
        let mut names: Vec<String> = Self::list_specs()?
            .into_iter()
            .flat_map(|(_, specs)| specs)
            .filter_map(|args| rule_comment(&args).map(|c| c.to_string()))
            .filter(|c| c.starts_with(RULE_PREFIX))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
