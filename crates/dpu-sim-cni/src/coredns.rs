//! CoreDNS Corefile patching for offline test networks
//!
//! The Corefile is rewritten line by line through an ordered table of named
//! rules. The default table makes CoreDNS usable without upstream
//! connectivity: loop detection and fallthrough are dropped, the cluster zone
//! also answers an extra top-level domain authoritatively (NXDOMAIN instead
//! of SERVFAIL for unknown names), and upstream forwarding goes to a fixed
//! server.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use dpu_sim_common::{Error, Result, KUBE_SYSTEM_NAMESPACE};

use crate::client::ClusterApi;

/// Name of the CoreDNS ConfigMap
pub const COREDNS_CONFIG_MAP: &str = "coredns";
/// ConfigMap key holding the Corefile
pub const COREFILE_KEY: &str = "Corefile";
/// Extra TLD served by the cluster zone
pub const DEFAULT_EXTRA_TLD: &str = "net";
/// Upstream DNS server used by the OVN-Kubernetes install
pub const DEFAULT_DNS_SERVER: &str = "8.8.8.8";

/// What a rule does to a matching line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Remove the line
    Drop,
    /// Insert `suffix` right after the matched directive, once
    ExtendDirective {
        /// Word to insert
        suffix: String,
    },
    /// Replace everything after the matched directive with the DNS server
    ForwardTo,
}

/// One named Corefile rewrite.
///
/// For [`RuleAction::ExtendDirective`] and [`RuleAction::ForwardTo`] the first
/// capture group of the matcher is the directive to keep.
#[derive(Debug, Clone)]
pub struct CorefileRule {
    name: String,
    matcher: Regex,
    action: RuleAction,
}

impl CorefileRule {
    /// Rule matching lines against `pattern`
    pub fn new(name: impl Into<String>, pattern: &str, action: RuleAction) -> Result<Self> {
        let name = name.into();
        let matcher = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid Corefile rule '{}': {}", name, e)))?;
        if action != RuleAction::Drop && matcher.captures_len() < 2 {
            return Err(Error::config(format!(
                "Corefile rule '{}' needs a capture group for the directive",
                name
            )));
        }
        Ok(Self {
            name,
            matcher,
            action,
        })
    }

    /// Rule removing lines that match `pattern`
    pub fn drop(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Self::new(name, pattern, RuleAction::Drop)
    }

    /// Rule name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rewrite `line`; `None` drops it
    fn rewrite(&self, line: &str, dns_server: &str) -> Option<String> {
        let Some(caps) = self.matcher.captures(line) else {
            return Some(line.to_string());
        };
        match &self.action {
            RuleAction::Drop => None,
            RuleAction::ExtendDirective { suffix } => {
                let Some(directive) = caps.get(1) else {
                    return Some(line.to_string());
                };
                let rest = &line[directive.end()..];
                if rest.split_whitespace().any(|word| word == suffix) {
                    return Some(line.to_string());
                }
                Some(format!("{} {}{}", directive.as_str(), suffix, rest))
            }
            RuleAction::ForwardTo => {
                let Some(directive) = caps.get(1) else {
                    return Some(line.to_string());
                };
                let opens_block = line.trim_end().ends_with('{');
                Some(format!(
                    "{} {}{}",
                    directive.as_str(),
                    dns_server,
                    if opens_block { " {" } else { "" }
                ))
            }
        }
    }
}

/// Ordered rule table applied to every Corefile line
#[derive(Debug, Clone)]
pub struct CorefilePolicy {
    rules: Vec<CorefileRule>,
}

impl CorefilePolicy {
    /// Policy with a caller-supplied rule table
    pub fn new(rules: Vec<CorefileRule>) -> Self {
        Self { rules }
    }

    /// Rules for a cluster without upstream DNS connectivity
    pub fn offline(extra_tld: &str) -> Result<Self> {
        Ok(Self::new(vec![
            CorefileRule::drop("drop-upstream", r"^\s*upstream\s*$")?,
            CorefileRule::drop("drop-fallthrough", r"^\s*fallthrough.*$")?,
            CorefileRule::drop("drop-loop", r"^\s*loop\s*$")?,
            CorefileRule::new(
                "serve-extra-tld",
                r"^(\s*kubernetes cluster\.local)(?:\s|$)",
                RuleAction::ExtendDirective {
                    suffix: extra_tld.to_string(),
                },
            )?,
            CorefileRule::new(
                "forward-upstream",
                r"^(\s*forward \.)(?:\s.*)?$",
                RuleAction::ForwardTo,
            )?,
        ]))
    }

    /// The rules, in application order
    pub fn rules(&self) -> &[CorefileRule] {
        &self.rules
    }

    /// Rewrite `corefile`, sending upstream queries to `dns_server`
    pub fn apply(&self, corefile: &str, dns_server: &str) -> String {
        let mut patched = Vec::new();
        'lines: for line in corefile.split('\n') {
            let mut line = line.to_string();
            for rule in &self.rules {
                match rule.rewrite(&line, dns_server) {
                    None => {
                        debug!(rule = %rule.name, line = %line.trim(), "Dropped Corefile line");
                        continue 'lines;
                    }
                    Some(rewritten) => {
                        if rewritten != line {
                            debug!(rule = %rule.name, line = %rewritten.trim(), "Rewrote Corefile line");
                        }
                        line = rewritten;
                    }
                }
            }
            patched.push(line);
        }
        patched.join("\n")
    }
}

/// Patches the cluster's CoreDNS ConfigMap
pub struct CoreDnsPatcher {
    api: Arc<dyn ClusterApi>,
    policy: CorefilePolicy,
}

impl CoreDnsPatcher {
    /// Patcher applying `policy`
    pub fn new(api: Arc<dyn ClusterApi>, policy: CorefilePolicy) -> Self {
        Self { api, policy }
    }

    /// Rewrite the Corefile in `kube-system/coredns`
    pub async fn patch(&self, dns_server: &str) -> Result<()> {
        info!(dns_server = %dns_server, "Patching CoreDNS Corefile");

        let data = self
            .api
            .get_config_map(KUBE_SYSTEM_NAMESPACE, COREDNS_CONFIG_MAP)
            .await
            .map_err(|e| Error::coredns_patch(format!("failed to read configmap: {}", e)))?;
        let corefile = data
            .get(COREFILE_KEY)
            .ok_or_else(|| Error::coredns_patch("Corefile not found in configmap"))?;

        let patched = self.policy.apply(corefile, dns_server);
        if &patched == corefile {
            debug!("Corefile already patched");
        }

        let update = BTreeMap::from([(COREFILE_KEY.to_string(), patched)]);
        self.api
            .update_config_map(KUBE_SYSTEM_NAMESPACE, COREDNS_CONFIG_MAP, update)
            .await
            .map_err(|e| Error::coredns_patch(format!("failed to update configmap: {}", e)))?;

        info!("CoreDNS Corefile patched");
        Ok(())
    }
}
