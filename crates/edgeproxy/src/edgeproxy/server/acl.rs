//! File-backed forward policy.
//!
//! A forward is allowed when at least one `allow` rule matches and no `deny` rule
//! matches. The policy file is polled and swapped in atomically; a broken edit
//! keeps the previous policy.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::watch;

use crate::edgeproxy::config::file_sig;
use crate::edgeproxy::net::split_host_port;
use crate::edgeproxy::server::authorize::{Authorizer, ForwardAction};
use crate::edgeproxy::tunnel::protocol::NetType;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePolicy {
    #[serde(default)]
    rules: Vec<FileRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRule {
    subject: Option<String>,
    destination: String,
    ports: Option<String>,
    proto: Option<String>,
    effect: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    Allow,
    Deny,
}

#[derive(Debug)]
struct Glob {
    pattern: String,
    re: Option<Regex>,
}

impl Glob {
    fn new(pattern: &str, ignore_case: bool) -> anyhow::Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            anyhow::bail!("acl: empty pattern");
        }
        let pattern = if ignore_case {
            pattern.to_ascii_lowercase()
        } else {
            pattern.to_string()
        };
        if !pattern.contains('*') && !pattern.contains('?') {
            return Ok(Self { pattern, re: None });
        }
        let re = compile_wildcard_pattern(&pattern)?;
        Ok(Self {
            pattern,
            re: Some(re),
        })
    }

    fn matches(&self, s: &str) -> bool {
        match &self.re {
            Some(re) => re.is_match(s),
            None => s == self.pattern,
        }
    }
}

fn compile_wildcard_pattern(pattern: &str) -> anyhow::Result<Regex> {
    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => {
                if ".^$+()[]{}|\\".contains(other) {
                    out.push('\\');
                }
                out.push(other);
            }
        }
    }
    out.push('$');
    Ok(Regex::new(&out)?)
}

#[derive(Debug)]
enum Destination {
    Network(IpNetwork),
    Host(Glob),
}

#[derive(Debug)]
struct Rule {
    subject: Glob,
    destination: Destination,
    ports: Glob,
    proto: NetType,
    effect: Effect,
}

impl Rule {
    fn matches(&self, action: &ForwardAction, ip: Option<IpAddr>, host: &str, port: &str) -> bool {
        if self.proto != action.net_type {
            return false;
        }
        if !self.subject.matches(action.subject.as_str()) || !self.ports.matches(port) {
            return false;
        }
        match (&self.destination, ip) {
            (Destination::Network(net), Some(ip)) => net.contains(ip),
            (Destination::Host(glob), None) => glob.matches(host),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    fn compile(fp: FilePolicy) -> anyhow::Result<Self> {
        let mut rules = Vec::with_capacity(fp.rules.len());
        for (i, r) in fp.rules.into_iter().enumerate() {
            rules.push(compile_rule(r).with_context(|| format!("acl: rules[{i}]"))?);
        }
        Ok(Self { rules })
    }

    fn evaluate(&self, action: &ForwardAction) -> bool {
        let Some((host, port)) = split_host_port(&action.destination_addr) else {
            return false;
        };
        let ip = host.parse::<IpAddr>().ok();
        let host = host.to_ascii_lowercase();
        let port = port.to_string();

        let mut allowed = false;
        for rule in &self.rules {
            if !rule.matches(action, ip, &host, &port) {
                continue;
            }
            match rule.effect {
                Effect::Deny => return false,
                Effect::Allow => allowed = true,
            }
        }
        allowed
    }
}

fn compile_rule(r: FileRule) -> anyhow::Result<Rule> {
    let subject = Glob::new(r.subject.as_deref().unwrap_or("*"), false)?;
    let ports = Glob::new(r.ports.as_deref().unwrap_or("*"), false)?;

    let dst = r.destination.trim();
    let destination = match dst.parse::<IpNetwork>() {
        Ok(net) => Destination::Network(net),
        Err(_) => Destination::Host(Glob::new(dst, true)?),
    };

    let proto = match r.proto.as_deref().map(str::trim).unwrap_or("tcp") {
        "" | "tcp" => NetType::Tcp,
        "udp" => NetType::Udp,
        other => anyhow::bail!("unknown proto {other:?} (expected tcp|udp)"),
    };

    let effect = match r
        .effect
        .as_deref()
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
        .unwrap_or("allow")
    {
        "allow" => Effect::Allow,
        "deny" => Effect::Deny,
        other => anyhow::bail!("unknown effect {other:?} (expected allow|deny)"),
    };

    Ok(Rule {
        subject,
        destination,
        ports,
        proto,
        effect,
    })
}

fn parse_policy(path: &Path, text: &str) -> anyhow::Result<Policy> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let fp: FilePolicy = match ext.as_str() {
        "toml" => toml::from_str(text).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(text).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("acl: unsupported policy extension {ext:?}"),
    };
    Policy::compile(fp)
}

pub struct AclAuthorizer {
    path: PathBuf,
    policy: ArcSwap<Policy>,
}

impl AclAuthorizer {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let policy = read_policy(&path)?;
        tracing::info!(path = %path.display(), rules = policy.rules.len(), "acl: loaded");
        Ok(Self {
            path,
            policy: ArcSwap::from_pointee(policy),
        })
    }

    /// Re-reads the policy file; on error the current policy stays in place.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let policy = read_policy(&self.path)?;
        let n = policy.rules.len();
        self.policy.store(Arc::new(policy));
        Ok(n)
    }

    pub async fn watch(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = poll_interval.max(Duration::from_millis(10));
        let mut last_sig = file_sig(&self.path).ok();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {
                    let sig = match file_sig(&self.path) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    if last_sig.is_some_and(|prev| prev == sig) {
                        continue;
                    }
                    last_sig = Some(sig);
                    match self.reload() {
                        Ok(rules) => tracing::info!(path = %self.path.display(), rules, "acl: reloaded"),
                        Err(err) => tracing::warn!(
                            path = %self.path.display(),
                            err = %format!("{err:#}"),
                            "acl: reload failed; keeping previous policy"
                        ),
                    }
                }
            }
        }
    }
}

fn read_policy(path: &Path) -> anyhow::Result<Policy> {
    let text = std::fs::read_to_string(path).with_context(|| format!("acl: read {}", path.display()))?;
    parse_policy(path, &text)
}

impl Authorizer for AclAuthorizer {
    fn authorize_forward(&self, action: &ForwardAction) -> bool {
        self.policy.load().evaluate(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edgeproxy::server::auth::Subject;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("edgeproxy_acl_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn fwd(subject: &str, dst: &str) -> ForwardAction {
        ForwardAction::new(Subject::new(subject), dst, NetType::Tcp)
    }

    const POLICY: &str = r#"
[[rules]]
subject = "*"
destination = "10.0.0.0/8"
ports = "443"

[[rules]]
subject = "ops-*"
destination = "10.0.0.0/8"

[[rules]]
destination = "10.9.9.9"
effect = "deny"

[[rules]]
destination = "*.internal.example.com"
ports = "*"

[[rules]]
destination = "::1/128"
ports = "80"
"#;

    #[test]
    fn allow_unless_denied() {
        let policy = parse_policy(Path::new("p.toml"), POLICY).unwrap();

        assert!(policy.evaluate(&fwd("alice", "10.0.0.5:443")));
        assert!(!policy.evaluate(&fwd("alice", "10.0.0.5:22")));
        assert!(policy.evaluate(&fwd("ops-bob", "10.0.0.5:22")));
        assert!(!policy.evaluate(&fwd("ops-bob", "10.9.9.9:443")));
        assert!(!policy.evaluate(&fwd("alice", "192.168.1.1:443")));
        assert!(policy.evaluate(&fwd("alice", "DB.Internal.Example.com:5432")));
        assert!(!policy.evaluate(&fwd("alice", "internal.example.com:5432")));
        assert!(policy.evaluate(&fwd("alice", "[::1]:80")));
        assert!(!policy.evaluate(&fwd("alice", "not-an-address")));

        let udp = ForwardAction::new(Subject::new("alice"), "10.0.0.5:443", NetType::Udp);
        assert!(!policy.evaluate(&udp));
    }

    #[test]
    fn yaml_policy_and_bad_rules() {
        let yaml = "rules:\n  - destination: \"0.0.0.0/0\"\n    proto: udp\n";
        let policy = parse_policy(Path::new("p.yaml"), yaml).unwrap();
        let udp = ForwardAction::new(Subject::anonymous(), "8.8.8.8:53", NetType::Udp);
        assert!(policy.evaluate(&udp));

        let err = parse_policy(
            Path::new("p.toml"),
            "[[rules]]\ndestination = \"x\"\neffect = \"maybe\"\n",
        )
        .err()
        .expect("bad effect accepted");
        assert!(format!("{err:#}").contains("rules[0]"));
    }

    #[test]
    fn reload_swaps_policy_and_keeps_old_on_error() {
        let dir = temp_dir("reload");
        let path = dir.join("acl.toml");
        std::fs::write(&path, "[[rules]]\ndestination = \"10.0.0.1\"\n").unwrap();

        let acl = AclAuthorizer::load(&path).unwrap();
        assert!(acl.authorize_forward(&fwd("a", "10.0.0.1:1")));
        assert!(!acl.authorize_forward(&fwd("a", "10.0.0.2:1")));

        std::fs::write(&path, "[[rules]]\ndestination = \"10.0.0.2\"\n").unwrap();
        assert_eq!(acl.reload().unwrap(), 1);
        assert!(acl.authorize_forward(&fwd("a", "10.0.0.2:1")));

        std::fs::write(&path, "[[rules]\n").unwrap();
        assert!(acl.reload().is_err());
        assert!(acl.authorize_forward(&fwd("a", "10.0.0.2:1")));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn watch_picks_up_file_changes() {
        let dir = temp_dir("watch");
        let path = dir.join("acl.yaml");
        std::fs::write(&path, "rules: []\n").unwrap();

        let acl = Arc::new(AclAuthorizer::load(&path).unwrap());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(acl.clone().watch(Duration::from_millis(20), rx));

        assert!(!acl.authorize_forward(&fwd("a", "10.0.0.1:1")));
        std::fs::write(&path, "rules:\n  - destination: \"10.0.0.0/24\"\n").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !acl.authorize_forward(&fwd("a", "10.0.0.1:1")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("policy change not picked up");

        tx.send(true).unwrap();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn watch_stops_when_shutdown_sender_is_dropped() {
        let dir = temp_dir("watch_dropped");
        let path = dir.join("acl.yaml");
        std::fs::write(&path, "rules: []\n").unwrap();

        let acl = Arc::new(AclAuthorizer::load(&path).unwrap());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(acl.watch(Duration::from_secs(3600), rx));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("watcher kept running without a shutdown sender")
            .unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
