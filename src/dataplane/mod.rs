//! Traffic classification.
//!
//! A dataplane configuration names a set of traffic classes (each with its
//! own scheduling policy, preferred/excluded paths, and optional packet
//! duplication) plus an ordered rule list mapping packets to classes.
//! Rules are compiled once at load time; matching is first-match-wins over
//! the configured order, falling back to the default class.
//!
//! The compiled [`Classifier`] is immutable and shared behind an `Arc` so
//! the control API can swap a new one in atomically while the scheduler is
//! running.

pub mod flow;

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::{PacketMeta, ProtocolKind};
use crate::types::SchedulerPolicy;

pub use flow::{flow_hash, flow_hash_packet, fnv1a_32};

/// Allowed range for duplicate copy counts.
const DUPLICATE_COPIES: RangeInclusive<u8> = 2..=3;

/// Serialized dataplane configuration (the `dataplane:` config section or
/// the external hot-reloadable file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataplaneConfig {
    /// Class applied when no rule matches. Must exist in `classes`.
    pub default_class: String,

    /// Named traffic classes.
    #[serde(default)]
    pub classes: HashMap<String, ClassConfig>,

    /// Ordered rules; the first matching rule wins.
    #[serde(default)]
    pub classifiers: Vec<RuleConfig>,
}

/// Per-class scheduling policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassConfig {
    #[serde(default)]
    pub policy: SchedulerPolicy,

    /// Path names preferred for this class (matched against both expanded
    /// names and base names). Empty = no preference.
    #[serde(default)]
    pub preferred_paths: Vec<String>,

    /// Path names never used for this class.
    #[serde(default)]
    pub excluded_paths: Vec<String>,

    /// Send every packet of this class on multiple paths.
    #[serde(default)]
    pub duplicate: bool,

    /// Number of copies when duplicating; clamped to 2..=3.
    #[serde(default = "default_copies")]
    pub duplicate_copies: u8,
}

fn default_copies() -> u8 {
    2
}

/// One classifier rule. Every present predicate must match; an absent
/// predicate is a wildcard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Protocol name (`tcp`, `udp`, `icmp`, `icmpv6`) or a decimal number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src_cidrs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dst_cidrs: Vec<String>,

    /// Single ports (`"22"`) or inclusive ranges (`"8000-9000"`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src_ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dst_ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dscp: Vec<u8>,

    /// Target class name.
    pub class: String,
}

/// Compiled per-class policy handed to the scheduler.
#[derive(Debug, Clone)]
pub struct ClassPolicy {
    pub name: String,
    pub policy: SchedulerPolicy,
    pub preferred_paths: HashSet<String>,
    pub excluded_paths: HashSet<String>,
    pub duplicate: bool,
    pub duplicate_copies: u8,
}

impl ClassPolicy {
    fn compile(name: &str, cfg: &ClassConfig) -> Self {
        Self {
            name: name.to_string(),
            policy: cfg.policy,
            preferred_paths: cfg.preferred_paths.iter().cloned().collect(),
            excluded_paths: cfg.excluded_paths.iter().cloned().collect(),
            duplicate: cfg.duplicate,
            duplicate_copies: cfg
                .duplicate_copies
                .clamp(*DUPLICATE_COPIES.start(), *DUPLICATE_COPIES.end()),
        }
    }
}

/// Compiled classifier rule.
#[derive(Debug, Clone)]
struct Rule {
    protocol: Option<u8>,
    src_cidrs: Vec<IpNet>,
    dst_cidrs: Vec<IpNet>,
    src_ports: Vec<RangeInclusive<u16>>,
    dst_ports: Vec<RangeInclusive<u16>>,
    dscp: Vec<u8>,
    class_index: usize,
}

impl Rule {
    fn matches(&self, meta: &PacketMeta) -> bool {
        if let Some(proto) = self.protocol {
            if meta.protocol.number() != proto {
                return false;
            }
        }
        if !self.src_cidrs.is_empty() && !self.src_cidrs.iter().any(|n| n.contains(&meta.src_addr))
        {
            return false;
        }
        if !self.dst_cidrs.is_empty() && !self.dst_cidrs.iter().any(|n| n.contains(&meta.dst_addr))
        {
            return false;
        }
        if !self.src_ports.is_empty() {
            let Some(port) = meta.src_port else {
                return false;
            };
            if !self.src_ports.iter().any(|r| r.contains(&port)) {
                return false;
            }
        }
        if !self.dst_ports.is_empty() {
            let Some(port) = meta.dst_port else {
                return false;
            };
            if !self.dst_ports.iter().any(|r| r.contains(&port)) {
                return false;
            }
        }
        if !self.dscp.is_empty() && !self.dscp.contains(&meta.dscp) {
            return false;
        }
        true
    }
}

/// Compiled, immutable classifier.
#[derive(Debug)]
pub struct Classifier {
    classes: Vec<Arc<ClassPolicy>>,
    rules: Vec<Rule>,
    default_index: usize,
}

impl Classifier {
    /// Compile and validate a dataplane configuration.
    pub fn compile(cfg: &DataplaneConfig) -> Result<Self> {
        if cfg.default_class.is_empty() {
            return Err(Error::InvalidConfig("dataplane: default_class is required".into()));
        }

        let mut classes = Vec::with_capacity(cfg.classes.len());
        let mut index_by_name = HashMap::new();
        // Deterministic class order keeps telemetry output stable.
        let mut names: Vec<_> = cfg.classes.keys().collect();
        names.sort();
        for name in names {
            index_by_name.insert(name.clone(), classes.len());
            classes.push(Arc::new(ClassPolicy::compile(name, &cfg.classes[name])));
        }

        let default_index = *index_by_name.get(&cfg.default_class).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "dataplane: default_class {:?} is not defined",
                cfg.default_class
            ))
        })?;

        let mut rules = Vec::with_capacity(cfg.classifiers.len());
        for (i, rule) in cfg.classifiers.iter().enumerate() {
            let class_index = *index_by_name.get(&rule.class).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "dataplane: rule {i} targets unknown class {:?}",
                    rule.class
                ))
            })?;
            rules.push(Rule {
                protocol: rule
                    .protocol
                    .as_deref()
                    .map(|p| parse_protocol(p, i))
                    .transpose()?,
                src_cidrs: parse_cidrs(&rule.src_cidrs, i)?,
                dst_cidrs: parse_cidrs(&rule.dst_cidrs, i)?,
                src_ports: parse_ports(&rule.src_ports, i)?,
                dst_ports: parse_ports(&rule.dst_ports, i)?,
                dscp: rule.dscp.clone(),
                class_index,
            });
        }

        Ok(Self {
            classes,
            rules,
            default_index,
        })
    }

    /// A minimal classifier with a single default class, used when no
    /// dataplane section is configured.
    pub fn single_default() -> Self {
        Self::single_default_with_policy(SchedulerPolicy::default())
    }

    /// Like [`single_default`](Self::single_default), with the global
    /// `multipath_policy` applied to the implicit class.
    pub fn single_default_with_policy(policy: SchedulerPolicy) -> Self {
        let cfg = DataplaneConfig {
            default_class: "default".into(),
            classes: HashMap::from([(
                "default".into(),
                ClassConfig {
                    policy,
                    ..Default::default()
                },
            )]),
            classifiers: Vec::new(),
        };
        Self::compile(&cfg).expect("built-in default classifier is valid")
    }

    /// First matching rule's class, or the default class.
    pub fn classify(&self, meta: &PacketMeta) -> Arc<ClassPolicy> {
        for rule in &self.rules {
            if rule.matches(meta) {
                return Arc::clone(&self.classes[rule.class_index]);
            }
        }
        Arc::clone(&self.classes[self.default_index])
    }

    /// Classify a raw packet; unparseable packets get the default class.
    pub fn classify_packet(&self, data: &[u8]) -> Arc<ClassPolicy> {
        match crate::packet::inspect(data) {
            Some(meta) => self.classify(&meta),
            None => self.default_class(),
        }
    }

    /// The default class policy.
    pub fn default_class(&self) -> Arc<ClassPolicy> {
        Arc::clone(&self.classes[self.default_index])
    }

    /// All class names, in stable order.
    pub fn class_names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }
}

fn parse_protocol(value: &str, rule: usize) -> Result<u8> {
    let number = match value {
        "tcp" => 6,
        "udp" => 17,
        "icmp" => 1,
        "icmpv6" => 58,
        other => other.parse::<u8>().map_err(|_| {
            Error::InvalidConfig(format!("dataplane: rule {rule}: unknown protocol {other:?}"))
        })?,
    };
    Ok(number)
}

fn parse_cidrs(values: &[String], rule: usize) -> Result<Vec<IpNet>> {
    values
        .iter()
        .map(|v| {
            // Accept bare addresses as host prefixes.
            v.parse::<IpNet>()
                .or_else(|_| v.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|_| {
                    Error::InvalidConfig(format!("dataplane: rule {rule}: invalid CIDR {v:?}"))
                })
        })
        .collect()
}

fn parse_ports(values: &[String], rule: usize) -> Result<Vec<RangeInclusive<u16>>> {
    values
        .iter()
        .map(|v| {
            let invalid =
                || Error::InvalidConfig(format!("dataplane: rule {rule}: invalid port {v:?}"));
            if let Some((lo, hi)) = v.split_once('-') {
                let lo: u16 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: u16 = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                Ok(lo..=hi)
            } else {
                let port: u16 = v.trim().parse().map_err(|_| invalid())?;
                Ok(port..=port)
            }
        })
        .collect()
}
