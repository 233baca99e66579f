//! Multipath scheduling: path configuration, per-path state, the packet
//! scheduler, and the reconnector.
//!
//! A *path* is one logical transport over a (local bind, remote host:port)
//! pair. QUIC paths configured with `pipes: N` are expanded into N sibling
//! paths sharing a base name, each with its own QUIC connection — useful on
//! shaped links where one connection is capped. Stripe paths keep `pipes`
//! as an internal fan-out count instead; their pipe sockets live inside the
//! stripe transport.

pub mod path;
pub mod reconnect;
pub mod scheduler;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TransportKind;

pub use path::{PathSnapshot, PathState};
pub use reconnect::PathDialer;
pub use scheduler::MultipathConn;

/// Per-failure cooldown step; `cooldown = consecutive_fails × 1 s`.
pub const COOLDOWN_STEP: Duration = Duration::from_secs(1);

/// Ceiling for the consecutive-failure counter (and thus cooldown).
pub const MAX_CONSECUTIVE_FAILS: u32 = 6;

/// Overall deadline for one `send_datagram` call, including retries.
pub const SEND_DEADLINE: Duration = Duration::from_millis(1200);

/// Sleep between selection attempts when no path is currently available.
pub const SELECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Sleep in the receive task when a path has no transport handle yet.
pub const RX_IDLE_DELAY: Duration = Duration::from_millis(150);

/// Backoff between reconnect attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Resolved configuration of one path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub name: String,

    /// Name of the configured path this entry was expanded from; equals
    /// `name` for unexpanded paths.
    pub base_name: String,

    /// Literal IP or `if:<name>`.
    pub bind: String,

    pub remote_addr: String,
    pub remote_port: u16,

    /// Lower is better.
    pub priority: u32,

    /// Load-spreading weight between equally prioritized paths, ≥ 1.
    pub weight: u32,

    /// QUIC: expansion count. Stripe: UDP socket fan-out.
    pub pipes: usize,

    pub transport: TransportKind,
}

impl PathConfig {
    /// Whether a class path-name set refers to this path, by expanded or
    /// base name.
    pub fn matches_name(&self, names: &std::collections::HashSet<String>) -> bool {
        names.contains(&self.name) || names.contains(&self.base_name)
    }
}

/// Expand QUIC paths with `pipes > 1` into sibling entries `name.0` ..
/// `name.N-1`, each a full path with its own connection. Stripe paths are
/// never expanded.
pub fn expand_paths(paths: Vec<PathConfig>) -> Vec<PathConfig> {
    let mut expanded = Vec::with_capacity(paths.len());
    for path in paths {
        let quic = matches!(path.transport, TransportKind::Quic);
        if quic && path.pipes > 1 {
            for i in 0..path.pipes {
                expanded.push(PathConfig {
                    name: format!("{}.{i}", path.name),
                    base_name: path.name.clone(),
                    pipes: 1,
                    ..path.clone()
                });
            }
        } else {
            expanded.push(PathConfig {
                base_name: path.name.clone(),
                ..path
            });
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, pipes: usize, transport: TransportKind) -> PathConfig {
        PathConfig {
            name: name.into(),
            base_name: String::new(),
            bind: "10.0.0.1".into(),
            remote_addr: "192.0.2.1".into(),
            remote_port: 4433,
            priority: 1,
            weight: 1,
            pipes,
            transport,
        }
    }

    #[test]
    fn no_pipes_is_identity() {
        let expanded = expand_paths(vec![
            cfg("wan5", 1, TransportKind::Quic),
            cfg("wan6", 0, TransportKind::Quic),
        ]);
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].name, "wan5");
        assert_eq!(expanded[0].base_name, "wan5");
        assert_eq!(expanded[1].name, "wan6");
        assert_eq!(expanded[1].base_name, "wan6");
    }

    #[test]
    fn quic_pipes_expand() {
        let expanded = expand_paths(vec![
            cfg("wan5", 4, TransportKind::Quic),
            cfg("wan6", 1, TransportKind::Quic),
        ]);
        assert_eq!(expanded.len(), 5);
        for i in 0..4 {
            assert_eq!(expanded[i].name, format!("wan5.{i}"));
            assert_eq!(expanded[i].base_name, "wan5");
            assert_eq!(expanded[i].pipes, 1);
            assert_eq!(expanded[i].priority, 1);
        }
        assert_eq!(expanded[4].name, "wan6");
        assert_eq!(expanded[4].base_name, "wan6");
    }

    #[test]
    fn mixed_expansion_preserves_order() {
        let expanded = expand_paths(vec![
            cfg("wan4", 2, TransportKind::Quic),
            cfg("wan5", 3, TransportKind::Quic),
            cfg("wan6", 1, TransportKind::Quic),
        ]);
        let names: Vec<_> = expanded.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            ["wan4.0", "wan4.1", "wan5.0", "wan5.1", "wan5.2", "wan6"]
        );
        let bases: Vec<_> = expanded.iter().map(|p| p.base_name.as_str()).collect();
        assert_eq!(bases, ["wan4", "wan4", "wan5", "wan5", "wan5", "wan6"]);
    }

    #[test]
    fn stripe_paths_never_expand() {
        let expanded = expand_paths(vec![cfg("dish", 4, TransportKind::Stripe)]);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].name, "dish");
        assert_eq!(expanded[0].base_name, "dish");
        assert_eq!(expanded[0].pipes, 4, "stripe keeps internal fan-out");
    }

    #[test]
    fn name_matching_covers_base() {
        let expanded = expand_paths(vec![cfg("wan5", 2, TransportKind::Quic)]);
        let set: std::collections::HashSet<String> = ["wan5".to_string()].into();
        assert!(expanded[0].matches_name(&set));
        let exact: std::collections::HashSet<String> = ["wan5.1".to_string()].into();
        assert!(!expanded[0].matches_name(&exact));
        assert!(expanded[1].matches_name(&exact));
    }
}
