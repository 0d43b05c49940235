//! Port binding of a queue engine.
//!
//! Two claim policies exist side by side:
//!
//! - **port** (`WorkerBinding::port`): drains jobs targeting this port first,
//!   then falls back to wildcard jobs (`target_port` NULL or 0). This is the
//!   compatibility path for databases written before per-port routing.
//! - **strict** (`WorkerBinding::strict`): only jobs targeting this port.
//!   Wildcard jobs are left for unbound workers.
//!
//! An unbound worker claims any ENQUEUED job.

use serde::Serialize;

use hostq_core::TargetPort;

use crate::config::QueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WorkerBinding {
    port: Option<u16>,
    strict: bool,
}

/// Row filter derived from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortScope {
    All,
    PortOrWildcard(u16),
    Exact(u16),
}

impl WorkerBinding {
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn port(port: u16) -> Self {
        Self {
            port: Some(port),
            strict: false,
        }
    }

    pub fn strict(port: u16) -> Self {
        Self {
            port: Some(port),
            strict: true,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        match (config.port, config.strict_port) {
            (Some(port), true) => Self::strict(port),
            (Some(port), false) => Self::port(port),
            (None, _) => Self::unbound(),
        }
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Concrete `target_port` to persist for a new job.
    pub fn resolve_target(&self, target: TargetPort) -> Option<u16> {
        match target {
            TargetPort::Inherit => self.port,
            TargetPort::Wildcard => None,
            TargetPort::Exact(port) => Some(port),
        }
    }

    pub(crate) fn scope(&self) -> PortScope {
        match (self.port, self.strict) {
            (None, _) => PortScope::All,
            (Some(port), false) => PortScope::PortOrWildcard(port),
            (Some(port), true) => PortScope::Exact(port),
        }
    }
}

impl PortScope {
    pub(crate) fn port(&self) -> Option<u16> {
        match self {
            PortScope::All => None,
            PortScope::PortOrWildcard(port) | PortScope::Exact(port) => Some(*port),
        }
    }

    /// `AND ...` clause restricting rows to this scope. The port, when any,
    /// is bound as parameter `?{param}`.
    pub(crate) fn filter(&self, param: usize) -> String {
        match self {
            PortScope::All => String::new(),
            PortScope::PortOrWildcard(_) => format!(
                " AND (target_port = ?{param} OR target_port IS NULL OR target_port = 0)"
            ),
            PortScope::Exact(_) => format!(" AND target_port = ?{param}"),
        }
    }

    /// Claim order: own port before wildcard, then priority, FIFO, insertion.
    pub(crate) fn claim_order(&self, param: usize) -> String {
        match self {
            PortScope::PortOrWildcard(_) => format!(
                "CASE WHEN target_port = ?{param} THEN 0 ELSE 1 END, priority ASC, enqueue_ts ASC, rowid ASC"
            ),
            PortScope::All | PortScope::Exact(_) => {
                "priority ASC, enqueue_ts ASC, rowid ASC".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherit_uses_bound_port() {
        assert_eq!(WorkerBinding::port(7001).resolve_target(TargetPort::Inherit), Some(7001));
        assert_eq!(WorkerBinding::unbound().resolve_target(TargetPort::Inherit), None);
        assert_eq!(WorkerBinding::port(7001).resolve_target(TargetPort::Wildcard), None);
        assert_eq!(
            WorkerBinding::unbound().resolve_target(TargetPort::Exact(7002)),
            Some(7002)
        );
    }

    #[test]
    fn binding_from_config() {
        let config = QueueConfig::new("/tmp/q").with_port(7001);
        assert_eq!(WorkerBinding::from_config(&config), WorkerBinding::port(7001));
        let config = config.with_strict_port(true);
        assert_eq!(WorkerBinding::from_config(&config), WorkerBinding::strict(7001));
        assert_eq!(
            WorkerBinding::from_config(&QueueConfig::new("/tmp/q")),
            WorkerBinding::unbound()
        );
    }

    #[test]
    fn scope_filters() {
        assert_eq!(WorkerBinding::unbound().scope().filter(1), "");
        assert!(WorkerBinding::port(7001).scope().filter(2).contains("?2 OR target_port IS NULL"));
        assert_eq!(WorkerBinding::strict(7001).scope().filter(1), " AND target_port = ?1");
        assert!(WorkerBinding::port(7001).scope().claim_order(2).starts_with("CASE"));
    }
}
