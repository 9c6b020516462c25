//! Backend pool management.
//!
//! # Responsibilities
//! - Manage collections of backends grouped by name
//! - Apply load balancing algorithms to select backends

use std::collections::HashMap;

use crate::config::BackendConfig;
use crate::load_balancer::{round_robin::RoundRobin, LoadBalancer};
use crate::relay::BackendTarget;

/// Manages backend pools and load balancing.
#[derive(Debug, Default)]
pub struct BackendManager {
    /// Map of backend_group name -> (Backends, LoadBalancerAlgo).
    groups: HashMap<String, (Vec<BackendTarget>, Box<dyn LoadBalancer>)>,
}

impl BackendManager {
    /// Create a new backend manager from configuration.
    pub fn new(configs: &[BackendConfig]) -> Self {
        let mut groups: HashMap<String, Vec<BackendTarget>> = HashMap::new();
        for config in configs {
            match config.address.parse() {
                Ok(addr) => groups
                    .entry(config.group.clone())
                    .or_default()
                    .push(BackendTarget::new(config.name.as_str(), addr)),
                Err(_) => tracing::warn!(backend = %config.name, address = %config.address, "Invalid backend address"),
            }
        }

        let groups = groups
            .into_iter()
            .map(|(name, backends)| {
                let lb: Box<dyn LoadBalancer> = Box::new(RoundRobin::new());
                (name, (backends, lb))
            })
            .collect();
        Self { groups }
    }

    /// Select a backend for the given group.
    pub fn get(&self, group_name: &str) -> Option<BackendTarget> {
        let Some((backends, lb)) = self.groups.get(group_name) else {
            tracing::debug!(group = %group_name, "Group not found");
            return None;
        };
        let backend = lb.next_server(backends);
        if backend.is_none() {
            tracing::debug!(group = %group_name, "Backend group is empty");
        }
        backend
    }

    pub fn group_len(&self, group_name: &str) -> usize {
        self.groups.get(group_name).map_or(0, |(b, _)| b.len())
    }
}
