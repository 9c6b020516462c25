//! Connector backed by the configured route table.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::RelayConfig;
use crate::load_balancer::pool::BackendManager;
use crate::processor::Hint;
use crate::relay::{BackendTarget, Connector};
use crate::routing::router::Router;

/// Routes plus the backend groups they point at; replaced as a unit.
#[derive(Debug, Default)]
pub struct RouteTable {
    router: Router,
    backends: BackendManager,
}

impl RouteTable {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            router: Router::new(&config.routes),
            backends: BackendManager::new(&config.backends),
        }
    }

    pub fn route_count(&self) -> usize {
        self.router.len()
    }
}

#[derive(Debug)]
pub struct RouteConnector {
    table: ArcSwap<RouteTable>,
}

impl RouteConnector {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::from_config(config)),
        }
    }

    /// Swap in routes and backends from `config`. Sessions keep the
    /// backend connections they already hold.
    pub fn reload(&self, config: &RelayConfig) {
        let table = RouteTable::from_config(config);
        tracing::info!(routes = table.route_count(), backends = config.backends.len(), "Route table reloaded");
        self.table.store(Arc::new(table));
    }
}

impl Connector for RouteConnector {
    fn resolve(&self, client: SocketAddr, hint: &Hint) -> Option<BackendTarget> {
        let table = self.table.load();
        let Some(route) = table.router.find(hint) else {
            tracing::debug!(client = %client, hint = %hint, "No route matched");
            return None;
        };
        let target = table.backends.get(&route.backend_group);
        match &target {
            Some(backend) => {
                tracing::trace!(client = %client, route = %route.name, backend = %backend, "Route matched");
            }
            None => {
                tracing::debug!(client = %client, route = %route.name, "Route has no backends");
            }
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;

    const CONFIG: &str = r#"
        [[backends]]
        name = "a1"
        group = "api"
        address = "127.0.0.1:9001"

        [[backends]]
        name = "w1"
        group = "web"
        address = "127.0.0.1:9101"

        [[routes]]
        name = "api"
        host = "example.com"
        path_prefix = "/api"
        backend_group = "api"
        priority = 10

        [[routes]]
        name = "web"
        host = "example.com"
        backend_group = "web"
    "#;

    fn client() -> SocketAddr {
        "192.0.2.1:5555".parse().unwrap()
    }

    #[test]
    fn resolves_by_host_and_path() {
        let connector = RouteConnector::new(&parse_config(CONFIG).unwrap());
        let api = Hint::of_host_uri(Some("Example.com:443".into()), Some("/api/x".into()));
        let web = Hint::of_host_uri(Some("example.com".into()), Some("/".into()));

        assert_eq!(connector.resolve(client(), &api).unwrap().name, "a1");
        assert_eq!(connector.resolve(client(), &web).unwrap().name, "w1");
        assert!(connector.resolve(client(), &Hint::none()).is_none());
    }

    #[test]
    fn reload_replaces_routes() {
        let connector = RouteConnector::new(&parse_config(CONFIG).unwrap());
        let hint = Hint::of_host_uri(Some("other.org".into()), None);
        assert!(connector.resolve(client(), &hint).is_none());

        let updated = parse_config(
            r#"
            [[backends]]
            name = "o1"
            group = "other"
            address = "127.0.0.1:9201"

            [[routes]]
            name = "other"
            backend_group = "other"
            "#,
        )
        .unwrap();
        connector.reload(&updated);
        assert_eq!(connector.resolve(client(), &hint).unwrap().name, "o1");
    }
}
