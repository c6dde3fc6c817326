//! In-memory route catalogue.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::route::RouteSpec;
use crate::ports::FunctionInstaller;

/// Installer backed by routes registered up front (or at runtime).
#[derive(Default)]
pub struct StaticInstaller {
    routes: DashMap<String, Arc<RouteSpec>>,
}

impl StaticInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StaticInstaller::insert`].
    pub fn with_route(self, route: RouteSpec) -> Self {
        self.insert(route);
        self
    }

    pub fn insert(&self, route: RouteSpec) {
        self.routes.insert(route.name.clone(), Arc::new(route));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.routes.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.routes.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl FunctionInstaller for StaticInstaller {
    async fn install(&self, name: &str) -> Option<Arc<RouteSpec>> {
        self.routes.get(name).map(|r| Arc::clone(r.value()))
    }
}
