//! Installed routes.
//!
//! Routes are resolved lazily through a [`FunctionInstaller`]. Concurrent
//! lookups of the same name share one install. Routes that go unused are
//! uninstalled after a while, unless an observable or channel still runs on
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::ChannelTable;
use crate::domain::config::FunctionsConfig;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::route::RouteSpec;
use crate::observable::ObservableTable;
use crate::ports::FunctionInstaller;

type Install = Shared<BoxFuture<'static, Option<Arc<RouteSpec>>>>;

struct Installed {
    route: Arc<RouteSpec>,
    last_used: Instant,
}

/// Name to route resolution with install deduplication and idle uninstall.
pub struct FunctionRegistry {
    installer: Arc<dyn FunctionInstaller>,
    installed: DashMap<String, Installed>,
    installing: Mutex<HashMap<String, Install>>,
    observables: Arc<ObservableTable>,
    channels: Arc<ChannelTable>,
    config: FunctionsConfig,
    max_name_length: usize,
}

impl FunctionRegistry {
    pub fn new(
        installer: Arc<dyn FunctionInstaller>,
        observables: Arc<ObservableTable>,
        channels: Arc<ChannelTable>,
        config: FunctionsConfig,
        max_name_length: usize,
    ) -> Self {
        Self {
            installer,
            installed: DashMap::new(),
            installing: Mutex::new(HashMap::new()),
            observables,
            channels,
            config,
            max_name_length,
        }
    }

    /// Number of installed routes
    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    /// Resolve `name`, installing it on first use.
    pub async fn resolve(&self, name: &str) -> SyncResult<Arc<RouteSpec>> {
        if name.is_empty() || name.len() > self.max_name_length {
            return Err(SyncError::not_found(name));
        }
        if let Some(mut installed) = self.installed.get_mut(name) {
            installed.last_used = Instant::now();
            return Ok(Arc::clone(&installed.route));
        }

        let install = {
            let mut installing = self.installing.lock();
            installing
                .entry(name.to_string())
                .or_insert_with(|| {
                    let installer = Arc::clone(&self.installer);
                    let name = name.to_string();
                    async move { installer.install(&name).await }.boxed().shared()
                })
                .clone()
        };
        let resolved = install.await.map(|route| {
            let installed = self
                .installed
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!(route = name, kind = %route.kind(), "route installed");
                    Installed {
                        route: Arc::clone(&route),
                        last_used: Instant::now(),
                    }
                });
            Arc::clone(&installed.route)
        });
        self.installing.lock().remove(name);
        resolved.ok_or_else(|| SyncError::not_found(name))
    }

    /// Replace a route definition. Live observables and channels of that
    /// name restart on the new definition and keep their subscribers.
    pub fn update_route(&self, route: RouteSpec) -> usize {
        let route = Arc::new(route);
        let name = route.name.clone();
        self.installed.insert(
            name.clone(),
            Installed {
                route: Arc::clone(&route),
                last_used: Instant::now(),
            },
        );
        let restarted =
            self.observables.restart_by_name(&route) + self.channels.restart_by_name(&route);
        info!(route = %name, restarted, "route updated");
        restarted
    }

    /// Uninstall a route. Live observables fail with `FunctionNotFound` and
    /// live channels are marked missing.
    pub fn remove_route(&self, name: &str) -> usize {
        self.installed.remove(name);
        let affected = self
            .observables
            .fail_by_name(name, SyncError::not_found(name))
            + self.channels.mark_missing(name);
        info!(route = name, affected, "route removed");
        affected
    }

    /// Uninstall routes idle since before `now - uninstall_after_idle`.
    /// Routes with live observables or channels count as used.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut live = self.observables.names();
        live.extend(self.channels.names());

        let idle = self.config.uninstall_after_idle;
        let before = self.installed.len();
        self.installed.retain(|name, installed| {
            if live.contains(name) {
                installed.last_used = now;
                return true;
            }
            now.saturating_duration_since(installed.last_used) < idle
        });
        let removed = before.saturating_sub(self.installed.len());
        if removed > 0 {
            debug!(removed, "idle routes uninstalled");
        }
        removed
    }
}

/// Periodically uninstall idle routes until shutdown.
pub async fn uninstall_task(registry: Arc<FunctionRegistry>, mut shutdown: broadcast::Receiver<()>) {
    let period = (registry.config.uninstall_after_idle / 2).max(std::time::Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                registry.sweep_idle(Instant::now());
            }
            _ = shutdown.recv() => return,
        }
    }
}
