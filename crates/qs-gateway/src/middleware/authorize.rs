//! Authorization gate in front of every non-public route.
//!
//! A route's own authorizer wins over the server-wide one. The gate tells a
//! policy fault (`AuthorizeFunctionError`) apart from a refusal
//! (`AuthorizeRejectedError`) and never retries; re-checking queued requests
//! after the client refreshes its auth payload is the router's job.

use std::sync::Arc;

use qs_wire::Payload;
use tracing::{debug, warn};

use crate::domain::error::{SyncError, SyncResult};
use crate::domain::route::RouteSpec;
use crate::domain::session::Session;
use crate::ports::{AllowAll, Authorizer};

/// Decides whether a session may use a route.
#[derive(Clone)]
pub struct AuthorizeGate {
    default: Arc<dyn Authorizer>,
}

impl Default for AuthorizeGate {
    fn default() -> Self {
        Self::new(Arc::new(AllowAll))
    }
}

impl AuthorizeGate {
    pub fn new(default: Arc<dyn Authorizer>) -> Self {
        Self { default }
    }

    /// `Ok(())` when allowed.
    pub async fn check(
        &self,
        route: &RouteSpec,
        session: &Session,
        payload: &Payload,
    ) -> SyncResult<()> {
        if route.public {
            return Ok(());
        }
        let authorizer = route.authorizer.as_ref().unwrap_or(&self.default);
        match authorizer.authorize(session, &route.name, payload).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(route = %route.name, client_id = %session.client_id(), "authorization rejected");
                Err(SyncError::AuthorizeRejectedError {
                    name: route.name.clone(),
                })
            }
            Err(fault) => {
                warn!(route = %route.name, error = %fault, "authorizer failed");
                Err(SyncError::AuthorizeFunctionError {
                    name: route.name.clone(),
                    message: fault.to_string(),
                })
            }
        }
    }
}
