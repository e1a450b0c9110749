use std::sync::Arc;

use crate::audit::AuditLog;
use crate::auth::TokenVerifier;
use crate::gateway::GatewayServices;

/// Shared state injected into every Axum handler via `State`.
pub struct AppState {
    pub gateway: GatewayServices,
    pub verifier: Arc<dyn TokenVerifier>,
    pub audit: Arc<dyn AuditLog>,
}
