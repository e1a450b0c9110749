//! HTTP request/response models for the gateway's REST API.

use serde::{Deserialize, Serialize};

/// Query string of `GET /api/v1/admin/health`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub verbose: bool,
}

/// Query string of `GET /api/v1/admin/reports/users`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportQuery {
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_lang() -> String {
    "en".to_string()
}

/// `GET /healthz`
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub status: &'static str,
}
