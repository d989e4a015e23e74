//! API request and response types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::agent::runtime::PermissionMode;
use crate::error::DomainError;
use crate::mesh::ManifestOverrides;
use crate::relay::envelope::BudgetSpec;
use crate::relay::InboxStatus;

/// Error body shape shared by every 4xx/5xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: DomainError,
}

impl ErrorResponse {
    pub fn new(error: DomainError) -> Self {
        Self { error }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub cwd: PathBuf,
}

/// Body for `POST /api/sessions/:id/messages`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub content: String,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveBody {
    pub tool_call_id: String,
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerBody {
    pub tool_call_id: String,
    pub answers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSessionBody {
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Body for `POST /api/relay/messages`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBody {
    pub subject: String,
    #[serde(default)]
    pub payload: Value,
    pub from: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterEndpointBody {
    pub subject: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<InboxStatus>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverBody {
    pub roots: Vec<PathBuf>,
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// Body for `POST /api/mesh/agents` (register).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentBody {
    pub path: PathBuf,
    #[serde(flatten)]
    pub overrides: ManifestOverrides,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenyBody {
    pub path: PathBuf,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopologyQuery {
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveScheduleBody {
    #[serde(default)]
    pub approver: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolvedResponse {
    pub resolved: bool,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}
