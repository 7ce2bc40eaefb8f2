/// Request bodies for the plan REST API
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardRequest {
    #[serde(default)]
    pub company_name: Option<String>,
    pub plan_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    pub email: String,
}
