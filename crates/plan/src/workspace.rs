/// Plans, companies, team membership and invitations
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{CompanyId, InvitationId, MemberId, Percent, PlanError, PlanId, UserId};

/// Invitations stay acceptable for a week.
pub const INVITATION_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    InProgress,
    Completed,
}

text_enum!(PlanStatus, "plan status", {
    Draft => "draft",
    InProgress => "in_progress",
    Completed => "completed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub description: Option<String>,
    pub company_id: Option<CompanyId>,
    pub status: PlanStatus,
    pub progress_percentage: Percent,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        name: impl Into<String>,
        company_id: Option<CompanyId>,
        created_by: UserId,
    ) -> Result<Self, PlanError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PlanError::Empty("plan name"));
        }
        let now = Utc::now();
        Ok(Self {
            id: PlanId::new(),
            name,
            description: None,
            company_id,
            status: PlanStatus::Draft,
            progress_percentage: 0,
            created_by,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

text_enum!(Role, "role", {
    Owner => "owner",
    Admin => "admin",
    Member => "member",
});

impl Role {
    /// Owners and admins may invite people and break other users' locks.
    pub fn can_administer(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Inactive,
}

text_enum!(MemberStatus, "member status", {
    Active => "active",
    Inactive => "inactive",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: MemberId,
    pub plan_id: PlanId,
    pub user_id: UserId,
    pub role: Role,
    pub status: MemberStatus,
    pub invited_by: Option<UserId>,
    pub joined_at: DateTime<Utc>,
}

impl TeamMember {
    pub fn new(plan_id: PlanId, user_id: UserId, role: Role, invited_by: Option<UserId>) -> Self {
        Self {
            id: MemberId::new(),
            plan_id,
            user_id,
            role,
            status: MemberStatus::Active,
            invited_by,
            joined_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }

    pub fn can_administer(&self) -> bool {
        self.is_active() && self.role.can_administer()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Revoked,
}

text_enum!(InvitationStatus, "invitation status", {
    Pending => "pending",
    Accepted => "accepted",
    Revoked => "revoked",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub plan_id: PlanId,
    pub email: String,
    pub token: String,
    pub invited_by: UserId,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    pub fn new(
        plan_id: PlanId,
        email: impl Into<String>,
        invited_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, PlanError> {
        let email = email.into().trim().to_lowercase();
        if email.is_empty() {
            return Err(PlanError::Empty("email"));
        }
        if !email.contains('@') {
            return Err(PlanError::InvalidValue {
                field: "email",
                value: email,
            });
        }
        Ok(Self {
            id: InvitationId::new(),
            plan_id,
            email,
            token: uuid::Uuid::new_v4().to_string(),
            invited_by,
            status: InvitationStatus::Pending,
            expires_at: now + Duration::days(INVITATION_TTL_DAYS),
            created_at: now,
        })
    }

    pub fn link(&self, site_url: &str) -> String {
        format!("{}/invite/{}", site_url.trim_end_matches('/'), self.token)
    }

    pub fn is_acceptable(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && now < self.expires_at
    }
}
