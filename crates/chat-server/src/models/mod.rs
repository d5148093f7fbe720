use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account role of a chat participant.
///
/// `MANAGER` is accepted on the wire as a legacy name for staff accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "STAFF", alias = "MANAGER")]
    Staff,
    #[serde(rename = "MEMBER")]
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Staff => "STAFF",
            Role::Member => "MEMBER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STAFF" | "MANAGER" => Ok(Role::Staff),
            "MEMBER" => Ok(Role::Member),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// One side of a conversation: an account id pinned to its role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

/// Authenticated caller, as extracted from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub role: Role,
    /// Normalized tenant id
    pub tenant: String,
}

impl Identity {
    pub fn participant(&self) -> Participant {
        Participant::new(self.id.clone(), self.role)
    }
}

/// Relationship request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Accepted => "ACCEPTED",
            RequestStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "ACCEPTED" => Ok(RequestStatus::Accepted),
            "REJECTED" => Ok(RequestStatus::Rejected),
            other => Err(format!("unknown request status: {}", other)),
        }
    }
}

/// Outcome chosen by the recipient of a relationship request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn status(&self) -> RequestStatus {
        match self {
            Decision::Accept => RequestStatus::Accepted,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

/// Authorization handshake between two participants of one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRequest {
    pub id: String,
    pub from: String,
    pub from_role: Role,
    pub to: String,
    pub to_role: Role,
    pub message: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl RelationshipRequest {
    pub fn sender(&self) -> Participant {
        Participant::new(self.from.clone(), self.from_role)
    }

    pub fn recipient(&self) -> Participant {
        Participant::new(self.to.clone(), self.to_role)
    }
}

/// Name and email of an account, resolved from the tenant's account tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayIdentity {
    pub name: String,
    pub email: String,
}

/// One account as listed by the display directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub participant: Participant,
    pub display: DisplayIdentity,
}

/// Tenant account listing row, with the caller's request status towards it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantUser {
    pub id: String,
    pub role: Role,
    pub name: String,
    pub email: String,
    /// `PENDING`, `ACCEPTED`, `REJECTED` or `NONE`
    pub chat_status: String,
}

/// Pending request enriched with the sender's display identity.
///
/// `name`/`email` are empty when the sender account no longer resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: String,
    pub from: RequestSender,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSender {
    pub id: String,
    pub role: Role,
    pub name: String,
    pub email: String,
}

/// The other side of an accepted relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counterparty {
    pub counterparty_id: String,
    pub counterparty_role: Role,
    pub name: String,
    pub email: String,
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub receiver_id: String,
    pub receiver_role: Role,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    pub fn sender(&self) -> Participant {
        Participant::new(self.sender_id.clone(), self.sender_role)
    }

    pub fn receiver(&self) -> Participant {
        Participant::new(self.receiver_id.clone(), self.receiver_role)
    }
}
