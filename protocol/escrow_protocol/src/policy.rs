//! # Authorization policy
//!
//! Every protocol entry point asks one question before touching state:
//! [`authorize`]`(principal, action, resource)`. The identity provider
//! supplies the principal; credentials never reach this crate.
//!
//! | Action           | Allowed roles                                   |
//! |------------------|-------------------------------------------------|
//! | `CreateCampaign` | `Charity`                                       |
//! | `UploadArtifact` | `Charity`                                       |
//! | `ManageCampaign` | owning `Charity`, `Admin`                       |
//! | `Pledge`/`Donate`| `Donor`                                         |
//! | `SubmitProof`    | owning `Charity` only                           |
//! | `Review`         | `Admin`, `Reviewer`                             |
//! | `Prioritize`     | `Admin`                                         |
//! | `Refund`         | `Admin`, `System`                               |
//! | `Disburse`       | `Admin`, `System`                               |
//! | `Reconcile`      | `Admin`                                         |
//! | `ViewStats`      | `Admin`, `Reviewer`                             |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{EscrowError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Donor,
    Charity,
    Reviewer,
    Admin,
    /// Internal actors such as the disbursement scheduler.
    System,
}

impl FromStr for Role {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "donor" => Ok(Self::Donor),
            "charity" => Ok(Self::Charity),
            "reviewer" => Ok(Self::Reviewer),
            "admin" => Ok(Self::Admin),
            "system" => Ok(Self::System),
            other => Err(EscrowError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

/// The acting identity, as vouched for by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<Role>,
}

impl Principal {
    pub fn new(id: impl Into<String>, roles: &[Role]) -> Self {
        Self {
            id: id.into(),
            roles: roles.to_vec(),
        }
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self::new(id, &[Role::System])
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    fn has_any(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| self.has_role(*r))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    CreateCampaign,
    UploadArtifact,
    ManageCampaign,
    Pledge,
    Donate,
    SubmitProof,
    Review,
    Prioritize,
    Refund,
    Disburse,
    Reconcile,
    ViewStats,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreateCampaign => "create campaigns",
            Self::UploadArtifact => "upload proof artifacts",
            Self::ManageCampaign => "manage this campaign",
            Self::Pledge => "pledge",
            Self::Donate => "donate",
            Self::SubmitProof => "submit proof for this campaign",
            Self::Review => "review proof submissions",
            Self::Prioritize => "reprioritize proof submissions",
            Self::Refund => "refund donations",
            Self::Disburse => "disburse funds",
            Self::Reconcile => "reconcile campaigns",
            Self::ViewStats => "view platform statistics",
        };
        f.write_str(s)
    }
}

/// What the action targets.
#[derive(Clone, Copy, Debug)]
pub enum Resource<'a> {
    Platform,
    Campaign { charity_id: &'a str },
}

impl Resource<'_> {
    fn owned_by(&self, principal: &Principal) -> bool {
        match self {
            Resource::Campaign { charity_id } => {
                principal.has_role(Role::Charity) && *charity_id == principal.id
            }
            Resource::Platform => false,
        }
    }
}

/// The single authorization decision point.
pub fn authorize(principal: &Principal, action: Action, resource: Resource<'_>) -> Result<()> {
    let allowed = match action {
        Action::CreateCampaign | Action::UploadArtifact => principal.has_role(Role::Charity),
        Action::ManageCampaign => resource.owned_by(principal) || principal.has_role(Role::Admin),
        Action::Pledge | Action::Donate => principal.has_role(Role::Donor),
        Action::SubmitProof => resource.owned_by(principal),
        Action::Review => principal.has_any(&[Role::Admin, Role::Reviewer]),
        Action::Refund | Action::Disburse => principal.has_any(&[Role::Admin, Role::System]),
        Action::Reconcile | Action::Prioritize => principal.has_role(Role::Admin),
        Action::ViewStats => principal.has_any(&[Role::Admin, Role::Reviewer]),
    };
    if allowed {
        Ok(())
    } else {
        Err(EscrowError::denied(&principal.id, action))
    }
}
