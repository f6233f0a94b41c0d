//! Typed identity handed over by the identity provider.

use crate::PickupError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Consumer,
    Cashier,
    Merchant,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumer => "CONSUMER",
            Self::Cashier => "CASHIER",
            Self::Merchant => "MERCHANT",
            Self::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PickupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONSUMER" => Ok(Self::Consumer),
            "CASHIER" => Ok(Self::Cashier),
            "MERCHANT" => Ok(Self::Merchant),
            "ADMIN" => Ok(Self::Admin),
            _ => Err(PickupError::Unauthenticated),
        }
    }
}

/// Who is calling. Each operation decides what it allows by matching on this
/// exhaustively, so a new role cannot slip through unnoticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Consumer { id: Uuid },
    Cashier { id: Uuid, store_id: Uuid },
    Merchant { owner_id: Uuid },
    Admin { id: Uuid },
}

impl Principal {
    /// Builds a principal from the loosely typed triple the identity provider
    /// forwards. A cashier without an assigned store is not a valid identity.
    pub fn from_parts(id: Uuid, role: Role, assigned_store: Option<Uuid>) -> Result<Self, PickupError> {
        match role {
            Role::Consumer => Ok(Self::Consumer { id }),
            Role::Cashier => assigned_store
                .map(|store_id| Self::Cashier { id, store_id })
                .ok_or_else(|| PickupError::forbidden("cashier has no assigned store")),
            Role::Merchant => Ok(Self::Merchant { owner_id: id }),
            Role::Admin => Ok(Self::Admin { id }),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Consumer { id } | Self::Cashier { id, .. } | Self::Admin { id } => *id,
            Self::Merchant { owner_id } => *owner_id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Consumer { .. } => Role::Consumer,
            Self::Cashier { .. } => Role::Cashier,
            Self::Merchant { .. } => Role::Merchant,
            Self::Admin { .. } => Role::Admin,
        }
    }
}
