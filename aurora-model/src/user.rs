//! Operator accounts. Session auth lives at the boundary; the core only
//! needs identities and the coarse role flags.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing)]
    pub hashed_password: String,
    pub is_active: bool,
    pub is_ops: bool,
    pub is_superuser: bool,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.is_ops || self.is_superuser
    }
}
