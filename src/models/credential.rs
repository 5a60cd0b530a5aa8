use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An upstream inference access token, owned by the external credential store.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub id: Uuid,
    pub api_key: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Credential {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_key: api_key.into(),
            last_used_at: None,
            is_active: true,
        }
    }
}

// Keeps tokens out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible: String = self.api_key.chars().take(4).collect();
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("api_key", &format_args!("{}***", visible))
            .field("last_used_at", &self.last_used_at)
            .field("is_active", &self.is_active)
            .finish()
    }
}
