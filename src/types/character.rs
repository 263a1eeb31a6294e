//! Chat participants

use serde::{Deserialize, Serialize};

/// The two speakers of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub user_name: String,
    pub character_name: String,
}

impl Persona {
    pub fn new(user_name: impl Into<String>, character_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            character_name: character_name.into(),
        }
    }

    /// Line prefix marking the user's turns, e.g. `User:`
    pub fn user_tag(&self) -> String {
        format!("{}:", self.user_name)
    }

    pub fn character_tag(&self) -> String {
        format!("{}:", self.character_name)
    }

    /// Both tags, user first
    pub fn speaker_tags(&self) -> Vec<String> {
        vec![self.user_tag(), self.character_tag()]
    }
}
