//! User directory
//!
//! Maps user ids to user records and keeps display names unique.

use std::collections::HashMap;

use crate::credentials::Credential;
use crate::error::ChatError;
use crate::types::{current_timestamp, UserId};

/// Registered account
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    /// Display name, unique across the directory
    pub username: String,
    pub credential: Credential,
    /// Last time the user did something (unix seconds)
    pub last_active: i64,
}

impl User {
    pub fn new(id: UserId, username: String, credential: Credential) -> Self {
        Self {
            id,
            username,
            credential,
            last_active: current_timestamp(),
        }
    }
}

/// Result of a rename attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOutcome {
    /// Name changed; carries the previous name
    Renamed { old: String },
    /// New name equals the current one
    Unchanged,
    /// Another user holds the name
    Taken,
    /// No such user
    UnknownUser,
}

/// id → user, plus a name index for lookups by display name
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: HashMap<UserId, User>,
    by_name: HashMap<String, UserId>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.users.len()
    }

    pub fn contains_name(&self, username: &str) -> bool {
        self.by_name.contains_key(username)
    }

    /// Add a user, rejecting a name already in use
    pub fn insert(&mut self, user: User) -> Result<(), ChatError> {
        if self.contains_name(&user.username) {
            return Err(ChatError::AlreadyExists("username already exists".to_string()));
        }
        self.by_name.insert(user.username.clone(), user.id);
        self.users.insert(user.id, user);
        Ok(())
    }

    pub fn get(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn find_by_name(&self, username: &str) -> Option<&User> {
        self.by_name.get(username).and_then(|id| self.users.get(id))
    }

    /// Refresh a user's last-active time
    pub fn touch(&mut self, id: UserId) {
        if let Some(user) = self.users.get_mut(&id) {
            user.last_active = current_timestamp();
        }
    }

    /// Change a user's display name, keeping names unique
    pub fn rename(&mut self, id: UserId, new_name: &str) -> RenameOutcome {
        if let Some(&holder) = self.by_name.get(new_name) {
            return if holder == id {
                RenameOutcome::Unchanged
            } else {
                RenameOutcome::Taken
            };
        }

        let Some(user) = self.users.get_mut(&id) else {
            return RenameOutcome::UnknownUser;
        };

        let old = std::mem::replace(&mut user.username, new_name.to_string());
        user.last_active = current_timestamp();
        self.by_name.remove(&old);
        self.by_name.insert(new_name.to_string(), id);

        RenameOutcome::Renamed { old }
    }
}
