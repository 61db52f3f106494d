// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! User Registry
//!
//! Storage backends for user credentials. The account subsystem is the
//! only writer; the relay handler reads during authentication. Mutations
//! hold one lock across the existence check, the in-memory change, and
//! persistence, so two concurrent account operations can never interleave.
//! A failed write rolls the in-memory change back before the caller is
//! acknowledged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Unique user id (also the id claimed in `update-pos` frames).
    pub id: String,
    /// Hex SHA-256 of the user's password.
    pub password_hash: String,
}

/// Why an account mutation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserStoreError {
    /// Create: the id is already registered.
    AlreadyExists,
    /// Delete: the id is not registered.
    NotFound,
    /// Delete: the supplied password hash does not match.
    WrongPassword,
    /// The registry could not be persisted; in-memory state was rolled back.
    Persist(String),
}

/// Trait for user registry backends.
pub trait UserStore: Send + Sync {
    /// Looks up a user by id.
    fn lookup(&self, id: &str) -> Option<UserRecord>;

    /// Registers a new user. Fails if the id already exists or the
    /// registry cannot be persisted.
    fn create(&self, record: UserRecord) -> Result<(), UserStoreError>;

    /// Removes a user after verifying the password hash.
    fn delete(&self, id: &str, password_hash: &str) -> Result<(), UserStoreError>;

    /// Returns the number of registered users.
    fn user_count(&self) -> usize;
}

// ============================================================================
// In-Memory Store (for testing and development)
// ============================================================================

/// In-memory user registry, no persistence.
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryUserStore {
    /// Creates an empty registry.
    pub fn new() -> Self {
        MemoryUserStore {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a registry pre-populated with records, for tests.
    pub fn with_users(records: impl IntoIterator<Item = UserRecord>) -> Self {
        let users = records
            .into_iter()
            .map(|r| (r.id, r.password_hash))
            .collect();
        MemoryUserStore {
            users: Mutex::new(users),
        }
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for MemoryUserStore {
    fn lookup(&self, id: &str) -> Option<UserRecord> {
        let users = self.users.lock().unwrap();
        users.get(id).map(|hash| UserRecord {
            id: id.to_string(),
            password_hash: hash.clone(),
        })
    }

    fn create(&self, record: UserRecord) -> Result<(), UserStoreError> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(&record.id) {
            return Err(UserStoreError::AlreadyExists);
        }
        users.insert(record.id, record.password_hash);
        Ok(())
    }

    fn delete(&self, id: &str, password_hash: &str) -> Result<(), UserStoreError> {
        let mut users = self.users.lock().unwrap();
        match users.get(id) {
            None => Err(UserStoreError::NotFound),
            Some(stored) if stored != password_hash => Err(UserStoreError::WrongPassword),
            Some(_) => {
                users.remove(id);
                Ok(())
            }
        }
    }

    fn user_count(&self) -> usize {
        self.users.lock().unwrap().len()
    }
}

// ============================================================================
// JSON File Store (production)
// ============================================================================

/// On-disk shape of the registry file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    users: Vec<UserRecord>,
}

/// User registry persisted as a JSON file.
///
/// Every successful mutation is written to disk before the caller is
/// acknowledged.
pub struct JsonUserStore {
    path: PathBuf,
    users: Mutex<HashMap<String, String>>,
}

impl JsonUserStore {
    /// Opens (or initializes) a registry file.
    pub fn open(path: &Path) -> Result<Self, String> {
        let users = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("read {}: {e}", path.display()))?;
            let file: RegistryFile = serde_json::from_str(&raw)
                .map_err(|e| format!("parse {}: {e}", path.display()))?;
            file.users
                .into_iter()
                .map(|r| (r.id, r.password_hash))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(JsonUserStore {
            path: path.to_path_buf(),
            users: Mutex::new(users),
        })
    }

    /// Serializes the given map to the registry file.
    fn persist(&self, users: &HashMap<String, String>) -> Result<(), UserStoreError> {
        let mut records: Vec<UserRecord> = users
            .iter()
            .map(|(id, hash)| UserRecord {
                id: id.clone(),
                password_hash: hash.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let json = serde_json::to_string_pretty(&RegistryFile { users: records })
            .map_err(|e| UserStoreError::Persist(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| UserStoreError::Persist(e.to_string()))
    }
}

impl UserStore for JsonUserStore {
    fn lookup(&self, id: &str) -> Option<UserRecord> {
        let users = self.users.lock().unwrap();
        users.get(id).map(|hash| UserRecord {
            id: id.to_string(),
            password_hash: hash.clone(),
        })
    }

    fn create(&self, record: UserRecord) -> Result<(), UserStoreError> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(&record.id) {
            return Err(UserStoreError::AlreadyExists);
        }
        users.insert(record.id.clone(), record.password_hash);

        if let Err(e) = self.persist(&users) {
            users.remove(&record.id);
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, id: &str, password_hash: &str) -> Result<(), UserStoreError> {
        let mut users = self.users.lock().unwrap();
        let stored = match users.get(id) {
            None => return Err(UserStoreError::NotFound),
            Some(stored) if stored != password_hash => return Err(UserStoreError::WrongPassword),
            Some(stored) => stored.clone(),
        };
        users.remove(id);

        if let Err(e) = self.persist(&users) {
            users.insert(id.to_string(), stored);
            return Err(e);
        }
        Ok(())
    }

    fn user_count(&self) -> usize {
        self.users.lock().unwrap().len()
    }
}
