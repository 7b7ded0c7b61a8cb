//! Peer identity lookup
//!
//! The controller resolves the other participant's display profile through a
//! [`Directory`]. A missing profile is a normal outcome: the call still
//! proceeds and the peer is shown as anonymous.

use crate::error::{MatchError, Result};
use crate::types::{PeerProfile, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Source of display profiles keyed by user id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Directory: Send + Sync {
    /// Profile for `user_id`, or `None` if the user has none
    async fn lookup(&self, user_id: &str) -> Result<Option<PeerProfile>>;
}

/// In-memory directory
#[derive(Default)]
pub struct StaticDirectory {
    profiles: RwLock<HashMap<UserId, PeerProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from `(user_id, profile)` pairs
    pub fn with_profiles(profiles: impl IntoIterator<Item = (UserId, PeerProfile)>) -> Self {
        Self {
            profiles: RwLock::new(profiles.into_iter().collect()),
        }
    }

    /// Add or replace a profile
    pub fn insert(&self, user_id: &str, profile: PeerProfile) -> Result<()> {
        self.profiles
            .write()
            .map_err(|_| MatchError::lock_poisoned("directory"))?
            .insert(user_id.to_string(), profile);
        Ok(())
    }

    pub fn remove(&self, user_id: &str) -> Result<Option<PeerProfile>> {
        Ok(self
            .profiles
            .write()
            .map_err(|_| MatchError::lock_poisoned("directory"))?
            .remove(user_id))
    }

    pub fn len(&self) -> usize {
        self.profiles.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(&self, user_id: &str) -> Result<Option<PeerProfile>> {
        Ok(self
            .profiles
            .read()
            .map_err(|_| MatchError::lock_poisoned("directory"))?
            .get(user_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> PeerProfile {
        PeerProfile {
            display_name: name.to_string(),
            course_of_study: "BS Computer Science".to_string(),
            campus: "Diliman".to_string(),
            year: "3rd".to_string(),
            interests: vec!["#Math21Study".to_string()],
            ..PeerProfile::default()
        }
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let directory =
            StaticDirectory::with_profiles([("alice".to_string(), profile("Alice"))]);

        let found = directory.lookup("alice").await.unwrap();
        assert_eq!(found.map(|p| p.display_name), Some("Alice".to_string()));
        assert!(directory.lookup("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let directory = StaticDirectory::new();
        assert!(directory.is_empty());

        directory.insert("bob", profile("Bob")).unwrap();
        assert_eq!(directory.len(), 1);
        assert!(directory.lookup("bob").await.unwrap().is_some());

        directory.remove("bob").unwrap();
        assert!(directory.lookup("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_directory() {
        let mut directory = MockDirectory::new();
        directory
            .expect_lookup()
            .withf(|user_id| user_id.to_string() == "carol")
            .times(1)
            .returning(|_| Ok(Some(profile("Carol"))));

        let found = directory.lookup("carol").await.unwrap().unwrap();
        assert_eq!(found.display_name, "Carol");
    }
}
