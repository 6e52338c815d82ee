//! User profile lookup
//!
//! The engine reads one profile snapshot per turn and never writes it.
//! Storage is the surrounding application's concern; an in-memory store is
//! provided for development and tests.

use crate::models::UserProfileSummary;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// Unknown users yield an empty summary, not an error.
    async fn get_summary(&self, user_id: Uuid) -> Result<UserProfileSummary>;
}

/// In-memory profile store for development
pub struct InMemoryProfileStore {
    profiles: Arc<RwLock<HashMap<Uuid, UserProfileSummary>>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self {
            profiles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn upsert(&self, user_id: Uuid, profile: UserProfileSummary) {
        let mut profiles = self.profiles.write().await;
        profiles.insert(user_id, profile);
    }

    pub async fn remove(&self, user_id: Uuid) -> Option<UserProfileSummary> {
        let mut profiles = self.profiles.write().await;
        profiles.remove(&user_id)
    }
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_summary(&self, user_id: Uuid) -> Result<UserProfileSummary> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(&user_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvestmentGoal, RiskAppetite, TradingExperience};

    #[test]
    fn test_unknown_user_is_empty_profile() {
        let store = InMemoryProfileStore::new();
        let summary = tokio_test::block_on(store.get_summary(Uuid::new_v4())).unwrap();
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_read() {
        let store = InMemoryProfileStore::new();
        let user_id = Uuid::new_v4();
        store
            .upsert(
                user_id,
                UserProfileSummary {
                    username: Some("dana".into()),
                    experience: Some(TradingExperience::Intermediate),
                    risk_appetite: Some(RiskAppetite::VeryHigh),
                    investment_goals: Some(InvestmentGoal::LongTermGrowth),
                    preferred_assets: vec!["stocks".into(), "crypto".into()],
                    interests: vec![],
                },
            )
            .await;

        let rendered = store.get_summary(user_id).await.unwrap().render();
        assert!(rendered.contains("Risk Appetite: Very High"));
        assert!(rendered.contains("Preferred Assets: stocks, crypto"));

        assert!(store.remove(user_id).await.is_some());
        assert!(store.get_summary(user_id).await.unwrap().is_empty());
    }
}
