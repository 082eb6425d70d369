use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    FreeUser,
    PremiumUser,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::FreeUser => "free_user",
            UserRole::PremiumUser => "premium_user",
        }
    }
}

stored_object!(UserProfile, "user_profile", {
    name: String,
    email: String,
    role: UserRole
});

impl UserProfile {
    pub fn new(user_id: String, name: String, email: String, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: user_id,
            name,
            email,
            role,
            created_at: now,
            updated_at: now,
        }
    }

    /// Free users have their results moved to the cold tier after completion.
    pub fn is_archive_eligible(&self) -> bool {
        self.role == UserRole::FreeUser
    }

    pub async fn save(profile: UserProfile, db: &SurrealDbClient) -> Result<UserProfile, AppError> {
        let user_id = profile.id.clone();
        db.upsert_item(profile)
            .await?
            .ok_or_else(|| AppError::InternalError(format!("profile {user_id} was not stored")))
    }

    pub async fn require(user_id: &str, db: &SurrealDbClient) -> Result<UserProfile, AppError> {
        db.get_item::<UserProfile>(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("profile for user {user_id}")))
    }

    pub async fn set_role(
        db: &SurrealDbClient,
        user_id: &str,
        role: UserRole,
    ) -> Result<UserProfile, AppError> {
        const ROLE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET role = $role,
                updated_at = $now
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(ROLE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", user_id.to_string()))
            .bind(("role", role.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<UserProfile> = result.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("profile for user {user_id}")))
    }

    pub async fn upgrade_to_premium(
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<UserProfile, AppError> {
        Self::set_role(db, user_id, UserRole::PremiumUser).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb")
    }

    #[tokio::test]
    async fn test_free_user_is_archive_eligible_until_upgrade() {
        let db = memory_db().await;
        let profile = UserProfile::new(
            "u1".into(),
            "Ada".into(),
            "ada@example.com".into(),
            UserRole::FreeUser,
        );
        UserProfile::save(profile, &db).await.expect("save");

        let stored = UserProfile::require("u1", &db).await.expect("profile");
        assert!(stored.is_archive_eligible());

        let upgraded = UserProfile::upgrade_to_premium(&db, "u1")
            .await
            .expect("upgrade");
        assert_eq!(upgraded.role, UserRole::PremiumUser);
        assert!(!upgraded.is_archive_eligible());
    }

    #[tokio::test]
    async fn test_missing_profile_is_not_found() {
        let db = memory_db().await;

        let err = UserProfile::require("ghost", &db)
            .await
            .expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(UserProfile::set_role(&db, "ghost", UserRole::PremiumUser)
            .await
            .is_err());
    }
}
