//! User profile records used to enrich delivered messages.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::{UserId, UserProfile};

use crate::database::{encode_ts, Database};
use crate::error::Result;

impl Database {
    /// Insert or replace the display attributes for a user.
    pub fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, avatar, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar = excluded.avatar,
                updated_at = excluded.updated_at",
            params![
                profile.id.as_str(),
                profile.display_name,
                profile.avatar,
                encode_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<Option<UserProfile>> {
        let profile = self
            .conn()
            .query_row(
                "SELECT id, display_name, avatar FROM users WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(UserProfile {
                        id: UserId(row.get(0)?),
                        display_name: row.get(1)?,
                        avatar: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_then_update() {
        let db = Database::open_in_memory().unwrap();
        let mut profile = UserProfile {
            id: UserId::from("alice"),
            display_name: "Alice".into(),
            avatar: None,
        };
        db.upsert_user(&profile).unwrap();
        assert_eq!(db.get_user(&profile.id).unwrap(), Some(profile.clone()));

        profile.display_name = "Alice L.".into();
        profile.avatar = Some("https://cdn.example/alice.png".into());
        db.upsert_user(&profile).unwrap();
        assert_eq!(db.get_user(&profile.id).unwrap(), Some(profile));
    }

    #[test]
    fn test_unknown_user_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_user(&UserId::from("ghost")).unwrap().is_none());
    }
}
