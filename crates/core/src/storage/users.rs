//! User storage operations

use rusqlite::{params, Connection, Row};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{parse_datetime, parse_goal_opt, parse_uuid, OptionalExt};
use crate::error::{Error, Result};
use crate::models::{ProfilePatch, User};

const USER_COLUMNS: &str =
    "id, email, name, password_hash, onboarding_completed, daily_calorie_goal, created_at";

pub struct UserStore<'a> {
    conn: &'a Connection,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password_hash: row.get(3)?,
        onboarding_completed: row.get::<_, i32>(4)? != 0,
        daily_calorie_goal: parse_goal_opt(row.get(5)?)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?)?,
    })
}

impl<'a> UserStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a new user; a duplicate email is a conflict
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub fn create(&self, user: &User) -> Result<()> {
        let result = self.conn.execute(
            "INSERT INTO users (id, email, name, password_hash, onboarding_completed, daily_calorie_goal, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id.to_string(),
                user.email,
                user.name,
                user.password_hash,
                user.onboarding_completed as i32,
                user.daily_calorie_goal,
                user.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Conflict(format!("email already registered: {}", user.email)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find user by ID
    #[instrument(skip(self))]
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        let user = self
            .conn
            .query_row(&sql, params![id.to_string()], user_from_row)
            .optional()?;
        Ok(user)
    }

    /// Find user by email (unique index)
    #[instrument(skip(self, email))]
    pub fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
        let user = self
            .conn
            .query_row(&sql, params![email], user_from_row)
            .optional()?;
        Ok(user)
    }

    /// Apply a sparse patch in one statement.
    ///
    /// Omitted fields keep their stored value. Returns whether a row matched.
    #[instrument(skip(self, patch))]
    pub fn apply_patch(&self, id: Uuid, patch: &ProfilePatch) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE users SET
                name = COALESCE(?1, name),
                daily_calorie_goal = COALESCE(?2, daily_calorie_goal)
             WHERE id = ?3",
            params![patch.name, patch.daily_calorie_goal, id.to_string()],
        )?;
        Ok(updated == 1)
    }

    /// Mark onboarding as done
    pub fn set_onboarding_completed(&self, id: Uuid) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE users SET onboarding_completed = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(updated == 1)
    }
}
