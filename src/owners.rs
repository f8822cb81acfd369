use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{constraint_violation, AppError, AppResult};

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    pub id: i64,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OwnerInput {
    #[serde(alias = "fullname")]
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

impl OwnerInput {
    fn normalized(&self) -> AppResult<(String, String, String)> {
        let full_name = self.full_name.trim();
        let email = self.email.trim();
        if full_name.is_empty() || email.is_empty() {
            return Err(AppError::Validation(
                "missing required fields: full_name, email".into(),
            ));
        }
        Ok((
            full_name.to_string(),
            email.to_lowercase(),
            self.phone.trim().to_string(),
        ))
    }
}

pub fn create_owner(connection: &Connection, input: &OwnerInput) -> AppResult<OwnerRecord> {
    let (full_name, email, phone) = input.normalized()?;
    connection
        .execute(
            "INSERT INTO owners (full_name, email, phone) VALUES (?1, ?2, ?3)",
            (&full_name, &email, &phone),
        )
        .map_err(|err| map_owner_conflict(err, &full_name, &email))?;
    let id = connection.last_insert_rowid();
    info!(owner_id = id, "owner created");
    owner_by_id(connection, id)
}

pub fn owner_by_id(connection: &Connection, owner_id: i64) -> AppResult<OwnerRecord> {
    connection
        .query_row(
            "SELECT id, full_name, email, phone, created_at FROM owners WHERE id = ?1",
            [owner_id],
            owner_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("owner", owner_id))
}

pub fn list_owners(connection: &Connection, limit: usize) -> AppResult<Vec<OwnerRecord>> {
    let mut stmt = connection.prepare(
        "SELECT id, full_name, email, phone, created_at FROM owners ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], owner_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn update_owner(
    connection: &Connection,
    owner_id: i64,
    input: &OwnerInput,
) -> AppResult<OwnerRecord> {
    let (full_name, email, phone) = input.normalized()?;
    let affected = connection
        .execute(
            "UPDATE owners SET full_name = ?1, email = ?2, phone = ?3 WHERE id = ?4",
            (&full_name, &email, &phone, owner_id),
        )
        .map_err(|err| map_owner_conflict(err, &full_name, &email))?;
    if affected == 0 {
        return Err(AppError::not_found("owner", owner_id));
    }
    owner_by_id(connection, owner_id)
}

pub fn delete_owner(connection: &Connection, owner_id: i64) -> AppResult<()> {
    let affected = connection.execute("DELETE FROM owners WHERE id = ?1", [owner_id])?;
    if affected == 0 {
        return Err(AppError::not_found("owner", owner_id));
    }
    info!(owner_id, "owner deleted");
    Ok(())
}

fn map_owner_conflict(err: rusqlite::Error, full_name: &str, email: &str) -> AppError {
    match constraint_violation(&err) {
        Some(message) if message.contains("owners.full_name") => {
            warn!(full_name, "owner name already exists");
            AppError::Conflict(format!("name '{full_name}' is already taken"))
        }
        Some(message) if message.contains("owners.email") => {
            warn!(email, "owner email already exists");
            AppError::Conflict(format!("email '{email}' is already registered"))
        }
        _ => AppError::from(err),
    }
}

fn owner_from_row(row: &Row<'_>) -> rusqlite::Result<OwnerRecord> {
    Ok(OwnerRecord {
        id: row.get(0)?,
        full_name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        created_at: row.get(4)?,
    })
}
