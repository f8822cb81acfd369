use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{constraint_violation, AppError, AppResult};
use crate::location;

const COMPANY_COLUMNS: &str = "id, owner_id, name, inn, organization_type, city, address,
    business_sphere, description, created_at, updated_at";

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct CompanyRecord {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub inn: String,
    pub organization_type: String,
    pub city: String,
    pub address: String,
    pub business_sphere: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CompanyRecord {
    /// Human-facing address returned by the geo endpoints.
    pub fn display_address(&self) -> String {
        format!("{}, {}", self.city, self.address)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NewCompany {
    pub owner_id: i64,
    pub name: String,
    pub inn: String,
    #[serde(default)]
    pub organization_type: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub business_sphere: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CompanyUpdate {
    pub name: String,
    #[serde(default)]
    pub organization_type: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub business_sphere: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub fn create_company(connection: &Connection, company: &NewCompany) -> AppResult<CompanyRecord> {
    let name = company.name.trim();
    let inn = company.inn.trim();
    if name.is_empty() || inn.is_empty() {
        return Err(AppError::Validation(
            "missing required fields: name, inn".into(),
        ));
    }
    if !is_valid_inn(inn) {
        return Err(AppError::Validation(
            "invalid INN: must be 10 or 12 digits".into(),
        ));
    }

    let tx = connection.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO companies (
            owner_id, name, inn, organization_type, city, address, business_sphere, description
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            company.owner_id,
            name,
            inn,
            company.organization_type.trim(),
            company.city.trim(),
            company.address.trim(),
            company.business_sphere.trim(),
            company.description.as_deref(),
        ],
    )
    .map_err(|err| map_company_conflict(err, inn))?;
    let id = tx.last_insert_rowid();
    location::insert_unresolved(&tx, id)?;
    tx.commit()?;

    info!(company_id = id, owner_id = company.owner_id, "company created");
    company_by_id(connection, id)
}

pub fn company_by_id(connection: &Connection, company_id: i64) -> AppResult<CompanyRecord> {
    connection
        .query_row(
            &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE id = ?1"),
            [company_id],
            company_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("company", company_id))
}

/// Most recently created companies, newest first.
pub fn list_recent_companies(connection: &Connection, limit: usize) -> AppResult<Vec<CompanyRecord>> {
    let mut stmt = connection.prepare(&format!(
        "SELECT {COMPANY_COLUMNS} FROM companies ORDER BY id DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit as i64], company_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn companies_for_owner(connection: &Connection, owner_id: i64) -> AppResult<Vec<CompanyRecord>> {
    let mut stmt = connection.prepare(&format!(
        "SELECT {COMPANY_COLUMNS} FROM companies WHERE owner_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([owner_id], company_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn update_company(
    connection: &Connection,
    company_id: i64,
    update: &CompanyUpdate,
) -> AppResult<CompanyRecord> {
    let name = update.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("company name cannot be empty".into()));
    }
    let affected = connection.execute(
        "UPDATE companies
        SET name = ?1, organization_type = ?2, city = ?3, address = ?4,
            business_sphere = ?5, description = COALESCE(?6, description),
            updated_at = DATETIME('now')
        WHERE id = ?7",
        params![
            name,
            update.organization_type.trim(),
            update.city.trim(),
            update.address.trim(),
            update.business_sphere.trim(),
            update.description.as_deref(),
            company_id,
        ],
    )?;
    if affected == 0 {
        return Err(AppError::not_found("company", company_id));
    }
    company_by_id(connection, company_id)
}

pub fn delete_company(connection: &Connection, company_id: i64) -> AppResult<()> {
    let affected = connection.execute("DELETE FROM companies WHERE id = ?1", [company_id])?;
    if affected == 0 {
        return Err(AppError::not_found("company", company_id));
    }
    info!(company_id, "company deleted");
    Ok(())
}

fn is_valid_inn(inn: &str) -> bool {
    matches!(inn.len(), 10 | 12) && inn.bytes().all(|b| b.is_ascii_digit())
}

fn map_company_conflict(err: rusqlite::Error, inn: &str) -> AppError {
    match constraint_violation(&err) {
        Some(message) if message.contains("companies.inn") => {
            warn!(inn, "INN already exists");
            AppError::Conflict(format!("company with INN '{inn}' already exists"))
        }
        Some(message) if message.contains("FOREIGN KEY") => {
            warn!(inn, "invalid owner reference");
            AppError::Validation("invalid owner ID: referenced owner does not exist".into())
        }
        _ => AppError::from(err),
    }
}

fn company_from_row(row: &Row<'_>) -> rusqlite::Result<CompanyRecord> {
    Ok(CompanyRecord {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        inn: row.get("inn")?,
        organization_type: row.get("organization_type")?,
        city: row.get("city")?,
        address: row.get("address")?,
        business_sphere: row.get("business_sphere")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
