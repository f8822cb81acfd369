//! Persisted resolution state for company coordinates.
//!
//! One `company_location` row per company. The row is inserted together with
//! the company and afterwards written only by the resolution coordinator.

use std::fmt;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::warn;

use crate::db::{self, SharedConnection};
use crate::errors::AppResult;
use crate::geocoder::Coordinates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Unresolved,
    Pending,
    Resolved,
    Failed,
}

impl ResolutionState {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ResolutionState::Unresolved => "unresolved",
            ResolutionState::Pending => "pending",
            ResolutionState::Resolved => "resolved",
            ResolutionState::Failed => "failed",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "unresolved" => Some(ResolutionState::Unresolved),
            "pending" => Some(ResolutionState::Pending),
            "resolved" => Some(ResolutionState::Resolved),
            "failed" => Some(ResolutionState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFoundUpstream,
    TransientUpstream,
    InvalidCoordinates,
}

impl FailureReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            FailureReason::NotFoundUpstream => "not_found_upstream",
            FailureReason::TransientUpstream => "transient_upstream",
            FailureReason::InvalidCoordinates => "invalid_coordinates",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "not_found_upstream" => Some(FailureReason::NotFoundUpstream),
            "transient_upstream" => Some(FailureReason::TransientUpstream),
            "invalid_coordinates" => Some(FailureReason::InvalidCoordinates),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompanyLocation {
    pub company_id: i64,
    pub state: ResolutionState,
    pub query_address: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub last_attempt_at: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub updated_at: String,
}

/// What read paths hand back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationView {
    pub state: ResolutionState,
    pub coordinates: Option<Coordinates>,
    pub query_address: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub last_attempt_at: Option<String>,
}

impl LocationView {
    pub fn is_resolved(&self) -> bool {
        self.state == ResolutionState::Resolved
    }

    /// Coordinates are only exposed for resolved rows.
    pub fn resolved_coordinates(&self) -> Option<Coordinates> {
        if self.is_resolved() {
            self.coordinates
        } else {
            None
        }
    }
}

impl From<CompanyLocation> for LocationView {
    fn from(location: CompanyLocation) -> Self {
        Self {
            state: location.state,
            coordinates: location.coordinates,
            query_address: location.query_address,
            failure_reason: location.failure_reason,
            last_attempt_at: location.last_attempt_at,
        }
    }
}

/// Provider query key: `"{city}, {address}, {name}"`, skipping blank parts.
pub fn build_query_address(city: &str, address: &str, name: &str) -> String {
    [city, address, name]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn insert_unresolved(connection: &Connection, company_id: i64) -> AppResult<()> {
    connection.execute(
        "INSERT INTO company_location (company_id, state, updated_at) VALUES (?1, 'unresolved', ?2)",
        (company_id, db::now_timestamp()),
    )?;
    Ok(())
}

#[derive(Clone)]
pub struct LocationStore {
    db: SharedConnection,
}

impl LocationStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn load(&self, company_id: i64) -> AppResult<Option<CompanyLocation>> {
        let conn = self.db.lock();
        let location = conn
            .query_row(
                "SELECT company_id, state, query_address, latitude, longitude,
                    last_attempt_at, failure_reason, failure_detail, updated_at
                FROM company_location
                WHERE company_id = ?1",
                [company_id],
                location_from_row,
            )
            .optional()?;
        Ok(location)
    }

    /// Returns `false` when the row no longer exists or is already resolved.
    pub fn mark_pending(&self, company_id: i64, query_address: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let affected = conn.execute(
            "UPDATE company_location
            SET state = 'pending', query_address = ?1, latitude = NULL, longitude = NULL,
                updated_at = ?2
            WHERE company_id = ?3 AND state != 'resolved'",
            (query_address, db::now_timestamp(), company_id),
        )?;
        Ok(affected > 0)
    }

    pub fn mark_resolved(&self, company_id: i64, coordinates: Coordinates) -> AppResult<bool> {
        let conn = self.db.lock();
        let affected = conn.execute(
            "UPDATE company_location
            SET state = 'resolved', latitude = ?1, longitude = ?2,
                failure_reason = NULL, failure_detail = NULL, updated_at = ?3
            WHERE company_id = ?4",
            (
                coordinates.latitude(),
                coordinates.longitude(),
                db::now_timestamp(),
                company_id,
            ),
        )?;
        Ok(affected > 0)
    }

    pub fn mark_failed(
        &self,
        company_id: i64,
        reason: FailureReason,
        detail: &str,
    ) -> AppResult<bool> {
        let now = db::now_timestamp();
        let conn = self.db.lock();
        let affected = conn.execute(
            "UPDATE company_location
            SET state = 'failed', latitude = NULL, longitude = NULL,
                failure_reason = ?1, failure_detail = ?2, last_attempt_at = ?3, updated_at = ?3
            WHERE company_id = ?4",
            (reason.as_tag(), detail, &now, company_id),
        )?;
        Ok(affected > 0)
    }
}

fn location_from_row(row: &Row<'_>) -> rusqlite::Result<CompanyLocation> {
    let company_id: i64 = row.get(0)?;
    let state_tag: String = row.get(1)?;
    let latitude: Option<f64> = row.get(3)?;
    let longitude: Option<f64> = row.get(4)?;
    let reason_tag: Option<String> = row.get(6)?;

    let mut state = ResolutionState::from_tag(&state_tag).unwrap_or_else(|| {
        warn!(company_id, state = %state_tag, "unknown location state; treating as unresolved");
        ResolutionState::Unresolved
    });
    let coordinates = match (latitude, longitude) {
        (Some(lat), Some(lon)) => Coordinates::new(lat, lon).ok(),
        _ => None,
    };
    if state == ResolutionState::Resolved && coordinates.is_none() {
        warn!(company_id, "resolved location without valid coordinates; treating as unresolved");
        state = ResolutionState::Unresolved;
    }

    Ok(CompanyLocation {
        company_id,
        state,
        query_address: row.get(2)?,
        coordinates,
        last_attempt_at: row.get(5)?,
        failure_reason: reason_tag.as_deref().and_then(FailureReason::from_tag),
        failure_detail: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
