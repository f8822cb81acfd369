use serde::Serialize;
use tracing::{debug, warn};

use crate::companies::CompanyRecord;
use crate::errors::{AppError, AppResult};
use crate::geocoder::Coordinates;
use crate::location::ResolutionState;
use crate::resolution::ResolutionCoordinator;

#[derive(Debug, Clone, Serialize)]
pub struct ListingItem {
    pub id: i64,
    pub name: String,
    pub city: String,
    pub address: String,
    pub state: ResolutionState,
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingView {
    pub items: Vec<ListingItem>,
    /// Set when at least one item has no resolved coordinates.
    pub partial: bool,
}

/// Builds the batch view from stored locations only. Never schedules resolution.
#[derive(Clone)]
pub struct ListingAggregator {
    coordinator: ResolutionCoordinator,
    limit: usize,
}

impl ListingAggregator {
    pub fn new(coordinator: ResolutionCoordinator, limit: usize) -> Self {
        Self {
            coordinator,
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn build(&self, companies: &[CompanyRecord]) -> AppResult<ListingView> {
        let mut items = Vec::with_capacity(companies.len().min(self.limit));
        for company in companies.iter().take(self.limit) {
            let view = match self.coordinator.current_view(company.id) {
                Ok(view) => view,
                Err(AppError::NotFound(_)) => {
                    warn!(company_id = company.id, "company without location row; skipping");
                    continue;
                }
                Err(err) => return Err(err),
            };
            items.push(ListingItem {
                id: company.id,
                name: company.name.clone(),
                city: company.city.clone(),
                address: company.address.clone(),
                state: view.state,
                coordinates: view.resolved_coordinates(),
            });
        }

        let partial = items.iter().any(|item| item.coordinates.is_none());
        debug!(items = items.len(), partial, "listing view built");
        Ok(ListingView { items, partial })
    }
}
