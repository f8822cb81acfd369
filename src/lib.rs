mod companies;
mod config;
mod db;
mod errors;
mod geocoder;
mod listing;
mod location;
mod owners;
mod resolution;
pub mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::companies::{CompanyRecord, CompanyUpdate, NewCompany};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::db::SharedConnection;
pub use crate::errors::{AppError, AppResult};
pub use crate::geocoder::{
    parse_point, Coordinates, GeocodeError, GeocodingProvider, GeocodingService, HttpGeocoder,
};
pub use crate::listing::{ListingAggregator, ListingItem, ListingView};
pub use crate::location::{
    build_query_address, CompanyLocation, FailureReason, LocationStore, LocationView,
    ResolutionState,
};
pub use crate::owners::{OwnerInput, OwnerRecord};
pub use crate::resolution::ResolutionCoordinator;

pub struct AppState {
    db: SharedConnection,
    db_path: PathBuf,
    config: AppConfig,
    coordinator: ResolutionCoordinator,
    listing: ListingAggregator,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub db_path: String,
    pub in_flight_resolutions: usize,
    pub config: PublicAppConfig,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let geocoder = GeocodingService::new(&config)?;
        Self::with_geocoder(config, geocoder)
    }

    /// Builds the state around an explicit geocoder, e.g. one pointed at a mock server.
    pub fn with_geocoder(config: AppConfig, geocoder: GeocodingService) -> AppResult<Self> {
        let (db, db_path) =
            db::bootstrap(&config.data_dir, &config.database_file_name)?.into_shared();
        let coordinator = ResolutionCoordinator::new(
            LocationStore::new(Arc::clone(&db)),
            geocoder,
            config.geocoder_max_in_flight,
        );
        let listing = ListingAggregator::new(coordinator.clone(), config.listing_limit);

        Ok(Self {
            db,
            db_path,
            config,
            coordinator,
            listing,
        })
    }

    pub fn db(&self) -> &SharedConnection {
        &self.db
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &ResolutionCoordinator {
        &self.coordinator
    }

    pub fn listing(&self) -> &ListingAggregator {
        &self.listing
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            db_path: self.db_path.to_string_lossy().to_string(),
            in_flight_resolutions: self.coordinator.in_flight_count(),
            config: self.config.public_profile(),
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,company_directory=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    init_tracing();
    let state = Arc::new(AppState::initialize(config)?);
    server::serve(state).await
}
