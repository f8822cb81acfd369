//! Lazy coordinate resolution with per-company single-flight.
//!
//! Read paths never wait on the geocoder: `get_or_trigger` answers from the
//! store and, when the location is not resolved yet, hands the lookup to a
//! background worker. At most one worker exists per company at a time.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::errors::{AppError, AppResult};
use crate::geocoder::GeocodingService;
use crate::location::{build_query_address, LocationStore, LocationView};

#[derive(Clone)]
pub struct ResolutionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: LocationStore,
    geocoder: GeocodingService,
    registry: InFlightRegistry,
    workers: Semaphore,
}

impl ResolutionCoordinator {
    pub fn new(store: LocationStore, geocoder: GeocodingService, max_in_flight: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                geocoder,
                registry: InFlightRegistry::default(),
                workers: Semaphore::new(max_in_flight.max(1)),
            }),
        }
    }

    /// Returns the stored view and, unless it is resolved, makes sure a
    /// resolution is running for `company_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_trigger(
        &self,
        company_id: i64,
        city: &str,
        address: &str,
        name: &str,
    ) -> AppResult<LocationView> {
        let view = self.current_view(company_id)?;
        if view.is_resolved() {
            return Ok(view);
        }

        match self.inner.registry.try_claim(company_id) {
            Some(done) => {
                let query = build_query_address(city, address, name);
                debug!(company_id, query = %query, state = %view.state, "scheduling resolution");
                self.spawn_resolution(company_id, query, done);
            }
            None => debug!(company_id, "resolution already in flight"),
        }
        Ok(view)
    }

    /// Read-only view of the stored location. Never schedules work.
    pub fn current_view(&self, company_id: i64) -> AppResult<LocationView> {
        self.inner
            .store
            .load(company_id)?
            .map(LocationView::from)
            .ok_or_else(|| AppError::not_found("company", company_id))
    }

    /// Waits for the in-flight resolution of `company_id`, if any.
    pub async fn settle(&self, company_id: i64) {
        if let Some(mut done) = self.inner.registry.waiter(company_id) {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Stops admitting provider calls and waits up to `grace` for running
    /// resolutions. Returns how many were still in flight at the deadline.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.inner.workers.close();
        let deadline = Instant::now() + grace;
        for (company_id, mut done) in self.inner.registry.waiters() {
            if timeout_at(deadline, done.wait_for(|finished| *finished))
                .await
                .is_err()
            {
                debug!(company_id, "drain deadline reached");
                break;
            }
        }

        let abandoned = self.inner.registry.len();
        if abandoned > 0 {
            warn!(abandoned, "abandoning in-flight resolutions at shutdown");
        } else {
            info!("all in-flight resolutions finished");
        }
        abandoned
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.len()
    }

    fn spawn_resolution(&self, company_id: i64, query: String, done: watch::Sender<bool>) {
        let worker_inner = Arc::clone(&self.inner);
        let worker = tokio::spawn(async move {
            worker_inner.resolve(company_id, &query).await;
        });

        let supervisor_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = worker.await {
                if err.is_panic() {
                    error!(company_id, "resolution worker panicked");
                } else {
                    warn!(company_id, "resolution worker cancelled");
                }
            }
            supervisor_inner.registry.release(company_id);
            done.send_replace(true);
        });
    }
}

impl Inner {
    async fn resolve(&self, company_id: i64, query: &str) {
        match self.store.mark_pending(company_id, query) {
            Ok(true) => {}
            Ok(false) => {
                debug!(company_id, "location missing or already resolved; skipping");
                return;
            }
            Err(err) => {
                error!(company_id, error = %err, "failed to mark location pending");
                return;
            }
        }

        let Ok(_permit) = self.workers.acquire().await else {
            debug!(company_id, "worker pool closed; leaving location pending");
            return;
        };

        let written = match self.geocoder.resolve(query).await {
            Ok(coordinates) => {
                info!(company_id, %coordinates, "location resolved");
                self.store.mark_resolved(company_id, coordinates)
            }
            Err(err) => {
                let reason = err.reason();
                warn!(
                    company_id,
                    reason = reason.as_tag(),
                    error = %err,
                    "location resolution failed"
                );
                self.store.mark_failed(company_id, reason, &err.to_string())
            }
        };

        match written {
            Ok(true) => {}
            Ok(false) => debug!(company_id, "location removed during resolution"),
            Err(err) => error!(company_id, error = %err, "failed to persist resolution outcome"),
        }
    }
}

struct InFlight {
    started_at: Instant,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct InFlightRegistry {
    entries: Mutex<HashMap<i64, InFlight>>,
}

impl InFlightRegistry {
    /// Inserts an entry if none exists; the caller that gets the sender owns the run.
    fn try_claim(&self, company_id: i64) -> Option<watch::Sender<bool>> {
        match self.entries.lock().entry(company_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(false);
                slot.insert(InFlight {
                    started_at: Instant::now(),
                    done: rx,
                });
                Some(tx)
            }
        }
    }

    fn release(&self, company_id: i64) {
        if let Some(entry) = self.entries.lock().remove(&company_id) {
            debug!(
                company_id,
                elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                "resolution finished"
            );
        }
    }

    fn waiter(&self, company_id: i64) -> Option<watch::Receiver<bool>> {
        self.entries
            .lock()
            .get(&company_id)
            .map(|entry| entry.done.clone())
    }

    fn waiters(&self) -> Vec<(i64, watch::Receiver<bool>)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.done.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::companies::{create_company, NewCompany};
    use crate::db::bootstrap;
    use crate::geocoder::{Coordinates, GeocodeError, GeocodingProvider};
    use crate::location::{FailureReason, ResolutionState};
    use crate::owners::{create_owner, OwnerInput};

    enum Step {
        Point(f64, f64),
        NotFound,
        OutOfRange,
        Panic,
    }

    struct ScriptedProvider {
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        gate: Semaphore,
    }

    impl ScriptedProvider {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Self::with_gate(steps, Semaphore::MAX_PERMITS)
        }

        fn gated(steps: Vec<Step>) -> Arc<Self> {
            Self::with_gate(steps, 0)
        }

        fn with_gate(steps: Vec<Step>, permits: usize) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(permits),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodingProvider for ScriptedProvider {
        async fn resolve(&self, query_address: &str) -> Result<Coordinates, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            let step = self.script.lock().pop_front();
            match step {
                Some(Step::Point(lat, lon)) => Coordinates::new(lat, lon),
                Some(Step::NotFound) => Err(GeocodeError::NotFound(query_address.to_string())),
                Some(Step::OutOfRange) => Coordinates::new(95.0, 37.6),
                Some(Step::Panic) => panic!("provider exploded"),
                None => Err(GeocodeError::Transient("script exhausted".into())),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        coordinator: ResolutionCoordinator,
        company_id: i64,
    }

    impl Fixture {
        fn trigger(&self) -> LocationView {
            self.coordinator
                .get_or_trigger(self.company_id, "Moscow", "Tverskaya 1", "Acme")
                .unwrap()
        }

        fn state(&self) -> LocationView {
            self.coordinator.current_view(self.company_id).unwrap()
        }
    }

    fn fixture(provider: Arc<ScriptedProvider>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (db, _path) = bootstrap(dir.path(), "resolution.db")
            .unwrap()
            .into_shared();
        let company_id = {
            let conn = db.lock();
            let owner = create_owner(
                &conn,
                &OwnerInput {
                    full_name: "Owner".into(),
                    email: "owner@example.com".into(),
                    phone: String::new(),
                },
            )
            .unwrap();
            create_company(
                &conn,
                &NewCompany {
                    owner_id: owner.id,
                    name: "Acme".into(),
                    inn: "1234567890".into(),
                    city: "Moscow".into(),
                    address: "Tverskaya 1".into(),
                    ..NewCompany::default()
                },
            )
            .unwrap()
            .id
        };
        let geocoder = GeocodingService::from_provider(provider, 1000);
        Fixture {
            _dir: dir,
            coordinator: ResolutionCoordinator::new(LocationStore::new(db), geocoder, 4),
            company_id,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_issue_one_provider_call() {
        let provider = ScriptedProvider::gated(vec![Step::Point(55.76, 37.611)]);
        let fx = fixture(provider.clone());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let coordinator = fx.coordinator.clone();
            let company_id = fx.company_id;
            handles.push(tokio::spawn(async move {
                coordinator.get_or_trigger(company_id, "Moscow", "Tverskaya 1", "Acme")
            }));
        }
        for handle in handles {
            let view = handle.await.unwrap().unwrap();
            assert!(matches!(
                view.state,
                ResolutionState::Unresolved | ResolutionState::Pending
            ));
            assert!(view.resolved_coordinates().is_none());
        }
        assert_eq!(fx.coordinator.in_flight_count(), 1);

        provider.gate.add_permits(1);
        fx.coordinator.settle(fx.company_id).await;

        assert_eq!(provider.calls(), 1);
        assert_eq!(fx.coordinator.in_flight_count(), 0);
        let view = fx.state();
        assert_eq!(view.state, ResolutionState::Resolved);
        assert_eq!(view.query_address.as_deref(), Some("Moscow, Tverskaya 1, Acme"));
    }

    #[tokio::test]
    async fn resolved_location_is_returned_without_provider_call() {
        let provider = ScriptedProvider::new(vec![Step::Point(55.76, 37.611)]);
        let fx = fixture(provider.clone());

        fx.trigger();
        fx.coordinator.settle(fx.company_id).await;
        let stored = fx.state().resolved_coordinates().unwrap();

        let again = fx.trigger();
        assert!(again.is_resolved());
        assert_eq!(again.resolved_coordinates(), Some(stored));
        assert_eq!(fx.coordinator.in_flight_count(), 0);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn failed_location_is_retried_on_next_trigger() {
        let provider = ScriptedProvider::new(vec![Step::NotFound, Step::Point(55.76, 37.611)]);
        let fx = fixture(provider.clone());

        fx.trigger();
        fx.coordinator.settle(fx.company_id).await;
        let failed = fx.state();
        assert_eq!(failed.state, ResolutionState::Failed);
        assert_eq!(failed.failure_reason, Some(FailureReason::NotFoundUpstream));
        assert!(failed.last_attempt_at.is_some());

        let returned = fx.trigger();
        assert_eq!(returned.state, ResolutionState::Failed);
        fx.coordinator.settle(fx.company_id).await;

        let resolved = fx.state();
        assert!(resolved.is_resolved());
        assert!(resolved.failure_reason.is_none());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn out_of_range_result_never_resolves() {
        let provider = ScriptedProvider::new(vec![Step::OutOfRange]);
        let fx = fixture(provider.clone());

        fx.trigger();
        fx.coordinator.settle(fx.company_id).await;

        let view = fx.state();
        assert_eq!(view.state, ResolutionState::Failed);
        assert_eq!(view.failure_reason, Some(FailureReason::InvalidCoordinates));
        assert!(view.coordinates.is_none());
    }

    #[tokio::test]
    async fn panicking_worker_releases_registry_entry() {
        let provider = ScriptedProvider::new(vec![Step::Panic, Step::Point(10.0, 20.0)]);
        let fx = fixture(provider.clone());

        fx.trigger();
        fx.coordinator.settle(fx.company_id).await;
        assert_eq!(fx.coordinator.in_flight_count(), 0);
        assert_eq!(fx.state().state, ResolutionState::Pending);

        fx.trigger();
        fx.coordinator.settle(fx.company_id).await;
        assert!(fx.state().is_resolved());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_company_is_not_found() {
        let provider = ScriptedProvider::new(Vec::new());
        let fx = fixture(provider.clone());

        let result = fx
            .coordinator
            .get_or_trigger(fx.company_id + 1, "Moscow", "Nowhere", "Ghost");
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(fx.coordinator.in_flight_count(), 0);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn drain_abandons_stuck_resolutions() {
        let provider = ScriptedProvider::gated(vec![Step::Point(1.0, 1.0)]);
        let fx = fixture(provider.clone());

        fx.trigger();
        let started = Instant::now();
        while provider.calls() == 0 {
            assert!(started.elapsed() < Duration::from_secs(5), "provider never called");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let abandoned = fx.coordinator.drain(Duration::from_millis(50)).await;
        assert_eq!(abandoned, 1);
        assert_eq!(fx.state().state, ResolutionState::Pending);
    }

    #[tokio::test]
    async fn drain_returns_zero_when_idle() {
        let provider = ScriptedProvider::new(vec![Step::Point(1.0, 1.0)]);
        let fx = fixture(provider);

        fx.trigger();
        fx.coordinator.settle(fx.company_id).await;
        assert_eq!(fx.coordinator.drain(Duration::from_millis(50)).await, 0);
    }
}
