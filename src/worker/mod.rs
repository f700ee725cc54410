//! The expensive tier: a long-lived service hosting every state-changing
//! operation. Scout, cron and the dynamic scheduler all land here over HTTP.

mod cycle;
mod dispatch;
mod planner;
mod reconcile;
mod server;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::TokenBroker;
use crate::config::Config;
use crate::pricing::PricingApi;
use crate::scheduler::SchedulerClient;
use crate::sheet::SheetClient;
use crate::store::{SecretStore, StateStore};
use crate::tesla::VehicleApi;

pub use cycle::{run_cycle, CycleOutcome};
pub use dispatch::{cleanup_single_session, send_special_schedule, CleanupOutcome, DispatchOutcome};
pub use planner::{run_daily_check, PlannerOutcome, Strategy};
pub use reconcile::{reconcile, ReconcileOutcome};
pub use server::serve;

/// Everything the handlers share. All collaborators sit behind traits so
/// the control logic can be exercised without a vehicle.
pub struct WorkerContext {
    pub config: Config,
    pub vehicle: Arc<dyn VehicleApi>,
    pub store: Arc<dyn StateStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub broker: Arc<TokenBroker>,
    pub pricing: Arc<dyn PricingApi>,
    pub sheet: Arc<dyn SheetClient>,
    pub scheduler: Arc<dyn SchedulerClient>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        vehicle: Arc<dyn VehicleApi>,
        store: Arc<dyn StateStore>,
        secrets: Arc<dyn SecretStore>,
        broker: Arc<TokenBroker>,
        pricing: Arc<dyn PricingApi>,
        sheet: Arc<dyn SheetClient>,
        scheduler: Arc<dyn SchedulerClient>,
    ) -> Self {
        WorkerContext {
            config,
            vehicle,
            store,
            secrets,
            broker,
            pricing,
            sheet,
            scheduler,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Transitions of one session must be serialised; different sessions may
    /// proceed concurrently.
    pub async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
