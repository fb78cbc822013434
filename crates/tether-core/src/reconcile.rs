//! Status reconciler: folds what a backend reports into the stored status.

use std::sync::Arc;

use tracing::{info, warn};

use tether_db::models::TaskStatus;

use crate::driver::{Driver, TaskContext};
use crate::error::Result;
use crate::store::TaskStore;
use crate::tunnel::TunnelAllocator;

pub struct Reconciler {
    store: Arc<dyn TaskStore>,
    tunnels: Arc<TunnelAllocator>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TaskStore>, tunnels: Arc<TunnelAllocator>) -> Self {
        Self { store, tunnels }
    }

    /// Probe the backend and persist any change. Terminal tasks are left
    /// alone; a task that turns out to have exited loses its relay.
    pub async fn reconcile(&self, driver: &dyn Driver, ctx: &TaskContext) -> Result<TaskStatus> {
        let current = ctx.task.status;
        if current.is_terminal() {
            return Ok(current);
        }
        let Some(observed) = driver.probe(ctx).await? else {
            return Ok(current);
        };
        if observed == current {
            return Ok(current);
        }

        if observed.is_terminal() {
            if let Err(e) = self.tunnels.stop(&ctx.task).await {
                warn!(task_id = %ctx.task.id, error = %e, "failed to stop relay of exited task");
            }
        }
        self.store.set_status(ctx.task.id, observed).await?;
        info!(task_id = %ctx.task.id, from = %current, to = %observed, "task status changed");
        Ok(observed)
    }
}
