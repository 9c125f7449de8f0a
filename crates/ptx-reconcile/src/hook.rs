use std::sync::Arc;

use ptx_orders::ReleaseHook;
use ptx_schemas::Order;
use tracing::{debug, warn};

use crate::ReputationWorker;

/// Reconciles both parties' reputation after an order is released.
pub struct ReputationTrigger {
    worker: Arc<ReputationWorker>,
}

impl ReputationTrigger {
    pub fn new(worker: Arc<ReputationWorker>) -> Self {
        Self { worker }
    }
}

impl ReleaseHook for ReputationTrigger {
    fn order_released(&self, order: &Order) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(order_id = %order.id, "no runtime; reputation trigger skipped");
            return;
        };
        let worker = Arc::clone(&self.worker);
        let users = vec![order.maker_id.clone(), order.taker_id.clone()];
        let order_id = order.id;
        rt.spawn(async move {
            match worker.reconcile_users(&users).await {
                Ok(report) => debug!(%order_id, updated = report.updated, "post-release reputation sync"),
                Err(e) => warn!(%order_id, error = %e, "post-release reputation sync failed"),
            }
        });
    }
}
