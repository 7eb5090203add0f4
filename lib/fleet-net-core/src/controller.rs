//! Controller runner shared by the member and hub agents

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use kube_runtime::controller::Action;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::Controller;
use tracing::{debug, info, warn};

use crate::objectmeta::ObjectKey;
use crate::store::StoreObject;
use crate::{FleetError, Result};

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Result of a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the next change or resync
    Done,
    /// Look again after the given delay
    RequeueAfter(Duration),
}

/// A level-triggered reconciler for one object kind, addressed by key.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome>;
}

struct Context<R> {
    reconciler: Arc<R>,
    resync: Duration,
}

/// Key of a watched object as a controller trigger
pub fn object_ref<K: StoreObject>(key: &ObjectKey) -> ObjectRef<K> {
    let obj_ref = ObjectRef::new(&key.name);
    if key.namespace.is_empty() {
        obj_ref
    } else {
        obj_ref.within(&key.namespace)
    }
}

/// Drives `reconciler` from `controller` until a shutdown signal arrives. Successful reconciles
/// are requeued after `resync` so state replicated across clusters converges even when an
/// event from the other cluster was missed.
pub async fn run_controller<K, R>(controller: Controller<K>, reconciler: Arc<R>, resync: Duration)
where
    K: StoreObject,
    R: Reconciler,
{
    let name = reconciler.name();
    info!(controller = name, "Starting controller");

    controller
        .shutdown_on_signal()
        .run(
            reconcile::<K, R>,
            error_policy::<K, R>,
            Arc::new(Context { reconciler, resync }),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj_ref, _)) => debug!(controller = name, object = %obj_ref, "Reconciled"),
                Err(e) => warn!(controller = name, error = %e, "Reconcile failed"),
            }
        })
        .await;

    info!(controller = name, "Controller stopped");
}

async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<Context<R>>) -> Result<Action>
where
    K: StoreObject,
    R: Reconciler,
{
    let key = ObjectKey::of(obj.as_ref());
    let name = ctx.reconciler.name();
    let start = Instant::now();
    debug!(controller = name, key = %key, "Reconciliation starts");

    let outcome = ctx.reconciler.reconcile(&key).await;
    debug!(
        controller = name,
        key = %key,
        latency_ms = start.elapsed().as_millis() as u64,
        "Reconciliation ends"
    );

    Ok(match outcome? {
        ReconcileOutcome::Done => Action::requeue(ctx.resync),
        ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
    })
}

fn error_policy<K, R>(obj: Arc<K>, err: &FleetError, ctx: Arc<Context<R>>) -> Action
where
    K: StoreObject,
    R: Reconciler,
{
    warn!(
        controller = ctx.reconciler.name(),
        key = %ObjectKey::of(obj.as_ref()),
        error = %err,
        "Reconcile error, requeueing"
    );
    Action::requeue(ERROR_REQUEUE)
}
