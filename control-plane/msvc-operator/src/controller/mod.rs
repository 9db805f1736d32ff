pub mod backoff;
pub mod dependent;
pub mod diff;
pub mod errors;
pub mod events;
pub mod reconcile;
pub mod status;
pub mod store;

use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::{Controller, controller, controller::Action, watcher};
use kube::{Api, Client};
use tracing::{debug, info, instrument, warn};

pub use backoff::RetryBackoff;
pub use dependent::{Change, Dependent, DependentKind, Verb};
pub use errors::{DependentFailure, ErrorClass, ReconcileErr, StoreError};
pub use reconcile::{ObjectKey, Outcome, Reconciler, ReconcilerSettings};
pub use store::{KubeStore, Removal, StoreClient, StoreObject};

use crate::config::OperatorConfig;
use crate::crd::microservice::MicroService;
use crate::templates::{MANAGED_BY, MANAGED_BY_LABEL};

pub const FINALIZER: &str = "devops.kinnylee.com/finalizer";
pub const CONTROLLER_NAME: &str = "microservice-operator";

pub struct ControllerContext {
    pub reconciler: Reconciler<KubeStore>,
    pub recorder: Recorder,
    pub cfg: OperatorConfig,
}

fn scoped<K>(client: &Client, ns: Option<&str>) -> Api<K>
where
    K: StoreObject,
{
    match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

pub async fn run_controller(
    client: Client,
    cfg: OperatorConfig,
) -> anyhow::Result<()> {
    let ns = cfg.watch_namespace().map(str::to_string);
    let ms_api: Api<MicroService> = scoped(&client, ns.as_deref());
    let owned = watcher::Config::default()
        .labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY}"));

    let reporter = Reporter {
        controller: CONTROLLER_NAME.into(),
        instance: std::env::var("POD_NAME").ok(),
    };
    let recorder = Recorder::new(client.clone(), reporter);
    let reconciler = Reconciler::new(
        KubeStore::new(client.clone()),
        ReconcilerSettings::from(&cfg),
        RetryBackoff::from(&cfg.retry),
    );
    info!(
        namespace = ns.as_deref().unwrap_or("<all>"),
        workers = cfg.workers,
        deletion = %cfg.deletion_strategy,
        "starting microservice controller"
    );
    let workers = cfg.workers.max(1);
    let ctx = Arc::new(ControllerContext {
        reconciler,
        recorder,
        cfg,
    });

    Controller::new(ms_api, watcher::Config::default())
        .owns(scoped::<Deployment>(&client, ns.as_deref()), owned.clone())
        .owns(scoped::<Service>(&client, ns.as_deref()), owned.clone())
        .owns(scoped::<Ingress>(&client, ns.as_deref()), owned)
        .with_config(controller::Config::default().concurrency(workers))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    debug!(object = %obj_ref, ?action, "reconciled")
                }
                Err(e) => warn!(error = %e, "reconcile error"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}

#[instrument(skip_all, fields(key = tracing::field::Empty))]
async fn reconcile(
    obj: Arc<MicroService>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let key = ObjectKey::from(obj.as_ref());
    tracing::Span::current().record("key", tracing::field::display(&key));
    let outcome = ctx
        .reconciler
        .reconcile_with_timeout(&key, ctx.cfg.reconcile_timeout())
        .await?;
    events::publish_outcome(&ctx.recorder, &obj, &outcome).await;
    outcome.into_action(ctx.cfg.resync())
}

fn error_policy(
    obj: Arc<MicroService>,
    error: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = ObjectKey::from(obj.as_ref());
    let delay = ctx.reconciler.retry_delay(&key, error);
    debug!(%key, class = %error.class(), ?delay, "requeue after error");
    Action::requeue(delay)
}
