use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::FINALIZER;
use super::backoff::RetryBackoff;
use super::dependent::{Change, Dependent, Verb, is_owned_by};
use super::diff;
use super::errors::{DependentFailure, ErrorClass, ReconcileErr, StoreError};
use super::status::{desired_status, should_patch_status};
use super::store::{Removal, StoreClient};
use crate::config::{DeletionStrategy, OperatorConfig};
use crate::crd::microservice::{ConditionType, MicroService};
use crate::templates::{BuildOptions, DesiredState, build};

/// Identity of a declared resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&MicroService> for ObjectKey {
    fn from(ms: &MicroService) -> Self {
        Self::new(
            ms.namespace().unwrap_or_else(|| "default".to_string()),
            ms.name_any(),
        )
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub deletion: DeletionStrategy,
    /// Immediate re-runs of a pass that hit an optimistic-concurrency
    /// conflict before handing it to the requeue backoff.
    pub conflict_retries: u32,
    pub build: BuildOptions,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            deletion: DeletionStrategy::default(),
            conflict_retries: 3,
            build: BuildOptions::default(),
        }
    }
}

impl From<&OperatorConfig> for ReconcilerSettings {
    fn from(cfg: &OperatorConfig) -> Self {
        Self {
            deletion: cfg.deletion_strategy,
            conflict_retries: cfg.retry.conflict_retries,
            build: BuildOptions {
                ingress_class: cfg.ingress_class().map(str::to_string),
            },
        }
    }
}

/// Result of one reconcile invocation.
#[derive(Debug)]
pub enum Outcome {
    /// Dependents match the spec; carries what this pass changed.
    Converged(Vec<Change>),
    /// The declared resource no longer exists.
    Absent,
    /// Teardown finished and the finalizer is gone.
    Finalized(Vec<Change>),
    /// Transient failure; requeue with backoff.
    Retry(ReconcileErr),
    /// Permanent failure recorded in status; wait for the next change.
    Failed(ReconcileErr),
}

impl Outcome {
    /// Mutations this invocation actually made, including partial progress
    /// of a failed pass.
    pub fn changes(&self) -> Vec<&Change> {
        let all: &[Change] = match self {
            Outcome::Converged(c) | Outcome::Finalized(c) => c,
            Outcome::Retry(e) | Outcome::Failed(e) => e.applied(),
            Outcome::Absent => &[],
        };
        all.iter().filter(|c| c.is_mutation()).collect()
    }

    pub fn into_action(
        self,
        resync: Option<Duration>,
    ) -> Result<Action, ReconcileErr> {
        match self {
            Outcome::Converged(_) => {
                Ok(resync.map_or_else(Action::await_change, Action::requeue))
            }
            Outcome::Absent | Outcome::Finalized(_) | Outcome::Failed(_) => {
                Ok(Action::await_change())
            }
            Outcome::Retry(err) => Err(err),
        }
    }
}

/// Drives a MicroService and its three dependents toward the declared
/// state, one identity at a time.
pub struct Reconciler<S> {
    store: S,
    settings: ReconcilerSettings,
    backoff: RetryBackoff,
    span: Span,
}

impl<S: StoreClient> Reconciler<S> {
    pub fn new(
        store: S,
        settings: ReconcilerSettings,
        backoff: RetryBackoff,
    ) -> Self {
        let span = info_span!("reconciler", deletion = %settings.deletion);
        Self {
            store,
            settings,
            backoff,
            span,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Requeue delay for a failed invocation of `key`.
    pub fn retry_delay(&self, key: &ObjectKey, err: &ReconcileErr) -> Duration {
        self.backoff.next_delay(&key.to_string(), err.class())
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Outcome {
        let span = info_span!(
            parent: &self.span,
            "reconcile",
            ns = %key.namespace,
            name = %key.name
        );
        self.run(key).instrument(span).await
    }

    /// [`Self::reconcile`] bounded by `timeout`. An elapsed pass is dropped
    /// mid-flight and reported as [`ReconcileErr::Timeout`].
    pub async fn reconcile_with_timeout(
        &self,
        key: &ObjectKey,
        timeout: Duration,
    ) -> Result<Outcome, ReconcileErr> {
        match tokio::time::timeout(timeout, self.reconcile(key)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                warn!(%key, ?timeout, "reconcile timed out");
                Err(ReconcileErr::Timeout(timeout))
            }
        }
    }

    async fn run(&self, key: &ObjectKey) -> Outcome {
        let mut landed = Vec::new();
        let mut conflicts = 0;
        loop {
            let ms = match self
                .store
                .get::<MicroService>(&key.namespace, &key.name)
                .await
            {
                Ok(Some(ms)) => ms,
                Ok(None) => {
                    debug!("resource gone");
                    self.backoff.reset(&key.to_string());
                    return Outcome::Absent;
                }
                Err(e) => return self.settle(key, None, e.into()).await,
            };

            let deleting = ms.meta().deletion_timestamp.is_some();
            let result = if deleting {
                self.finalize(&ms).await
            } else {
                self.apply(&ms).await
            };

            match result {
                Ok(mut changes) => {
                    self.backoff.reset(&key.to_string());
                    landed.append(&mut changes);
                    let mutated = landed.iter().filter(|c| c.is_mutation()).count();
                    if deleting {
                        info!(deleted = mutated, "teardown complete");
                        return Outcome::Finalized(landed);
                    }
                    if mutated > 0 {
                        info!(changes = mutated, "converged");
                    } else {
                        debug!("already converged");
                    }
                    return Outcome::Converged(landed);
                }
                Err(err)
                    if err.class() == ErrorClass::Conflict
                        && conflicts < self.settings.conflict_retries =>
                {
                    conflicts += 1;
                    debug!(attempt = conflicts, error = %err, "conflict; re-reading and retrying");
                    landed.extend(
                        err.applied().iter().filter(|c| c.is_mutation()).cloned(),
                    );
                }
                Err(err) => {
                    let err = carry_landed(err, landed);
                    return self.settle(key, Some(&ms), err).await;
                }
            }
        }
    }

    /// One forward pass: finalizer bookkeeping, build, converge, status.
    async fn apply(&self, ms: &MicroService) -> Result<Vec<Change>, ReconcileErr> {
        let ms = self.ensure_finalizer(ms).await?;
        let desired = build(&ms, &self.settings.build)?;
        let changes = self.converge(&ms, &desired).await?;

        let status = desired_status(
            ms.status.as_ref(),
            ConditionType::Ready,
            "all dependents converged",
            ms.meta().generation,
            desired.resource_refs(),
        );
        if should_patch_status(ms.status.as_ref(), &status) {
            let key = ObjectKey::from(&ms);
            self.store
                .update_status(&key.namespace, &key.name, &status)
                .await?;
        }
        Ok(changes)
    }

    /// Hold the finalizer under the finalizer strategy and drop a stale one
    /// otherwise. Returns the object as it now stands in the store.
    async fn ensure_finalizer(
        &self,
        ms: &MicroService,
    ) -> Result<MicroService, ReconcileErr> {
        let held = has_finalizer(ms);
        let want = self.settings.deletion == DeletionStrategy::Finalizer;
        if held == want {
            return Ok(ms.clone());
        }
        let key = ObjectKey::from(ms);
        let mut updated = ms.clone();
        if want {
            info!("adding finalizer");
            updated.finalizers_mut().push(FINALIZER.to_string());
        } else {
            info!("dropping finalizer left by the finalizer strategy");
            updated.finalizers_mut().retain(|f| f != FINALIZER);
        }
        Ok(self.store.replace(&key.namespace, &updated).await?)
    }

    async fn converge(
        &self,
        ms: &MicroService,
        desired: &DesiredState,
    ) -> Result<Vec<Change>, ReconcileErr> {
        let key = ObjectKey::from(ms);
        let (ns, name) = (key.namespace.as_str(), key.name.as_str());
        let uid = ms.uid().unwrap_or_default();
        let store = &self.store;

        let (deployment, service, ingress) = tokio::join!(
            diff::converge::<Deployment, _>(
                store,
                ns,
                name,
                desired.deployment.as_ref(),
                &uid
            ),
            diff::converge::<Service, _>(
                store,
                ns,
                name,
                desired.service.as_ref(),
                &uid
            ),
            diff::converge::<Ingress, _>(
                store,
                ns,
                name,
                desired.ingress.as_ref(),
                &uid
            ),
        );

        let mut applied = Vec::with_capacity(3);
        let mut failures = Vec::new();
        for result in [deployment, service, ingress] {
            match result {
                Ok(change) => applied.push(change),
                Err(failure) => failures.push(failure),
            }
        }
        if failures.is_empty() {
            Ok(applied)
        } else {
            applied.retain(Change::is_mutation);
            Err(ReconcileErr::Dependents { failures, applied })
        }
    }

    /// Teardown for a resource marked for deletion. Dependents go in
    /// traffic-first order and the finalizer is released last.
    async fn finalize(&self, ms: &MicroService) -> Result<Vec<Change>, ReconcileErr> {
        if !has_finalizer(ms) {
            debug!("deleting without our finalizer; nothing to do");
            return Ok(Vec::new());
        }
        let mut changes = Vec::new();
        if self.settings.deletion == DeletionStrategy::Finalizer {
            self.remove::<Ingress>(ms, &mut changes).await?;
            self.remove::<Service>(ms, &mut changes).await?;
            self.remove::<Deployment>(ms, &mut changes).await?;
        }

        let key = ObjectKey::from(ms);
        let mut released = ms.clone();
        released.finalizers_mut().retain(|f| f != FINALIZER);
        match self.store.replace(&key.namespace, &released).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {
                info!("finalizer removed");
                Ok(changes)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn remove<K: Dependent>(
        &self,
        ms: &MicroService,
        changes: &mut Vec<Change>,
    ) -> Result<(), ReconcileErr> {
        let key = ObjectKey::from(ms);
        let (ns, name) = (key.namespace.as_str(), key.name.as_str());
        let uid = ms.uid().unwrap_or_default();
        let failed = |error: StoreError, applied: &[Change]| ReconcileErr::Dependents {
            failures: vec![DependentFailure {
                kind: K::KIND,
                name: name.to_string(),
                error,
            }],
            applied: applied.to_vec(),
        };

        let actual = match self.store.get::<K>(ns, name).await {
            Ok(Some(actual)) => actual,
            Ok(None) => return Ok(()),
            Err(e) => return Err(failed(e, changes.as_slice())),
        };
        if !is_owned_by(actual.meta(), &uid) {
            debug!(kind = %K::KIND, %name, "not owned; leaving in place");
            return Ok(());
        }
        if actual.meta().deletion_timestamp.is_some() {
            return Err(ReconcileErr::Terminating {
                kind: K::KIND,
                name: name.to_string(),
                applied: changes.clone(),
            });
        }
        match self.store.delete::<K>(ns, name).await {
            Ok(Removal::Deleted) => {
                info!(kind = %K::KIND, %name, "deleted");
                changes.push(Change::new(K::KIND, name, Verb::Deleted));
                Ok(())
            }
            Ok(Removal::Absent) => Ok(()),
            Ok(Removal::Pending) => {
                info!(kind = %K::KIND, %name, "deletion accepted; waiting");
                changes.push(Change::new(K::KIND, name, Verb::Deleted));
                Err(ReconcileErr::Terminating {
                    kind: K::KIND,
                    name: name.to_string(),
                    applied: changes.clone(),
                })
            }
            Err(e) => Err(failed(e, changes.as_slice())),
        }
    }

    /// Record a failed pass on the resource and pick the outcome.
    async fn settle(
        &self,
        key: &ObjectKey,
        ms: Option<&MicroService>,
        err: ReconcileErr,
    ) -> Outcome {
        let class = err.class();
        if class.is_transient() {
            warn!(%class, error = %err, "reconcile failed; will retry");
            if let Some(ms) = ms {
                let message = format!("retrying: {err}");
                if let Err(e) =
                    self.write_condition(ms, ConditionType::Progressing, message).await
                {
                    warn!(error = %e, "could not record progress in status");
                }
            }
            return Outcome::Retry(err);
        }

        match class {
            ErrorClass::Forbidden => {
                error!(error = %err, "permission denied; giving up until the resource changes")
            }
            _ => warn!(%class, error = %err, "reconcile failed permanently"),
        }
        if let Some(ms) = ms {
            if let Err(e) =
                self.write_condition(ms, ConditionType::Error, err.to_string()).await
            {
                if e.class().is_transient() {
                    warn!(error = %e, "could not record failure in status; retrying");
                    return Outcome::Retry(err);
                }
                error!(error = %e, "could not record failure in status");
            }
        }
        self.backoff.reset(&key.to_string());
        Outcome::Failed(err)
    }

    async fn write_condition(
        &self,
        ms: &MicroService,
        condition: ConditionType,
        message: String,
    ) -> Result<(), StoreError> {
        let current = ms.status.as_ref();
        let status = desired_status(
            current,
            condition,
            message,
            ms.meta().generation,
            current.map(|s| s.resources.clone()).unwrap_or_default(),
        );
        if !should_patch_status(current, &status) {
            return Ok(());
        }
        let key = ObjectKey::from(ms);
        self.store
            .update_status(&key.namespace, &key.name, &status)
            .await
            .map(|_| ())
    }
}

fn has_finalizer(ms: &MicroService) -> bool {
    ms.finalizers().iter().any(|f| f == FINALIZER)
}

fn carry_landed(mut err: ReconcileErr, mut landed: Vec<Change>) -> ReconcileErr {
    if let ReconcileErr::Dependents { applied, .. }
    | ReconcileErr::Terminating { applied, .. } = &mut err
    {
        landed.append(applied);
        *applied = landed;
    }
    err
}
