//! Decide and apply the single step that moves one dependent toward its
//! desired shape.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::dependent::{
    Change, Dependent, Verb, is_controlled_elsewhere, is_owned_by,
};
use super::errors::{DependentFailure, StoreError};
use super::store::StoreClient;

#[derive(Clone, Debug, PartialEq)]
pub enum Action<K> {
    Create(K),
    /// Observed object with managed fields overlaid; keeps the observed
    /// `resourceVersion` as the update precondition.
    Update(K),
    NoOp,
    /// Owned leftover of a kind no longer in the target set.
    Delete(String),
    /// Same name is held by another controller.
    Foreign(String),
    /// Observed object is being deleted; it must disappear before it can be
    /// recreated.
    Terminating(String),
}

pub fn plan<K: Dependent>(
    desired: Option<&K>,
    actual: Option<&K>,
    owner_uid: &str,
) -> Action<K> {
    match (desired, actual) {
        (Some(want), None) => Action::Create(want.clone()),
        (None, None) => Action::NoOp,
        (None, Some(have)) => {
            if is_owned_by(have.meta(), owner_uid) {
                Action::Delete(have.name_any())
            } else {
                Action::NoOp
            }
        }
        (Some(want), Some(have)) => {
            if is_controlled_elsewhere(have.meta(), owner_uid) {
                return Action::Foreign(have.name_any());
            }
            if have.meta().deletion_timestamp.is_some() {
                return Action::Terminating(have.name_any());
            }
            let merged = K::merge_managed(have, want);
            if &merged == have {
                Action::NoOp
            } else {
                Action::Update(merged)
            }
        }
    }
}

/// Read the current object, plan, and apply. `name` identifies the slot even
/// when nothing is desired for it.
pub async fn converge<K, S>(
    store: &S,
    ns: &str,
    name: &str,
    desired: Option<&K>,
    owner_uid: &str,
) -> Result<Change, DependentFailure>
where
    K: Dependent,
    S: StoreClient + ?Sized,
{
    let fail = |error: StoreError| DependentFailure {
        kind: K::KIND,
        name: name.to_string(),
        error,
    };
    let actual = store.get::<K>(ns, name).await.map_err(fail)?;
    let change = |verb| Change::new(K::KIND, name, verb);

    match plan(desired, actual.as_ref(), owner_uid) {
        Action::Create(obj) => {
            store.create(ns, &obj).await.map_err(fail)?;
            info!(kind = %K::KIND, %ns, %name, "created");
            Ok(change(Verb::Created))
        }
        Action::Update(obj) => {
            store.replace(ns, &obj).await.map_err(fail)?;
            info!(kind = %K::KIND, %ns, %name, "updated");
            Ok(change(Verb::Updated))
        }
        Action::NoOp => {
            debug!(kind = %K::KIND, %ns, %name, "in sync");
            Ok(change(Verb::Unchanged))
        }
        Action::Delete(name) => {
            store.delete::<K>(ns, &name).await.map_err(fail)?;
            info!(kind = %K::KIND, %ns, %name, "deleted leftover");
            Ok(change(Verb::Deleted))
        }
        Action::Foreign(name) => {
            warn!(kind = %K::KIND, %ns, %name, "name taken by another controller; leaving it alone");
            Err(fail(StoreError::Invalid(format!(
                "{} {name} exists and is controlled by another owner",
                K::KIND
            ))))
        }
        Action::Terminating(name) => {
            debug!(kind = %K::KIND, %ns, %name, "waiting for termination");
            // Someone else's finalizer decides when it goes; back off.
            Err(fail(StoreError::Unavailable(format!(
                "{} {name} is terminating",
                K::KIND
            ))))
        }
    }
}
