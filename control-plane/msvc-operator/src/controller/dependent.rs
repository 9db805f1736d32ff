//! Per-kind knowledge of which fields the controller owns.
//!
//! Everything outside the managed subset (replica counts, server-assigned
//! defaults, foreign labels, sidecar containers) is carried over from the
//! observed object untouched.
//!
//! The pod's `imagePullSecrets` list is owned whole: it mirrors
//! `spec.secret`, so clearing that field removes the entry. Secrets other
//! writers add to the pod template do not survive a converge.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use super::store::StoreObject;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependentKind {
    Deployment,
    Service,
    Ingress,
}

impl DependentKind {
    /// Removal order on teardown: traffic entry first, workload last.
    pub const TEARDOWN_ORDER: [DependentKind; 3] = [
        DependentKind::Ingress,
        DependentKind::Service,
        DependentKind::Deployment,
    ];
}

impl std::fmt::Display for DependentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependentKind::Deployment => write!(f, "Deployment"),
            DependentKind::Service => write!(f, "Service"),
            DependentKind::Ingress => write!(f, "Ingress"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

/// What a convergence step did to one dependent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub kind: DependentKind,
    pub name: String,
    pub verb: Verb,
}

impl Change {
    pub fn new(kind: DependentKind, name: impl Into<String>, verb: Verb) -> Self {
        Self {
            kind,
            name: name.into(),
            verb,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.verb != Verb::Unchanged
    }
}

pub trait Dependent: StoreObject + PartialEq {
    const KIND: DependentKind;

    /// `actual` with every controller-owned field taken from `desired`.
    /// The result equals `actual` exactly when nothing managed drifted.
    fn merge_managed(actual: &Self, desired: &Self) -> Self;
}

impl Dependent for Deployment {
    const KIND: DependentKind = DependentKind::Deployment;

    fn merge_managed(actual: &Self, desired: &Self) -> Self {
        let mut out = actual.clone();
        merge_meta(&mut out.metadata, &desired.metadata);
        let Some(want) = desired.spec.as_ref() else {
            return out;
        };
        let spec = out.spec.get_or_insert_with(Default::default);
        spec.selector = want.selector.clone();

        if let Some(labels) =
            want.template.metadata.as_ref().and_then(|m| m.labels.as_ref())
        {
            let meta = spec.template.metadata.get_or_insert_with(Default::default);
            merge_labels(&mut meta.labels, labels);
        }
        if let Some(want_pod) = want.template.spec.as_ref() {
            let pod = spec.template.spec.get_or_insert_with(Default::default);
            // Owned whole; a merge could never drop a removed secret.
            pod.image_pull_secrets = want_pod.image_pull_secrets.clone();
            for container in &want_pod.containers {
                merge_container(&mut pod.containers, container);
            }
        }
        out
    }
}

impl Dependent for Service {
    const KIND: DependentKind = DependentKind::Service;

    fn merge_managed(actual: &Self, desired: &Self) -> Self {
        let mut out = actual.clone();
        merge_meta(&mut out.metadata, &desired.metadata);
        let Some(want) = desired.spec.as_ref() else {
            return out;
        };
        let spec = out.spec.get_or_insert_with(Default::default);
        spec.selector = want.selector.clone();
        if let Some(want_ports) = want.ports.as_ref() {
            let observed = spec.ports.take().unwrap_or_default();
            let ports = want_ports
                .iter()
                .map(|p| {
                    let mut port = p.clone();
                    // nodePort is allocated by the cluster, never by us.
                    if port.node_port.is_none() {
                        port.node_port = observed
                            .iter()
                            .find(|o| o.name == p.name && o.port == p.port)
                            .and_then(|o| o.node_port);
                    }
                    port
                })
                .collect();
            spec.ports = Some(ports);
        }
        out
    }
}

impl Dependent for Ingress {
    const KIND: DependentKind = DependentKind::Ingress;

    fn merge_managed(actual: &Self, desired: &Self) -> Self {
        let mut out = actual.clone();
        merge_meta(&mut out.metadata, &desired.metadata);
        let Some(want) = desired.spec.as_ref() else {
            return out;
        };
        let spec = out.spec.get_or_insert_with(Default::default);
        spec.rules = want.rules.clone();
        if want.ingress_class_name.is_some() {
            spec.ingress_class_name = want.ingress_class_name.clone();
        }
        out
    }
}

fn merge_meta(meta: &mut ObjectMeta, desired: &ObjectMeta) {
    if let Some(labels) = desired.labels.as_ref() {
        merge_labels(&mut meta.labels, labels);
    }
    if let Some(owners) = desired.owner_references.as_ref() {
        merge_owner_refs(&mut meta.owner_references, owners);
    }
}

fn merge_labels(
    into: &mut Option<BTreeMap<String, String>>,
    from: &BTreeMap<String, String>,
) {
    let labels = into.get_or_insert_with(Default::default);
    for (k, v) in from {
        if labels.get(k) != Some(v) {
            labels.insert(k.clone(), v.clone());
        }
    }
}

fn merge_owner_refs(
    into: &mut Option<Vec<OwnerReference>>,
    from: &[OwnerReference],
) {
    let owners = into.get_or_insert_with(Default::default);
    for want in from {
        match owners.iter_mut().find(|o| o.uid == want.uid) {
            Some(existing) => {
                if existing != want {
                    *existing = want.clone();
                }
            }
            None => owners.push(want.clone()),
        }
    }
}

fn merge_container(containers: &mut Vec<Container>, want: &Container) {
    match containers.iter_mut().find(|c| c.name == want.name) {
        Some(c) => {
            c.image = want.image.clone();
            c.image_pull_policy = want.image_pull_policy.clone();
            c.ports = want.ports.clone();
        }
        None => containers.push(want.clone()),
    }
}

/// Whether `meta` names `uid` as an owner.
pub fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == uid)
}

/// Whether some other object is the managing controller of `meta`.
pub fn is_controlled_elsewhere(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.controller == Some(true) && o.uid != uid)
}
