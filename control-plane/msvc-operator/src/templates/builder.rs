//! Renders the Deployment, Service and Ingress a MicroService should own.
//!
//! Rendering is pure: the same MicroService always yields byte-identical
//! manifests, which is what lets the diff engine treat "no change" as
//! "no write".

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, LocalObjectReference, PodSpec, PodTemplateSpec,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend,
    IngressRule, IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta, OwnerReference,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use super::validate as naming;
use crate::crd::microservice::{MicroService, ResourceRef};

pub const APP_LABEL: &str = "app";
pub const OWNER_LABEL: &str = "devops.kinnylee.com/microservice";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "microservice-operator";

pub const CONTAINER_PORT: i32 = 8080;
pub const SERVICE_PORT: i32 = 80;
pub const PULL_POLICY: &str = "Always";
pub const PROTOCOL: &str = "TCP";
pub const INGRESS_PATH: &str = "/";
pub const INGRESS_PATH_TYPE: &str = "Prefix";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("name '{0}' must be a DNS-1035 label (lowercase alphanumerics and '-', starting with a letter, at most 63 characters)")]
    InvalidName(String),
    #[error("image '{0}' must be a non-empty reference without whitespace")]
    InvalidImage(String),
    #[error("host '{0}' must be a DNS-1123 subdomain, optionally prefixed with '*.'")]
    InvalidHost(String),
    #[error("secret '{0}' must be a DNS-1123 subdomain")]
    InvalidSecret(String),
    #[error("object has no uid; owner references cannot be built")]
    MissingUid,
}

/// Cluster-wide knobs that shape rendering without coming from the spec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub ingress_class: Option<String>,
}

/// Manifests a MicroService should own. A `None` slot means the kind is not
/// part of the target set and any owned leftover gets deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    pub deployment: Option<Deployment>,
    pub service: Option<Service>,
    pub ingress: Option<Ingress>,
}

impl DesiredState {
    pub fn resource_refs(&self) -> Vec<ResourceRef> {
        let named = |kind: &str, meta: Option<&ObjectMeta>| {
            meta.and_then(|m| m.name.clone()).map(|name| ResourceRef {
                kind: kind.to_string(),
                name,
            })
        };
        [
            named("Deployment", self.deployment.as_ref().map(|d| &d.metadata)),
            named("Service", self.service.as_ref().map(|s| &s.metadata)),
            named("Ingress", self.ingress.as_ref().map(|i| &i.metadata)),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Labels selecting the MicroService's pods. Shared by the Deployment
/// selector, the pod template and the Service selector.
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

/// Labels stamped on every dependent's metadata.
pub fn managed_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(name);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.insert(OWNER_LABEL.to_string(), name.to_string());
    labels
}

pub fn validate(ms: &MicroService) -> Result<(), BuildError> {
    let name = ms.name_any();
    if !naming::is_dns1035_label(&name) {
        return Err(BuildError::InvalidName(name));
    }
    if !naming::is_image_ref(&ms.spec.image) {
        return Err(BuildError::InvalidImage(ms.spec.image.clone()));
    }
    if !naming::is_ingress_host(&ms.spec.host) {
        return Err(BuildError::InvalidHost(ms.spec.host.clone()));
    }
    if let Some(secret) = ms.spec.pull_secret() {
        if !naming::is_dns1123_subdomain(secret) {
            return Err(BuildError::InvalidSecret(secret.to_string()));
        }
    }
    Ok(())
}

pub fn build(
    ms: &MicroService,
    opts: &BuildOptions,
) -> Result<DesiredState, BuildError> {
    validate(ms)?;
    let owner = ms
        .controller_owner_ref(&())
        .filter(|o| !o.uid.is_empty())
        .ok_or(BuildError::MissingUid)?;
    let ctx = RenderContext {
        name: ms.name_any(),
        namespace: ms.namespace(),
        owner,
    };
    Ok(DesiredState {
        deployment: Some(render_deployment(&ctx, ms)),
        service: Some(render_service(&ctx)),
        ingress: Some(render_ingress(&ctx, ms, opts)),
    })
}

struct RenderContext {
    name: String,
    namespace: Option<String>,
    owner: OwnerReference,
}

impl RenderContext {
    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: self.namespace.clone(),
            labels: Some(managed_labels(&self.name)),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }
}

fn render_deployment(ctx: &RenderContext, ms: &MicroService) -> Deployment {
    let pod_labels = selector_labels(&ctx.name);
    let image_pull_secrets = ms.spec.pull_secret().map(|secret| {
        vec![LocalObjectReference {
            name: secret.to_string(),
        }]
    });
    let container = Container {
        name: ctx.name.clone(),
        image: Some(ms.spec.image.clone()),
        image_pull_policy: Some(PULL_POLICY.to_string()),
        ports: Some(vec![ContainerPort {
            container_port: CONTAINER_PORT,
            protocol: Some(PROTOCOL.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };
    Deployment {
        metadata: ctx.metadata(),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    image_pull_secrets,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_service(ctx: &RenderContext) -> Service {
    Service {
        metadata: ctx.metadata(),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&ctx.name)),
            ports: Some(vec![ServicePort {
                name: Some(ctx.name.clone()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                protocol: Some(PROTOCOL.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_ingress(
    ctx: &RenderContext,
    ms: &MicroService,
    opts: &BuildOptions,
) -> Ingress {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: ctx.name.clone(),
            port: Some(ServiceBackendPort {
                number: Some(SERVICE_PORT),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };
    Ingress {
        metadata: ctx.metadata(),
        spec: Some(IngressSpec {
            ingress_class_name: opts.ingress_class.clone(),
            rules: Some(vec![IngressRule {
                host: Some(ms.spec.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(INGRESS_PATH.to_string()),
                        path_type: INGRESS_PATH_TYPE.to_string(),
                        backend,
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
