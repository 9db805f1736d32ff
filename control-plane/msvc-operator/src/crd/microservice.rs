use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired shape of a single HTTP microservice: one image served behind a
/// Service and exposed on `host` through an Ingress.
#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema,
)]
#[kube(
    group = "devops.kinnylee.com",
    version = "v1",
    kind = "MicroService",
    plural = "microservices",
    shortname = "ms",
    namespaced,
    status = "MicroServiceStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Condition","type":"string","jsonPath":".status.condition"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MicroServiceSpec {
    /// Container image reference, pulled on every pod start.
    pub image: String,
    /// Host name routed to the service by the generated Ingress.
    pub host: String,
    /// Name of an image pull secret in the same namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl MicroServiceSpec {
    /// Pull secret name, treating an empty string as unset.
    pub fn pull_secret(&self) -> Option<&str> {
        self.secret.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MicroServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Child resources managed for this MicroService.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRef>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    Ready,
    Progressing,
    Error,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::Progressing => write!(f, "Progressing"),
            ConditionType::Error => write!(f, "Error"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
}
