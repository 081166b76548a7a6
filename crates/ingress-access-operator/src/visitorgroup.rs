//! VisitorGroup CRD: named sets of source ranges allowed to reach exposed services

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VisitorGroup spec - a list of allowed visitor sources
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ingress.neo9.io",
    version = "v1",
    kind = "VisitorGroup",
    plural = "visitorgroups",
    shortname = "vg",
    namespaced = false,
    printcolumn = r#"{"name":"Sources", "type":"integer", "jsonPath":".spec.sources.length"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VisitorGroupSpec {
    /// Allowed sources
    #[serde(default)]
    pub sources: Vec<VisitorGroupSource>,
}

/// One allowed source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VisitorGroupSource {
    /// Human-readable label for the source
    pub name: String,
    /// CIDR block, e.g. `10.0.0.0/8`
    pub cidr: String,
}

impl VisitorGroupSpec {
    /// All CIDR blocks of the group, in declaration order
    pub fn cidrs(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.cidr.as_str()).collect()
    }
}
