//! Foreign metal3 BareMetalHost: the power-management record.
//!
//! The reboot state machine mutates only `spec.online` (desired power)
//! and polls `status.poweredOn` (observed power). Everything else on
//! the host is carried through untouched.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec of a metal3 BareMetalHost, modeled fields plus pass-through.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metal3.io",
    version = "v1alpha1",
    kind = "BareMetalHost",
    plural = "baremetalhosts",
    shortname = "bmh",
    status = "BareMetalHostStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostSpec {
    /// Desired power state; the power-management backend converges on it
    #[serde(default)]
    pub online: bool,
    /// Unmodeled spec fields
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Status of a metal3 BareMetalHost.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostStatus {
    /// Observed power state reported by the power-management backend
    #[serde(default)]
    pub powered_on: bool,
    /// Unmodeled status fields
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl BareMetalHost {
    /// Observed power state; an absent status reads as powered off.
    pub fn powered_on(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.powered_on)
    }
}
