//! The orchestrator seam: what the construction facade needs from an engine.

use keel_core::{KeelResult, ResolutionFailure, Resolver};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A fully resolved registration, handed to the engine once every input and
/// prerequisite of a resource has resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "type")]
    pub type_token: String,
    pub name: String,
    pub inputs: Json,
    /// Some input was secret; engines must not persist `inputs` in plaintext.
    #[serde(default)]
    pub secret_inputs: bool,
    /// Parent URN.
    pub parent: Option<String>,
    /// Provider reference in `urn::id` form.
    pub provider: Option<String>,
    /// URNs of explicit dependencies and of resources referenced by inputs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub protect: bool,
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    #[serde(default)]
    pub delete_before_replace: bool,
    #[serde(default)]
    pub retain_on_delete: bool,
    #[serde(default)]
    pub additional_secret_outputs: Vec<String>,
}

/// The engine settles these once the resource's concrete state is known.
/// Dropping the id/outputs resolvers without settling is how a preview
/// leaves them unknown.
#[derive(Debug)]
pub struct OutputResolvers {
    pub urn: Resolver<String>,
    pub id: Resolver<String>,
    pub outputs: Resolver<Json>,
}

impl OutputResolvers {
    pub fn reject(self, failure: ResolutionFailure) {
        self.urn.reject(failure.clone());
        self.id.reject(failure.clone());
        self.outputs.reject(failure);
    }
}

/// Inbound orchestrator interface.
pub trait Engine {
    fn project(&self) -> &str;

    fn stack(&self) -> &str;

    /// Preview mode: ids and outputs never resolve.
    fn is_dry_run(&self) -> bool;

    /// Record a resource in the dependency graph at declaration time. Fails on
    /// a duplicate `(type, name)`.
    fn declare(&self, type_token: &str, name: &str) -> KeelResult<()>;

    /// Create or update the resource described by `request` and settle
    /// `resolvers` when done. May settle synchronously.
    fn register(&self, request: RegisterRequest, resolvers: OutputResolvers);
}
