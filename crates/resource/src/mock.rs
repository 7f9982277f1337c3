//! In-process mock orchestrator for tests and demos.
//!
//! URNs follow `urn:keel:{stack}::{project}::{qualified type}::{name}` where
//! the qualified type is prefixed by the parent's (`Parent$Child`). Outputs
//! echo the resolved inputs merged with canned outputs.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use keel_core::{KeelError, KeelResult, ResolutionFailure};
use serde_json::Value as Json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, OutputResolvers, RegisterRequest};

/// When the mock settles a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Inside `register`.
    Immediate,
    /// Only on `complete_next` / `complete_all`.
    Manual,
    /// After a delay on the current `tokio::task::LocalSet`.
    Delayed(Duration),
}

/// Settlement decided at registration time.
#[derive(Debug, Clone)]
struct Completion {
    name: String,
    urn: String,
    id: String,
    outputs: Json,
    secret: bool,
    dry_run: bool,
    failure: Option<String>,
}

impl Completion {
    fn apply(self, resolvers: OutputResolvers) {
        if let Some(message) = self.failure {
            warn!(name = %self.name, error = %message, "mock registration failed");
            resolvers.reject(ResolutionFailure::new(message));
            return;
        }
        debug!(urn = %self.urn, dry_run = self.dry_run, "mock registration settled");
        let OutputResolvers { urn, id, outputs } = resolvers;
        urn.resolve(self.urn);
        if self.dry_run {
            // id and outputs stay unknown for the rest of the preview
            return;
        }
        id.resolve(self.id);
        if self.secret {
            outputs.resolve_secret(self.outputs);
        } else {
            outputs.resolve(self.outputs);
        }
    }
}

pub struct MockEngine {
    project: String,
    stack: String,
    dry_run: bool,
    mode: CompletionMode,
    declared: RefCell<BTreeSet<(String, String)>>,
    registered: RefCell<Vec<RegisterRequest>>,
    queue: RefCell<VecDeque<(Completion, OutputResolvers)>>,
    in_flight: Rc<Cell<usize>>,
    canned_outputs: HashMap<String, Json>,
    canned_ids: HashMap<String, String>,
    failures: HashMap<String, String>,
}

impl MockEngine {
    pub fn new(project: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stack: stack.into(),
            dry_run: false,
            mode: CompletionMode::Immediate,
            declared: RefCell::new(BTreeSet::new()),
            registered: RefCell::new(Vec::new()),
            queue: RefCell::new(VecDeque::new()),
            in_flight: Rc::new(Cell::new(0)),
            canned_outputs: HashMap::new(),
            canned_ids: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: CompletionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn preview(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Extra provider-computed outputs for the resource with logical `name`.
    pub fn with_outputs(mut self, name: impl Into<String>, outputs: Json) -> Self {
        self.canned_outputs.insert(name.into(), outputs);
        self
    }

    pub fn with_id(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.canned_ids.insert(name.into(), id.into());
        self
    }

    /// Make the registration of `name` fail with `message`.
    pub fn fail_on(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(name.into(), message.into());
        self
    }

    /// Registrations received so far, in arrival order.
    pub fn registered(&self) -> Vec<RegisterRequest> {
        self.registered.borrow().clone()
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.registered.borrow().iter().map(|r| r.name.clone()).collect()
    }

    pub fn declared_count(&self) -> usize {
        self.declared.borrow().len()
    }

    /// Registrations waiting for manual completion.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Delayed completions spawned but not yet applied.
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Settle the oldest queued registration. Returns false when idle.
    pub fn complete_next(&self) -> bool {
        let next = self.queue.borrow_mut().pop_front();
        match next {
            Some((completion, resolvers)) => {
                completion.apply(resolvers);
                true
            }
            None => false,
        }
    }

    /// Settle queued registrations until none remain, including ones that
    /// become ready along the way. Returns how many were settled.
    pub fn complete_all(&self) -> usize {
        let mut n = 0usize;
        while self.complete_next() {
            n += 1;
        }
        n
    }

    fn urn_for(&self, request: &RegisterRequest) -> String {
        let qualified = match request.parent.as_deref().and_then(|p| p.split("::").nth(2)) {
            Some(parent_type) => format!("{}${}", parent_type, request.type_token),
            None => request.type_token.clone(),
        };
        format!("urn:keel:{}::{}::{}::{}", self.stack, self.project, qualified, request.name)
    }

    fn completion_for(&self, request: &RegisterRequest) -> Completion {
        let id = self.canned_ids.get(&request.name).cloned().unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}", request.name, &suffix[..8])
        });
        let mut outputs = match &request.inputs {
            Json::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(Json::Object(extra)) = self.canned_outputs.get(&request.name) {
            for (k, v) in extra {
                outputs.insert(k.clone(), v.clone());
            }
        }
        Completion {
            name: request.name.clone(),
            urn: self.urn_for(request),
            id,
            outputs: Json::Object(outputs),
            secret: request.secret_inputs,
            dry_run: self.dry_run,
            failure: self.failures.get(&request.name).cloned(),
        }
    }
}

impl Engine for MockEngine {
    fn project(&self) -> &str {
        &self.project
    }

    fn stack(&self) -> &str {
        &self.stack
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn declare(&self, type_token: &str, name: &str) -> KeelResult<()> {
        let fresh = self.declared.borrow_mut().insert((type_token.to_string(), name.to_string()));
        if !fresh {
            return Err(KeelError::DuplicateResource { type_token: type_token.to_string(), name: name.to_string() });
        }
        Ok(())
    }

    fn register(&self, request: RegisterRequest, resolvers: OutputResolvers) {
        let completion = self.completion_for(&request);
        info!(urn = %completion.urn, deps = request.dependencies.len(), "mock register");
        self.registered.borrow_mut().push(request);
        match self.mode {
            CompletionMode::Immediate => completion.apply(resolvers),
            CompletionMode::Manual => self.queue.borrow_mut().push_back((completion, resolvers)),
            CompletionMode::Delayed(delay) => {
                let in_flight = Rc::clone(&self.in_flight);
                in_flight.set(in_flight.get() + 1);
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    in_flight.set(in_flight.get() - 1);
                    completion.apply(resolvers);
                });
            }
        }
    }
}
