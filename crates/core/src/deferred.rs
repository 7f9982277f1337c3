//! Deferred values: single-assignment cells settled by the orchestrator.
//!
//! A `DeferredValue<T>` is either pending, resolved (with a secret tag) or
//! failed. Derived values are built by registering continuations; nothing is
//! polled and nothing runs on another thread. The orchestrator side holds a
//! [`Resolver`] and settles the cell exactly once. A resolver that is dropped
//! without settling leaves the value (and everything derived from it) pending
//! forever, which is the normal outcome for identity fields during preview.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use futures::channel::oneshot;
use tracing::trace;

use crate::{ResolutionFailure, Value};

/// A settled value together with its secret tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub secret: bool,
}

pub type Outcome<T> = Result<Resolved<T>, ResolutionFailure>;

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>)>;

enum State<T> {
    Pending,
    Settled(Outcome<T>),
}

struct Inner<T> {
    state: RefCell<State<T>>,
    queue: RefCell<VecDeque<Continuation<T>>>,
    // Set while queued continuations run, so late subscribers keep FIFO order.
    draining: Cell<bool>,
    secret: Cell<bool>,
}

impl<T: Clone + 'static> Inner<T> {
    fn new(state: State<T>, secret: bool) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(state),
            queue: RefCell::new(VecDeque::new()),
            draining: Cell::new(false),
            secret: Cell::new(secret),
        })
    }

    fn settled(&self) -> Option<Outcome<T>> {
        match &*self.state.borrow() {
            State::Pending => None,
            State::Settled(outcome) => Some(outcome.clone()),
        }
    }

    fn settle(&self, outcome: Outcome<T>) {
        {
            let mut state = self.state.borrow_mut();
            if matches!(*state, State::Settled(_)) {
                return;
            }
            let outcome = outcome.map(|mut r| {
                r.secret |= self.secret.get();
                r
            });
            if matches!(&outcome, Ok(r) if r.secret) {
                self.secret.set(true);
            }
            *state = State::Settled(outcome);
        }
        self.drain();
    }

    fn subscribe(&self, k: Continuation<T>) {
        match self.settled() {
            Some(outcome) if !self.draining.get() => k(&outcome),
            _ => self.queue.borrow_mut().push_back(k),
        }
    }

    fn drain(&self) {
        let Some(outcome) = self.settled() else { return };
        self.draining.set(true);
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(k) => k(&outcome),
                None => break,
            }
        }
        self.draining.set(false);
    }
}

/// An eventually-available value.
pub struct DeferredValue<T> {
    inner: Rc<Inner<T>>,
}

/// Orchestrator-side handle that settles one `DeferredValue`.
pub struct Resolver<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for DeferredValue<T> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

/// Identity comparison: two handles are equal when they share one cell.
impl<T> PartialEq for DeferredValue<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for DeferredValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner.state.borrow() {
            State::Pending => f.write_str("DeferredValue(<pending>)"),
            State::Settled(Ok(r)) if r.secret => f.write_str("DeferredValue([secret])"),
            State::Settled(Ok(r)) => f.debug_tuple("DeferredValue").field(&r.value).finish(),
            State::Settled(Err(e)) => write!(f, "DeferredValue(<failed: {}>)", e.message),
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resolver")
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let unsettled = self.inner.state.try_borrow().map(|s| matches!(*s, State::Pending)).unwrap_or(false);
        if unsettled {
            let waiting = self.inner.queue.try_borrow().map(|q| q.len()).unwrap_or(0);
            trace!(waiting, "resolver dropped unsettled; value stays pending");
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub fn resolve(self, value: T) {
        self.inner.settle(Ok(Resolved { value, secret: false }));
    }

    pub fn resolve_secret(self, value: T) {
        self.inner.settle(Ok(Resolved { value, secret: true }));
    }

    pub fn reject(self, failure: ResolutionFailure) {
        self.inner.settle(Err(failure));
    }

    pub fn settle(self, outcome: Outcome<T>) {
        self.inner.settle(outcome);
    }
}

impl<T: Clone + 'static> DeferredValue<T> {
    fn with_secret(secret: bool) -> (Self, Resolver<T>) {
        let inner = Inner::new(State::Pending, secret);
        (Self { inner: Rc::clone(&inner) }, Resolver { inner })
    }

    /// A pending value and the resolver that will settle it.
    pub fn pending() -> (Self, Resolver<T>) {
        Self::with_secret(false)
    }

    pub fn known(value: T) -> Self {
        Self { inner: Inner::new(State::Settled(Ok(Resolved { value, secret: false })), false) }
    }

    pub fn secret(value: T) -> Self {
        Self { inner: Inner::new(State::Settled(Ok(Resolved { value, secret: true })), true) }
    }

    pub fn failed(failure: ResolutionFailure) -> Self {
        Self { inner: Inner::new(State::Settled(Err(failure)), false) }
    }

    pub fn is_secret(&self) -> bool {
        self.inner.secret.get()
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Settled(Ok(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Settled(Err(_)))
    }

    /// Current state without registering anything. `None` while pending.
    pub fn peek(&self) -> Option<Result<T, ResolutionFailure>> {
        self.inner.settled().map(|o| o.map(|r| r.value))
    }

    /// Register a continuation. Runs at most once, in registration order,
    /// immediately if the value is already settled.
    pub fn subscribe(&self, k: impl FnOnce(&Outcome<T>) + 'static) {
        self.inner.subscribe(Box::new(k));
    }

    /// Await settlement from inside an event loop. Never completes for a value
    /// that is never settled.
    pub async fn wait(&self) -> Result<T, ResolutionFailure> {
        let (tx, rx) = oneshot::channel();
        self.subscribe(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        match rx.await {
            Ok(outcome) => outcome.map(|r| r.value),
            Err(oneshot::Canceled) => Err(ResolutionFailure::new("deferred value dropped before resolution")),
        }
    }

    /// Transform the resolved value. `f` runs once if `self` resolves, never
    /// otherwise; the result inherits the secret tag.
    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> DeferredValue<U> {
        let (out, resolver) = DeferredValue::with_secret(self.is_secret());
        self.subscribe(move |outcome| match outcome {
            Ok(r) => resolver.settle(Ok(Resolved { value: f(r.value.clone()), secret: r.secret })),
            Err(e) => resolver.reject(e.clone()),
        });
        out
    }

    /// Transform into another deferred value; the result is secret if either
    /// `self` or the value returned by `f` is.
    pub fn flat_map<U: Clone + 'static>(
        &self,
        f: impl FnOnce(T) -> DeferredValue<U> + 'static,
    ) -> DeferredValue<U> {
        let (out, resolver) = DeferredValue::with_secret(self.is_secret());
        self.subscribe(move |outcome| match outcome {
            Ok(r) => {
                let upstream_secret = r.secret;
                f(r.value.clone()).subscribe(move |next| {
                    resolver.settle(next.clone().map(|mut n| {
                        n.secret |= upstream_secret;
                        n
                    }))
                });
            }
            Err(e) => resolver.reject(e.clone()),
        });
        out
    }

    pub fn zip<U: Clone + 'static>(&self, other: &DeferredValue<U>) -> DeferredValue<(T, U)> {
        let right = other.clone();
        let out = self.flat_map(move |a| right.map(move |b| (a, b)));
        if other.is_secret() {
            out.inner.secret.set(true);
        }
        out
    }

    /// Same value, tagged secret.
    pub fn as_secret(&self) -> Self {
        let (out, resolver) = Self::with_secret(true);
        self.subscribe(move |outcome| resolver.settle(outcome.clone()));
        out
    }

    /// Explicit declassification for display code: `f` sees the value and its
    /// secret tag and the result is never secret.
    pub fn redact_with<U: Clone + 'static>(&self, f: impl FnOnce(T, bool) -> U + 'static) -> DeferredValue<U> {
        let (out, resolver) = DeferredValue::with_secret(false);
        self.subscribe(move |outcome| match outcome {
            Ok(r) => resolver.resolve(f(r.value.clone(), r.secret)),
            Err(e) => resolver.reject(e.clone()),
        });
        out
    }
}

struct JoinState<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
    secret: bool,
    resolver: Option<Resolver<Vec<T>>>,
}

/// Join deferred values into one deferred vector, in input order. Resolves
/// only when every input resolves; fails on the first failure.
pub fn join<T: Clone + 'static>(items: impl IntoIterator<Item = DeferredValue<T>>) -> DeferredValue<Vec<T>> {
    let items: Vec<DeferredValue<T>> = items.into_iter().collect();
    let secret = items.iter().any(DeferredValue::is_secret);
    let (out, resolver) = DeferredValue::with_secret(secret);
    if items.is_empty() {
        resolver.resolve(Vec::new());
        return out;
    }
    let state = Rc::new(RefCell::new(JoinState {
        slots: vec![None; items.len()],
        remaining: items.len(),
        secret,
        resolver: Some(resolver),
    }));
    for (idx, item) in items.iter().enumerate() {
        let state = Rc::clone(&state);
        item.subscribe(move |outcome| {
            let mut st = state.borrow_mut();
            match outcome {
                Err(e) => {
                    if let Some(resolver) = st.resolver.take() {
                        drop(st);
                        resolver.reject(e.clone());
                    }
                }
                Ok(r) => {
                    if st.resolver.is_none() {
                        return;
                    }
                    st.slots[idx] = Some(r.value.clone());
                    st.secret |= r.secret;
                    st.remaining -= 1;
                    if st.remaining == 0 {
                        let values: Vec<T> = st.slots.drain(..).flatten().collect();
                        let secret = st.secret;
                        let resolver = st.resolver.take();
                        drop(st);
                        if let Some(resolver) = resolver {
                            resolver.settle(Ok(Resolved { value: values, secret }));
                        }
                    }
                }
            }
        });
    }
    out
}

/// One piece of a [`stringify`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Literal(String),
    Deferred(DeferredValue<String>),
}

impl From<&str> for Part {
    fn from(s: &str) -> Self {
        Part::Literal(s.to_owned())
    }
}

impl From<String> for Part {
    fn from(s: String) -> Self {
        Part::Literal(s)
    }
}

impl From<DeferredValue<String>> for Part {
    fn from(d: DeferredValue<String>) -> Self {
        Part::Deferred(d)
    }
}

impl From<&DeferredValue<String>> for Part {
    fn from(d: &DeferredValue<String>) -> Self {
        Part::Deferred(d.clone())
    }
}

/// Concatenate literal and deferred string parts in order.
pub fn stringify<P: Into<Part>>(parts: impl IntoIterator<Item = P>) -> DeferredValue<String> {
    let parts = parts.into_iter().map(|p| match p.into() {
        Part::Literal(s) => DeferredValue::known(s),
        Part::Deferred(d) => d,
    });
    join(parts).map(|pieces| pieces.concat())
}

/// Names bound to resolved values for the body of [`bind`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    names: Vec<String>,
    values: Vec<Value>,
}

impl Bindings {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names.iter().position(|n| n == name).map(|i| &self.values[i])
    }

    /// Like `get`, but unknown names read as `Null`.
    pub fn value(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// Dynamic binding combinator: resolve every `(name, value)` pair, then run
/// `body` with the names bound positionally. The typed form is [`crate::bind!`].
pub fn bind<N, R>(
    pairs: impl IntoIterator<Item = (N, DeferredValue<Value>)>,
    body: impl FnOnce(&Bindings) -> R + 'static,
) -> DeferredValue<R>
where
    N: Into<String>,
    R: Clone + 'static,
{
    let (names, values): (Vec<String>, Vec<DeferredValue<Value>>) =
        pairs.into_iter().map(|(n, d)| (n.into(), d)).unzip();
    join(values).map(move |values| body(&Bindings { names, values }))
}

/// Bind deferred values to names and evaluate a body over the resolved values.
///
/// ```ignore
/// let total = bind!(a = width, b = height => a * b);
/// ```
#[macro_export]
macro_rules! bind {
    (@zip $d:expr) => { ::core::clone::Clone::clone(&$d) };
    (@zip $d:expr, $($rest:expr),+) => {
        $crate::DeferredValue::zip(&$d, &$crate::bind!(@zip $($rest),+))
    };
    (@pat $n:ident) => { $n };
    (@pat $n:ident, $($rest:ident),+) => { ($n, $crate::bind!(@pat $($rest),+)) };
    ($($name:ident = $d:expr),+ $(,)? => $body:expr) => {
        $crate::DeferredValue::map(&$crate::bind!(@zip $($d),+), move |__keel_bound| {
            let $crate::bind!(@pat $($name),+) = __keel_bound;
            $body
        })
    };
}
