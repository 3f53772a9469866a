//! Attach/detach state of the call interceptor.
//!
//! `register()` and `unregister()` act on every bound subscriber. Scopes
//! (`pause`, `suppress`, `lift`) belong to the thread that opened them: each
//! thread keeps its own stack of scopes per gate, and a guard removes only
//! its own entry when dropped. Guards dropped out of order, or scopes on
//! different threads that overlap, therefore never leave stale state behind.
//!
//! The subscriber slots hold the interceptor while the gate is registered or
//! while any thread has a `lift` scope open. [`GateCore::intercepts_here`]
//! tells the interceptor whether the calling thread records.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::reload;

use crate::err_msg;
use crate::error::Result;

/// Name of the step that pulls the interceptor out of the host. Calls with
/// this name are never recorded.
pub(crate) const DETACH_FUNCTION: &str = "detach_hooks";

/// Installs (`true`) or removes (`false`) the interceptor from one subscriber.
pub(crate) type Hook = Box<dyn Fn(bool) -> Result<(), reload::Error> + Send + Sync>;

static NEXT_GATE: AtomicU64 = AtomicU64::new(0);
static NEXT_SCOPE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // gate id -> scopes opened on this thread, outermost first
    static SCOPES: RefCell<HashMap<u64, Vec<Scope>>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Not intercepting, recording still allowed.
    Pause,
    /// Nothing is recorded.
    Suppress,
    /// Intercepting and recording, whatever the outer scopes say.
    Lift,
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    id: u64,
    kind: ScopeKind,
}

/// The part of the gate the interceptor consults on every notification.
#[derive(Debug)]
pub struct GateCore {
    id: u64,
    active: bool,
    attached: AtomicBool,
}

impl GateCore {
    /// Whether calls on the calling thread are recorded right now.
    pub fn intercepts_here(&self) -> bool {
        if !self.active {
            return false;
        }
        match innermost(self.id, |_| true) {
            Some(ScopeKind::Pause | ScopeKind::Suppress) => false,
            Some(ScopeKind::Lift) => true,
            None => self.attached.load(Ordering::SeqCst),
        }
    }

    /// Whether a disable scope silences the calling thread.
    pub fn suppressed_here(&self) -> bool {
        innermost(self.id, |kind| kind != ScopeKind::Pause) == Some(ScopeKind::Suppress)
    }
}

fn innermost(gate: u64, relevant: impl Fn(ScopeKind) -> bool) -> Option<ScopeKind> {
    SCOPES
        .try_with(|scopes| {
            scopes.borrow().get(&gate).and_then(|stack| {
                stack
                    .iter()
                    .rev()
                    .map(|scope| scope.kind)
                    .find(|kind| relevant(*kind))
            })
        })
        .ok()
        .flatten()
}

#[derive(Default)]
struct Slots {
    hooks: Vec<Hook>,
    installed: bool,
    // open lift scopes over all threads
    lifts: usize,
}

pub struct Gate {
    core: Arc<GateCore>,
    slots: Mutex<Slots>,
}

impl Gate {
    /// An inactive gate never attaches anything; used by the dummy instrumenter.
    pub fn new(active: bool) -> Self {
        Self {
            core: Arc::new(GateCore {
                id: NEXT_GATE.fetch_add(1, Ordering::Relaxed),
                active,
                attached: AtomicBool::new(false),
            }),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub(crate) fn core(&self) -> &Arc<GateCore> {
        &self.core
    }

    /// Whether the interceptor records calls on the calling thread.
    pub fn is_registered(&self) -> bool {
        self.core.intercepts_here()
    }

    /// Whether a disable scope silences the calling thread.
    pub fn is_suppressed(&self) -> bool {
        self.core.suppressed_here()
    }

    /// Installs the interceptor in every bound subscriber. No-op when already attached.
    pub fn register(&self) -> Result<()> {
        self.set_attached(true)
    }

    /// Removes the interceptor from every bound subscriber. No-op when already detached.
    pub fn unregister(&self) -> Result<()> {
        self.set_attached(false)
    }

    /// Stops intercepting on this thread, without silencing the manual API.
    pub fn pause(&self) -> GateGuard<'_> {
        self.open(ScopeKind::Pause)
    }

    /// Stops intercepting and silences all recording on this thread.
    pub fn suppress(&self) -> GateGuard<'_> {
        self.open(ScopeKind::Suppress)
    }

    /// Intercepts and records on this thread, also inside a disable scope
    /// and while the gate is unregistered.
    pub fn lift(&self) -> Result<GateGuard<'_>> {
        if self.core.active {
            let mut slots = self.lock_slots();
            slots.lifts += 1;
            if let Err(e) = self.sync(&mut slots) {
                slots.lifts -= 1;
                return Err(e);
            }
        }
        Ok(self.open(ScopeKind::Lift))
    }

    /// Adds a subscriber slot, filling it right away when the interceptor is installed.
    pub(crate) fn bind(&self, hook: Hook) -> Result<()> {
        let mut slots = self.lock_slots();
        if slots.installed {
            hook(true)?;
        }
        slots.hooks.push(hook);
        Ok(())
    }

    fn open(&self, kind: ScopeKind) -> GateGuard<'_> {
        let scope = Scope {
            id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        let gate = self.core.id;
        let pushed = SCOPES.try_with(|scopes| {
            scopes.borrow_mut().entry(gate).or_default().push(scope);
        });
        if pushed.is_err() {
            err_msg!("gate scope opened while the thread is shutting down");
        }
        GateGuard {
            gate: self,
            scope,
            _not_send: PhantomData,
        }
    }

    fn close(&self, scope: Scope) -> Result<()> {
        let gate = self.core.id;
        // a thread being torn down has nothing left to close
        let _ = SCOPES.try_with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            if let Some(stack) = scopes.get_mut(&gate) {
                stack.retain(|open| open.id != scope.id);
                if stack.is_empty() {
                    scopes.remove(&gate);
                }
            }
        });

        if scope.kind == ScopeKind::Lift && self.core.active {
            let mut slots = self.lock_slots();
            slots.lifts = slots.lifts.saturating_sub(1);
            self.sync(&mut slots)?;
        }
        Ok(())
    }

    fn set_attached(&self, attach: bool) -> Result<()> {
        if !self.core.active {
            return Ok(());
        }
        let mut slots = self.lock_slots();
        let previous = self.core.attached.swap(attach, Ordering::SeqCst);
        if previous == attach {
            return Ok(());
        }
        if let Err(e) = self.sync(&mut slots) {
            self.core.attached.store(previous, Ordering::SeqCst);
            return Err(e);
        }
        tracing::debug!(attached = attach, "call interceptor toggled");
        Ok(())
    }

    // brings the slots in line with the registration and the open lift scopes
    fn sync(&self, slots: &mut Slots) -> Result<()> {
        let wanted = self.core.attached.load(Ordering::SeqCst) || slots.lifts > 0;
        if slots.installed == wanted {
            return Ok(());
        }
        if wanted {
            attach_hooks(&mut slots.hooks)?;
        } else {
            detach_hooks(&mut slots.hooks)?;
        }
        slots.installed = wanted;
        tracing::debug!(installed = wanted, subscribers = slots.hooks.len(), "interceptor slots updated");
        Ok(())
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn attach_hooks(hooks: &mut Vec<Hook>) -> Result<()> {
    flip_hooks(hooks, true)
}

fn detach_hooks(hooks: &mut Vec<Hook>) -> Result<()> {
    flip_hooks(hooks, false)
}

// slots whose subscriber is gone are dropped
fn flip_hooks(hooks: &mut Vec<Hook>, attach: bool) -> Result<()> {
    let mut result = Ok(());
    hooks.retain(|hook| match hook(attach) {
        Ok(()) => true,
        Err(e) if e.is_dropped() => false,
        Err(e) => {
            result = Err(e.into());
            true
        }
    });
    result
}

/// Closes one gate scope on the thread that opened it, on every exit path.
/// Only this scope is removed; scopes opened before or after it stay open.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a Gate,
    scope: Scope,
    // scopes live in the opening thread's state
    _not_send: PhantomData<*const ()>,
}

impl GateGuard<'_> {
    pub fn kind(&self) -> ScopeKind {
        self.scope.kind
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.gate.close(self.scope) {
            err_msg!("failed to close call interceptor scope: {e}");
        }
    }
}
