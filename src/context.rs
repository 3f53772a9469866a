use std::sync::{Arc, OnceLock};

use tracing::Subscriber;
use tracing_subscriber::{registry::LookupSpan, reload};

use crate::config::{Config, InstrumenterKind};
use crate::err_msg;
use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::interceptor::{layer::RegionLayer, Exclusion, Interceptor};
use crate::sink::{Emitter, NullSink, RegionSink};

/// The instrumentation context: instrumenter kind, gate, call interceptor
/// and the sink they feed. Cloning is cheap and every clone shares state.
#[derive(Clone)]
pub struct Instrumentation {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) gate: Gate,
    pub(crate) emitter: Arc<Emitter>,
    pub(crate) interceptor: Option<Arc<Interceptor>>,
}

impl Instrumentation {
    pub fn new(config: Config, sink: impl RegionSink + 'static) -> Self {
        let emitter = Arc::new(Emitter::new(Arc::new(sink)));
        let interceptor = config.kind.flavor().map(|flavor| {
            Arc::new(Interceptor::new(
                flavor,
                Exclusion::from_config(&config),
                config.kind.is_native(),
                emitter.clone(),
            ))
        });
        tracing::debug!(kind = %config.kind, "instrumentation created");

        Self {
            inner: Arc::new(Inner {
                gate: Gate::new(interceptor.is_some()),
                config,
                emitter,
                interceptor,
            }),
        }
    }

    /// Instrumentation that installs nothing and records nothing.
    pub fn dummy() -> Self {
        Self::new(Config::new(InstrumenterKind::Dummy), NullSink)
    }

    pub fn kind(&self) -> InstrumenterKind {
        self.inner.config.kind
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn gate(&self) -> &Gate {
        &self.inner.gate
    }

    pub fn emitter(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// The call interceptor; `None` for the dummy kind.
    pub fn interceptor(&self) -> Option<&Arc<Interceptor>> {
        self.inner.interceptor.as_ref()
    }

    pub(crate) fn is_dummy(&self) -> bool {
        self.inner.interceptor.is_none()
    }

    /// Whether nothing may be recorded right now.
    pub(crate) fn is_silenced(&self) -> bool {
        self.is_dummy() || self.inner.gate.is_suppressed()
    }

    /// A slot for the call interceptor, to be added to a subscriber:
    ///
    /// ```
    /// use tracing_regions::{Config, Instrumentation, MemorySink};
    /// use tracing_subscriber::prelude::*;
    ///
    /// let regions = Instrumentation::new(Config::default(), MemorySink::new());
    /// let subscriber = tracing_subscriber::registry().with(regions.layer());
    /// tracing::subscriber::with_default(subscriber, || {
    ///     regions.register().unwrap();
    /// });
    /// ```
    ///
    /// The slot holds the interceptor only while the gate is registered (or
    /// an `enable` scope is open somewhere). Several subscribers, for example
    /// one per thread, can be bound to the same instrumentation;
    /// `register()` and `unregister()` flip all of them. `disable` and
    /// `enable` scopes only affect the thread that opens them.
    pub fn layer<S>(&self) -> reload::Layer<Option<RegionLayer>, S>
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup> + 'static,
    {
        let (layer, handle) = reload::Layer::new(None);
        if let Some(interceptor) = self.inner.interceptor.clone() {
            let gate = self.inner.gate.core().clone();
            let bound = self.inner.gate.bind(Box::new(move |attach| {
                handle.modify(|slot| {
                    *slot = attach.then(|| RegionLayer::new(interceptor.clone(), gate.clone()));
                })
            }));
            if let Err(e) = bound {
                err_msg!("failed to attach the call interceptor: {e}");
            }
        }
        layer
    }

    /// Attaches the call interceptor.
    pub fn register(&self) -> Result<()> {
        self.inner.gate.register()
    }

    /// Detaches the call interceptor. Detaching is cheaper than
    /// `disable_recording`, as the host stops calling into the interceptor.
    pub fn unregister(&self) -> Result<()> {
        self.inner.gate.unregister()
    }

    /// Whether calls on the calling thread are recorded right now.
    pub fn get_registered(&self) -> bool {
        self.inner.gate.is_registered()
    }

    /// Runs `f` under this instrumentation: registers first when
    /// `Config::enable_instrumenter` is set, and always unregisters afterwards,
    /// also when `f` unwinds.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        struct Unregister<'a>(&'a Instrumentation);

        impl Drop for Unregister<'_> {
            fn drop(&mut self) {
                if let Err(e) = self.0.unregister() {
                    err_msg!("failed to unregister after run: {e}");
                }
            }
        }

        if self.inner.config.enable_instrumenter {
            self.register()?;
        }
        let _unregister = Unregister(self);
        Ok(f())
    }

    /// Flushes the sink.
    pub fn finalize(&self) -> Result<()> {
        self.inner.emitter.finalize()?;
        Ok(())
    }
}

/// Holds at most one instrumentation. The first selection wins; selecting a
/// different kind afterwards fails with [`Error::KindMismatch`].
pub struct Selector {
    slot: OnceLock<Instrumentation>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    /// Returns the selected instrumentation, creating it with `make` on first use.
    /// `make` is not called when an instrumentation is already selected, and
    /// nothing is selected when `make` builds a kind other than `kind`.
    pub fn select(
        &self,
        kind: InstrumenterKind,
        make: impl FnOnce(InstrumenterKind) -> Instrumentation,
    ) -> Result<&Instrumentation> {
        let selected = match self.slot.get() {
            Some(selected) => selected,
            None => {
                let made = make(kind);
                if made.kind() != kind {
                    return Err(Error::KindMismatch {
                        active: made.kind(),
                        requested: kind,
                    });
                }
                // a concurrent first selection may win; its kind is checked below
                let selected = self.slot.get_or_init(|| made);
                tracing::debug!(kind = %selected.kind(), "instrumenter selected");
                selected
            }
        };
        if selected.kind() != kind {
            return Err(Error::KindMismatch {
                active: selected.kind(),
                requested: kind,
            });
        }
        Ok(selected)
    }

    pub fn get(&self) -> Option<&Instrumentation> {
        self.slot.get()
    }
}

static GLOBAL: Selector = Selector::new();

/// Selects the process-wide instrumentation. See [`Selector::select`].
pub fn select(
    kind: InstrumenterKind,
    make: impl FnOnce(InstrumenterKind) -> Instrumentation,
) -> Result<&'static Instrumentation> {
    GLOBAL.select(kind, make)
}

/// The process-wide instrumentation, if one was selected.
pub fn global() -> Option<&'static Instrumentation> {
    GLOBAL.get()
}
