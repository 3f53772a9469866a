use std::sync::Arc;

use tracing::span;

use crate::config::Flavor;
use crate::data::{with_span_storage_mut, with_span_storage_or_default};
use crate::err_msg;
use crate::gate::GateCore;
use crate::interceptor::{Interceptor, LocalHook};

/// RegionLayer (internally called interceptor::layer)
/// This Layer is the call-event callback: entering a span is a call,
/// exiting it is a return, and an event inside a span is a line.
///
/// It is never installed directly. `Instrumentation::layer` hands out a
/// reloadable slot and the gate puts a `RegionLayer` into it on
/// `register()` and takes it out again on `unregister()`. While installed,
/// calls are only recorded on threads that no disable scope silences.
pub struct RegionLayer {
    interceptor: Arc<Interceptor>,
    gate: Arc<GateCore>,
}

// local hooks of a span; a span entered again before it exits stacks them
#[derive(Default)]
struct LocalHooks(Vec<LocalHook>);

impl RegionLayer {
    pub(crate) fn new(interceptor: Arc<Interceptor>, gate: Arc<GateCore>) -> Self {
        Self { interceptor, gate }
    }
}

impl<S> tracing_subscriber::Layer<S> for RegionLayer
where
    S: tracing::Subscriber,
    // lets the layer reach span extensions.
    S: for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_enter(&self, id: &span::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        if !self.gate.intercepts_here() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return err_msg!("failed to get span on_enter");
        };
        let hook = match self.interceptor.on_call(span.metadata()) {
            Ok(hook) => hook,
            Err(e) => return err_msg!("region begin failed: {e}"),
        };

        if self.interceptor.flavor() == Flavor::Trace {
            if let Some(hook) = hook {
                with_span_storage_or_default(id, &ctx, |hooks: &mut LocalHooks| {
                    hooks.0.push(hook)
                });
            }
        }
    }

    fn on_exit(&self, id: &span::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let result = match self.interceptor.flavor() {
            Flavor::Profile => {
                let Some(span) = ctx.span(id) else {
                    return err_msg!("failed to get span on_exit");
                };
                if self.gate.intercepts_here() {
                    self.interceptor.on_return(span.metadata()).map(drop)
                } else {
                    // a call begun before this thread stopped intercepting still ends
                    self.interceptor.on_return_of_open(span.metadata()).map(drop)
                }
            }
            Flavor::Trace => {
                // no hook: the call was excluded or happened while detached
                let Some(hook) =
                    with_span_storage_mut(id, &ctx, |hooks: &mut LocalHooks| hooks.0.pop())
                        .flatten()
                else {
                    return;
                };
                self.interceptor.on_local_return(&hook)
            }
        };

        if let Err(e) = result {
            err_msg!("region end failed: {e}");
        }
    }

    fn on_event(&self, _event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        if self.interceptor.flavor() == Flavor::Trace
            && self.gate.intercepts_here()
            && ctx.lookup_current().is_some()
        {
            self.interceptor.on_line();
        }
    }
}
