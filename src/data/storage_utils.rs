use tracing::span;
use tracing_subscriber::registry::LookupSpan;

use crate::err_msg;

/// Perform operation with the span's storage of the given type, inserting a
/// default value first if the span has none.
pub fn with_span_storage_or_default<T, S, R>(
    id: &span::Id,
    ctx: &tracing_subscriber::layer::Context<'_, S>,
    f: impl FnOnce(&mut T) -> R,
) -> Option<R>
where
    T: 'static + Default + Send + Sync,
    S: tracing::Subscriber,
    for<'lookup> S: LookupSpan<'lookup>,
{
    let Some(span) = ctx.span(id) else {
        err_msg!("failed to get span");
        return None;
    };

    let mut extensions = span.extensions_mut();
    if extensions.get_mut::<T>().is_none() {
        extensions.insert(T::default());
    }
    extensions.get_mut::<T>().map(f)
}

/// Perform operation with mutable span storage value.
/// Returns `None` without complaint when the span never received storage of this type.
pub fn with_span_storage_mut<T, S, R>(
    id: &span::Id,
    ctx: &tracing_subscriber::layer::Context<'_, S>,
    f: impl FnOnce(&mut T) -> R,
) -> Option<R>
where
    T: 'static,
    S: tracing::Subscriber,
    for<'lookup> S: LookupSpan<'lookup>,
{
    let Some(span) = ctx.span(id) else {
        err_msg!("failed to get span");
        return None;
    };

    let mut extensions = span.extensions_mut();
    extensions.get_mut::<T>().map(f)
}
