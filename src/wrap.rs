//! Function wrapping: a callable that brackets every invocation in a region
//! when the call interceptor would not see it.

use std::any::type_name;
use std::panic::Location;

use crate::context::Instrumentation;
use crate::data::{abspath, RegionIdentity, UNKNOWN_MODULE, USER_MODULE};
use crate::error::Result;
use crate::user::RegionGuard;

const CLOSURE_SUFFIX: &str = "::{{closure}}";

/// A wrapped callable. See [`Instrumentation::wrap`] and [`Instrumentation::wrap_named`].
pub struct Wrapped<'a, F> {
    ctx: &'a Instrumentation,
    f: F,
    identity: RegionIdentity,
    named: bool,
}

impl Instrumentation {
    /// Wraps `f` so every call runs inside the region of `f` itself,
    /// unless the call interceptor is attached and already records it.
    ///
    /// The region is named after the function path of `F`; closures are
    /// named after their enclosing function.
    #[track_caller]
    pub fn wrap<F>(&self, f: F) -> Wrapped<'_, F> {
        let caller = Location::caller();
        let (module, function) = split_type_name(type_name::<F>());
        Wrapped {
            ctx: self,
            f,
            identity: RegionIdentity::new(module, function, abspath(caller.file()), caller.line()),
            named: false,
        }
    }

    /// Wraps `f` so every call runs inside the user region `user:<name>`,
    /// whether the call interceptor is attached or not.
    #[track_caller]
    pub fn wrap_named<F>(&self, name: &str, f: F) -> Wrapped<'_, F> {
        let caller = Location::caller();
        Wrapped {
            ctx: self,
            f,
            identity: RegionIdentity::user(name, Some(caller.file()), caller.line()),
            named: true,
        }
    }
}

impl<'a, F> Wrapped<'a, F> {
    pub fn identity(&self) -> &RegionIdentity {
        &self.identity
    }

    pub fn call<R>(&self) -> Result<R>
    where
        F: Fn() -> R,
    {
        let _region = self.open()?;
        Ok((self.f)())
    }

    pub fn call_with<A, R>(&self, arg: A) -> Result<R>
    where
        F: Fn(A) -> R,
    {
        let _region = self.open()?;
        Ok((self.f)(arg))
    }

    fn open(&self) -> Result<Option<RegionGuard<'a>>> {
        let ctx = self.ctx;
        if self.named {
            let open = ctx.begin_user_region(
                &self.identity.function,
                Some(self.identity.file.as_str()),
                self.identity.line,
            )?;
            return Ok(Some(RegionGuard::new(
                ctx,
                USER_MODULE.to_string(),
                self.identity.function.clone(),
                open,
            )));
        }
        if ctx.is_silenced() || ctx.get_registered() {
            return Ok(None);
        }
        ctx.emitter().region_begin(&self.identity)?;
        Ok(Some(RegionGuard::new(
            ctx,
            self.identity.module.clone(),
            self.identity.function.clone(),
            true,
        )))
    }
}

/// Splits a type path into module and function, ignoring generic arguments.
/// Types that are not a path, such as `fn` pointers and qualified paths,
/// keep their full name under the unknown module.
fn split_type_name(name: &str) -> (String, String) {
    if name.starts_with("fn(") || name.starts_with('<') {
        return (UNKNOWN_MODULE.to_string(), name.to_string());
    }
    let path = &name[..name.find('<').unwrap_or(name.len())];
    let base = path.strip_suffix(CLOSURE_SUFFIX).unwrap_or(path);
    match base.rfind("::") {
        Some(i) => (name[..i].to_string(), name[i + 2..].to_string()),
        None => (UNKNOWN_MODULE.to_string(), name.to_string()),
    }
}
