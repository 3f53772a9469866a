//! The call interceptor: turns call/return notifications of the host into
//! region begin/end events.
//!
//! Two flavors share one contract:
//! - profile: sees calls and returns; a return resolves the frame again and
//!   applies the exclusion rule inline.
//! - trace: sees calls, returns and lines; a call that is recorded installs a
//!   local hook on its frame, and only frames carrying a local hook produce a
//!   region end. An excluded call installs nothing, so its return is dropped
//!   as well.
//!
//! [`layer::RegionLayer`] drives the interceptor from `tracing` span
//! enter/exit notifications; other hosts can call [`Interceptor::on_call`]
//! and friends directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{Config, Flavor};
use crate::data::{Frame, FrameToken, RegionIdentity};
use crate::error::Result;
use crate::sink::Emitter;

pub mod layer;

/// Hook left on a frame whose call was recorded; delivers the matching end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHook(pub Arc<RegionIdentity>);

/// Calls that must never be recorded: the instrumentation's own frames.
#[derive(Debug, Clone, Default)]
pub struct Exclusion {
    prefixes: Vec<String>,
    functions: Vec<String>,
}

impl Exclusion {
    pub fn new(prefixes: Vec<String>, functions: Vec<String>) -> Self {
        Self {
            prefixes,
            functions,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.excluded_prefixes.clone(),
            config.excluded_functions.clone(),
        )
    }

    pub fn excludes(&self, identity: &RegionIdentity) -> bool {
        self.functions.iter().any(|f| *f == identity.function)
            || self
                .prefixes
                .iter()
                .any(|prefix| identity.module.starts_with(prefix.as_str()))
    }
}

type IdentityCache = Mutex<HashMap<FrameToken, Option<Arc<RegionIdentity>>>>;

pub struct Interceptor {
    flavor: Flavor,
    exclusion: Exclusion,
    // native variants only; `None` entries memoize exclusion
    cache: Option<IdentityCache>,
    emitter: Arc<Emitter>,
    lines: AtomicU64,
}

impl Interceptor {
    pub fn new(flavor: Flavor, exclusion: Exclusion, cached: bool, emitter: Arc<Emitter>) -> Self {
        Self {
            flavor,
            exclusion,
            cache: cached.then(|| Mutex::new(HashMap::new())),
            emitter,
            lines: AtomicU64::new(0),
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Call event. Returns the recorded identity, or `None` when the call is
    /// excluded. For the trace flavor the returned identity is the local hook
    /// the host must keep on the frame; without it the return is never delivered.
    pub fn on_call<F: Frame + ?Sized>(&self, frame: &F) -> Result<Option<LocalHook>> {
        let Some(identity) = self.resolve(frame) else {
            return Ok(None);
        };
        self.emitter.region_begin(&identity)?;
        Ok(Some(LocalHook(identity)))
    }

    /// Return event as seen by the profile flavor: the frame is resolved again.
    /// Returns whether an end was emitted.
    pub fn on_return<F: Frame + ?Sized>(&self, frame: &F) -> Result<bool> {
        let Some(identity) = self.resolve(frame) else {
            return Ok(false);
        };
        self.emitter
            .region_end(&identity.module, &identity.function)?;
        Ok(true)
    }

    /// Return event of the profile flavor on a thread that is not
    /// intercepting: the end is emitted only when the region is open on this
    /// thread, so the call that began it is not left unmatched.
    pub fn on_return_of_open<F: Frame + ?Sized>(&self, frame: &F) -> Result<bool> {
        let Some(identity) = self.resolve(frame) else {
            return Ok(false);
        };
        if !self.emitter.is_open(&identity.module, &identity.function) {
            return Ok(false);
        }
        self.emitter
            .region_end(&identity.module, &identity.function)?;
        Ok(true)
    }

    /// Return event delivered through a local hook (trace flavor).
    pub fn on_local_return(&self, hook: &LocalHook) -> Result<()> {
        self.emitter.region_end(&hook.0.module, &hook.0.function)?;
        Ok(())
    }

    /// Line event (trace flavor). Nothing is emitted.
    pub fn on_line(&self) {
        self.lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Line events observed so far.
    pub fn line_events(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    fn resolve<F: Frame + ?Sized>(&self, frame: &F) -> Option<Arc<RegionIdentity>> {
        let (Some(cache), Some(token)) = (&self.cache, frame.token()) else {
            return self.resolve_uncached(frame);
        };
        if let Some(hit) = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
        {
            return hit.clone();
        }
        let resolved = self.resolve_uncached(frame);
        cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, resolved.clone());
        resolved
    }

    fn resolve_uncached<F: Frame + ?Sized>(&self, frame: &F) -> Option<Arc<RegionIdentity>> {
        let identity = RegionIdentity::inspect(frame);
        (!self.exclusion.excludes(&identity)).then(|| Arc::new(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CallSite;
    use crate::sink::memory::{MemorySink, SinkEvent};

    fn interceptor(flavor: Flavor, cached: bool) -> (Arc<MemorySink>, Interceptor) {
        let sink = Arc::new(MemorySink::new());
        let emitter = Arc::new(Emitter::new(sink.clone()));
        let exclusion = Exclusion::from_config(&Config::default());
        (sink, Interceptor::new(flavor, exclusion, cached, emitter))
    }

    fn foo() -> CallSite {
        CallSite::new("app", "foo").at("/src/app.rs", 3).with_token(1)
    }

    fn bar() -> CallSite {
        CallSite::new("app", "bar").at("/src/app.rs", 9).with_token(2)
    }

    fn internal() -> CallSite {
        CallSite::new("tracing_regions::user", "region_begin").with_token(3)
    }

    #[test]
    fn profile_flavor_emits_nested_pairs() {
        for cached in [false, true] {
            let (sink, interceptor) = interceptor(Flavor::Profile, cached);
            interceptor.on_call(&foo()).unwrap();
            interceptor.on_call(&bar()).unwrap();
            assert!(interceptor.on_return(&bar()).unwrap());
            assert!(interceptor.on_return(&foo()).unwrap());

            assert_eq!(
                sink.take(),
                vec![
                    SinkEvent::begin("app:foo"),
                    SinkEvent::begin("app:bar"),
                    SinkEvent::end("app:bar"),
                    SinkEvent::end("app:foo"),
                ]
            );
        }
    }

    #[test]
    fn excluded_frames_are_dropped_symmetrically() {
        let (sink, interceptor) = interceptor(Flavor::Profile, false);
        interceptor.on_call(&foo()).unwrap();
        assert_eq!(interceptor.on_call(&internal()).unwrap(), None);
        assert!(!interceptor.on_return(&internal()).unwrap());
        interceptor.on_return(&foo()).unwrap();

        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("app:foo"), SinkEvent::end("app:foo")]
        );
    }

    #[test]
    fn detach_step_is_excluded_by_name() {
        let (sink, interceptor) = interceptor(Flavor::Profile, false);
        let detach = CallSite::new("host::runtime", crate::gate::DETACH_FUNCTION);
        assert!(!interceptor.on_return(&detach).unwrap());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn silent_return_only_closes_open_regions() {
        let (sink, interceptor) = interceptor(Flavor::Profile, false);
        interceptor.on_call(&foo()).unwrap();
        assert!(!interceptor.on_return_of_open(&bar()).unwrap());
        assert!(interceptor.on_return_of_open(&foo()).unwrap());
        assert!(!interceptor.on_return_of_open(&foo()).unwrap());

        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("app:foo"), SinkEvent::end("app:foo")]
        );
    }

    #[test]
    fn trace_flavor_ends_through_local_hook() {
        let (sink, interceptor) = interceptor(Flavor::Trace, true);
        let outer = interceptor.on_call(&foo()).unwrap().unwrap();
        assert!(interceptor.on_call(&internal()).unwrap().is_none());
        interceptor.on_line();
        interceptor.on_local_return(&outer).unwrap();

        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("app:foo"), SinkEvent::end("app:foo")]
        );
        assert_eq!(interceptor.line_events(), 1);
    }

    #[test]
    fn cache_keeps_first_resolution_per_token() {
        let (sink, interceptor) = interceptor(Flavor::Profile, true);
        interceptor.on_call(&foo()).unwrap();
        // same token, different description: the cached identity wins
        let renamed = CallSite::new("app", "renamed").with_token(1);
        interceptor.on_return(&renamed).unwrap();

        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("app:foo"), SinkEvent::end("app:foo")]
        );
    }

    #[test]
    fn identities_are_deterministic() {
        let (sink, interceptor) = interceptor(Flavor::Profile, false);
        for _ in 0..2 {
            interceptor.on_call(&foo()).unwrap();
            interceptor.on_return(&foo()).unwrap();
        }
        let begun = sink.begun();
        assert_eq!(begun.len(), 2);
        assert_eq!(begun[0], begun[1]);
    }
}
