//! Manual region API: user-marked regions, gate scopes, recording switches
//! and parameters. Everything here is a no-op for the dummy instrumenter and
//! while a disable scope is active.

use std::panic::Location;

use crate::context::Instrumentation;
use crate::data::{RegionIdentity, USER_MODULE};
use crate::err_msg;
use crate::error::Result;
use crate::gate::GateGuard;

impl Instrumentation {
    /// Opens the user region `user:<name>` at the caller's location.
    ///
    /// The call interceptor is paused on this thread while the begin is
    /// emitted, so the marker itself is never recorded as a call.
    #[track_caller]
    pub fn region_begin(&self, name: &str) -> Result<()> {
        let caller = Location::caller();
        self.region_begin_at(name, Some(caller.file()), caller.line())
    }

    /// Opens the user region `user:<name>` at an explicit location.
    /// `file` is made absolute; `None` is recorded as `"None"`.
    pub fn region_begin_at(&self, name: &str, file: Option<&str>, line: u32) -> Result<()> {
        self.begin_user_region(name, file, line).map(drop)
    }

    /// Closes the user region `user:<name>`.
    ///
    /// Fails with `Error::RegionMismatch` if the region is open but a region
    /// opened after it is still open. A region that is not open at all is
    /// reported as an `error_region` in the recorded data.
    pub fn region_end(&self, name: &str) -> Result<()> {
        if self.is_silenced() {
            return Ok(());
        }
        self.emitter().check_innermost(USER_MODULE, name)?;
        self.emitter().region_end(USER_MODULE, name)?;
        Ok(())
    }

    /// Opens `user:<name>` until the returned guard is dropped.
    #[track_caller]
    pub fn region(&self, name: &str) -> Result<RegionGuard<'_>> {
        let caller = Location::caller();
        let open = self.begin_user_region(name, Some(caller.file()), caller.line())?;
        Ok(RegionGuard::new(self, USER_MODULE.to_string(), name.to_string(), open))
    }

    /// Stops the call interceptor and silences all recording on the calling
    /// thread until the returned guard is dropped. Only this scope ends with
    /// the guard, so an inner scope never re-enables what an outer scope
    /// disabled, and other threads keep recording.
    ///
    /// A named scope is marked as `user:<name>` around the silent window.
    #[track_caller]
    pub fn disable(&self, region_name: Option<&str>) -> Result<ScopeGuard<'_>> {
        let caller = Location::caller();
        let region = match region_name {
            Some(name) => Some(self.region_at(name, caller)?),
            None => None,
        };
        let gate = self.gate().suppress();
        Ok(ScopeGuard {
            gate: Some(gate),
            region,
            region_inside: false,
        })
    }

    /// Turns the call interceptor on for the calling thread, also inside a
    /// disable scope, until the returned guard is dropped.
    ///
    /// A named scope is marked as `user:<name>` inside the window.
    #[track_caller]
    pub fn enable(&self, region_name: Option<&str>) -> Result<ScopeGuard<'_>> {
        let caller = Location::caller();
        let gate = self.gate().lift()?;
        let region = match region_name {
            Some(name) => Some(self.region_at(name, caller)?),
            None => None,
        };
        Ok(ScopeGuard {
            gate: Some(gate),
            region,
            region_inside: true,
        })
    }

    pub fn enable_recording(&self) -> Result<()> {
        if !self.is_dummy() {
            self.emitter().enable_recording()?;
        }
        Ok(())
    }

    pub fn disable_recording(&self) -> Result<()> {
        if !self.is_dummy() {
            self.emitter().disable_recording()?;
        }
        Ok(())
    }

    pub fn parameter_int(&self, name: &str, value: i64) -> Result<()> {
        if !self.is_silenced() {
            self.emitter().parameter_int(name, value)?;
        }
        Ok(())
    }

    pub fn parameter_uint(&self, name: &str, value: u64) -> Result<()> {
        if !self.is_silenced() {
            self.emitter().parameter_uint(name, value)?;
        }
        Ok(())
    }

    pub fn parameter_string(&self, name: &str, value: &str) -> Result<()> {
        if !self.is_silenced() {
            self.emitter().parameter_string(name, value)?;
        }
        Ok(())
    }

    /// Begins the rewind region `user:<name>` at the caller's location.
    #[track_caller]
    pub fn rewind_begin(&self, name: &str) -> Result<()> {
        let caller = Location::caller();
        self.rewind_begin_at(name, Some(caller.file()), caller.line())
    }

    pub fn rewind_begin_at(&self, name: &str, file: Option<&str>, line: u32) -> Result<()> {
        if self.is_silenced() {
            return Ok(());
        }
        let _paused = self.gate().pause();
        self.emitter()
            .rewind_begin(&RegionIdentity::user(name, file, line))?;
        Ok(())
    }

    /// Ends the rewind region `user:<name>`. With `rewind` set, the
    /// measurement engine discards what was recorded since its begin.
    /// Fails with `Error::RewindNotBegun` when `name` was never begun.
    pub fn rewind_end(&self, name: &str, rewind: bool) -> Result<()> {
        if self.is_silenced() {
            return Ok(());
        }
        self.emitter().rewind_end(USER_MODULE, name, rewind)
    }

    /// Begins the online-access phase `user:<name>` at the caller's location.
    #[track_caller]
    pub fn oa_region_begin(&self, name: &str) -> Result<()> {
        let caller = Location::caller();
        self.oa_region_begin_at(name, Some(caller.file()), caller.line())
    }

    pub fn oa_region_begin_at(&self, name: &str, file: Option<&str>, line: u32) -> Result<()> {
        if self.is_silenced() {
            return Ok(());
        }
        let _paused = self.gate().pause();
        self.emitter()
            .oa_region_begin(&RegionIdentity::user(name, file, line))?;
        Ok(())
    }

    pub fn oa_region_end(&self, name: &str) -> Result<()> {
        if !self.is_silenced() {
            self.emitter().oa_region_end(USER_MODULE, name)?;
        }
        Ok(())
    }

    fn region_at(&self, name: &str, caller: &Location<'_>) -> Result<RegionGuard<'_>> {
        let open = self.begin_user_region(name, Some(caller.file()), caller.line())?;
        Ok(RegionGuard::new(self, USER_MODULE.to_string(), name.to_string(), open))
    }

    /// Emits the begin with the interceptor paused. Returns whether anything was emitted.
    pub(crate) fn begin_user_region(
        &self,
        name: &str,
        file: Option<&str>,
        line: u32,
    ) -> Result<bool> {
        if self.is_silenced() {
            return Ok(false);
        }
        let _paused = self.gate().pause();
        self.emitter()
            .region_begin(&RegionIdentity::user(name, file, line))?;
        Ok(true)
    }
}

/// Open region, closed when dropped (also while unwinding).
#[must_use = "the region ends as soon as the guard is dropped"]
pub struct RegionGuard<'a> {
    ctx: &'a Instrumentation,
    module: String,
    function: String,
    open: bool,
}

impl<'a> RegionGuard<'a> {
    pub(crate) fn new(ctx: &'a Instrumentation, module: String, function: String, open: bool) -> Self {
        Self {
            ctx,
            module,
            function,
            open,
        }
    }

    /// Closes the region now, reporting sink failures to the caller.
    pub fn end(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.open) {
            return Ok(());
        }
        self.ctx.emitter().region_end(&self.module, &self.function)?;
        Ok(())
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            err_msg!("failed to end region {}:{}: {e}", self.module, self.function);
        }
    }
}

/// Guard of an `enable`/`disable` scope. Closes the gate scope and the
/// scope's named region when dropped. Stays on the thread that opened it.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct ScopeGuard<'a> {
    gate: Option<GateGuard<'a>>,
    region: Option<RegionGuard<'a>>,
    // enable scopes mark their region inside the gate window, disable scopes outside it
    region_inside: bool,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.region_inside {
            drop(self.region.take());
            drop(self.gate.take());
        } else {
            drop(self.gate.take());
            drop(self.region.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{Config, InstrumenterKind};
    use crate::error::Error;
    use crate::sink::memory::{MemorySink, SinkEvent};

    fn instrumentation() -> (Arc<MemorySink>, Instrumentation) {
        let sink = Arc::new(MemorySink::new());
        (sink.clone(), Instrumentation::new(Config::default(), sink))
    }

    #[test]
    fn manual_region_without_interceptor() {
        let (sink, regions) = instrumentation();
        regions.region_begin("x").unwrap();
        println!("hello world");
        regions.region_end("x").unwrap();

        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("user:x"), SinkEvent::end("user:x")]
        );
    }

    #[test]
    fn caller_location_is_recorded() {
        let (sink, regions) = instrumentation();
        let line = line!() + 1;
        regions.region_begin("located").unwrap();
        regions.region_end("located").unwrap();

        let begun = &sink.begun()[0];
        assert_eq!(begun.line, line);
        assert!(begun.file.ends_with("src/user.rs"));
        assert!(begun.file.starts_with('/'));
    }

    #[test]
    fn explicit_location_without_file() {
        let (sink, regions) = instrumentation();
        regions.region_begin_at("nowhere", None, 7).unwrap();
        regions.region_end("nowhere").unwrap();
        let begun = &sink.begun()[0];
        assert_eq!((begun.file.as_str(), begun.line), ("None", 7));
    }

    #[test]
    fn gate_state_survives_region_begin() {
        let (_sink, regions) = instrumentation();
        regions.register().unwrap();
        regions.region_begin("x").unwrap();
        assert!(regions.get_registered());
        regions.region_end("x").unwrap();
    }

    #[test]
    fn out_of_order_end_is_an_error() {
        let (sink, regions) = instrumentation();
        regions.region_begin("outer").unwrap();
        regions.region_begin("inner").unwrap();
        assert!(matches!(
            regions.region_end("outer"),
            Err(Error::RegionMismatch { .. })
        ));
        regions.region_end("inner").unwrap();
        regions.region_end("outer").unwrap();
        assert_eq!(sink.take().len(), 4);
    }

    #[test]
    fn end_without_begin_is_reported_not_raised() {
        let (sink, regions) = instrumentation();
        regions.region_end("test_region").unwrap();
        assert!(sink
            .take()
            .contains(&SinkEvent::string("leave-region", "user:test_region")));
    }

    #[test]
    fn scoped_region_ends_on_unwind() {
        let (sink, regions) = instrumentation();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _region = regions.region("fragile").unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("user:fragile"), SinkEvent::end("user:fragile")]
        );
    }

    #[test]
    fn nested_disable_scopes_silence_everything() {
        let (sink, regions) = instrumentation();
        regions.register().unwrap();
        {
            let _outer = regions.disable(None).unwrap();
            {
                let _inner = regions.disable(None).unwrap();
                regions.region_begin("hidden").unwrap();
                regions.parameter_int("hidden", 1).unwrap();
                regions.region_end("hidden").unwrap();
            }
            assert!(!regions.get_registered());
            regions.region_begin("still_hidden").unwrap();
            regions.region_end("still_hidden").unwrap();
        }
        assert!(regions.get_registered());
        regions.region_begin("visible").unwrap();
        regions.region_end("visible").unwrap();

        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("user:visible"), SinkEvent::end("user:visible")]
        );
    }

    #[test]
    fn named_disable_scope_is_marked_outside_the_silence() {
        let (sink, regions) = instrumentation();
        {
            let _scope = regions.disable(Some("quiet")).unwrap();
            regions.region_begin("hidden").unwrap();
            regions.region_end("hidden").unwrap();
        }
        assert_eq!(
            sink.take(),
            vec![SinkEvent::begin("user:quiet"), SinkEvent::end("user:quiet")]
        );
    }

    #[test]
    fn enable_scope_overrides_disable_scope() {
        let (sink, regions) = instrumentation();
        let outer = regions.disable(None).unwrap();
        {
            let _enabled = regions.enable(Some("loud")).unwrap();
            assert!(regions.get_registered());
            regions.parameter_uint("n", 3).unwrap();
        }
        assert!(!regions.get_registered());
        drop(outer);
        assert!(!regions.get_registered());

        assert_eq!(
            sink.take(),
            vec![
                SinkEvent::begin("user:loud"),
                SinkEvent::Parameter("n".into(), crate::sink::memory::ParameterValue::Uint(3)),
                SinkEvent::end("user:loud"),
            ]
        );
    }

    #[test]
    fn recording_switches_reach_the_sink() {
        let (sink, regions) = instrumentation();
        regions.disable_recording().unwrap();
        regions.enable_recording().unwrap();
        regions.parameter_string("phase", "setup").unwrap();
        assert_eq!(
            sink.take(),
            vec![
                SinkEvent::DisableRecording,
                SinkEvent::EnableRecording,
                SinkEvent::string("phase", "setup"),
            ]
        );
    }

    #[test]
    fn rewind_region_round_trip() {
        let (sink, regions) = instrumentation();
        regions.register().unwrap();
        regions.rewind_begin("retry").unwrap();
        assert!(regions.get_registered());
        regions.rewind_end("retry", true).unwrap();
        assert!(matches!(
            regions.rewind_end("never", false),
            Err(Error::RewindNotBegun(name)) if name == "user:never"
        ));

        assert_eq!(
            sink.take(),
            vec![
                SinkEvent::RewindBegin("user:retry".into()),
                SinkEvent::RewindEnd("user:retry".into(), true),
            ]
        );
    }

    #[test]
    fn online_access_phase() {
        let (sink, regions) = instrumentation();
        regions.oa_region_begin_at("phase", None, 12).unwrap();
        regions.parameter_int("step", 1).unwrap();
        regions.oa_region_end("phase").unwrap();
        {
            let _quiet = regions.disable(None).unwrap();
            regions.oa_region_begin("hidden").unwrap();
            regions.oa_region_end("hidden").unwrap();
            regions.rewind_end("hidden", true).unwrap();
        }

        assert_eq!(
            sink.take(),
            vec![
                SinkEvent::OaBegin("user:phase".into()),
                SinkEvent::Parameter("step".into(), crate::sink::memory::ParameterValue::Int(1)),
                SinkEvent::OaEnd("user:phase".into()),
            ]
        );
    }

    #[test]
    fn dummy_records_nothing() {
        let sink = Arc::new(MemorySink::new());
        let regions = Instrumentation::new(Config::new(InstrumenterKind::Dummy), sink.clone());
        regions.register().unwrap();
        assert!(!regions.get_registered());
        regions.region_begin("x").unwrap();
        regions.region_end("x").unwrap();
        regions.parameter_int("p", 1).unwrap();
        regions.enable_recording().unwrap();
        regions.rewind_begin("r").unwrap();
        regions.rewind_end("r", true).unwrap();
        regions.oa_region_begin("o").unwrap();
        regions.oa_region_end("o").unwrap();
        assert!(sink.take().is_empty());
    }
}
