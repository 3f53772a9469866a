use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::data::{region_name, thread_index, RegionIdentity};
use crate::error::{Error, SinkError};
use crate::sink::RegionSink;

pub(crate) const ERROR_MODULE: &str = "error";
pub(crate) const ERROR_REGION: &str = "error_region";
pub(crate) const LEAVE_REGION_PARAMETER: &str = "leave-region";

/// Front of a [`RegionSink`]: forwards events and keeps the per-thread stack
/// of open regions, so that an end without a begin is reported inside the
/// recorded data instead of reaching the sink as a bare end.
pub struct Emitter {
    sink: Arc<dyn RegionSink>,
    open: Mutex<HashMap<u64, Vec<String>>>,
    // rewind regions ever begun; their ends are checked against it
    rewinds: Mutex<HashSet<String>>,
    warned: AtomicBool,
}

impl Emitter {
    pub fn new(sink: Arc<dyn RegionSink>) -> Self {
        Self {
            sink,
            open: Mutex::new(HashMap::new()),
            rewinds: Mutex::new(HashSet::new()),
            warned: AtomicBool::new(false),
        }
    }

    pub fn region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.sink.region_begin(region)?;
        self.open_regions()
            .entry(thread_index())
            .or_default()
            .push(region.region_name());
        Ok(())
    }

    /// Closes the innermost open region named `module:function` on the
    /// calling thread. Regions opened later than it stay open.
    pub fn region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        let name = region_name(module, function);
        let closed = {
            let mut open = self.open_regions();
            let thread = thread_index();
            let closed = open.get_mut(&thread).and_then(|stack| {
                let position = stack.iter().rposition(|open| *open == name)?;
                Some(stack.remove(position))
            });
            if open.get(&thread).is_some_and(Vec::is_empty) {
                open.remove(&thread);
            }
            closed
        };

        match closed {
            Some(_) => self.sink.region_end(module, function),
            None => self.report_unmatched_end(&name),
        }
    }

    /// Fails when `module:function` is open on the calling thread but
    /// another region was opened after it.
    pub fn check_innermost(&self, module: &str, function: &str) -> Result<(), Error> {
        let name = region_name(module, function);
        let open = self.open_regions();
        let Some(stack) = open.get(&thread_index()) else {
            return Ok(());
        };
        match stack.last() {
            Some(innermost) if *innermost != name && stack.contains(&name) => {
                Err(Error::RegionMismatch {
                    innermost: innermost.clone(),
                    found: name,
                })
            }
            _ => Ok(()),
        }
    }

    /// Whether `module:function` is open on the calling thread.
    pub fn is_open(&self, module: &str, function: &str) -> bool {
        let name = region_name(module, function);
        self.open_regions()
            .get(&thread_index())
            .is_some_and(|stack| stack.contains(&name))
    }

    /// Regions currently open on the calling thread, outermost first.
    pub fn open_on_current_thread(&self) -> Vec<String> {
        self.open_regions()
            .get(&thread_index())
            .cloned()
            .unwrap_or_default()
    }

    pub fn enable_recording(&self) -> Result<(), SinkError> {
        self.sink.enable_recording()
    }

    pub fn disable_recording(&self) -> Result<(), SinkError> {
        self.sink.disable_recording()
    }

    pub fn parameter_int(&self, name: &str, value: i64) -> Result<(), SinkError> {
        self.sink.parameter_int(name, value)
    }

    pub fn parameter_uint(&self, name: &str, value: u64) -> Result<(), SinkError> {
        self.sink.parameter_uint(name, value)
    }

    pub fn parameter_string(&self, name: &str, value: &str) -> Result<(), SinkError> {
        self.sink.parameter_string(name, value)
    }

    pub fn rewind_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.sink.rewind_begin(region)?;
        self.rewinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region.region_name());
        Ok(())
    }

    /// Fails with `Error::RewindNotBegun` for a rewind region that was never begun.
    pub fn rewind_end(&self, module: &str, function: &str, rewind: bool) -> Result<(), Error> {
        let name = region_name(module, function);
        if !self
            .rewinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&name)
        {
            return Err(Error::RewindNotBegun(name));
        }
        self.sink.rewind_end(module, function, rewind)?;
        Ok(())
    }

    pub fn oa_region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.sink.oa_region_begin(region)
    }

    pub fn oa_region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        self.sink.oa_region_end(module, function)
    }

    pub fn finalize(&self) -> Result<(), SinkError> {
        self.sink.finalize()
    }

    fn report_unmatched_end(&self, name: &str) -> Result<(), SinkError> {
        let error_region = RegionIdentity::new(ERROR_MODULE, ERROR_REGION, "tracing-regions", 0);
        self.sink.region_begin(&error_region)?;
        self.sink.parameter_string(LEAVE_REGION_PARAMETER, name)?;
        self.sink.region_end(ERROR_MODULE, ERROR_REGION)?;

        if !self.warned.swap(true, Ordering::Relaxed) {
            eprintln!(
                "TRACING_REGIONS ERROR: There was a region exit without an enter!\n\
                 TRACING_REGIONS ERROR: For details look for \"{ERROR_REGION}\" in the trace or profile."
            );
        }
        Ok(())
    }

    fn open_regions(&self) -> MutexGuard<'_, HashMap<u64, Vec<String>>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
