//! Measurement engines that consume region events.
//!
//! The call interceptor and the manual region API never talk to a sink
//! directly; everything goes through [`Emitter`], which tracks the regions
//! open on each thread and turns unmatched ends into `error_region` reports.

use std::sync::Arc;

use crate::data::RegionIdentity;
use crate::error::SinkError;

pub mod csv;
mod emitter;
pub mod memory;
pub mod tree;

pub use emitter::Emitter;

/// The measurement engine behind the instrumentation.
///
/// Calls are synchronous and may arrive from any thread; implementations
/// serialize concurrent deliveries themselves.
pub trait RegionSink: Send + Sync {
    fn region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError>;

    fn region_end(&self, module: &str, function: &str) -> Result<(), SinkError>;

    fn enable_recording(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn disable_recording(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn parameter_int(&self, name: &str, value: i64) -> Result<(), SinkError>;

    fn parameter_uint(&self, name: &str, value: u64) -> Result<(), SinkError>;

    fn parameter_string(&self, name: &str, value: &str) -> Result<(), SinkError>;

    /// Begins a rewind region. Engines without rewind support ignore it.
    fn rewind_begin(&self, _region: &RegionIdentity) -> Result<(), SinkError> {
        Ok(())
    }

    /// Ends a rewind region. With `rewind` set, everything recorded since
    /// its begin is discarded.
    fn rewind_end(&self, _module: &str, _function: &str, _rewind: bool) -> Result<(), SinkError> {
        Ok(())
    }

    /// Begins an online-access phase.
    fn oa_region_begin(&self, _region: &RegionIdentity) -> Result<(), SinkError> {
        Ok(())
    }

    fn oa_region_end(&self, _module: &str, _function: &str) -> Result<(), SinkError> {
        Ok(())
    }

    /// Flush everything recorded so far.
    fn finalize(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<T: RegionSink + ?Sized> RegionSink for Arc<T> {
    fn region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        (**self).region_begin(region)
    }

    fn region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        (**self).region_end(module, function)
    }

    fn enable_recording(&self) -> Result<(), SinkError> {
        (**self).enable_recording()
    }

    fn disable_recording(&self) -> Result<(), SinkError> {
        (**self).disable_recording()
    }

    fn parameter_int(&self, name: &str, value: i64) -> Result<(), SinkError> {
        (**self).parameter_int(name, value)
    }

    fn parameter_uint(&self, name: &str, value: u64) -> Result<(), SinkError> {
        (**self).parameter_uint(name, value)
    }

    fn parameter_string(&self, name: &str, value: &str) -> Result<(), SinkError> {
        (**self).parameter_string(name, value)
    }

    fn rewind_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        (**self).rewind_begin(region)
    }

    fn rewind_end(&self, module: &str, function: &str, rewind: bool) -> Result<(), SinkError> {
        (**self).rewind_end(module, function, rewind)
    }

    fn oa_region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        (**self).oa_region_begin(region)
    }

    fn oa_region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        (**self).oa_region_end(module, function)
    }

    fn finalize(&self) -> Result<(), SinkError> {
        (**self).finalize()
    }
}

/// Accepts and discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RegionSink for NullSink {
    fn region_begin(&self, _region: &RegionIdentity) -> Result<(), SinkError> {
        Ok(())
    }

    fn region_end(&self, _module: &str, _function: &str) -> Result<(), SinkError> {
        Ok(())
    }

    fn parameter_int(&self, _name: &str, _value: i64) -> Result<(), SinkError> {
        Ok(())
    }

    fn parameter_uint(&self, _name: &str, _value: u64) -> Result<(), SinkError> {
        Ok(())
    }

    fn parameter_string(&self, _name: &str, _value: &str) -> Result<(), SinkError> {
        Ok(())
    }
}
