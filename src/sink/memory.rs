use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::data::{region_name, thread_index, RegionIdentity};
use crate::error::SinkError;
use crate::sink::RegionSink;

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Int(i64),
    Uint(u64),
    String(String),
}

/// One delivered event. Regions are named `module:function`.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Begin(String),
    End(String),
    Parameter(String, ParameterValue),
    EnableRecording,
    DisableRecording,
    RewindBegin(String),
    /// Rewind region end and whether it asked for a rewind.
    RewindEnd(String, bool),
    OaBegin(String),
    OaEnd(String),
}

impl SinkEvent {
    pub fn begin(region: &str) -> Self {
        Self::Begin(region.to_string())
    }

    pub fn end(region: &str) -> Self {
        Self::End(region.to_string())
    }

    pub fn string(name: &str, value: &str) -> Self {
        Self::Parameter(name.to_string(), ParameterValue::String(value.to_string()))
    }
}

#[derive(Debug, Default)]
struct Recorded {
    events: Vec<(u64, SinkEvent)>,
    begun: Vec<RegionIdentity>,
}

/// Keeps every event in memory, tagged with the delivering thread.
#[derive(Debug, Default)]
pub struct MemorySink {
    recorded: Mutex<Recorded>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.lock().events.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Events delivered so far, each with the index of the thread that delivered it.
    pub fn events_by_thread(&self) -> Vec<(u64, SinkEvent)> {
        self.lock().events.clone()
    }

    /// Full identities of every begun region, in delivery order.
    pub fn begun(&self) -> Vec<RegionIdentity> {
        self.lock().begun.clone()
    }

    /// Drains the recorded events.
    pub fn take(&self) -> Vec<SinkEvent> {
        let mut recorded = self.lock();
        recorded.begun.clear();
        std::mem::take(&mut recorded.events)
            .into_iter()
            .map(|(_, e)| e)
            .collect()
    }

    fn push(&self, event: SinkEvent) {
        self.lock().events.push((thread_index(), event));
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegionSink for MemorySink {
    fn region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        let mut recorded = self.lock();
        recorded.begun.push(region.clone());
        recorded
            .events
            .push((thread_index(), SinkEvent::Begin(region.region_name())));
        Ok(())
    }

    fn region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        self.push(SinkEvent::End(region_name(module, function)));
        Ok(())
    }

    fn enable_recording(&self) -> Result<(), SinkError> {
        self.push(SinkEvent::EnableRecording);
        Ok(())
    }

    fn disable_recording(&self) -> Result<(), SinkError> {
        self.push(SinkEvent::DisableRecording);
        Ok(())
    }

    fn parameter_int(&self, name: &str, value: i64) -> Result<(), SinkError> {
        self.push(SinkEvent::Parameter(name.into(), ParameterValue::Int(value)));
        Ok(())
    }

    fn parameter_uint(&self, name: &str, value: u64) -> Result<(), SinkError> {
        self.push(SinkEvent::Parameter(name.into(), ParameterValue::Uint(value)));
        Ok(())
    }

    fn parameter_string(&self, name: &str, value: &str) -> Result<(), SinkError> {
        self.push(SinkEvent::string(name, value));
        Ok(())
    }

    fn rewind_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.push(SinkEvent::RewindBegin(region.region_name()));
        Ok(())
    }

    fn rewind_end(&self, module: &str, function: &str, rewind: bool) -> Result<(), SinkError> {
        self.push(SinkEvent::RewindEnd(region_name(module, function), rewind));
        Ok(())
    }

    fn oa_region_begin(&self, region: &RegionIdentity) -> Result<(), SinkError> {
        self.push(SinkEvent::OaBegin(region.region_name()));
        Ok(())
    }

    fn oa_region_end(&self, module: &str, function: &str) -> Result<(), SinkError> {
        self.push(SinkEvent::OaEnd(region_name(module, function)));
        Ok(())
    }
}
