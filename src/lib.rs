//! Region instrumentation on top of the [tracing](https://docs.rs/tracing/latest/tracing/) crate.
//!
//! # Overview
//! Spans are treated as function calls: entering a span begins the region
//! `module:function` of its callsite and exiting it ends that region. The
//! region events are forwarded to a measurement engine, a [`RegionSink`].
//! Regions can also be marked by hand, the call interceptor can be switched
//! off and on in scopes, and the measurement engine can receive parameters.
//!
//! Sinks provided:
//!     `CsvSink`: logs every event in CSV format
//!     `TreeSink`: prints a call graph whenever an outermost region closes
//!     `MemorySink`: keeps the events, for inspection
//!
//! ```
//! use tracing::debug_span;
//! use tracing_subscriber::prelude::*;
//! use tracing_regions::*;
//!
//! fn solve() {
//!     let span = debug_span!("solve");
//!     let _scope = span.enter();
//! }
//!
//! fn main() -> Result<()> {
//!     let regions = Instrumentation::new(Config::default(), TreeSink::new(TreeConfig::default()));
//!     let subscriber = tracing_subscriber::registry().with(regions.layer());
//!     tracing::subscriber::with_default(subscriber, || -> Result<()> {
//!         regions.run(|| {
//!             let _setup = regions.region("setup")?;
//!             regions.parameter_int("size", 64)?;
//!             solve();
//!             Ok::<_, Error>(())
//!         })??;
//!         regions.finalize()
//!     })
//! }
//! ```
//!
//! Spans of this crate itself are never recorded.
//!
//! # Configuration
//! [`Config::from_env`] reads the instrumenter kind from
//! `TRACING_REGIONS_INSTRUMENTER` and turns the call interceptor off when
//! `TRACING_REGIONS_NOINSTRUMENTER` is set.
//!
//! # Features
//! The `panic` feature will turn eprintln! into panic!, causing the program to halt on errors.

mod config;
mod context;
pub mod data;
mod error;
pub mod gate;
pub mod interceptor;
pub mod sink;
mod user;
mod wrap;

pub use config::{Config, Flavor, InstrumenterKind, ENV_INSTRUMENTER, ENV_NO_INSTRUMENTER};
pub use context::{global, select, Instrumentation, Selector};
pub use data::{CallSite, Frame, RegionIdentity};
pub use error::{Error, Result, SinkError};
pub use interceptor::layer::RegionLayer;
pub use sink::{
    csv::CsvSink,
    memory::{MemorySink, SinkEvent},
    tree::{Config as TreeConfig, TreeSink},
    Emitter, NullSink, RegionSink,
};
pub use user::{RegionGuard, ScopeGuard};
pub use wrap::Wrapped;

// use this instead of eprintln!
macro_rules! err_msg {
    ($($arg:tt)*) => {{
        eprintln!($($arg)*);
        assert!(cfg!(not(feature = "panic")))
    }};
}

pub(crate) use err_msg;
