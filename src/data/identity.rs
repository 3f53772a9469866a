use std::fmt;

use crate::data::abspath;

/// Module name used for regions opened through the manual region API.
pub const USER_MODULE: &str = "user";

/// Module name used when a frame carries no module and is not a known synthetic frame.
pub const UNKNOWN_MODULE: &str = "unknown";

/// File name used when a frame carries no source file.
pub const NO_FILE: &str = "None";

// frames synthesized by the host runtime without a declared module, keyed by their file name
const SYNTHETIC_FILES: &[(&str, &str)] =
    &[("<__array_function__ internals>", "numpy.__array_function__")];

/// Stable per-callable token, used to memoize identity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken(pub usize);

/// An execution frame as seen by the host runtime's call/return notification.
pub trait Frame {
    fn module_name(&self) -> Option<&str>;
    fn function_name(&self) -> &str;
    fn file_name(&self) -> Option<&str>;
    fn line_number(&self) -> Option<u32>;

    /// Token that stays the same for every call of the same callable.
    /// Frames without one are resolved on every event.
    fn token(&self) -> Option<FrameToken> {
        None
    }
}

// span metadata is 'static per callsite, so its address identifies the callable
impl Frame for tracing::Metadata<'static> {
    fn module_name(&self) -> Option<&str> {
        self.module_path()
    }

    fn function_name(&self) -> &str {
        self.name()
    }

    fn file_name(&self) -> Option<&str> {
        self.file()
    }

    fn line_number(&self) -> Option<u32> {
        self.line()
    }

    fn token(&self) -> Option<FrameToken> {
        Some(FrameToken(self as *const Self as usize))
    }
}

/// An owned frame description, for hosts that do not go through `tracing`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSite {
    pub module: Option<String>,
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub token: Option<FrameToken>,
}

impl CallSite {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_token(mut self, token: usize) -> Self {
        self.token = Some(FrameToken(token));
        self
    }
}

impl Frame for CallSite {
    fn module_name(&self) -> Option<&str> {
        self.module.as_deref()
    }

    fn function_name(&self) -> &str {
        &self.function
    }

    fn file_name(&self) -> Option<&str> {
        self.file.as_deref()
    }

    fn line_number(&self) -> Option<u32> {
        self.line
    }

    fn token(&self) -> Option<FrameToken> {
        self.token
    }
}

/// Label of a region: compared by value, two calls of the same function
/// produce equal identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionIdentity {
    pub module: String,
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl RegionIdentity {
    pub fn new(
        module: impl Into<String>,
        function: impl Into<String>,
        file: impl Into<String>,
        line: u32,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            file: file.into(),
            line,
        }
    }

    /// Identity of a manually marked region.
    pub fn user(name: impl Into<String>, file: Option<&str>, line: u32) -> Self {
        Self::new(USER_MODULE, name, resolve_file(file), line)
    }

    /// Resolves the identity of `frame`. Every field resolves to some value.
    pub fn inspect<F: Frame + ?Sized>(frame: &F) -> Self {
        Self {
            module: resolve_module(frame).to_string(),
            function: frame.function_name().to_string(),
            file: resolve_file(frame.file_name()),
            line: frame.line_number().unwrap_or_default(),
        }
    }

    /// `module:function`, the name regions are registered under.
    pub fn region_name(&self) -> String {
        region_name(&self.module, &self.function)
    }

    /// Leading component of the module path.
    pub fn group(&self) -> &str {
        group_of(&self.module)
    }
}

impl fmt::Display for RegionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}:{})", self.module, self.function, self.file, self.line)
    }
}

pub fn region_name(module: &str, function: &str) -> String {
    format!("{module}:{function}")
}

pub fn group_of(module: &str) -> &str {
    let end = [module.find("::"), module.find('.')]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(module.len());
    &module[..end]
}

fn resolve_module<F: Frame + ?Sized>(frame: &F) -> &str {
    if let Some(module) = frame.module_name() {
        return module;
    }
    frame
        .file_name()
        .and_then(|file| {
            SYNTHETIC_FILES
                .iter()
                .find(|(synthetic, _)| *synthetic == file)
                .map(|(_, module)| *module)
        })
        .unwrap_or(UNKNOWN_MODULE)
}

fn resolve_file(file: Option<&str>) -> String {
    match file {
        Some(file) => abspath(file),
        None => NO_FILE.to_string(),
    }
}
