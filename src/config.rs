use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Environment variable selecting the instrumenter kind.
pub const ENV_INSTRUMENTER: &str = "TRACING_REGIONS_INSTRUMENTER";

/// Environment variable that, when set to a truthy value, keeps the call
/// interceptor detached until `register()` is called explicitly.
pub const ENV_NO_INSTRUMENTER: &str = "TRACING_REGIONS_NOINSTRUMENTER";

/// Which interception flavor forwards call events, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstrumenterKind {
    /// Call and return events, identity resolved on every event.
    Profile,
    /// Call, return and line events; the return is delivered by a hook
    /// installed on the entered frame.
    Trace,
    /// Installs nothing and emits nothing.
    Dummy,
    /// `Profile` with identities memoized per callable.
    #[default]
    NativeProfile,
    /// `Trace` with identities memoized per callable.
    NativeTrace,
}

/// How call events reach the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Profile,
    Trace,
}

impl InstrumenterKind {
    pub fn flavor(self) -> Option<Flavor> {
        match self {
            Self::Profile | Self::NativeProfile => Some(Flavor::Profile),
            Self::Trace | Self::NativeTrace => Some(Flavor::Trace),
            Self::Dummy => None,
        }
    }

    /// Whether resolved identities are cached per callable.
    pub fn is_native(self) -> bool {
        matches!(self, Self::NativeProfile | Self::NativeTrace)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Trace => "trace",
            Self::Dummy => "dummy",
            Self::NativeProfile => "native-profile",
            Self::NativeTrace => "native-trace",
        }
    }
}

impl fmt::Display for InstrumenterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumenterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Self::Profile),
            "trace" => Ok(Self::Trace),
            "dummy" => Ok(Self::Dummy),
            "native-profile" | "cProfile" => Ok(Self::NativeProfile),
            "native-trace" | "cTrace" => Ok(Self::NativeTrace),
            other => Err(Error::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kind: InstrumenterKind,

    /// Attach the call interceptor when `Instrumentation::run` starts.
    pub enable_instrumenter: bool,

    /// Calls whose module starts with one of these prefixes are never recorded.
    pub excluded_prefixes: Vec<String>,

    /// Calls to functions with one of these names are never recorded.
    pub excluded_functions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: InstrumenterKind::default(),
            enable_instrumenter: true,
            excluded_prefixes: vec![env!("CARGO_CRATE_NAME").to_string()],
            excluded_functions: vec![crate::gate::DETACH_FUNCTION.to_string()],
        }
    }
}

impl Config {
    pub fn new(kind: InstrumenterKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Defaults overridden by `TRACING_REGIONS_INSTRUMENTER` and
    /// `TRACING_REGIONS_NOINSTRUMENTER`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(kind) = lookup(ENV_INSTRUMENTER).filter(|v| !v.is_empty()) {
            config.kind = kind.parse()?;
        }
        if let Some(flag) = lookup(ENV_NO_INSTRUMENTER) {
            config.enable_instrumenter = !matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kind_names_and_aliases() {
        assert_eq!("trace".parse::<InstrumenterKind>().unwrap(), InstrumenterKind::Trace);
        assert_eq!(
            "cProfile".parse::<InstrumenterKind>().unwrap(),
            InstrumenterKind::NativeProfile
        );
        assert_eq!(
            "native-trace".parse::<InstrumenterKind>().unwrap(),
            InstrumenterKind::NativeTrace
        );
        assert!(matches!(
            "strace".parse::<InstrumenterKind>(),
            Err(Error::UnknownKind(name)) if name == "strace"
        ));
    }

    #[test]
    fn kind_round_trips_through_display() {
        for kind in [
            InstrumenterKind::Profile,
            InstrumenterKind::Trace,
            InstrumenterKind::Dummy,
            InstrumenterKind::NativeProfile,
            InstrumenterKind::NativeTrace,
        ] {
            assert_eq!(kind.to_string().parse::<InstrumenterKind>().unwrap(), kind);
        }
    }

    #[test]
    fn defaults_exclude_own_namespace() {
        let config = Config::default();
        assert_eq!(config.kind, InstrumenterKind::NativeProfile);
        assert!(config.enable_instrumenter);
        assert_eq!(config.excluded_prefixes, vec!["tracing_regions".to_string()]);
    }

    #[test]
    fn environment_overrides() {
        let config = Config::from_lookup(|key| match key {
            ENV_INSTRUMENTER => Some("trace".into()),
            ENV_NO_INSTRUMENTER => Some("1".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.kind, InstrumenterKind::Trace);
        assert!(!config.enable_instrumenter);

        let bad = Config::from_lookup(|key| (key == ENV_INSTRUMENTER).then(|| "bogus".into()));
        assert!(bad.is_err());
    }
}
