use std::fmt;

use serde::Serialize;

/// Version details baked into a binary at compile time
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub build_profile: &'static str,
    /// Set by the daemon's build script; absent for plain library builds
    pub build_timestamp: Option<&'static str>,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}", self.name, self.version, self.build_profile)?;
        if let Some(ts) = self.build_timestamp {
            write!(f, ", built {}", ts)?;
        }
        write!(f, ")")
    }
}

/// Build info for the crate that invokes the macro
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            build_profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
            build_timestamp: option_env!("BUILD_TIMESTAMP"),
        }
    };
}

/// Build info for this library
pub fn build_info() -> BuildInfo {
    build_info!()
}
