//! Compiler configuration
//!
//! The in-memory driver takes a `CompilerConfig`; embedders can also load
//! one from a TOML snippet:
//!
//! ```toml
//! target = "x86-64"
//! opt = "standard"
//! ```

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TargetArch {
    #[default]
    #[serde(rename = "x86-64")]
    X64,
    #[serde(rename = "rv64imac")]
    Rv64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptLevel {
    /// No optimization passes.
    None,
    /// Constant folding and dead-code elimination.
    #[default]
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub target: TargetArch,
    pub opt: OptLevel,
}

impl CompilerConfig {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("bad compiler config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = CompilerConfig::default();
        assert_eq!(c.target, TargetArch::X64);
        assert_eq!(c.opt, OptLevel::Standard);
    }

    #[test]
    fn parse_toml() {
        let c = CompilerConfig::from_toml("target = \"rv64imac\"\nopt = \"none\"").unwrap();
        assert_eq!(c.target, TargetArch::Rv64);
        assert_eq!(c.opt, OptLevel::None);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let c = CompilerConfig::from_toml("opt = \"none\"").unwrap();
        assert_eq!(c.target, TargetArch::X64);
    }

    #[test]
    fn bad_target_is_an_error() {
        assert!(CompilerConfig::from_toml("target = \"mips\"").is_err());
    }
}
