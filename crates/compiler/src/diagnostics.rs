//! Compiler diagnostics
//!
//! Every pass accumulates diagnostics instead of failing fast: a
//! compilation that hits errors still runs every pass that is safe so the
//! caller sees the complete set. Code generation is the only pass skipped
//! in the presence of errors.

use crate::types::EffectSet;
use serde::Serialize;
use serde::ser::Serializer;

/// Source position (0-indexed line and column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

impl SourceLoc {
    pub fn new(line: u32, col: u32) -> Self {
        SourceLoc { line, col }
    }
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 1-indexed for humans
        write!(f, "{}:{}", self.line + 1, self.col + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagKind {
    Lex,
    Parse,
    Type,
    Effect,
    UndefinedName,
    Verify,
}

fn serialize_effects<S: Serializer>(
    set: &Option<EffectSet>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    match set {
        Some(s) => ser.serialize_some(&s.to_string()),
        None => ser.serialize_none(),
    }
}

/// One diagnostic. Effect violations carry the required and allowed sets
/// so tooling can explain exactly which bit was missing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub message: String,
    pub loc: SourceLoc,
    #[serde(serialize_with = "serialize_effects")]
    pub required: Option<EffectSet>,
    #[serde(serialize_with = "serialize_effects")]
    pub allowed: Option<EffectSet>,
}

impl Diagnostic {
    pub fn new(kind: DiagKind, loc: SourceLoc, message: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            message: message.into(),
            loc,
            required: None,
            allowed: None,
        }
    }

    pub fn effect(
        loc: SourceLoc,
        message: impl Into<String>,
        required: EffectSet,
        allowed: EffectSet,
    ) -> Self {
        Diagnostic {
            kind: DiagKind::Effect,
            message: message.into(),
            loc,
            required: Some(required),
            allowed: Some(allowed),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}: {}", self.loc, self.kind, self.message)?;
        if let (Some(req), Some(allowed)) = (self.required, self.allowed) {
            write!(f, " (requires {}, allowed {})", req, allowed)?;
        }
        Ok(())
    }
}

/// Render a diagnostic list as a JSON array.
pub fn diagnostics_to_json(diags: &[Diagnostic]) -> String {
    serde_json::to_string_pretty(diags).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_effect_sets() {
        let d = Diagnostic::effect(
            SourceLoc::new(4, 10),
            "operator '/' requires the VOID effect",
            EffectSet::VOID,
            EffectSet::NONE,
        );
        let text = d.to_string();
        assert!(text.contains("5:11"));
        assert!(text.contains("requires VOID"));
        assert!(text.contains("allowed NONE"));
    }

    #[test]
    fn json_export() {
        let d = Diagnostic::new(DiagKind::Parse, SourceLoc::new(0, 0), "expected ')'");
        let json = diagnostics_to_json(&[d]);
        assert!(json.contains("\"parse\""));
        assert!(json.contains("expected ')'"));
    }

    #[test]
    fn json_effect_sets_are_names() {
        let d = Diagnostic::effect(
            SourceLoc::default(),
            "x",
            EffectSet::VOID | EffectSet::PERSIST,
            EffectSet::NONE,
        );
        let json = diagnostics_to_json(&[d]);
        assert!(json.contains("VOID|PERSIST"));
        assert!(json.contains("NONE"));
    }
}
