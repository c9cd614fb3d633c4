//! Per-declaration diagnostics.
//!
//! A malformed binding marker produces one `Diagnostic` and extraction keeps
//! going; the collected list rides along with the successful signatures so a
//! single bad declaration never blocks its neighbours.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::span::LineCol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// A diagnostic attached to one declaration in the marked source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Name of the declaration the diagnostic is about, when one could be
    /// recovered from the malformed input.
    pub declaration: Option<String>,
    pub message: String,
    pub position: Option<LineCol>,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            declaration: None,
            message: message.into(),
            position: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            declaration: None,
            message: message.into(),
            position: None,
        }
    }

    #[must_use]
    pub fn with_declaration(mut self, name: impl Into<String>) -> Self {
        self.declaration = Some(name.into());
        self
    }

    #[must_use]
    pub fn at(mut self, position: LineCol) -> Self {
        self.position = Some(position);
        self
    }

    /// One-line rendering: `warning[add]: 3:5: message`.
    pub fn render(&self) -> String {
        let mut out = self.severity.to_string();
        if let Some(decl) = &self.declaration {
            out.push('[');
            out.push_str(decl);
            out.push(']');
        }
        out.push_str(": ");
        if let Some(pos) = self.position {
            out.push_str(&format!("{}:{}: ", pos.line, pos.column));
        }
        out.push_str(&self.message);
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
