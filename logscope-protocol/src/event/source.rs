use std::fmt;

use serde::{Deserialize, Serialize};

/// File name used when a call site cannot be determined.
pub const UNKNOWN_FILE: &str = "unknown";

/// Best-effort description of where an event was produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

impl Source {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column: None,
            function: None,
        }
    }

    /// The `{file: "unknown", line: 0}` sentinel.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_FILE, 0)
    }

    pub fn with_column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn is_unknown(&self) -> bool {
        self.file == UNKNOWN_FILE && self.line == 0
    }
}

impl Default for Source {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(column) = self.column {
            write!(f, ":{}", column)?;
        }
        if let Some(function) = &self.function {
            write!(f, " ({})", function)?;
        }
        Ok(())
    }
}
