// Configuration error types
// Parse errors carry line/column and a source excerpt; validation errors carry a path

use std::fmt;

/// Parse error with location and surrounding source lines
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// A few lines around the error
    pub context: String,
    /// Optional hint for fixing the error
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Wrong types, missing fields, unknown action kinds
    InvalidSchema,
    /// File could not be read
    IoError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(ParseErrorKind::IoError)
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the source lines around the error location
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column - 1) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml error, keeping its location
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let raw = err.to_string();
        let message = raw
            .split(" at line ")
            .next()
            .unwrap_or(raw.as_str())
            .to_string();

        let kind = if raw.contains("did not find expected") || raw.contains("found character") {
            ParseErrorKind::YamlSyntax
        } else {
            ParseErrorKind::InvalidSchema
        };

        let mut error = ParseError::new(message, line, column)
            .with_kind(kind)
            .with_source_context(source, 2);

        if raw.contains("unknown variant") {
            error = error.with_suggestion(
                "action kind must be one of: stage_load, dimension_load, fact_load, quality_check, barrier",
            );
        } else if raw.contains("missing field `kind`") {
            error = error.with_suggestion("every action and probe needs a `kind` field");
        }

        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.line > 0 {
            write!(f, " (line {}:{})", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context.trim_end())?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            write!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Semantic validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Location in the definition, e.g. `tasks[load_users].key`
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_context_marks_error_line() {
        let source = "name: x\ntasks:\n  - id: a\n    action: 5\n";
        let err = ParseError::new("bad action", 4, 13).with_source_context(source, 1);

        assert!(err.context.contains(">    4 |     action: 5"));
        assert!(err.context.contains("^"));
        assert!(!err.context.contains("name: x"));
    }

    #[test]
    fn test_display_includes_location_and_help() {
        let err = ParseError::new("unknown variant `copy`", 3, 5).with_suggestion("use stage_load");
        let text = err.to_string();

        assert!(text.starts_with("unknown variant `copy` (line 3:5)"));
        assert!(text.ends_with("help: use stage_load"));
    }
}
