// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler phases.
// The front-end is fatal-on-first-error: each phase returns `Result<_, Diagnostic>`
// and the driver stops at the first error it sees. The resolver's pre-final
// iterations are the one exception — there, soft failures are counted rather
// than raised (see resolve.rs).
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;
use std::rc::Rc;

// ── Source text ──────────────────────────────────────────────────────────

/// One chunk of source code handed to the compiler, with a display name.
#[derive(Debug)]
pub struct SourceChunk {
    pub name: String,
    pub text: String,
    /// Internal chunks (the built-in library) get shorter error messages.
    pub is_internal: bool,
}

impl SourceChunk {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Rc<Self> {
        Rc::new(SourceChunk {
            name: name.into(),
            text: text.into(),
            is_internal: false,
        })
    }

    pub fn internal(name: impl Into<String>, text: impl Into<String>) -> Rc<Self> {
        Rc::new(SourceChunk {
            name: name.into(),
            text: text.into(),
            is_internal: true,
        })
    }

    /// Convert a byte offset into a 1-based (line, column) pair.
    pub fn line_and_column(&self, offset: usize) -> (usize, usize) {
        let clamped = offset.min(self.text.len());
        let mut line = 1;
        let mut col = 1;
        for c in self.text[..clamped].chars() {
            if c == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }
}

/// Byte-offset span within one source chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn join(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A source location: a chunk plus a byte span within it.
#[derive(Debug, Clone)]
pub struct Location {
    pub chunk: Rc<SourceChunk>,
    pub span: Span,
}

impl Location {
    pub fn new(chunk: Rc<SourceChunk>, span: Span) -> Self {
        Location { chunk, span }
    }

    pub fn describe(&self) -> String {
        let (line, col) = self.chunk.line_and_column(self.span.start);
        format!("{}:{}:{}", self.chunk.name, line, col)
    }
}

// ── Category and severity ────────────────────────────────────────────────

/// Which phase produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Lexical,
    Parse,
    Sanity,
    Resolution,
    Type,
    Overload,
    Lowering,
    PostCheck,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Lexical => "lexical",
            Category::Parse => "parse",
            Category::Sanity => "sanity",
            Category::Resolution => "resolution",
            Category::Type => "type",
            Category::Overload => "overload",
            Category::Lowering => "lowering",
            Category::PostCheck => "post-check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic. Carries the phase category, a source location,
/// and an optional remediation hint.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub category: Category,
    pub level: Level,
    pub location: Option<Location>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(category: Category, location: Location, message: impl Into<String>) -> Self {
        Diagnostic {
            category,
            level: Level::Error,
            location: Some(location),
            message: message.into(),
            hint: None,
        }
    }

    /// A diagnostic with no location (e.g. "no main processor found").
    pub fn global(category: Category, message: impl Into<String>) -> Self {
        Diagnostic {
            category,
            level: Level::Error,
            location: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn warning(mut self) -> Self {
        self.level = Level::Warning;
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            Level::Error => "error",
            Level::Warning => "warning",
        };
        if let Some(loc) = &self.location {
            write!(
                f,
                "{}: {} [{}]: {}",
                loc.describe(),
                level,
                self.category.as_str(),
                self.message
            )?;
        } else {
            write!(f, "{} [{}]: {}", level, self.category.as_str(), self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Phase result type used throughout the front-end.
pub type CompileResult<T> = Result<T, Diagnostic>;

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Rc<SourceChunk> {
        SourceChunk::new("test.soul", "processor P\n{\n}\n")
    }

    #[test]
    fn line_and_column() {
        let c = chunk();
        assert_eq!(c.line_and_column(0), (1, 1));
        assert_eq!(c.line_and_column(10), (1, 11));
        assert_eq!(c.line_and_column(12), (2, 1));
    }

    #[test]
    fn display_with_location() {
        let d = Diagnostic::new(
            Category::Parse,
            Location::new(chunk(), Span::new(12, 13)),
            "unexpected token",
        );
        assert_eq!(format!("{d}"), "test.soul:2:1: error [parse]: unexpected token");
    }

    #[test]
    fn display_global_with_hint() {
        let d = Diagnostic::global(Category::PostCheck, "no main processor")
            .with_hint("annotate one processor with [[ main ]]");
        assert_eq!(
            format!("{d}"),
            "error [post-check]: no main processor\n  hint: annotate one processor with [[ main ]]"
        );
    }

    #[test]
    fn span_join() {
        let a = Span::new(4, 8);
        let b = Span::new(6, 12);
        assert_eq!(a.join(b), Span::new(4, 12));
    }
}
