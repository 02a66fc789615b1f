//! Runtime error type.

use thiserror::Error;

/// One frame of a runtime backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name, or `<script>` for an unnamed function.
    pub function: String,

    /// Source line of the faulting instruction.
    pub line: u32,
}

/// A runtime failure: arity or type mismatch, bad index, undefined global
/// or property, call of a non-callable.
///
/// The VM reports the error to stderr with its backtrace, resets its
/// stack, and stays usable for another run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Runtime error: {message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    /// The full diagnostic: message followed by one `[line N] in f` entry
    /// per live frame, innermost first.
    pub fn render(&self) -> String {
        let mut out = format!("Runtime error: {}", self.message);
        for frame in &self.trace {
            out.push_str(&format!("\n[line {}] in {}", frame.line, frame.function));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_backtrace() {
        let error = RuntimeError {
            message: "Operands must be numbers.".to_string(),
            trace: vec![
                TraceFrame {
                    function: "inner".to_string(),
                    line: 3,
                },
                TraceFrame {
                    function: "script".to_string(),
                    line: 1,
                },
            ],
        };
        assert_eq!(
            error.render(),
            "Runtime error: Operands must be numbers.\n[line 3] in inner\n[line 1] in script"
        );
    }
}
