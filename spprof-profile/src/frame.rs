use serde_derive::{Deserialize, Serialize};

/// A single frame in a call stack.
///
/// Interpreter frames carry the function name, source filename and line as
/// reported by the host runtime. Native frames carry the symbol name (or
/// `"?"`), the object file path in `filename`, and a zero line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Frame {
    pub function_name: String,
    pub filename: String,
    pub line: u32,
    pub is_native: bool,
}

impl Frame {
    pub fn interpreted(function_name: &str, filename: &str, line: u32) -> Self {
        Frame {
            function_name: function_name.to_string(),
            filename: filename.to_string(),
            line,
            is_native: false,
        }
    }

    pub fn native(symbol: &str, object_file: &str) -> Self {
        Frame {
            function_name: symbol.to_string(),
            filename: object_file.to_string(),
            line: 0,
            is_native: true,
        }
    }

    /// Display label used by the collapsed format.
    ///
    /// Interpreter frames with a known location render as
    /// `function (file:line)`; frames without one render as the bare
    /// function name. Native frames are prefixed with `[native]` so mixed
    /// stacks stay readable in flame graphs.
    pub fn collapsed_label(&self) -> String {
        if self.is_native {
            format!("[native] {}", self.function_name)
        } else if !self.filename.is_empty() && self.line > 0 {
            format!("{} ({}:{})", self.function_name, self.filename, self.line)
        } else {
            self.function_name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapsed_label_variants() {
        let f = Frame::interpreted("run", "app.x", 42);
        assert_eq!(f.collapsed_label(), "run (app.x:42)");

        let no_location = Frame::interpreted("<module>", "", 0);
        assert_eq!(no_location.collapsed_label(), "<module>");

        let native = Frame::native("memcpy", "/lib/libc.so.6");
        assert_eq!(native.collapsed_label(), "[native] memcpy");
    }
}
