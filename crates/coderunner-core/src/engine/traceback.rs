//! Error reports restricted to frames of the submitted code.
//!
//! The layout follows the familiar traceback format: one `File` entry per
//! frame, oldest first, each followed by the offending source line, and a
//! final `<Kind>: <message>` line. Frames that belong to host modules or to
//! the engine itself never appear.

use rhai::{EvalAltResult, ParseError, Position};

use crate::guard::SandboxFault;

/// Source name attached to every compiled submission.
pub const STUDENT_SOURCE: &str = "<student_code>";

const TOP_LEVEL: &str = "<module>";

struct Frame {
    function: String,
    line: usize,
}

fn push_frame(out: &mut String, frame: &Frame, code: &str) {
    out.push_str(&format!(
        "  File \"{}\", line {}, in {}\n",
        STUDENT_SOURCE, frame.line, frame.function
    ));
    if let Some(text) = code.lines().nth(frame.line.saturating_sub(1)) {
        let text = text.trim();
        if !text.is_empty() {
            out.push_str(&format!("    {}\n", text));
        }
    }
}

pub fn format_syntax_error(err: &ParseError, code: &str) -> String {
    let mut out = String::new();
    if let Some(line) = err.1.line() {
        let frame = Frame {
            function: TOP_LEVEL.to_string(),
            line,
        };
        push_frame(&mut out, &frame, code);
    }
    out.push_str(&format!("SyntaxError: {}", err.0));
    out
}

pub fn format_runtime_error(err: &EvalAltResult, code: &str) -> String {
    let mut frames = Vec::new();
    let mut function = TOP_LEVEL.to_string();
    let mut current = err;

    loop {
        match current {
            EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) => {
                if source.is_empty() || source == STUDENT_SOURCE {
                    push_position(&mut frames, &function, *pos);
                }
                function = name.clone();
                current = inner.as_ref();
            }
            EvalAltResult::ErrorInModule(_, inner, _) => {
                current = inner.as_ref();
            }
            _ => {
                push_position(&mut frames, &function, current.position());
                break;
            }
        }
    }

    let (kind, message) = classify(current);
    let mut out = String::new();
    for frame in &frames {
        push_frame(&mut out, frame, code);
    }
    out.push_str(&format!("{}: {}", kind, message));
    out
}

fn push_position(frames: &mut Vec<Frame>, function: &str, pos: Position) {
    if let Some(line) = pos.line() {
        frames.push(Frame {
            function: function.to_string(),
            line,
        });
    }
}

/// Exception kind and bare message of the innermost error.
pub fn classify(err: &EvalAltResult) -> (String, String) {
    if let EvalAltResult::ErrorRuntime(value, _) = err {
        return match value.clone().try_cast::<SandboxFault>() {
            Some(fault) => (fault.kind.to_string(), fault.message),
            None => ("RuntimeError".to_string(), value.to_string()),
        };
    }
    if let EvalAltResult::ErrorModuleNotFound(name, _) = err {
        return ("ImportError".to_string(), format!("No module named '{}'", name));
    }

    let message = bare_message(err);
    let kind = match err {
        EvalAltResult::ErrorVariableNotFound(..) | EvalAltResult::ErrorFunctionNotFound(..) => {
            "NameError"
        }
        EvalAltResult::ErrorArrayBounds(..) | EvalAltResult::ErrorStringBounds(..) => "IndexError",
        EvalAltResult::ErrorMismatchDataType(..) => "TypeError",
        EvalAltResult::ErrorArithmetic(..) if message.starts_with("Division by zero") => {
            "ZeroDivisionError"
        }
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorDataTooLarge(..) => "MemoryError",
        EvalAltResult::ErrorStackOverflow(..) => "RecursionError",
        _ => "RuntimeError",
    };
    (kind.to_string(), message)
}

/// Display text of an error without the trailing position suffix.
fn bare_message(err: &EvalAltResult) -> String {
    let text = err.to_string();
    let pos = err.position();
    if pos.is_none() {
        return text;
    }
    let suffix = format!(" ({})", pos);
    match text.strip_suffix(&suffix) {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}
