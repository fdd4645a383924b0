//! Diagnostic reporting infrastructure.
//!
//! The compiler consumes a binary program snapshot, so diagnostics carry no
//! source spans; they identify the offending heap object, function or
//! bytecode index in the message instead.
//!
//! # Error Codes
//!
//! Wisp compiler error codes are organized by category:
//!
//! - **E0001-E0099**: Structural bugs in the input snapshot (unknown
//!   opcodes, disagreeing stack heights, unknown heap object variants).
//!   These are unrecoverable: emitting anything would be unsound.
//! - **E0100-E0199**: LLVM-side failures (builder errors, function or
//!   module verification).
//! - **E0200-E0299**: I/O failures while writing the output module.

use thiserror::Error;

/// Compiler error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // ============================================================
    // Snapshot errors (E0001-E0099)
    // ============================================================
    /// Unknown or truncated bytecode.
    MalformedBytecode = 1,
    /// Two control-flow paths reach the same bytecode index with
    /// different operand stack heights.
    StackHeightMismatch = 2,
    /// A heap object variant the materializer does not understand.
    UnknownHeapObject = 3,
    /// A bytecode referenced a literal index outside the function's
    /// literal table.
    BadLiteralIndex = 4,
    /// An object reference did not have the expected variant.
    BadObjectKind = 5,

    // ============================================================
    // LLVM errors (E0100-E0199)
    // ============================================================
    /// An LLVM instruction builder call failed.
    LlvmBuilder = 100,
    /// Per-function verification failed.
    FunctionVerification = 101,
    /// Whole-module verification failed.
    ModuleVerification = 102,
    /// Internal compiler error.
    Internal = 103,

    // ============================================================
    // I/O errors (E0200-E0299)
    // ============================================================
    /// Could not write the bitcode output file.
    BitcodeWrite = 200,
}

impl ErrorCode {
    /// Get the formatted error code string (e.g., "E0002").
    pub fn as_str(&self) -> String {
        format!("E{:04}", *self as u16)
    }

    /// Get a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::MalformedBytecode => "malformed bytecode",
            ErrorCode::StackHeightMismatch => "operand stack heights disagree",
            ErrorCode::UnknownHeapObject => "unknown heap object variant",
            ErrorCode::BadLiteralIndex => "literal index out of range",
            ErrorCode::BadObjectKind => "object reference has unexpected kind",
            ErrorCode::LlvmBuilder => "LLVM builder call failed",
            ErrorCode::FunctionVerification => "function verification failed",
            ErrorCode::ModuleVerification => "module verification failed",
            ErrorCode::Internal => "internal compiler error",
            ErrorCode::BitcodeWrite => "could not write bitcode output",
        }
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// An error that prevents compilation.
    Error,
    /// A warning that doesn't prevent compilation.
    Warning,
    /// An informational note.
    Note,
}

/// A compiler diagnostic.
///
/// There is no partial-success mode (the output file either exists and is
/// complete, or compilation failed), so every `Error` diagnostic returned
/// from [`crate::codegen::LlvmCodegen::generate`] is fatal to the caller.
#[derive(Debug, Clone, Error)]
#[error("{}", self.render())]
pub struct Diagnostic {
    /// The kind of diagnostic.
    pub kind: DiagnosticKind,
    /// The error code, when one applies.
    pub code: Option<ErrorCode>,
    /// The main message.
    pub message: String,
    /// Additional notes (offending IR dumps, object ids, bytecode indices).
    pub notes: Vec<String>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            notes: Vec::new(),
        }
    }

    /// Create a new error diagnostic with an error code.
    pub fn error_with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: Some(code),
            message: message.into(),
            notes: Vec::new(),
        }
    }

    /// Create a new warning diagnostic.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code: None,
            message: message.into(),
            notes: Vec::new(),
        }
    }

    /// Attach a note to this diagnostic.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Map an LLVM builder error into the standard single-diagnostic list
    /// used by codegen `Result`s.
    pub fn llvm(err: impl std::fmt::Display) -> Vec<Diagnostic> {
        vec![Diagnostic::error_with_code(
            ErrorCode::LlvmBuilder,
            format!("LLVM builder error: {}", err),
        )]
    }

    fn render(&self) -> String {
        let prefix = match self.kind {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        };
        let mut out = match self.code {
            Some(code) => format!("{}[{}]: {}", prefix, code.as_str(), self.message),
            None => format!("{}: {}", prefix, self.message),
        };
        for note in &self.notes {
            out.push_str("\n  note: ");
            out.push_str(note);
        }
        out
    }

    /// Print this diagnostic to stderr.
    pub fn emit(&self) {
        eprintln!("{}", self);
    }
}

/// Construct an internal-compiler-error [`Diagnostic`] with the location of
/// the invoking code baked into the message.
///
/// Internal errors indicate bugs in the compiler itself rather than the
/// input snapshot; the location makes them actionable without a backtrace.
#[macro_export]
macro_rules! ice {
    ($($arg:tt)*) => {
        $crate::diagnostics::Diagnostic::error_with_code(
            $crate::diagnostics::ErrorCode::Internal,
            format!("internal compiler error at {}:{}: {}", file!(), line!(), format!($($arg)*)),
        )
    };
}
