use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! invariant_error {
    ($msg:expr) => {
        crate::Error::Invariant {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Invariant {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Only two failure classes exist in this crate. Malformed input is anything the caller hands
/// us that cannot describe a valid method body (misaligned branch targets, overlapping
/// exception regions, local references past the end of the local list). Invariant violations
/// are internal defects: a transformation pass left the block graph in a state a later stage
/// refuses to accept. Both abort the current method's pipeline; neither produces partial
/// output.
///
/// # Examples
///
/// ```rust
/// use blockscope::{Error, MethodFlow};
///
/// match MethodFlow::build(vec![], &[], vec![]) {
///     Ok(_) => println!("parsed"),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("malformed method body: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The method body is damaged and could not be parsed.
    ///
    /// This error indicates that the instruction stream or the exception-handler table does
    /// not describe a well-formed method. The error includes the source location where the
    /// malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A transformation pass violated an internal invariant of the block graph.
    ///
    /// The input was well-formed but a pass left the graph in a state that a later stage
    /// cannot trust, such as a removed block that still has live incoming edges. This is a
    /// defect in a pass, not in the input; the pipeline aborts rather than emit silently
    /// corrupt code.
    #[error("Invariant violated - {file}:{line}: {message}")]
    Invariant {
        /// The message to be printed for the Invariant error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories or for
    /// wrapping external failures with additional context.
    #[error("{0}")]
    Error(String),
}
