//! This crate parses the DWARF debug information of an ELF binary into an
//! immutable [DebugModel], used by `revmpi-debugger` to map source lines to
//! addresses (and back), find stack-frame owners and locate variables.
//!
//! It also detects the message-passing wrapper convention: a binary built
//! with the wrapper declares a sentinel function ([WRAPPER_MARKER]), and every
//! other function declared in the same file wraps one message operation.
//!
//! # Example
//!
//! ```no_run
//! use revmpi_symbol::DebugModel;
//!
//! let model = DebugModel::parse("./ring").unwrap();
//!
//! let file = model.entry_source_file("main").unwrap();
//! let addr = model.line_to_address(file, 12).unwrap();
//!
//! for message_fn in model.message_functions() {
//!     println!("{}", message_fn.op_name);
//! }
//! ```

mod error;
mod location;
mod model;
mod parser;

pub use self::error::{Error, Result};
pub use self::location::{LocationContext, LocationExpr};
pub use self::model::{BaseType, DebugModel, DebugModule, Encoding, Function, FunctionId};
pub use self::model::{LineEntry, MessageFunction, ModuleId, Parameter, SourceLocation};
pub use self::model::{RECORD_HELPER, Variable, WRAPPER_MARKER};
pub use self::parser::ParseOptions;
