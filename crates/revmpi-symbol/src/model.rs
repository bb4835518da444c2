use std::fmt;
use std::ops::Range;

use indexmap::IndexMap;

use crate::location::LocationExpr;

/// Name of the sentinel function declared by the message-passing wrapper.
pub const WRAPPER_MARKER: &str = "_MPI_WRAPPER_INCLUDE";

/// Name of the wrapper helper called by message functions to publish the
/// operation (and, in fork mode, to fork the paused process image).
pub const RECORD_HELPER: &str = "_MPI_WRAPPER_RECORD";

/// Index of a [Function] in a [DebugModel].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub(crate) usize);

/// Index of a [DebugModule] in a [DebugModel].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) usize);

/// In-memory model of the debug information of a binary.
///
/// The model is built once by [DebugModel::parse] and never mutated afterwards.
/// Addresses are static (as found in the binary), callers relocate them.
#[derive(Debug, Default)]
pub struct DebugModel {
    pub(crate) modules: Vec<DebugModule>,
    pub(crate) functions: Vec<Function>,
    pub(crate) variables: Vec<Variable>,
    pub(crate) message_functions: Vec<MessageFunction>,
    pub(crate) wrapper_file: Option<String>,
    pub(crate) is_pie: bool,
}

/// One compiled translation unit.
#[derive(Debug, Default)]
pub struct DebugModule {
    /// Name of the unit (usually its main source file).
    pub name: String,

    /// File table of the unit's line program.
    pub files: IndexMap<u64, String>,

    /// Line-table rows, in line-program order.
    pub entries: Vec<LineEntry>,

    /// Functions defined in this unit.
    pub functions: Vec<FunctionId>,

    /// Address range of the unit, if contiguous.
    pub range: Option<Range<u64>>,
}

/// A row of a line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Static address of the instruction.
    pub address: u64,

    /// Index into the owning module's file table.
    pub file: u64,

    /// Source line.
    pub line: u64,

    /// Source column (0 for the left edge).
    pub column: u64,

    /// Whether the instruction is a recommended breakpoint location.
    pub is_stmt: bool,
}

/// A function with a known code range.
#[derive(Debug, Clone)]
pub struct Function {
    /// Index of this function in its model.
    pub id: FunctionId,

    /// Unit declaring this function.
    pub module: ModuleId,

    /// Function name.
    pub name: String,

    /// Declaring file (index into the module's file table).
    pub file: u64,

    /// Declaring line.
    pub line: u64,

    /// `[low_pc, high_pc)` range of the function.
    pub range: Range<u64>,

    /// Formal parameters, in declaration order.
    pub parameters: Vec<Parameter>,
}

/// A formal parameter of a [Function].
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Parameter name.
    pub name: String,

    /// Type of the parameter.
    pub base_type: BaseType,

    /// Location expression of the parameter.
    pub location: Option<LocationExpr>,
}

/// A variable, global or local to a function.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Variable name.
    pub name: String,

    /// Type of the variable.
    pub base_type: BaseType,

    /// Function declaring this variable (`None` for globals).
    pub function: Option<FunctionId>,

    /// Location expression of the variable.
    pub location: Option<LocationExpr>,
}

/// Primitive type of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseType {
    /// Type name.
    pub name: String,

    /// Size of a value, in bytes.
    pub byte_size: u64,

    /// How to interpret a value.
    pub encoding: Encoding,
}

/// Interpretation of the bytes of a [BaseType].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Two's complement integer.
    Signed,
    /// Unsigned integer (also used for pointers).
    Unsigned,
    /// IEEE 754 float.
    Float,
    /// Boolean.
    Boolean,
    /// Anything else (aggregates, unresolved types).
    Unknown,
}

/// A function defined by the message-passing wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFunction {
    /// The wrapper function.
    pub function: FunctionId,

    /// Name of the wrapped operation (wrapper name without its leading `_`).
    pub op_name: String,
}

/// Source position of an address.
#[derive(Debug, Clone, Copy)]
pub struct SourceLocation<'a> {
    /// Source line.
    pub line: u64,

    /// Source file.
    pub file: &'a str,

    /// Function enclosing the address, if any.
    pub function: Option<&'a Function>,
}

impl BaseType {
    /// Placeholder for variables whose type could not be resolved.
    pub fn unknown() -> Self {
        Self {
            name: "unknown type".to_owned(),
            byte_size: 0,
            encoding: Encoding::Unknown,
        }
    }
}

impl Parameter {
    /// Views this parameter as a variable local to `function`.
    pub fn as_variable(&self, function: FunctionId) -> Variable {
        Variable {
            name: self.name.clone(),
            base_type: self.base_type.clone(),
            function: Some(function),
            location: self.location.clone(),
        }
    }
}

impl Function {
    /// Whether `addr` lies within this function.
    pub fn contains(&self, addr: u64) -> bool {
        self.range.contains(&addr)
    }

    /// Looks up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

impl DebugModel {
    /// Whether the binary is position-independent (`ET_DYN`).
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// All translation units.
    pub fn modules(&self) -> &[DebugModule] {
        &self.modules
    }

    /// All variables (globals and locals).
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Returns the function with the given ID.
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0]
    }

    /// Returns the unit with the given ID.
    pub fn module(&self, id: ModuleId) -> &DebugModule {
        &self.modules[id.0]
    }

    /// Functions defined by the message-passing wrapper, if the binary was
    /// built with it.
    pub fn message_functions(&self) -> &[MessageFunction] {
        &self.message_functions
    }

    /// Source file declaring the wrapper marker function.
    pub fn wrapper_file(&self) -> Option<&str> {
        self.wrapper_file.as_deref()
    }

    /// Returns the address of the first statement of `line` in `file`.
    ///
    /// `file` matches a module file either exactly or as a path suffix.
    pub fn line_to_address(&self, file: &str, line: u64) -> crate::Result<u64> {
        for module in &self.modules {
            for entry in module.entries.iter().filter(|e| e.is_stmt && e.line == line) {
                if module
                    .files
                    .get(&entry.file)
                    .is_some_and(|f| same_file(f, file))
                {
                    return Ok(entry.address);
                }
            }
        }

        Err(crate::Error::LineNotFound {
            file: file.to_owned(),
            line,
        })
    }

    /// Returns the source position of `addr`.
    ///
    /// An exact line-table match is preferred. Otherwise the closest
    /// preceding row inside the enclosing function is used.
    pub fn address_to_line(&self, addr: u64) -> crate::Result<SourceLocation<'_>> {
        let function = self.address_to_function(addr);

        let found = self.modules.iter().find_map(|module| {
            module
                .entries
                .iter()
                .find(|e| e.address == addr)
                .map(|e| (module, e))
        });

        let found = found.or_else(|| {
            let function = function?;
            let module = self.module(function.module);
            module
                .entries
                .iter()
                .filter(|e| function.contains(e.address) && e.address <= addr)
                .max_by_key(|e| e.address)
                .map(|e| (module, e))
        });

        let (module, entry) = found.ok_or(crate::Error::AddressNotFound(addr))?;

        let file = module
            .files
            .get(&entry.file)
            .map(String::as_str)
            .unwrap_or_default();

        Ok(SourceLocation {
            line: entry.line,
            file,
            function,
        })
    }

    /// Returns the function whose range contains `addr`.
    ///
    /// # Note
    ///
    /// `None` is a normal outcome for addresses outside the described code
    /// (shared libraries, PLT stubs).
    pub fn address_to_function(&self, addr: u64) -> Option<&Function> {
        self.functions.iter().find(|f| f.contains(addr))
    }

    /// Looks up a function by name.
    pub fn lookup_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Looks up a global variable by name.
    pub fn lookup_global_variable(&self, name: &str) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.function.is_none() && v.name == name)
    }

    /// Looks up a variable declared in `function` by name.
    pub fn lookup_variable_in_function(&self, function: &Function, name: &str) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.function == Some(function.id) && v.name == name)
    }

    /// Returns the line-table rows within the function `name`.
    pub fn entries_for_function(&self, name: &str) -> crate::Result<Vec<&LineEntry>> {
        let function = self
            .lookup_function(name)
            .ok_or_else(|| crate::Error::FunctionNotFound(name.to_owned()))?;

        Ok(self.entries_in(function))
    }

    /// Returns the line-table rows within `function`.
    pub fn entries_in(&self, function: &Function) -> Vec<&LineEntry> {
        self.module(function.module)
            .entries
            .iter()
            .filter(|e| function.contains(e.address))
            .collect()
    }

    /// Returns the source file declaring the function `name`.
    pub fn entry_source_file(&self, name: &str) -> crate::Result<&str> {
        let function = self
            .lookup_function(name)
            .ok_or_else(|| crate::Error::FunctionNotFound(name.to_owned()))?;

        self.declaring_file(function)
            .ok_or_else(|| crate::Error::FunctionNotFound(name.to_owned()))
    }

    /// Returns the source file declaring `function`.
    pub fn declaring_file(&self, function: &Function) -> Option<&str> {
        self.module(function.module)
            .files
            .get(&function.file)
            .map(String::as_str)
    }

    /// Detects the wrapper marker and records every other function declared
    /// in the same file as a message function, except [RECORD_HELPER].
    pub(crate) fn resolve_message_functions(&mut self) {
        let Some(marker) = self.lookup_function(WRAPPER_MARKER) else {
            tracing::warn!(marker = WRAPPER_MARKER, "binary was not built with the message wrapper");
            return;
        };

        let marker_id = marker.id;
        let marker_file = marker.file;
        let module = self.module(marker.module);

        let message_functions = module
            .functions
            .iter()
            .map(|&id| self.function(id))
            .filter(|f| f.file == marker_file && f.id != marker_id && f.name != RECORD_HELPER)
            .map(|f| MessageFunction {
                function: f.id,
                op_name: f.name.strip_prefix('_').unwrap_or(&f.name).to_owned(),
            })
            .collect::<Vec<_>>();

        self.wrapper_file = module.files.get(&marker_file).cloned();

        tracing::debug!(
            count = message_functions.len(),
            file = self.wrapper_file.as_deref().unwrap_or_default(),
            "resolved message functions"
        );

        self.message_functions = message_functions;
    }
}

fn same_file(candidate: &str, wanted: &str) -> bool {
    candidate == wanted
        || candidate
            .strip_suffix(wanted)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}() [{:#x}..{:#x}) line {}",
            self.name, self.range.start, self.range.end, self.line
        )?;

        if !self.parameters.is_empty() {
            let params = self
                .parameters
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>();
            write!(f, " params: {}", params.join(", "))?;
        }

        Ok(())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} bytes)",
            self.name, self.base_type.name, self.base_type.byte_size
        )
    }
}

impl fmt::Display for DebugModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} files, {} line entries, {} functions)",
            self.name,
            self.files.len(),
            self.entries.len(),
            self.functions.len()
        )
    }
}
