use std::borrow::Cow;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use gimli::{AttributeValue, EndianSlice, Reader, RunTimeEndian, Unit, UnitOffset};
use goblin::elf::header::ET_DYN;
use goblin::elf::section_header::SHT_NOBITS;
use goblin::elf::Elf;
use indexmap::IndexMap;

use crate::location::LocationExpr;
use crate::model::{BaseType, DebugModel, DebugModule, Encoding, Function, FunctionId};
use crate::model::{LineEntry, ModuleId, Parameter, Variable};

/// Maximum number of `DW_AT_type` indirections followed to find a base type.
const MAX_TYPE_CHAIN: usize = 8;

/// Options controlling how debug information is interpreted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Number of lines prepended to every source file after compilation
    /// (subtracted from every line reported by the line tables).
    pub line_offset: u64,
}

impl DebugModel {
    /// Parses the debug information of the ELF binary at `path`.
    pub fn parse(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::parse_with(path, ParseOptions::default())
    }

    /// Parses the debug information of the ELF binary at `path`, with
    /// the given options.
    #[tracing::instrument(name = "parse_debug_info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn parse_with(path: impl AsRef<Path>, options: ParseOptions) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| crate::Error::File(path.to_path_buf(), e))?;

        Self::from_elf_bytes(&bytes, options)
    }

    /// Parses the debug information of an in-memory ELF image.
    pub fn from_elf_bytes(bytes: &[u8], options: ParseOptions) -> crate::Result<Self> {
        let elf = Elf::parse(bytes)?;

        let endian = if elf.little_endian {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        if section_data(&elf, bytes, ".debug_info").is_none() {
            return Err(crate::Error::MissingDebugInfo);
        }

        let load_section = |id: gimli::SectionId| {
            let data = section_data(&elf, bytes, id.name()).unwrap_or_default();
            Ok::<_, crate::Error>(EndianSlice::new(data, endian))
        };

        let dwarf = gimli::Dwarf::load(load_section)?;

        let mut model = DebugModel {
            is_pie: elf.header.e_type == ET_DYN,
            ..Default::default()
        };

        let mut units = dwarf.units();

        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            UnitParser::new(&dwarf, &unit, &mut model, options).parse()?;
        }

        tracing::debug!(
            modules = model.modules.len(),
            functions = model.functions.len(),
            variables = model.variables.len(),
            pie = model.is_pie,
            "parsed debug info"
        );

        model.resolve_message_functions();

        Ok(model)
    }
}

fn section_data<'a>(elf: &Elf, bytes: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let sh = elf
        .section_headers
        .iter()
        .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(name))?;

    if sh.sh_type == SHT_NOBITS {
        return None;
    }

    let start = usize::try_from(sh.sh_offset).ok()?;
    let size = usize::try_from(sh.sh_size).ok()?;

    bytes.get(start..start.checked_add(size)?)
}

/// Scope of the subprogram currently being traversed.
#[derive(Clone, Copy)]
struct Scope {
    depth: isize,
    function: Option<FunctionId>,
}

struct UnitParser<'a, R: Reader> {
    dwarf: &'a gimli::Dwarf<R>,
    unit: &'a Unit<R>,
    model: &'a mut DebugModel,
    options: ParseOptions,
    module: ModuleId,
}

impl<'a, R: Reader> UnitParser<'a, R> {
    fn new(
        dwarf: &'a gimli::Dwarf<R>,
        unit: &'a Unit<R>,
        model: &'a mut DebugModel,
        options: ParseOptions,
    ) -> Self {
        let module = ModuleId(model.modules.len());

        Self {
            dwarf,
            unit,
            model,
            options,
            module,
        }
    }

    fn parse(mut self) -> crate::Result<()> {
        let mut module = DebugModule::default();
        self.parse_line_program(&mut module)?;
        self.model.modules.push(module);

        let unit = self.unit;
        let mut entries = unit.entries();
        let mut depth = 0isize;
        let mut scope: Option<Scope> = None;

        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;

            if scope.as_ref().is_some_and(|s| depth <= s.depth) {
                scope = None;
            }

            match entry.tag() {
                gimli::DW_TAG_compile_unit => self.parse_unit_attrs(entry)?,
                gimli::DW_TAG_subprogram if scope.is_none() => {
                    let function = self.parse_function(entry)?;
                    scope = Some(Scope { depth, function });
                }
                gimli::DW_TAG_formal_parameter => {
                    let Some(Scope {
                        depth: fn_depth,
                        function: Some(id),
                    }) = scope
                    else {
                        continue;
                    };

                    if depth == fn_depth + 1 {
                        if let Some(param) = self.parse_parameter(entry)? {
                            self.model.functions[id.0].parameters.push(param);
                        }
                    }
                }
                gimli::DW_TAG_variable => {
                    let function = match scope {
                        Some(Scope { function: None, .. }) => continue,
                        Some(Scope { function, .. }) => function,
                        None => None,
                    };

                    if let Some(variable) = self.parse_variable(entry, function)? {
                        self.model.variables.push(variable);
                    }
                }
                _ => (),
            }
        }

        Ok(())
    }

    fn parse_unit_attrs(&mut self, entry: &gimli::DebuggingInformationEntry<'_, '_, R>) -> crate::Result<()> {
        let name = self.attr_string(entry, gimli::DW_AT_name)?;

        let low = match entry.attr_value(gimli::DW_AT_low_pc)? {
            Some(value) => self.dwarf.attr_address(self.unit, value)?,
            None => None,
        };

        let range = match (low, entry.attr(gimli::DW_AT_high_pc)?) {
            (Some(low), Some(high)) => self.high_pc(low, &high)?.map(|high| low..high),
            _ => None,
        };

        let module = &mut self.model.modules[self.module.0];
        module.name = name.unwrap_or_default();
        module.range = range;

        Ok(())
    }

    fn parse_line_program(&self, module: &mut DebugModule) -> crate::Result<()> {
        let Some(program) = self.unit.line_program.clone() else {
            return Ok(());
        };

        let mut files = IndexMap::new();

        {
            let header = program.header();
            let base = if header.version() >= 5 { 0 } else { 1 };

            for (index, file) in header.file_names().iter().enumerate() {
                let path = self.file_path(header, file)?;
                files.insert(index as u64 + base, path);
            }
        }

        let mut entries = Vec::new();
        let mut rows = program.rows();

        while let Some((_, row)) = rows.next_row()? {
            if row.end_sequence() {
                continue;
            }

            let column = match row.column() {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(c) => c.get(),
            };

            entries.push(LineEntry {
                address: row.address(),
                file: row.file_index(),
                line: self.adjust_line(row.line().map(NonZeroU64::get).unwrap_or(0)),
                column,
                is_stmt: row.is_stmt(),
            });
        }

        module.files = files;
        module.entries = entries;

        Ok(())
    }

    fn file_path(
        &self,
        header: &gimli::LineProgramHeader<R>,
        file: &gimli::FileEntry<R>,
    ) -> crate::Result<String> {
        let mut path = PathBuf::new();

        if let Some(comp_dir) = &self.unit.comp_dir {
            path.push(comp_dir.to_string_lossy()?.as_ref());
        }

        if let Some(dir) = file.directory(header) {
            let dir = self.dwarf.attr_string(self.unit, dir)?;
            path.push(dir.to_string_lossy()?.as_ref());
        }

        let name = self.dwarf.attr_string(self.unit, file.path_name())?;
        path.push(name.to_string_lossy()?.as_ref());

        Ok(path.to_string_lossy().into_owned())
    }

    fn parse_function(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<'_, '_, R>,
    ) -> crate::Result<Option<FunctionId>> {
        let Some(name) = self.attr_string(entry, gimli::DW_AT_name)? else {
            return Ok(None);
        };

        let low = match entry.attr_value(gimli::DW_AT_low_pc)? {
            Some(value) => self.dwarf.attr_address(self.unit, value)?,
            None => None,
        };

        // declarations carry no code
        let Some(low) = low else {
            return Ok(None);
        };

        let high = match entry.attr(gimli::DW_AT_high_pc)? {
            Some(attr) => self.high_pc(low, &attr)?.unwrap_or(low),
            None => low,
        };

        let file = match entry.attr(gimli::DW_AT_decl_file)? {
            Some(attr) => match attr.value() {
                AttributeValue::FileIndex(index) => index,
                _ => attr.udata_value().unwrap_or(0),
            },
            None => 0,
        };

        let line = entry
            .attr(gimli::DW_AT_decl_line)?
            .and_then(|attr| attr.udata_value())
            .map(|line| self.adjust_line(line))
            .unwrap_or(0);

        let id = FunctionId(self.model.functions.len());

        self.model.functions.push(Function {
            id,
            module: self.module,
            name,
            file,
            line,
            range: low..high,
            parameters: Vec::new(),
        });

        self.model.modules[self.module.0].functions.push(id);

        Ok(Some(id))
    }

    fn parse_parameter(
        &self,
        entry: &gimli::DebuggingInformationEntry<'_, '_, R>,
    ) -> crate::Result<Option<Parameter>> {
        let Some(name) = self.attr_string(entry, gimli::DW_AT_name)? else {
            return Ok(None);
        };

        Ok(Some(Parameter {
            name,
            base_type: self.base_type(entry)?,
            location: self.location(entry)?,
        }))
    }

    fn parse_variable(
        &self,
        entry: &gimli::DebuggingInformationEntry<'_, '_, R>,
        function: Option<FunctionId>,
    ) -> crate::Result<Option<Variable>> {
        let Some(name) = self.attr_string(entry, gimli::DW_AT_name)? else {
            return Ok(None);
        };

        Ok(Some(Variable {
            name,
            base_type: self.base_type(entry)?,
            function,
            location: self.location(entry)?,
        }))
    }

    fn location(
        &self,
        entry: &gimli::DebuggingInformationEntry<'_, '_, R>,
    ) -> crate::Result<Option<LocationExpr>> {
        match entry.attr_value(gimli::DW_AT_location)? {
            Some(AttributeValue::Exprloc(expr)) => {
                let bytes = expr.0.to_slice()?;
                Ok(Some(LocationExpr::new(bytes.into_owned())))
            }
            // location lists are only emitted for optimized code
            _ => Ok(None),
        }
    }

    fn base_type(&self, entry: &gimli::DebuggingInformationEntry<'_, '_, R>) -> crate::Result<BaseType> {
        let mut offset = match entry.attr_value(gimli::DW_AT_type)? {
            Some(AttributeValue::UnitRef(offset)) => offset,
            _ => return Ok(BaseType::unknown()),
        };

        for _ in 0..MAX_TYPE_CHAIN {
            let ty = self.unit.entry(offset)?;

            match ty.tag() {
                gimli::DW_TAG_base_type => return self.describe_base_type(&ty),
                gimli::DW_TAG_pointer_type => {
                    return Ok(BaseType {
                        name: "pointer".to_owned(),
                        byte_size: self.byte_size(&ty)?.unwrap_or(8),
                        encoding: Encoding::Unsigned,
                    });
                }
                gimli::DW_TAG_typedef
                | gimli::DW_TAG_const_type
                | gimli::DW_TAG_volatile_type
                | gimli::DW_TAG_restrict_type => match next_type_ref(&ty)? {
                    Some(next) => offset = next,
                    None => break,
                },
                _ => {
                    return Ok(BaseType {
                        name: self
                            .attr_string(&ty, gimli::DW_AT_name)?
                            .unwrap_or_else(|| "aggregate".to_owned()),
                        byte_size: self.byte_size(&ty)?.unwrap_or(0),
                        encoding: Encoding::Unknown,
                    });
                }
            }
        }

        Ok(BaseType::unknown())
    }

    fn describe_base_type(
        &self,
        ty: &gimli::DebuggingInformationEntry<'_, '_, R>,
    ) -> crate::Result<BaseType> {
        let encoding = match ty.attr_value(gimli::DW_AT_encoding)? {
            Some(AttributeValue::Encoding(ate)) => match ate {
                gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => Encoding::Signed,
                gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char => Encoding::Unsigned,
                gimli::DW_ATE_float => Encoding::Float,
                gimli::DW_ATE_boolean => Encoding::Boolean,
                _ => Encoding::Unknown,
            },
            _ => Encoding::Unknown,
        };

        Ok(BaseType {
            name: self
                .attr_string(ty, gimli::DW_AT_name)?
                .unwrap_or_default(),
            byte_size: self.byte_size(ty)?.unwrap_or(0),
            encoding,
        })
    }

    fn byte_size(&self, ty: &gimli::DebuggingInformationEntry<'_, '_, R>) -> crate::Result<Option<u64>> {
        Ok(ty
            .attr(gimli::DW_AT_byte_size)?
            .and_then(|attr| attr.udata_value()))
    }

    fn high_pc(&self, low: u64, attr: &gimli::Attribute<R>) -> crate::Result<Option<u64>> {
        match attr.value() {
            value @ (AttributeValue::Addr(_) | AttributeValue::DebugAddrIndex(_)) => {
                Ok(self.dwarf.attr_address(self.unit, value)?)
            }
            _ => Ok(attr.udata_value().map(|offset| low + offset)),
        }
    }

    fn attr_string(
        &self,
        entry: &gimli::DebuggingInformationEntry<'_, '_, R>,
        name: gimli::DwAt,
    ) -> crate::Result<Option<String>> {
        let Some(value) = entry.attr_value(name)? else {
            return Ok(None);
        };

        let s = self.dwarf.attr_string(self.unit, value)?;
        let s: Cow<'_, str> = s.to_string_lossy()?;

        Ok(Some(s.into_owned()))
    }

    fn adjust_line(&self, line: u64) -> u64 {
        line.saturating_sub(self.options.line_offset)
    }
}

fn next_type_ref<R: Reader>(
    ty: &gimli::DebuggingInformationEntry<'_, '_, R>,
) -> crate::Result<Option<UnitOffset<R::Offset>>> {
    match ty.attr_value(gimli::DW_AT_type)? {
        Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        _ => Ok(None),
    }
}
