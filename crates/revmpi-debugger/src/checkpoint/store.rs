use std::fmt;
use std::ops::Range;

use revmpi_symbol::DebugModel;

use crate::process::ProcessContext;
use crate::sys::MemoryMap;

/// Pseudo-path of the main stack mapping.
pub const STACK_IDENT: &str = "[stack]";

/// Pseudo-path of the heap mapping.
pub const HEAP_IDENT: &str = "[heap]";

/// Descriptor of a captured memory range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Runtime address range.
    pub range: Range<u64>,

    /// Path (or pseudo-path) of the mapping.
    pub ident: String,
}

/// What a store may look at while capturing.
pub struct CaptureContext<'a> {
    /// The stopped process.
    pub process: &'a ProcessContext,

    /// Debug information of the process.
    pub model: &'a DebugModel,
}

/// A way of keeping memory of a traced process for later restore.
pub trait CheckpointStore: Send {
    /// Name of the strategy, for display.
    fn name(&self) -> &'static str;

    /// Runs the process stopped at the start of the operation `op_name` up
    /// to the point where it can be captured.
    ///
    /// The process stays stopped inside the message function.
    fn prepare(&mut self, _process: &mut ProcessContext, _model: &DebugModel, _op_name: &str) -> crate::Result<()> {
        Ok(())
    }

    /// Captures the memory of interest of a stopped process.
    fn capture(&mut self, cx: &CaptureContext<'_>) -> crate::Result<Box<dyn MemoryImage>>;
}

/// Memory kept by a [CheckpointStore] for one checkpoint.
pub trait MemoryImage: Send + fmt::Debug {
    /// Regions whose content this image holds or refers to.
    fn regions(&self) -> &[MemoryRegion];

    /// Writes the captured memory back into the process.
    fn restore(&self, process: &ProcessContext) -> crate::Result<()>;
}

impl MemoryRegion {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        (self.range.end - self.range.start) as usize
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x} {}", self.range.start, self.range.end, self.ident)
    }
}

/// Returns the mappings of the process whose path is one of `idents`, in
/// memory-map order.
pub fn regions_by_ident(process: &ProcessContext, idents: &[&str]) -> crate::Result<Vec<MemoryRegion>> {
    Ok(select_regions(process.memory_maps()?, idents, false))
}

/// Keeps the mappings whose path is one of `idents` (and which are writable,
/// if `writable_only` is set).
pub(crate) fn select_regions(maps: Vec<MemoryMap>, idents: &[&str], writable_only: bool) -> Vec<MemoryRegion> {
    let regions = maps
        .into_iter()
        .filter(|map| !writable_only || map.perms.contains('w'))
        .filter_map(|map| {
            let ident = map.ident?;
            idents.contains(&ident.as_str()).then_some(MemoryRegion {
                range: map.range,
                ident,
            })
        })
        .collect::<Vec<_>>();

    tracing::trace!(?idents, writable_only, count = regions.len(), "memory regions");

    regions
}
