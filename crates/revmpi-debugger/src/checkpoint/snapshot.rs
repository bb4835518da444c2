use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use super::store::{CaptureContext, CheckpointStore, MemoryImage, MemoryRegion, STACK_IDENT, regions_by_ident};
use crate::process::ProcessContext;
use crate::sys;

/// Copies the stack and the executable's mappings into a spool file.
///
/// A spool file holds the raw bytes of each region, concatenated in the
/// order of the region list kept in memory. It has no header.
pub struct SnapshotStore {
    dir: PathBuf,
    prefix: String,
}

#[derive(Debug)]
struct SnapshotImage {
    regions: Vec<MemoryRegion>,
    blob: TempPath,
}

impl SnapshotStore {
    /// Creates a store spooling into `dir`.
    pub fn new(dir: impl Into<PathBuf>, target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_owned());

        Self {
            dir: dir.into(),
            prefix: format!("{name}-cp-"),
        }
    }
}

impl CheckpointStore for SnapshotStore {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn capture(&mut self, cx: &CaptureContext<'_>) -> crate::Result<Box<dyn MemoryImage>> {
        let target = cx.process.target().to_string_lossy();
        let regions = regions_by_ident(cx.process, &[STACK_IDENT, &*target])?;

        let file = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempfile_in(&self.dir)
            .map_err(|e| sys::Error::File(self.dir.clone(), e))?;

        let (file, blob) = file.into_parts();
        let mut writer = BufWriter::new(file);

        for region in &regions {
            let data = sys::mem::read_mem_file(cx.process.pid(), region.range.start, region.len())?;

            writer
                .write_all(&data)
                .map_err(|e| sys::Error::File(blob.to_path_buf(), e))?;

            tracing::trace!(region = %region, "region spooled");
        }

        writer
            .flush()
            .map_err(|e| sys::Error::File(blob.to_path_buf(), e))?;

        tracing::debug!(path = %blob.display(), regions = regions.len(), "snapshot written");

        Ok(Box::new(SnapshotImage { regions, blob }))
    }
}

impl MemoryImage for SnapshotImage {
    fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn restore(&self, process: &ProcessContext) -> crate::Result<()> {
        let file = File::open(&self.blob).map_err(|e| sys::Error::File(self.blob.to_path_buf(), e))?;
        let mut reader = BufReader::new(file);

        for region in &self.regions {
            let mut data = vec![0u8; region.len()];

            reader
                .read_exact(&mut data)
                .map_err(|e| sys::Error::File(self.blob.to_path_buf(), e))?;

            sys::mem::write_mem_file(process.pid(), region.range.start, &data)?;

            tracing::trace!(region = %region, "region restored");
        }

        Ok(())
    }
}
