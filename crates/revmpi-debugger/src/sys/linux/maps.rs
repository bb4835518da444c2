use std::ops::Range;
use std::path::PathBuf;

use nix::unistd::Pid;

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    /// Runtime address range.
    pub range: Range<u64>,
    /// Permissions, as in `r-xp`.
    pub perms: String,
    /// Offset in the mapped file.
    pub offset: u64,
    /// Path of the mapped file, or a pseudo-path such as `[stack]`.
    pub ident: Option<String>,
}

/// Returns the raw content of `/proc/<pid>/maps`.
pub fn read_maps_text(pid: Pid) -> crate::sys::Result<String> {
    let path = maps_file_path(pid);

    std::fs::read_to_string(&path).map_err(|e| crate::sys::Error::File(path, e))
}

/// Returns the memory mappings of the process with the given ID.
pub fn read_memory_maps(pid: Pid) -> crate::sys::Result<Vec<MemoryMap>> {
    let text = read_maps_text(pid)?;

    parse_maps(&text).map_err(|line| crate::sys::Error::MalformedMaps(maps_file_path(pid), line))
}

fn parse_maps(text: &str) -> Result<Vec<MemoryMap>, String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_maps_line(line).ok_or_else(|| line.to_owned()))
        .collect()
}

fn parse_maps_line(line: &str) -> Option<MemoryMap> {
    let mut fields = line.split_whitespace();

    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.to_owned();
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;

    // device, inode
    fields.next()?;
    fields.next()?;

    let ident = fields.collect::<Vec<_>>().join(" ");

    Some(MemoryMap {
        range: u64::from_str_radix(start, 16).ok()?..u64::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        ident: (!ident.is_empty()).then_some(ident),
    })
}

fn maps_file_path(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/maps"))
}

#[cfg(test)]
mod tests {
    use super::parse_maps;

    #[test]
    fn parse_maps_lines() {
        let maps = parse_maps(indoc::indoc! {"
            55d0c8a00000-55d0c8a01000 r--p 00000000 08:01 1311 /tmp/my target
            55d0c8a01000-55d0c8a02000 r-xp 00001000 08:01 1311 /tmp/my target
            7ffd3c1e0000-7ffd3c201000 rw-p 00000000 00:00 0                          [stack]
            7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
        "})
        .unwrap();

        assert_eq!(maps.len(), 4);
        assert_eq!(maps[0].range, 0x55d0c8a00000..0x55d0c8a01000);
        assert_eq!(maps[0].ident.as_deref(), Some("/tmp/my target"));
        assert_eq!(maps[1].perms, "r-xp");
        assert_eq!(maps[1].offset, 0x1000);
        assert_eq!(maps[2].ident.as_deref(), Some("[stack]"));
        assert_eq!(maps[3].ident, None);
    }

    #[test]
    fn malformed_line() {
        assert_eq!(
            parse_maps("nonsense r--p"),
            Err("nonsense r--p".to_owned())
        );
    }
}
