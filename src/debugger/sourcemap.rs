//! PC-keyed source map index.
//!
//! TEAL compilers emit Source Map v3 documents in which each `;`-separated
//! mappings group corresponds to one program counter. This module decodes
//! the VLQ deltas into absolute `(pc, file, line, column)` tuples and builds
//! the two lookup directions the debugger needs: pc -> location for stack
//! traces, and (file, line) -> columns/pcs for breakpoints.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{Error, Result};
use super::trace::{ProgramHash, SourceEntry};

/// Index of an interned source file, global across all programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub usize);

/// A resolved source position. Lines and columns are 0-based here; the DAP
/// surface converts to the client's 1-based convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub file: FileId,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
    pub text: String,
}

impl SourceFile {
    pub fn line_text(&self, line: u32) -> Option<&str> {
        self.text.lines().nth(line as usize)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    pub column: u32,
    pub pc: u64,
    pub program: ProgramHash,
}

struct ProgramMap {
    name: String,
    pc_to_loc: Vec<Option<Loc>>,
}

pub struct SourceIndex {
    files: Vec<SourceFile>,
    programs: HashMap<ProgramHash, ProgramMap>,
    by_line: HashMap<(FileId, u32), Vec<LineEntry>>,
}

impl SourceIndex {
    pub fn build(entries: &[SourceEntry]) -> Result<Self> {
        let mut index = SourceIndex {
            files: Vec::new(),
            programs: HashMap::new(),
            by_line: HashMap::new(),
        };

        for entry in entries {
            if index.programs.contains_key(&entry.hash) {
                log::warn!("duplicate source entry for program {}, keeping the first", entry.hash);
                continue;
            }

            let name = entry
                .filename
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.filename.display().to_string());

            let local_files = entry
                .source_map
                .sources
                .iter()
                .map(|source| index.intern_file(&entry.base_dir.join(source)))
                .collect::<Result<Vec<_>>>()?;

            let tuples = decode_mappings(&entry.source_map.mappings)
                .map_err(|e| Error::BadSourceMap(name.clone(), e))?;

            let mut pc_to_loc: Vec<Option<Loc>> = Vec::new();
            for (pc, src, line, column) in tuples {
                let Some(&file) = local_files.get(src) else {
                    return Err(Error::BadSourceMap(
                        name.clone(),
                        format!("segment references source #{src} but only {} sources are declared", local_files.len()),
                    ));
                };

                if pc_to_loc.len() <= pc as usize {
                    pc_to_loc.resize(pc as usize + 1, None);
                }
                pc_to_loc[pc as usize] = Some(Loc { file, line, column });

                index
                    .by_line
                    .entry((file, line))
                    .or_default()
                    .push(LineEntry {
                        column,
                        pc,
                        program: entry.hash,
                    });
            }

            index.programs.insert(entry.hash, ProgramMap { name, pc_to_loc });
        }

        for entries in index.by_line.values_mut() {
            entries.sort_by_key(|e| (e.column, e.pc));
        }

        Ok(index)
    }

    fn intern_file(&mut self, path: &Path) -> Result<FileId> {
        if let Some(pos) = self.files.iter().position(|f| f.path == path) {
            return Ok(FileId(pos));
        }

        let text = fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.files.push(SourceFile {
            path: path.to_path_buf(),
            name,
            text,
        });
        Ok(FileId(self.files.len() - 1))
    }

    pub fn contains_program(&self, hash: ProgramHash) -> bool {
        self.programs.contains_key(&hash)
    }

    pub fn program_name(&self, hash: ProgramHash) -> Option<&str> {
        self.programs.get(&hash).map(|p| p.name.as_str())
    }

    pub fn pc_to_loc(&self, program: ProgramHash, pc: u64) -> Option<Loc> {
        self.programs
            .get(&program)?
            .pc_to_loc
            .get(pc as usize)
            .copied()
            .flatten()
    }

    pub fn file(&self, id: FileId) -> &SourceFile {
        &self.files[id.0]
    }

    /// Looks a client path up among the interned files. Descriptor paths and
    /// client paths are both canonicalized so editors that report resolved
    /// symlinks still match.
    pub fn file_by_path(&self, path: &Path) -> Option<FileId> {
        let canon = fs::canonicalize(path).ok();
        self.files.iter().position(|f| {
            f.path == path || canon.as_deref().is_some_and(|c| fs::canonicalize(&f.path).ok().as_deref() == Some(c))
        })
        .map(FileId)
    }

    pub fn line_entries(&self, file: FileId, line: u32) -> &[LineEntry] {
        self.by_line
            .get(&(file, line))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All (line, column) pairs recorded for `file` within the line range,
    /// deduplicated and sorted. This is the `breakpointLocations` answer.
    pub fn breakpoint_locations(&self, file: FileId, lines: std::ops::RangeInclusive<u32>) -> Vec<(u32, u32)> {
        let mut locations: Vec<(u32, u32)> = lines
            .flat_map(|line| {
                self.line_entries(file, line)
                    .iter()
                    .map(move |e| (line, e.column))
            })
            .collect();
        locations.sort_unstable();
        locations.dedup();
        locations
    }

    /// Program counters mapped to an exact source position.
    pub fn location_to_pcs(&self, file: FileId, line: u32, column: u32) -> Vec<(ProgramHash, u64)> {
        self.line_entries(file, line)
            .iter()
            .filter(|e| e.column == column)
            .map(|e| (e.program, e.pc))
            .collect()
    }

    /// Snaps a requested breakpoint column to the first mapped column at or
    /// after it on the same line. `None` means the line has no mapping at or
    /// after that column and the breakpoint stays unverified.
    pub fn snap_column(&self, file: FileId, line: u32, column: u32) -> Option<u32> {
        self.line_entries(file, line)
            .iter()
            .map(|e| e.column)
            .find(|&c| c >= column)
    }

    pub fn line_is_mapped(&self, file: FileId, line: u32) -> bool {
        !self.line_entries(file, line).is_empty()
    }
}

// ---------------------------------- VLQ decoding ----------------------------------

/// Decodes a v3 `mappings` string into `(pc, source, line, column)` tuples.
/// The group index is the program counter; deltas accumulate across groups
/// and across segments within a group, the first segment of a group is the
/// position recorded for that pc.
fn decode_mappings(mappings: &str) -> std::result::Result<Vec<(u64, usize, u32, u32)>, String> {
    let mut out = Vec::new();
    let mut src: i64 = 0;
    let mut line: i64 = 0;
    let mut column: i64 = 0;

    for (pc, group) in mappings.split(';').enumerate() {
        if group.is_empty() {
            continue;
        }

        for (seg_index, segment) in group.split(',').enumerate() {
            let fields = decode_vlq_segment(segment)?;
            match fields.len() {
                1 => continue,
                4 | 5 => {
                    src += fields[1];
                    line += fields[2];
                    column += fields[3];
                }
                n => return Err(format!("segment has {n} fields")),
            }

            if src < 0 || line < 0 || column < 0 {
                return Err(format!(
                    "segment at pc {pc} yields negative position ({src}, {line}, {column})"
                ));
            }

            if seg_index == 0 {
                out.push((pc as u64, src as usize, line as u32, column as u32));
            }
        }
    }

    Ok(out)
}

fn decode_vlq_segment(segment: &str) -> std::result::Result<Vec<i64>, String> {
    let mut fields = Vec::new();
    let mut value: i64 = 0;
    let mut shift = 0u32;

    for ch in segment.bytes() {
        let digit = base64_digit(ch).ok_or_else(|| format!("invalid VLQ character {:?}", ch as char))?;
        value |= i64::from(digit & 0x1f) << shift;

        if digit & 0x20 != 0 {
            shift += 5;
            if shift > 60 {
                return Err("VLQ value overflows".to_string());
            }
        } else {
            let negative = value & 1 != 0;
            let magnitude = value >> 1;
            fields.push(if negative { -magnitude } else { magnitude });
            value = 0;
            shift = 0;
        }
    }

    if shift != 0 {
        return Err("truncated VLQ segment".to_string());
    }
    Ok(fields)
}

fn base64_digit(ch: u8) -> Option<u32> {
    match ch {
        b'A'..=b'Z' => Some(u32::from(ch - b'A')),
        b'a'..=b'z' => Some(u32::from(ch - b'a') + 26),
        b'0'..=b'9' => Some(u32::from(ch - b'0') + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}
