//! Source breakpoint registry.
//!
//! Breakpoints live per file and are replaced wholesale by every
//! `setBreakpoints` request, as the protocol prescribes. A breakpoint is
//! verified against the source-map index when it is set; unverified
//! breakpoints are kept (the client shows them greyed out) but never match
//! a stop.

use std::collections::HashMap;

use super::sourcemap::{FileId, Loc, SourceIndex};

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: i64,
    /// Requested position, 0-based.
    pub line: u32,
    pub column: Option<u32>,
    /// Column the request snapped to. `None` on a verified breakpoint means
    /// the whole line matches.
    pub resolved_column: Option<u32>,
    pub verified: bool,
}

#[derive(Default)]
pub struct BreakpointStore {
    next_id: i64,
    by_file: HashMap<FileId, Vec<Breakpoint>>,
}

impl BreakpointStore {
    /// Replaces the breakpoint set of `file`, verifying each request
    /// against the source map. Returns the new set in request order.
    pub fn set(
        &mut self,
        index: &SourceIndex,
        file: FileId,
        requests: &[(u32, Option<u32>)],
    ) -> &[Breakpoint] {
        let breakpoints = requests
            .iter()
            .map(|&(line, column)| {
                self.next_id += 1;

                let (verified, resolved_column) = match column {
                    Some(column) => match index.snap_column(file, line, column) {
                        Some(snapped) => (true, Some(snapped)),
                        None => (false, None),
                    },
                    None => (index.line_is_mapped(file, line), None),
                };

                Breakpoint {
                    id: self.next_id,
                    line,
                    column,
                    resolved_column,
                    verified,
                }
            })
            .collect();

        self.by_file.insert(file, breakpoints);
        &self.by_file[&file]
    }

    /// Id of the first verified breakpoint matching a stop location.
    pub fn matches(&self, file: FileId, loc: Loc) -> Option<i64> {
        self.by_file.get(&file)?.iter().find_map(|bp| {
            let column_matches = match bp.resolved_column {
                Some(column) => column == loc.column,
                None => true,
            };
            (bp.verified && bp.line == loc.line && column_matches).then_some(bp.id)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::trace::{ProgramHash, RawSourceMap, SourceEntry};
    use std::io::Write;
    use std::path::PathBuf;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn write_source(name: &str, content: &str) -> TempDirGuard {
        static NONCE: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let nonce = NONCE.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "avmdbg-bp-test-{}-{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).unwrap();
        let mut f = std::fs::File::create(path.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        TempDirGuard { path }
    }

    fn index_with_one_file() -> (SourceIndex, FileId, TempDirGuard) {
        // pc 0 -> line 0, pc 1 -> line 1, pc 2 -> (line 2, col 0),
        // pc 3 -> (line 2, col 4).
        let guard = write_source("bp.teal", "#pragma version 8\nint 1\nreturn\n");
        let entry = SourceEntry {
            hash: ProgramHash([1; 32]),
            filename: guard.path.join("bp.teal"),
            source_map: RawSourceMap {
                version: 3,
                sources: vec!["bp.teal".to_string()],
                mappings: "AAAA;AACA;AACA;AAAI".to_string(),
            },
            base_dir: guard.path.clone(),
        };
        let index = SourceIndex::build(&[entry]).unwrap();
        let file = index.file_by_path(&guard.path.join("bp.teal")).unwrap();
        (index, file, guard)
    }

    #[test]
    fn test_line_breakpoint_verification_and_matching() {
        let (index, file, _guard) = index_with_one_file();
        let mut store = BreakpointStore::default();

        let set = store
            .set(&index, file, &[(1, None), (0, Some(3)), (7, None)])
            .to_vec();
        assert!(set[0].verified);
        assert!(!set[1].verified, "line 0 has no column >= 3");
        assert!(!set[2].verified, "line 7 is not mapped");

        let loc = Loc { file, line: 1, column: 0 };
        assert_eq!(store.matches(file, loc), Some(set[0].id));
        let unmapped = Loc { file, line: 7, column: 0 };
        assert_eq!(store.matches(file, unmapped), None);
    }

    #[test]
    fn test_column_breakpoint_snaps_forward() {
        let (index, file, _guard) = index_with_one_file();
        let mut store = BreakpointStore::default();

        // Line 2 maps columns 0 and 4; a request at column 2 snaps to 4.
        let set = store.set(&index, file, &[(2, Some(2))]).to_vec();
        assert!(set[0].verified);
        assert_eq!(set[0].resolved_column, Some(4));

        assert_eq!(
            store.matches(file, Loc { file, line: 2, column: 4 }),
            Some(set[0].id)
        );
        assert_eq!(store.matches(file, Loc { file, line: 2, column: 0 }), None);

        // The exact position resolves back to the pc that carries it.
        let pcs = index.location_to_pcs(file, 2, 4);
        assert_eq!(pcs.len(), 1);
        assert_eq!(pcs[0].1, 3);
    }

    #[test]
    fn test_set_replaces_previous_breakpoints() {
        let (index, file, _guard) = index_with_one_file();
        let mut store = BreakpointStore::default();

        let first = store.set(&index, file, &[(1, None)]).to_vec();
        store.set(&index, file, &[(2, None)]);

        assert_eq!(store.matches(file, Loc { file, line: 1, column: 0 }), None);
        assert!(store
            .matches(file, Loc { file, line: 2, column: 0 })
            .is_some_and(|id| id != first[0].id));
    }
}
