//! Replay core: everything between the raw trace documents and the DAP
//! surface. The [`Debugger`] owns the immutable execution tree, the source
//! index and the per-frame state checkpoints, plus the only two mutable
//! pieces of a session: the cursor and the breakpoint set.

pub mod breakpoint;
pub mod error;
pub mod sourcemap;
pub mod state;
pub mod step;
pub mod trace;
pub mod tree;
pub mod txn_doc;

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use breakpoint::{Breakpoint, BreakpointStore};
pub use error::{Error, Result};
use sourcemap::{FileId, SourceIndex};
use state::{Checkpoints, ReconstructedState, Reconstructor};
pub use step::{Cursor, StopReason};
use trace::ProgramKind;
use tree::{ExecutionTree, FrameId, FrameKind, TxnUnit};

pub struct Debugger {
    tree: ExecutionTree,
    index: SourceIndex,
    checkpoints: Checkpoints,
    breakpoints: BreakpointStore,
    cursor: Option<Cursor>,
    terminated: bool,
}

/// Where a stack frame points the client at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSource {
    /// A real TEAL file on disk.
    Teal { path: PathBuf },
    /// A rendered `transaction-group-N.json` pseudo document.
    Document { group_index: usize, name: String },
}

#[derive(Debug, Clone)]
pub struct StackFrameInfo {
    pub name: String,
    pub source: FrameSource,
    /// 0-based; the DAP surface converts to the client convention.
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub struct StepTarget {
    pub id: i64,
    pub label: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Debugger {
    /// Loads the simulate response and the sources descriptor and builds
    /// every derived structure. Fails if any traced program has no source
    /// entry.
    pub fn launch(trace_path: &Path, sources_path: &Path) -> Result<Debugger> {
        let loaded = trace::load_simulate_response(trace_path)?;
        let entries = trace::load_sources_descriptor(sources_path)?;
        let index = SourceIndex::build(&entries)?;

        for hash in loaded.program_hashes() {
            if !index.contains_program(hash) {
                return Err(Error::MissingSource(hash.to_string()));
            }
        }

        let tree = ExecutionTree::build(&loaded);
        let checkpoints = Checkpoints::compute(&tree);
        let cursor = step::initial_cursor(&tree);
        let terminated = cursor.is_none();

        Ok(Debugger {
            tree,
            index,
            checkpoints,
            breakpoints: BreakpointStore::default(),
            cursor,
            terminated,
        })
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Rendered pseudo document of a transaction group, for the `source`
    /// request.
    pub fn document_text(&self, group_index: usize) -> Option<&str> {
        self.tree.docs.get(group_index).map(|doc| doc.text.as_str())
    }

    /// Stack of the current cursor path, deepest frame first.
    pub fn stack_frames(&self) -> Vec<StackFrameInfo> {
        let Some(cursor) = &self.cursor else {
            return Vec::new();
        };
        cursor
            .path
            .iter()
            .rev()
            .map(|&(frame_id, index)| self.frame_info(frame_id, index))
            .collect()
    }

    fn frame_info(&self, frame_id: FrameId, index: usize) -> StackFrameInfo {
        let frame = self.tree.frame(frame_id);
        let doc = self.tree.doc(frame.group_index);
        let document = FrameSource::Document {
            group_index: frame.group_index,
            name: doc.name.clone(),
        };

        match frame.kind {
            FrameKind::TransactionGroup => {
                let line = frame
                    .children
                    .get(index)
                    .map(|&child| doc.txn_line(&self.tree.frame(child).txn_path))
                    .unwrap_or(0);
                let name = if frame.parent.is_none() {
                    format!("transaction group {}", frame.group_index)
                } else {
                    "inner transaction group".to_string()
                };
                StackFrameInfo {
                    name,
                    source: document,
                    line,
                    column: 0,
                }
            }
            FrameKind::Transaction => {
                let line = match frame.units.get(index) {
                    Some(TxnUnit::Program(program)) => {
                        let kind = self
                            .tree
                            .frame(*program)
                            .program_kind
                            .unwrap_or(ProgramKind::Approval);
                        doc.program_line(&frame.txn_path, kind)
                    }
                    _ => doc.txn_line(&frame.txn_path),
                };
                StackFrameInfo {
                    name: format!("transaction {}", frame.txn_path.iter().join(".")),
                    source: document,
                    line,
                    column: 0,
                }
            }
            FrameKind::LogicSig | FrameKind::AppCall => {
                let program = frame.program.expect("program frames carry a hash");
                let name = self
                    .index
                    .program_name(program)
                    .unwrap_or(frame.program_kind.map(ProgramKind::label).unwrap_or("program"))
                    .to_string();

                match frame
                    .events
                    .get(index)
                    .and_then(|event| self.index.pc_to_loc(program, event.pc))
                {
                    Some(loc) => StackFrameInfo {
                        name,
                        source: FrameSource::Teal {
                            path: self.index.file(loc.file).path.clone(),
                        },
                        line: loc.line,
                        column: loc.column,
                    },
                    // Unmapped pc: fall back to the owning transaction.
                    None => StackFrameInfo {
                        name,
                        source: document,
                        line: doc.txn_line(&frame.txn_path),
                        column: 0,
                    },
                }
            }
        }
    }

    /// Reconstructed state for a stack frame, 0 being the deepest.
    pub fn reconstructed_state(&self, frame_index: usize) -> Option<ReconstructedState> {
        let cursor = self.cursor.as_ref()?;
        let position = cursor.path.len().checked_sub(1 + frame_index)?;
        let (frame_id, unit_index) = cursor.path[position];
        Some(Reconstructor::new(&self.tree, &self.checkpoints).state_at(frame_id, unit_index))
    }

    pub fn file_for_client_path(&self, path: &Path) -> Option<FileId> {
        self.index.file_by_path(path)
    }

    pub fn set_breakpoints(&mut self, file: FileId, requests: &[(u32, Option<u32>)]) -> Vec<Breakpoint> {
        self.breakpoints.set(&self.index, file, requests).to_vec()
    }

    pub fn breakpoint_locations(&self, file: FileId, lines: RangeInclusive<u32>) -> Vec<(u32, u32)> {
        self.index.breakpoint_locations(file, lines)
    }

    /// Opcode names reachable by a step-in from the current position: the
    /// next event of the current frame plus the first opcode of every
    /// program a spawned inner group would run.
    pub fn step_in_targets(&self) -> Vec<StepTarget> {
        let Some(cursor) = &self.cursor else {
            return Vec::new();
        };
        let (frame_id, index) = cursor.leaf();
        let frame = self.tree.frame(frame_id);

        let mut targets = Vec::new();
        match frame.kind {
            FrameKind::Transaction => {
                if let Some(TxnUnit::Program(program)) = frame.units.get(index) {
                    self.push_first_opcode_target(*program, &mut targets);
                }
            }
            FrameKind::LogicSig | FrameKind::AppCall => {
                if let Some(inner) = frame.inner_group_at(index) {
                    for &txn in &self.tree.frame(inner).children {
                        for unit in &self.tree.frame(txn).units {
                            if let TxnUnit::Program(program) = unit {
                                self.push_first_opcode_target(*program, &mut targets);
                            }
                        }
                    }
                }
                if let Some(event) = frame.events.get(index + 1) {
                    if let Some(program) = frame.program {
                        targets.push(self.opcode_target(program, event.pc));
                    }
                }
            }
            FrameKind::TransactionGroup => {}
        }

        for (position, target) in targets.iter_mut().enumerate() {
            target.id = position as i64 + 1;
        }
        targets
    }

    fn push_first_opcode_target(&self, program_frame: FrameId, targets: &mut Vec<StepTarget>) {
        let frame = self.tree.frame(program_frame);
        if let (Some(program), Some(event)) = (frame.program, frame.events.first()) {
            targets.push(self.opcode_target(program, event.pc));
        }
    }

    fn opcode_target(&self, program: trace::ProgramHash, pc: u64) -> StepTarget {
        match self.index.pc_to_loc(program, pc) {
            Some(loc) => {
                let label = self
                    .index
                    .file(loc.file)
                    .line_text(loc.line)
                    .and_then(|text| text.split_whitespace().next())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("pc {pc}"));
                StepTarget {
                    id: 0,
                    label,
                    line: Some(loc.line),
                    column: Some(loc.column),
                }
            }
            None => StepTarget {
                id: 0,
                label: format!("pc {pc}"),
                line: None,
                column: None,
            },
        }
    }
}
