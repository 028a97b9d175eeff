//! Execution tree builder.
//!
//! Turns the nested trace records into an arena of frames: transaction
//! groups own transactions, transactions own their program executions, and
//! a program event that spawned inner transactions points at the child
//! group entered when stepping into it. Parent links are arena indices, the
//! tree is built once at load and never mutated afterwards.

use serde_json::Value;

use super::trace::{ExecTrace, LoadedTrace, OpcodeEvent, ProgramHash, ProgramKind};
use super::txn_doc::GroupDoc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    TransactionGroup,
    Transaction,
    LogicSig,
    AppCall,
}

/// Rest positions of a transaction frame: the transaction object itself,
/// then one unit per program execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnUnit {
    Intro,
    Program(FrameId),
}

#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub parent: Option<FrameId>,
    /// Top-level group index, which is also the pseudo document index.
    pub group_index: usize,
    /// Path of the owning transaction: top-level index, then inner-txn
    /// indices. Empty for top-level group frames.
    pub txn_path: Vec<usize>,
    pub program: Option<ProgramHash>,
    pub program_kind: Option<ProgramKind>,
    /// Application under execution, for state attribution.
    pub app_id: Option<u64>,
    /// Transaction children of a group frame.
    pub children: Vec<FrameId>,
    /// Units of a transaction frame.
    pub units: Vec<TxnUnit>,
    /// Opcode events of a program frame.
    pub events: Vec<OpcodeEvent>,
    /// For program frames: event index -> group frame spawned at that event.
    pub inner_groups: Vec<(usize, FrameId)>,
}

impl Frame {
    fn new(kind: FrameKind, parent: Option<FrameId>, group_index: usize, txn_path: Vec<usize>) -> Frame {
        Frame {
            kind,
            parent,
            group_index,
            txn_path,
            program: None,
            program_kind: None,
            app_id: None,
            children: Vec::new(),
            units: Vec::new(),
            events: Vec::new(),
            inner_groups: Vec::new(),
        }
    }

    pub fn is_program(&self) -> bool {
        matches!(self.kind, FrameKind::LogicSig | FrameKind::AppCall)
    }

    /// Number of rest positions this frame contributes.
    pub fn unit_count(&self) -> usize {
        match self.kind {
            FrameKind::TransactionGroup => self.children.len(),
            FrameKind::Transaction => self.units.len(),
            FrameKind::LogicSig | FrameKind::AppCall => self.events.len(),
        }
    }

    pub fn inner_group_at(&self, event_index: usize) -> Option<FrameId> {
        self.inner_groups
            .iter()
            .find(|(idx, _)| *idx == event_index)
            .map(|(_, id)| *id)
    }
}

pub struct ExecutionTree {
    frames: Vec<Frame>,
    pub roots: Vec<FrameId>,
    pub docs: Vec<GroupDoc>,
}

impl ExecutionTree {
    pub fn build(trace: &LoadedTrace) -> ExecutionTree {
        let mut builder = Builder { frames: Vec::new() };
        let mut roots = Vec::with_capacity(trace.groups.len());
        let mut docs = Vec::with_capacity(trace.groups.len());

        for (group_index, group) in trace.groups.iter().enumerate() {
            let results: Vec<&Value> = group.txns.iter().map(|t| &t.result).collect();
            docs.push(GroupDoc::render(group_index, &results));

            let root = builder.alloc(Frame::new(
                FrameKind::TransactionGroup,
                None,
                group_index,
                Vec::new(),
            ));
            for (txn_index, txn) in group.txns.iter().enumerate() {
                let child = builder.txn_frame(
                    root,
                    group_index,
                    vec![txn_index],
                    &txn.result,
                    txn.trace.as_ref(),
                );
                builder.frames[root.0].children.push(child);
            }
            roots.push(root);
        }

        ExecutionTree {
            frames: builder.frames,
            roots,
            docs,
        }
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id.0]
    }

    pub fn doc(&self, group_index: usize) -> &GroupDoc {
        &self.docs[group_index]
    }
}

struct Builder {
    frames: Vec<Frame>,
}

impl Builder {
    fn alloc(&mut self, frame: Frame) -> FrameId {
        self.frames.push(frame);
        FrameId(self.frames.len() - 1)
    }

    fn txn_frame(
        &mut self,
        parent: FrameId,
        group_index: usize,
        txn_path: Vec<usize>,
        top_result: &Value,
        trace: Option<&ExecTrace>,
    ) -> FrameId {
        let txn = self.alloc(Frame::new(
            FrameKind::Transaction,
            Some(parent),
            group_index,
            txn_path.clone(),
        ));
        self.frames[txn.0].units.push(TxnUnit::Intro);

        let Some(trace) = trace else {
            return txn;
        };

        let app_id = resolve_app_id(top_result, &txn_path[1..]);
        let programs: Vec<_> = trace.programs().cloned().collect();
        for program in programs {
            let kind = match program.kind {
                ProgramKind::LogicSig => FrameKind::LogicSig,
                ProgramKind::Approval | ProgramKind::ClearState => FrameKind::AppCall,
            };

            let frame_id = self.alloc(Frame::new(kind, Some(txn), group_index, txn_path.clone()));
            {
                let frame = &mut self.frames[frame_id.0];
                frame.program = Some(program.hash);
                frame.program_kind = Some(program.kind);
                frame.events = program.events.clone();
                if kind == FrameKind::AppCall {
                    frame.app_id = app_id;
                }
            }

            for (event_index, event) in program.events.iter().enumerate() {
                if event.spawned_inners.is_empty() {
                    continue;
                }

                let inner_group = self.alloc(Frame::new(
                    FrameKind::TransactionGroup,
                    Some(frame_id),
                    group_index,
                    txn_path.clone(),
                ));
                for &inner_index in &event.spawned_inners {
                    let Some(inner_trace) = trace.inner.get(inner_index) else {
                        log::warn!(
                            "event at pc {} spawns inner #{inner_index} but only {} inner traces exist",
                            event.pc,
                            trace.inner.len()
                        );
                        continue;
                    };

                    let mut inner_path = txn_path.clone();
                    inner_path.push(inner_index);
                    let child = self.txn_frame(
                        inner_group,
                        group_index,
                        inner_path,
                        top_result,
                        Some(inner_trace),
                    );
                    self.frames[inner_group.0].children.push(child);
                }

                self.frames[frame_id.0].inner_groups.push((event_index, inner_group));
            }

            self.frames[txn.0].units.push(TxnUnit::Program(frame_id));
        }

        txn
    }
}

/// App id of the transaction at `rel_path` (inner-txn indices below the
/// top-level transaction whose result JSON is `top_result`). Prefers the
/// `apid` field of the transaction, falls back to `application-index` for
/// app creations.
fn resolve_app_id(top_result: &Value, rel_path: &[usize]) -> Option<u64> {
    let prefix: String = rel_path
        .iter()
        .map(|j| format!("/inner-txns/{j}"))
        .collect();

    top_result
        .pointer(&format!("{prefix}/txn/txn/apid"))
        .and_then(Value::as_u64)
        .or_else(|| {
            top_result
                .pointer(&format!("{prefix}/application-index"))
                .and_then(Value::as_u64)
        })
}
