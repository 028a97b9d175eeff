//! State reconstruction.
//!
//! No per-event snapshots are stored. At load time one pass over the tree in
//! execution order records the on-chain state at every frame entry; a stop
//! then replays only the current frame's events up to the cursor on top of
//! its entry checkpoint. Stack and scratch are per-frame and always start
//! empty at frame entry, so they never need checkpointing at all.
//!
//! Execution order: an event's own effects apply first, then the inner
//! frames it spawned run, then the next event of the frame.

use std::collections::{BTreeMap, HashMap};

use super::trace::{AvmValue, Delta, OpcodeEvent};
use super::tree::{ExecutionTree, FrameId, FrameKind, TxnUnit};

/// Byte-keyed application state section. Keys compare by content; the
/// ordered map keeps rendering deterministic.
pub type ByteMap = BTreeMap<Vec<u8>, AvmValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    pub global: ByteMap,
    pub local: BTreeMap<String, ByteMap>,
    pub boxes: ByteMap,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainState {
    pub apps: BTreeMap<u64, AppState>,
}

impl ChainState {
    fn apply(&mut self, app_id: Option<u64>, delta: &Delta) {
        let Some(app_id) = app_id else {
            if !matches!(delta, Delta::ScratchWrite { .. }) {
                log::warn!("state delta for a frame with no application id, dropped");
            }
            return;
        };
        let app = self.apps.entry(app_id).or_default();

        match delta {
            Delta::ScratchWrite { .. } => {}
            Delta::GlobalWrite { key, value } => {
                app.global.insert(key.clone(), value.clone());
            }
            Delta::GlobalDelete { key } => {
                app.global.remove(key);
            }
            Delta::LocalWrite { account, key, value } => {
                app.local
                    .entry(account.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            Delta::LocalDelete { account, key } => {
                if let Some(entries) = app.local.get_mut(account) {
                    entries.remove(key);
                }
            }
            Delta::BoxWrite { key, value } => {
                app.boxes.insert(key.clone(), value.clone());
            }
            Delta::BoxDelete { key } => {
                app.boxes.remove(key);
            }
        }
    }
}

/// Everything inspectable at one cursor position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconstructedState {
    pub stack: Vec<AvmValue>,
    /// Sparse: slots holding `uint 0` are absent.
    pub scratch: BTreeMap<u8, AvmValue>,
    pub chain: ChainState,
}

fn apply_exec(event: &OpcodeEvent, stack: &mut Vec<AvmValue>, scratch: &mut BTreeMap<u8, AvmValue>) {
    let keep = stack.len().saturating_sub(event.stack_pop_count);
    stack.truncate(keep);
    stack.extend(event.stack_additions.iter().cloned());

    for delta in &event.deltas {
        if let Delta::ScratchWrite { slot, value } = delta {
            if value.is_zero() {
                scratch.remove(slot);
            } else {
                scratch.insert(*slot, value.clone());
            }
        }
    }
}

/// On-chain state at the entry of every frame.
pub struct Checkpoints {
    entry: HashMap<FrameId, ChainState>,
}

impl Checkpoints {
    pub fn compute(tree: &ExecutionTree) -> Checkpoints {
        let mut checkpoints = Checkpoints { entry: HashMap::new() };
        let mut chain = ChainState::default();
        for &root in &tree.roots {
            checkpoints.visit(tree, root, &mut chain);
        }
        checkpoints
    }

    fn visit(&mut self, tree: &ExecutionTree, id: FrameId, chain: &mut ChainState) {
        self.entry.insert(id, chain.clone());

        let frame = tree.frame(id);
        match frame.kind {
            FrameKind::TransactionGroup => {
                for &child in &frame.children {
                    self.visit(tree, child, chain);
                }
            }
            FrameKind::Transaction => {
                for unit in &frame.units {
                    if let TxnUnit::Program(program) = unit {
                        self.visit(tree, *program, chain);
                    }
                }
            }
            FrameKind::LogicSig | FrameKind::AppCall => {
                for (index, event) in frame.events.iter().enumerate() {
                    for delta in &event.deltas {
                        chain.apply(frame.app_id, delta);
                    }
                    if let Some(inner) = frame.inner_group_at(index) {
                        self.visit(tree, inner, chain);
                    }
                }
            }
        }
    }

    fn entry_state(&self, id: FrameId) -> ChainState {
        self.entry.get(&id).cloned().unwrap_or_default()
    }
}

pub struct Reconstructor<'a> {
    tree: &'a ExecutionTree,
    checkpoints: &'a Checkpoints,
}

impl<'a> Reconstructor<'a> {
    pub fn new(tree: &'a ExecutionTree, checkpoints: &'a Checkpoints) -> Self {
        Reconstructor { tree, checkpoints }
    }

    /// State with the first `index` units of `frame` applied, i.e. the state
    /// observed when the cursor rests on unit `index`.
    pub fn state_at(&self, id: FrameId, index: usize) -> ReconstructedState {
        let frame = self.tree.frame(id);
        let mut state = ReconstructedState {
            chain: self.checkpoints.entry_state(id),
            ..Default::default()
        };

        match frame.kind {
            FrameKind::TransactionGroup => {
                for &child in frame.children.iter().take(index) {
                    self.apply_subtree(child, &mut state.chain);
                }
            }
            FrameKind::Transaction => {
                for unit in frame.units.iter().take(index) {
                    if let TxnUnit::Program(program) = unit {
                        self.apply_subtree(*program, &mut state.chain);
                    }
                }
            }
            FrameKind::LogicSig | FrameKind::AppCall => {
                for (event_index, event) in frame.events.iter().take(index).enumerate() {
                    apply_exec(event, &mut state.stack, &mut state.scratch);
                    for delta in &event.deltas {
                        state.chain.apply(frame.app_id, delta);
                    }
                    if let Some(inner) = frame.inner_group_at(event_index) {
                        self.apply_subtree(inner, &mut state.chain);
                    }
                }
            }
        }

        state
    }

    /// Applies every on-chain effect under `id`, recursively.
    fn apply_subtree(&self, id: FrameId, chain: &mut ChainState) {
        let frame = self.tree.frame(id);
        match frame.kind {
            FrameKind::TransactionGroup => {
                for &child in &frame.children {
                    self.apply_subtree(child, chain);
                }
            }
            FrameKind::Transaction => {
                for unit in &frame.units {
                    if let TxnUnit::Program(program) = unit {
                        self.apply_subtree(*program, chain);
                    }
                }
            }
            FrameKind::LogicSig | FrameKind::AppCall => {
                for (index, event) in frame.events.iter().enumerate() {
                    for delta in &event.deltas {
                        chain.apply(frame.app_id, delta);
                    }
                    if let Some(inner) = frame.inner_group_at(index) {
                        self.apply_subtree(inner, chain);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::trace::{
        ExecTrace, LoadedTrace, ProgramHash, ProgramKind, ProgramTrace, TxnGroup, TxnResult,
    };
    use serde_json::json;

    fn build_tree() -> ExecutionTree {
        let events = vec![
            OpcodeEvent {
                pc: 1,
                stack_additions: vec![AvmValue::Bytes(b"key".to_vec())],
                ..Default::default()
            },
            OpcodeEvent {
                pc: 2,
                stack_additions: vec![AvmValue::Uint(7)],
                ..Default::default()
            },
            OpcodeEvent {
                pc: 3,
                stack_pop_count: 2,
                deltas: vec![
                    Delta::GlobalWrite {
                        key: b"key".to_vec(),
                        value: AvmValue::Uint(7),
                    },
                    Delta::ScratchWrite {
                        slot: 5,
                        value: AvmValue::Uint(9),
                    },
                ],
                ..Default::default()
            },
            OpcodeEvent {
                pc: 4,
                deltas: vec![Delta::ScratchWrite {
                    slot: 5,
                    value: AvmValue::Uint(0),
                }],
                ..Default::default()
            },
        ];

        ExecutionTree::build(&LoadedTrace {
            groups: vec![TxnGroup {
                txns: vec![TxnResult {
                    result: json!({ "txn": { "txn": { "apid": 10 } } }),
                    trace: Some(ExecTrace {
                        approval: Some(ProgramTrace {
                            kind: ProgramKind::Approval,
                            hash: ProgramHash([2; 32]),
                            events,
                        }),
                        ..Default::default()
                    }),
                }],
            }],
        })
    }

    fn program_frame(tree: &ExecutionTree) -> FrameId {
        let root = tree.frame(tree.roots[0]);
        let txn = tree.frame(root.children[0]);
        match txn.units[1] {
            TxnUnit::Program(id) => id,
            TxnUnit::Intro => panic!("expected program unit"),
        }
    }

    #[test]
    fn test_state_replay_and_zero_scratch_elision() {
        let tree = build_tree();
        let checkpoints = Checkpoints::compute(&tree);
        let reconstructor = Reconstructor::new(&tree, &checkpoints);
        let program = program_frame(&tree);

        // Resting on the write opcode: operands pushed, nothing applied yet.
        let before = reconstructor.state_at(program, 2);
        assert_eq!(
            before.stack,
            vec![AvmValue::Bytes(b"key".to_vec()), AvmValue::Uint(7)]
        );
        assert!(before.scratch.is_empty());
        assert!(before.chain.apps.get(&10).is_none());

        // One event later the write landed and the operands are gone.
        let after = reconstructor.state_at(program, 3);
        assert!(after.stack.is_empty());
        assert_eq!(after.scratch.get(&5), Some(&AvmValue::Uint(9)));
        assert_eq!(
            after.chain.apps[&10].global.get(b"key".as_slice()),
            Some(&AvmValue::Uint(7))
        );

        // A zero write empties the slot out of the visible map.
        let end = reconstructor.state_at(program, 4);
        assert!(end.scratch.is_empty());

        // Reconstruction is a pure function of the cursor.
        assert_eq!(reconstructor.state_at(program, 3), reconstructor.state_at(program, 3));
    }
}
