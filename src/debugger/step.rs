//! Stepping engine.
//!
//! The cursor is a root-to-leaf stack of (frame, unit index) pairs. A leaf
//! always rests on a transaction unit or a program event; group frames
//! appear on the path but are never a rest position themselves. An event
//! index means "about to execute this event", so state reconstruction for a
//! rest position replays everything strictly before it.
//!
//! Movement primitives copy the cursor and commit only on success, which
//! keeps the session cursor intact when a move runs off either end of the
//! trace. Every public step method returns the [`StopReason`] the DAP
//! surface translates into a `stopped`/`terminated` event.

use super::tree::{ExecutionTree, FrameId, FrameKind, TxnUnit};
use super::Debugger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Index into the tree's root groups.
    pub root: usize,
    /// (frame, unit index) pairs from the root group down to the leaf.
    pub path: Vec<(FrameId, usize)>,
}

impl Cursor {
    pub fn leaf(&self) -> (FrameId, usize) {
        *self.path.last().expect("cursor path is never empty")
    }

    fn set_leaf_index(&mut self, index: usize) {
        if let Some(leaf) = self.path.last_mut() {
            leaf.1 = index;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Entry,
    Step,
    Breakpoint { id: i64 },
    Terminated,
}

/// First rest position of the trace: the intro unit of the first
/// transaction of the first non-empty group.
pub(super) fn initial_cursor(tree: &ExecutionTree) -> Option<Cursor> {
    for (root_index, &root) in tree.roots.iter().enumerate() {
        if let Some(&first_txn) = tree.frame(root).children.first() {
            return Some(Cursor {
                root: root_index,
                path: vec![(root, 0), (first_txn, 0)],
            });
        }
    }
    None
}

/// One step forward at the finest granularity, descending into program
/// executions and spawned inner groups. `None` means the trace is over.
pub(super) fn advance(tree: &ExecutionTree, cursor: &Cursor) -> Option<Cursor> {
    let mut c = cursor.clone();
    let (frame_id, index) = c.leaf();
    let frame = tree.frame(frame_id);

    match frame.kind {
        FrameKind::Transaction => {
            if let TxnUnit::Program(program) = frame.units[index] {
                if !tree.frame(program).events.is_empty() {
                    c.path.push((program, 0));
                    return Some(c);
                }
            }
            advance_within(tree, c)
        }
        FrameKind::LogicSig | FrameKind::AppCall => {
            if let Some(inner) = frame.inner_group_at(index) {
                if let Some(&first_txn) = tree.frame(inner).children.first() {
                    c.path.push((inner, 0));
                    c.path.push((first_txn, 0));
                    return Some(c);
                }
            }
            advance_within(tree, c)
        }
        FrameKind::TransactionGroup => advance_within(tree, c),
    }
}

/// Treats the leaf's current unit as finished and moves to the next rest
/// position at this level or above, never entering the finished unit's
/// children.
fn advance_within(tree: &ExecutionTree, mut c: Cursor) -> Option<Cursor> {
    loop {
        let (frame_id, index) = c.leaf();
        let frame = tree.frame(frame_id);

        if index + 1 < frame.unit_count() {
            c.set_leaf_index(index + 1);
            if frame.kind == FrameKind::TransactionGroup {
                c.path.push((frame.children[index + 1], 0));
            }
            return Some(c);
        }

        if c.path.len() > 1 {
            c.path.pop();
            continue;
        }

        // Top-level group exhausted: move on to the next one with content.
        loop {
            c.root += 1;
            let &root = tree.roots.get(c.root)?;
            if let Some(&first_txn) = tree.frame(root).children.first() {
                c.path = vec![(root, 0), (first_txn, 0)];
                return Some(c);
            }
        }
    }
}

/// Pushes the deepest last rest position of `id`'s subtree onto the path.
/// Callers ensure the subtree has at least one rest position.
fn descend_last(tree: &ExecutionTree, c: &mut Cursor, id: FrameId) {
    let frame = tree.frame(id);
    match frame.kind {
        FrameKind::TransactionGroup => {
            let last = frame.children.len() - 1;
            c.path.push((id, last));
            descend_last(tree, c, frame.children[last]);
        }
        FrameKind::Transaction => {
            let last = frame.units.len() - 1;
            c.path.push((id, last));
            if let TxnUnit::Program(program) = frame.units[last] {
                if !tree.frame(program).events.is_empty() {
                    descend_last(tree, c, program);
                }
            }
        }
        FrameKind::LogicSig | FrameKind::AppCall => {
            let last = frame.events.len() - 1;
            c.path.push((id, last));
            if let Some(inner) = frame.inner_group_at(last) {
                if !tree.frame(inner).children.is_empty() {
                    descend_last(tree, c, inner);
                }
            }
        }
    }
}

/// One step backward, descending into the subtree of the unit being crossed
/// (the exact mirror of [`advance`]). `None` means the cursor already rests
/// on the very first position.
pub(super) fn retreat(tree: &ExecutionTree, cursor: &Cursor) -> Option<Cursor> {
    let mut c = cursor.clone();
    let (frame_id, index) = c.leaf();
    let frame = tree.frame(frame_id);

    if index == 0 {
        return pop_retreat(tree, c);
    }

    let prev = index - 1;
    c.set_leaf_index(prev);
    match frame.kind {
        FrameKind::Transaction => {
            if let TxnUnit::Program(program) = frame.units[prev] {
                if !tree.frame(program).events.is_empty() {
                    descend_last(tree, &mut c, program);
                }
            }
        }
        FrameKind::LogicSig | FrameKind::AppCall => {
            if let Some(inner) = frame.inner_group_at(prev) {
                if !tree.frame(inner).children.is_empty() {
                    descend_last(tree, &mut c, inner);
                }
            }
        }
        FrameKind::TransactionGroup => {}
    }
    Some(c)
}

/// Leaves the leaf frame backwards: rests on whatever position the frame
/// was entered from.
fn pop_retreat(tree: &ExecutionTree, mut c: Cursor) -> Option<Cursor> {
    loop {
        if c.path.len() == 1 {
            // Backing out of a top-level group.
            loop {
                if c.root == 0 {
                    return None;
                }
                c.root -= 1;
                let root = tree.roots[c.root];
                if !tree.frame(root).children.is_empty() {
                    c.path.clear();
                    descend_last(tree, &mut c, root);
                    return Some(c);
                }
            }
        }

        c.path.pop();
        let (frame_id, index) = c.leaf();
        let frame = tree.frame(frame_id);
        match frame.kind {
            // The program unit / spawning event we were inside of.
            FrameKind::Transaction | FrameKind::LogicSig | FrameKind::AppCall => return Some(c),
            FrameKind::TransactionGroup => {
                if index > 0 {
                    c.set_leaf_index(index - 1);
                    descend_last(tree, &mut c, frame.children[index - 1]);
                    return Some(c);
                }
                // Entered at the group's start: keep exiting.
            }
        }
    }
}

/// Forward step that never enters the current unit's children.
pub(super) fn advance_over(tree: &ExecutionTree, cursor: &Cursor) -> Option<Cursor> {
    let (frame_id, index) = cursor.leaf();
    let frame = tree.frame(frame_id);

    let has_child = match frame.kind {
        FrameKind::Transaction => matches!(frame.units[index], TxnUnit::Program(_)),
        FrameKind::LogicSig | FrameKind::AppCall => frame.inner_group_at(index).is_some(),
        FrameKind::TransactionGroup => false,
    };

    if has_child {
        advance_within(tree, cursor.clone())
    } else {
        advance(tree, cursor)
    }
}

/// Forward step that finishes the leaf frame and rests just after it.
pub(super) fn advance_out(tree: &ExecutionTree, cursor: &Cursor) -> Option<Cursor> {
    let mut c = cursor.clone();
    if c.path.len() > 1 {
        c.path.pop();
    }
    advance_within(tree, c)
}

/// Backward step that rests on the previous unit itself instead of
/// descending into its subtree.
pub(super) fn retreat_over(tree: &ExecutionTree, cursor: &Cursor) -> Option<Cursor> {
    let mut c = cursor.clone();
    let (_, index) = c.leaf();
    if index > 0 {
        c.set_leaf_index(index - 1);
        Some(c)
    } else {
        pop_retreat(tree, c)
    }
}

/// Backward step to the position the leaf frame was entered from.
pub(super) fn retreat_out(tree: &ExecutionTree, cursor: &Cursor) -> Option<Cursor> {
    let mut c = cursor.clone();
    c.set_leaf_index(0);
    pop_retreat(tree, c)
}

impl Debugger {
    pub fn step_in(&mut self) -> StopReason {
        self.forward(advance)
    }

    pub fn step_over(&mut self) -> StopReason {
        self.forward(advance_over)
    }

    pub fn step_out(&mut self) -> StopReason {
        self.forward(advance_out)
    }

    pub fn step_back(&mut self) -> StopReason {
        self.backward(retreat)
    }

    pub fn reverse_step_over(&mut self) -> StopReason {
        self.backward(retreat_over)
    }

    pub fn reverse_step_out(&mut self) -> StopReason {
        self.backward(retreat_out)
    }

    /// Runs forward until a verified breakpoint matches or the trace ends.
    pub fn continue_forward(&mut self) -> StopReason {
        if self.terminated {
            return StopReason::Terminated;
        }
        loop {
            let Some(cursor) = &self.cursor else {
                self.terminated = true;
                return StopReason::Terminated;
            };
            match advance(&self.tree, cursor) {
                Some(next) => {
                    self.cursor = Some(next);
                    if let Some(id) = self.breakpoint_hit() {
                        return StopReason::Breakpoint { id };
                    }
                }
                None => {
                    self.terminated = true;
                    return StopReason::Terminated;
                }
            }
        }
    }

    /// Runs backward until the most recent breakpoint hit strictly before
    /// the starting cursor; rests at the first event otherwise.
    pub fn reverse_continue(&mut self) -> StopReason {
        if self.terminated {
            return StopReason::Terminated;
        }
        loop {
            let Some(cursor) = &self.cursor else {
                return StopReason::Entry;
            };
            match retreat(&self.tree, cursor) {
                Some(next) => {
                    self.cursor = Some(next);
                    if let Some(id) = self.breakpoint_hit() {
                        return StopReason::Breakpoint { id };
                    }
                }
                None => return StopReason::Entry,
            }
        }
    }

    fn forward(&mut self, movement: fn(&ExecutionTree, &Cursor) -> Option<Cursor>) -> StopReason {
        if self.terminated {
            return StopReason::Terminated;
        }
        let Some(cursor) = &self.cursor else {
            self.terminated = true;
            return StopReason::Terminated;
        };
        match movement(&self.tree, cursor) {
            Some(next) => {
                self.cursor = Some(next);
                self.stop_reason_here()
            }
            None => {
                self.terminated = true;
                StopReason::Terminated
            }
        }
    }

    fn backward(&mut self, movement: fn(&ExecutionTree, &Cursor) -> Option<Cursor>) -> StopReason {
        if self.terminated {
            return StopReason::Terminated;
        }
        let Some(cursor) = &self.cursor else {
            return StopReason::Step;
        };
        match movement(&self.tree, cursor) {
            Some(next) => {
                self.cursor = Some(next);
                self.stop_reason_here()
            }
            // Already at the first position; reverse steps clamp there.
            None => StopReason::Step,
        }
    }

    /// A step that lands exactly on a verified breakpoint is promoted.
    fn stop_reason_here(&self) -> StopReason {
        match self.breakpoint_hit() {
            Some(id) => StopReason::Breakpoint { id },
            None => StopReason::Step,
        }
    }

    pub(super) fn breakpoint_hit(&self) -> Option<i64> {
        let cursor = self.cursor.as_ref()?;
        let (frame_id, index) = cursor.leaf();
        let frame = self.tree.frame(frame_id);
        let program = frame.program?;
        let event = frame.events.get(index)?;
        let loc = self.index.pc_to_loc(program, event.pc)?;
        self.breakpoints.matches(loc.file, loc)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::trace::{
        ExecTrace, LoadedTrace, OpcodeEvent, ProgramHash, ProgramKind, ProgramTrace, TxnGroup,
        TxnResult,
    };
    use serde_json::json;

    fn event(pc: u64) -> OpcodeEvent {
        OpcodeEvent { pc, ..Default::default() }
    }

    fn program(kind: ProgramKind, hash_byte: u8, events: Vec<OpcodeEvent>) -> ProgramTrace {
        ProgramTrace {
            kind,
            hash: ProgramHash([hash_byte; 32]),
            events,
        }
    }

    /// txn0: plain payment. txn1: logic sig (2 events) + app call (3 events,
    /// the middle one spawning an inner group with one app call of 1 event).
    fn build_tree() -> ExecutionTree {
        let mut spawn = event(2);
        spawn.spawned_inners = vec![0];

        ExecutionTree::build(&LoadedTrace {
            groups: vec![TxnGroup {
                txns: vec![
                    TxnResult {
                        result: json!({ "txn": { "txn": { "type": "pay" } } }),
                        trace: None,
                    },
                    TxnResult {
                        result: json!({
                            "inner-txns": [ { "txn": { "txn": { "apid": 2000 } } } ],
                            "txn": { "lsig": { "l": "AQ==" }, "txn": { "apid": 1054 } },
                        }),
                        trace: Some(ExecTrace {
                            logic_sig: Some(program(ProgramKind::LogicSig, 1, vec![event(1), event(2)])),
                            approval: Some(program(
                                ProgramKind::Approval,
                                2,
                                vec![event(1), spawn, event(3)],
                            )),
                            clear_state: None,
                            inner: vec![ExecTrace {
                                approval: Some(program(ProgramKind::Approval, 3, vec![event(1)])),
                                ..Default::default()
                            }],
                        }),
                    },
                ],
            }],
        })
    }

    /// Leaf positions as (frame kind, unit index), for readable assertions.
    fn leaf_of(tree: &ExecutionTree, cursor: &Cursor) -> (FrameKind, usize) {
        let (frame_id, index) = cursor.leaf();
        (tree.frame(frame_id).kind, index)
    }

    #[test]
    fn test_step_in_walks_whole_trace_in_order() {
        let tree = build_tree();
        let mut cursor = initial_cursor(&tree).unwrap();

        let mut walk = vec![leaf_of(&tree, &cursor)];
        while let Some(next) = advance(&tree, &cursor) {
            cursor = next;
            walk.push(leaf_of(&tree, &cursor));
        }

        assert_eq!(
            walk,
            vec![
                (FrameKind::Transaction, 0),  // txn0 intro
                (FrameKind::Transaction, 0),  // txn1 intro
                (FrameKind::Transaction, 1),  // logic sig unit
                (FrameKind::LogicSig, 0),
                (FrameKind::LogicSig, 1),
                (FrameKind::Transaction, 2),  // app call unit
                (FrameKind::AppCall, 0),
                (FrameKind::AppCall, 1),      // spawning event
                (FrameKind::Transaction, 0),  // inner txn intro
                (FrameKind::Transaction, 1),  // inner app unit
                (FrameKind::AppCall, 0),      // inner app event
                (FrameKind::AppCall, 2),      // back in the outer app
            ]
        );
    }

    #[test]
    fn test_step_over_skips_spawned_inner_group() {
        let tree = build_tree();
        let mut cursor = initial_cursor(&tree).unwrap();

        // Walk to the spawning event.
        for _ in 0..7 {
            cursor = advance(&tree, &cursor).unwrap();
        }
        assert_eq!(leaf_of(&tree, &cursor), (FrameKind::AppCall, 1));

        let over = advance_over(&tree, &cursor).unwrap();
        assert_eq!(leaf_of(&tree, &over), (FrameKind::AppCall, 2));
        assert_eq!(over.path.len(), cursor.path.len());
    }

    #[test]
    fn test_step_back_mirrors_step_in() {
        let tree = build_tree();
        let mut cursor = initial_cursor(&tree).unwrap();
        let mut trail = vec![cursor.clone()];

        while let Some(next) = advance(&tree, &cursor) {
            cursor = next;
            trail.push(cursor.clone());
        }

        // Walk the whole trace backwards and compare against the forward trail.
        for expected in trail.iter().rev().skip(1) {
            cursor = retreat(&tree, &cursor).unwrap();
            assert_eq!(&cursor, expected);
        }
        assert!(retreat(&tree, &cursor).is_none(), "clamped at the entry position");
    }

    #[test]
    fn test_step_out_of_inner_group() {
        let tree = build_tree();
        let mut cursor = initial_cursor(&tree).unwrap();

        // Walk to the inner app event.
        for _ in 0..10 {
            cursor = advance(&tree, &cursor).unwrap();
        }
        assert_eq!(leaf_of(&tree, &cursor), (FrameKind::AppCall, 0));
        assert_eq!(cursor.path.len(), 6);

        // Out of the inner program: rests after the inner app unit's frame,
        // which cascades to the outer app's next event.
        let out = advance_out(&tree, &cursor).unwrap();
        assert_eq!(leaf_of(&tree, &out), (FrameKind::AppCall, 2));
        assert_eq!(out.path.len(), 3);

        // Reverse step-out returns to the position the program was entered
        // from: the spawning event still being "next".
        let back_in = retreat(&tree, &out).unwrap();
        let back_out = retreat_out(&tree, &back_in).unwrap();
        assert_eq!(leaf_of(&tree, &back_out), (FrameKind::Transaction, 1));
    }
}
