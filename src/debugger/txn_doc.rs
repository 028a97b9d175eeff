//! Pseudo source documents for transaction frames.
//!
//! Transaction and group frames have no TEAL behind them; the IDE is shown a
//! pretty-printed JSON rendition of the group (`transaction-group-N.json`)
//! instead, and stack frames point at positions inside it. The renderer here
//! produces that text itself so it can record the line of every JSON path it
//! emits; relying on a serializer and re-scanning its output would tie us to
//! its formatting.

use std::collections::HashMap;

use serde_json::Value;

use super::trace::ProgramKind;

/// A rendered transaction-group document plus a path -> line index.
#[derive(Debug)]
pub struct GroupDoc {
    pub name: String,
    pub text: String,
    /// JSON pointer -> 0-based line where the pointed-at value begins.
    lines: HashMap<String, u32>,
}

impl GroupDoc {
    /// Renders the group's txn-result objects as a 2-space-indented JSON
    /// array. Object keys are emitted in sorted order, which is also what
    /// `serde_json` parses into by default, so renderings are stable across
    /// load/render cycles.
    pub fn render(group_index: usize, txns: &[&Value]) -> GroupDoc {
        let mut renderer = Renderer {
            text: String::new(),
            line: 0,
            lines: HashMap::new(),
        };

        let array = Value::Array(txns.iter().map(|&v| v.clone()).collect());
        renderer.value(&array, 0, "");
        renderer.text.push('\n');

        GroupDoc {
            name: format!("transaction-group-{group_index}.json"),
            text: renderer.text,
            lines: renderer.lines,
        }
    }

    pub fn line_of(&self, pointer: &str) -> Option<u32> {
        self.lines.get(pointer).copied()
    }

    /// Line of the transaction object at `path` (top-level index followed by
    /// inner-transaction indices).
    pub fn txn_line(&self, path: &[usize]) -> u32 {
        self.line_of(&txn_pointer(path)).unwrap_or(0)
    }

    /// Line of the field that stands for one of the transaction's program
    /// executions. Falls back to the transaction object itself when the
    /// field is absent from the result JSON.
    pub fn program_line(&self, path: &[usize], kind: ProgramKind) -> u32 {
        let base = txn_pointer(path);
        let field = match kind {
            ProgramKind::LogicSig => format!("{base}/txn/lsig"),
            ProgramKind::Approval | ProgramKind::ClearState => format!("{base}/txn/txn/apid"),
        };
        self.line_of(&field).unwrap_or_else(|| self.txn_line(path))
    }
}

/// `[0]` -> `/0`, `[0, 2]` -> `/0/inner-txns/2`, and so on.
fn txn_pointer(path: &[usize]) -> String {
    let mut pointer = String::new();
    for (depth, index) in path.iter().enumerate() {
        if depth == 0 {
            pointer.push_str(&format!("/{index}"));
        } else {
            pointer.push_str(&format!("/inner-txns/{index}"));
        }
    }
    pointer
}

struct Renderer {
    text: String,
    line: u32,
    lines: HashMap<String, u32>,
}

impl Renderer {
    fn push(&mut self, s: &str) {
        self.line += s.bytes().filter(|&b| b == b'\n').count() as u32;
        self.text.push_str(s);
    }

    fn value(&mut self, v: &Value, indent: usize, pointer: &str) {
        match v {
            Value::Object(map) if map.is_empty() => self.push("{}"),
            Value::Object(map) => {
                self.push("{\n");
                let last = map.len() - 1;
                for (i, (key, child)) in map.iter().enumerate() {
                    let child_pointer = format!("{pointer}/{}", escape_pointer_token(key));
                    self.lines.insert(child_pointer.clone(), self.line);
                    self.push(&" ".repeat(indent + 2));
                    self.push(&format!("{}: ", Value::String(key.clone())));
                    self.value(child, indent + 2, &child_pointer);
                    self.push(if i == last { "\n" } else { ",\n" });
                }
                self.push(&" ".repeat(indent));
                self.push("}");
            }
            Value::Array(items) if items.is_empty() => self.push("[]"),
            Value::Array(items) => {
                self.push("[\n");
                let last = items.len() - 1;
                for (i, child) in items.iter().enumerate() {
                    let child_pointer = format!("{pointer}/{i}");
                    self.lines.insert(child_pointer.clone(), self.line);
                    self.push(&" ".repeat(indent + 2));
                    self.value(child, indent + 2, &child_pointer);
                    self.push(if i == last { "\n" } else { ",\n" });
                }
                self.push(&" ".repeat(indent));
                self.push("]");
            }
            scalar => {
                // Scalars cannot fail to serialize.
                self.push(&serde_json::to_string(scalar).expect("scalar to json"));
            }
        }
    }
}

fn escape_pointer_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
