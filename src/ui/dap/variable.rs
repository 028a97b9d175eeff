//! Variable references and value rendering.
//!
//! A DAP `variablesReference` is a single integer; this module bit-packs
//! the scope kind, the stack frame and a registry id into it. The registry
//! maps ids to expansion nodes (which map to expand, which byte string to
//! break down) and is reset at every stop, references from before a resume
//! are invalid by protocol.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dap::types::{Variable, VariablePresentationHint, VariablePresentationHintKind};
use sha2::{Digest, Sha512_256};

use crate::debugger::trace::AvmValue;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum VarScope {
    None = 0,
    Execution = 1,
    Chain = 2,
}

impl TryFrom<u8> for VarScope {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VarScope::None),
            1 => Ok(VarScope::Execution),
            2 => Ok(VarScope::Chain),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VarRef {
    pub scope: VarScope,
    /// Stack frame index, 0 = deepest.
    pub frame: u32,
    /// Registry id; 0 is the scope root itself.
    pub var_id: u16,
}

impl VarRef {
    pub fn pack(self) -> i64 {
        (self.scope as u64 | ((self.frame as u64) << 8) | ((self.var_id as u64) << 40)) as i64
    }

    pub fn unpack(raw: u64) -> Option<Self> {
        Some(Self {
            scope: ((raw & 0xFF) as u8).try_into().ok()?,
            frame: ((raw >> 8) & 0xFFFF_FFFF) as u32,
            var_id: ((raw >> 40) & 0xFFFF) as u16,
        })
    }

    pub fn with_node(self, var_id: u16) -> Self {
        Self { var_id, ..self }
    }
}

/// What a non-root reference expands into.
#[derive(Debug, Clone)]
pub enum Node {
    Stack,
    Scratch,
    App(u64),
    AppGlobal(u64),
    AppBoxes(u64),
    AppLocal(u64),
    AppLocalAccount(u64, String),
    Bytes(Vec<u8>),
}

#[derive(Default)]
pub struct ReferenceRegistry {
    nodes: HashMap<u16, Node>,
    next: u16,
}

impl ReferenceRegistry {
    /// Drops every reference handed out since the last stop.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.next = 0;
    }

    pub fn insert(&mut self, node: Node) -> u16 {
        self.next += 1;
        self.nodes.insert(self.next, node);
        self.next
    }

    pub fn get(&self, var_id: u16) -> Option<&Node> {
        self.nodes.get(&var_id)
    }
}

pub fn type_name(value: &AvmValue) -> &'static str {
    match value {
        AvmValue::Uint(_) => "uint64",
        AvmValue::Bytes(_) => "bytes",
    }
}

/// Value column rendering: decimal for uints, 0x-hex for byte strings.
/// The expanded children of a byte string carry the other renderings.
pub fn render_value(value: &AvmValue) -> String {
    value.to_string()
}

/// Map keys: printable ASCII shows as text, anything else as 0x-hex.
pub fn render_key(key: &[u8]) -> String {
    if is_printable(key) {
        String::from_utf8_lossy(key).into_owned()
    } else {
        AvmValue::Bytes(key.to_vec()).to_string()
    }
}

fn is_printable(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|b| (0x20..=0x7e).contains(b))
}

fn data_hint() -> Option<VariablePresentationHint> {
    Some(VariablePresentationHint {
        kind: Some(VariablePresentationHintKind::Data),
        ..Default::default()
    })
}

/// One AVM value as a DAP variable; byte strings become expandable.
pub fn avm_variable(
    registry: &mut ReferenceRegistry,
    base: VarRef,
    name: String,
    value: &AvmValue,
) -> Variable {
    let variables_reference = match value {
        AvmValue::Bytes(bytes) => base
            .with_node(registry.insert(Node::Bytes(bytes.clone())))
            .pack(),
        AvmValue::Uint(_) => 0,
    };

    Variable {
        name,
        value: render_value(value),
        type_field: Some(type_name(value).to_string()),
        presentation_hint: data_hint(),
        variables_reference,
        ..Default::default()
    }
}

/// Simultaneous renderings of one byte string: hex and base64 always,
/// ascii when fully printable, an Algorand address when it is exactly a
/// 32-byte public key, the length, and one child per byte.
pub fn expand_bytes(bytes: &[u8]) -> Vec<Variable> {
    let plain = |name: &str, value: String| Variable {
        name: name.to_string(),
        value,
        presentation_hint: data_hint(),
        ..Default::default()
    };

    let mut variables = vec![
        plain("hex", AvmValue::Bytes(bytes.to_vec()).to_string()),
        plain("base64", BASE64.encode(bytes)),
    ];

    if is_printable(bytes) {
        variables.push(plain("ascii", String::from_utf8_lossy(bytes).into_owned()));
    }

    if let Ok(key) = <&[u8; 32]>::try_from(bytes) {
        variables.push(plain("address", algorand_address(key)));
    }

    variables.push(plain("length", bytes.len().to_string()));

    variables.extend(
        bytes
            .iter()
            .enumerate()
            .map(|(index, byte)| plain(&index.to_string(), byte.to_string())),
    );

    variables
}

/// 58-character textual form of a 32-byte public key: base32 over the key
/// plus the last 4 bytes of its SHA-512/256 digest.
fn algorand_address(key: &[u8; 32]) -> String {
    let digest = Sha512_256::digest(key);

    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(key);
    data.extend_from_slice(&digest[28..]);

    base32_nopad(&data)
}

fn base32_nopad(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;

    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_var_ref_round_trip() {
        let var_ref = VarRef {
            scope: VarScope::Chain,
            frame: 3,
            var_id: 77,
        };
        let unpacked = VarRef::unpack(var_ref.pack() as u64).unwrap();
        assert_eq!(unpacked.scope, VarScope::Chain);
        assert_eq!(unpacked.frame, 3);
        assert_eq!(unpacked.var_id, 77);

        assert!(VarRef::unpack(0xFF).is_none());
    }

    #[test]
    fn test_byte_expansion_children() {
        let children = expand_bytes(b"1!");
        let get = |name: &str| {
            children
                .iter()
                .find(|v| v.name == name)
                .map(|v| v.value.clone())
        };

        assert_eq!(get("hex"), Some("0x3121".to_string()));
        assert_eq!(get("base64"), Some("MSE=".to_string()));
        assert_eq!(get("ascii"), Some("1!".to_string()));
        assert_eq!(get("length"), Some("2".to_string()));
        assert_eq!(get("0"), Some("49".to_string()));
        assert_eq!(get("1"), Some("33".to_string()));
        assert_eq!(get("address"), None, "only 32-byte values render an address");
    }

    #[test]
    fn test_address_rendering_for_32_byte_values() {
        let children = expand_bytes(&[0u8; 32]);
        let address = children
            .iter()
            .find(|v| v.name == "address")
            .map(|v| v.value.clone())
            .unwrap();
        assert_eq!(address.len(), 58);
        assert!(address.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_key_rendering() {
        assert_eq!(render_key(b"global-int-key"), "global-int-key");
        assert_eq!(render_key(&[0x00, 0xff]), "0x00ff");
    }
}
