//! Simulation trace loader.
//!
//! Parses the simulate-response document and the transaction-group sources
//! descriptor into typed records. All base64 byte fields are decoded eagerly
//! and integers that arrive as JSON strings (values above 2^53 are emitted
//! that way by some nodes) are normalized here, so the rest of the crate
//! never sees the wire shapes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use super::error::{Error, Result};

/// SHA-512/256 digest of an executed program, the key that ties a trace to
/// its TEAL source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHash(pub [u8; 32]);

impl ProgramHash {
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| Error::bad_trace(format!("program hash is not base64: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::bad_trace("program hash is not 32 bytes"))?;
        Ok(ProgramHash(arr))
    }
}

impl fmt::Display for ProgramHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

/// A value on the AVM stack, in a scratch slot, or in application state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvmValue {
    Uint(u64),
    Bytes(Vec<u8>),
}

impl AvmValue {
    pub fn is_zero(&self) -> bool {
        matches!(self, AvmValue::Uint(0))
    }
}

impl fmt::Display for AvmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvmValue::Uint(v) => write!(f, "{v}"),
            AvmValue::Bytes(b) => {
                write!(f, "0x")?;
                b.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
            }
        }
    }
}

/// A single observable side effect of one opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    ScratchWrite { slot: u8, value: AvmValue },
    GlobalWrite { key: Vec<u8>, value: AvmValue },
    GlobalDelete { key: Vec<u8> },
    LocalWrite { account: String, key: Vec<u8>, value: AvmValue },
    LocalDelete { account: String, key: Vec<u8> },
    BoxWrite { key: Vec<u8>, value: AvmValue },
    BoxDelete { key: Vec<u8> },
}

/// One executed VM instruction.
///
/// `spawned_inners` are indices into the enclosing [`ExecTrace::inner`] list;
/// the execution tree builder resolves them into child frames.
#[derive(Debug, Clone, Default)]
pub struct OpcodeEvent {
    pub pc: u64,
    pub stack_pop_count: usize,
    pub stack_additions: Vec<AvmValue>,
    pub deltas: Vec<Delta>,
    pub spawned_inners: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    LogicSig,
    Approval,
    ClearState,
}

impl ProgramKind {
    pub fn label(self) -> &'static str {
        match self {
            ProgramKind::LogicSig => "logic sig",
            ProgramKind::Approval => "approval program",
            ProgramKind::ClearState => "clear state program",
        }
    }
}

/// The flattened opcode sequence of one program execution.
#[derive(Debug, Clone)]
pub struct ProgramTrace {
    pub kind: ProgramKind,
    pub hash: ProgramHash,
    pub events: Vec<OpcodeEvent>,
}

/// Execution record of a single transaction: up to one trace per program
/// kind plus the inner transactions it spawned.
#[derive(Debug, Clone, Default)]
pub struct ExecTrace {
    pub logic_sig: Option<ProgramTrace>,
    pub approval: Option<ProgramTrace>,
    pub clear_state: Option<ProgramTrace>,
    pub inner: Vec<ExecTrace>,
}

impl ExecTrace {
    /// Program traces in execution order.
    pub fn programs(&self) -> impl Iterator<Item = &ProgramTrace> {
        self.logic_sig
            .iter()
            .chain(self.approval.iter())
            .chain(self.clear_state.iter())
    }
}

/// One entry of `txn-results`: the raw result object (kept verbatim, it
/// feeds the pseudo source document and app-id extraction) plus the
/// normalized execution trace.
#[derive(Debug, Clone)]
pub struct TxnResult {
    pub result: Value,
    pub trace: Option<ExecTrace>,
}

#[derive(Debug, Clone)]
pub struct TxnGroup {
    pub txns: Vec<TxnResult>,
}

#[derive(Debug, Clone)]
pub struct LoadedTrace {
    pub groups: Vec<TxnGroup>,
}

impl LoadedTrace {
    /// Hashes of every program executed anywhere in the simulation.
    pub fn program_hashes(&self) -> Vec<ProgramHash> {
        fn walk(trace: &ExecTrace, out: &mut Vec<ProgramHash>) {
            for program in trace.programs() {
                if !out.contains(&program.hash) {
                    out.push(program.hash);
                }
            }
            for inner in &trace.inner {
                walk(inner, out);
            }
        }

        let mut hashes = Vec::new();
        for group in &self.groups {
            for txn in &group.txns {
                if let Some(trace) = &txn.trace {
                    walk(trace, &mut hashes);
                }
            }
        }
        hashes
    }
}

/// One entry of the sources descriptor. The source map is kept in its raw
/// decoded-JSON form here; `sourcemap::SourceIndex` turns it into lookup
/// tables.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub hash: ProgramHash,
    pub filename: PathBuf,
    pub source_map: RawSourceMap,
    /// Directory of the descriptor file, the base for relative paths.
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSourceMap {
    pub version: u32,
    pub sources: Vec<String>,
    pub mappings: String,
}

pub fn load_simulate_response(path: &Path) -> Result<LoadedTrace> {
    let bytes = fs::read(path)?;
    let raw: RawSimulateResponse = serde_json::from_slice(&bytes)
        .map_err(|e| Error::bad_trace(format!("{}: {e}", path.display())))?;

    let mut groups = Vec::with_capacity(raw.txn_groups.len());
    for raw_group in raw.txn_groups {
        let mut txns = Vec::with_capacity(raw_group.txn_results.len());
        for raw_txn in raw_group.txn_results {
            let trace = raw_txn.exec_trace.map(normalize_exec_trace).transpose()?;
            txns.push(TxnResult {
                result: raw_txn.txn_result,
                trace,
            });
        }
        groups.push(TxnGroup { txns });
    }

    if groups.is_empty() {
        return Err(Error::bad_trace("simulate response contains no txn-groups"));
    }

    Ok(LoadedTrace { groups })
}

pub fn load_sources_descriptor(path: &Path) -> Result<Vec<SourceEntry>> {
    let bytes = fs::read(path)?;
    let raw: RawSourcesDescriptor = serde_json::from_slice(&bytes)
        .map_err(|e| Error::bad_trace(format!("{}: {e}", path.display())))?;

    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

    let mut entries = Vec::with_capacity(raw.sources.len());
    for raw_entry in raw.sources {
        let source_map = match (raw_entry.source_map, raw_entry.source_map_path) {
            (Some(map), _) => map,
            (None, Some(map_path)) => {
                let map_bytes = fs::read(base_dir.join(&map_path))?;
                serde_json::from_slice(&map_bytes)
                    .map_err(|e| Error::bad_trace(format!("{map_path}: {e}")))?
            }
            (None, None) => {
                return Err(Error::bad_trace(format!(
                    "source entry {} carries no source map",
                    raw_entry.filename
                )))
            }
        };

        entries.push(SourceEntry {
            hash: ProgramHash::from_base64(&raw_entry.hash)?,
            filename: base_dir.join(&raw_entry.filename),
            source_map,
            base_dir: base_dir.clone(),
        });
    }

    Ok(entries)
}

// ---------------------------------- wire shapes ----------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSimulateResponse {
    #[serde(default)]
    txn_groups: Vec<RawTxnGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawTxnGroup {
    #[serde(default)]
    txn_results: Vec<RawTxnResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawTxnResult {
    txn_result: Value,
    exec_trace: Option<RawExecTrace>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawExecTrace {
    logic_sig_trace: Option<Vec<RawOpcodeUnit>>,
    logic_sig_hash: Option<String>,
    approval_program_trace: Option<Vec<RawOpcodeUnit>>,
    approval_program_hash: Option<String>,
    clear_state_program_trace: Option<Vec<RawOpcodeUnit>>,
    clear_state_program_hash: Option<String>,
    #[serde(default)]
    inner_trace: Vec<RawExecTrace>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawOpcodeUnit {
    #[serde(deserialize_with = "u64_compat")]
    pc: u64,
    #[serde(default, deserialize_with = "opt_u64_compat")]
    stack_pop_count: Option<u64>,
    #[serde(default)]
    stack_additions: Vec<RawAvmValue>,
    #[serde(default)]
    scratch_changes: Vec<RawScratchChange>,
    #[serde(default)]
    state_changes: Vec<RawStateChange>,
    #[serde(default)]
    spawned_inners: Vec<usize>,
}

#[derive(Deserialize)]
struct RawAvmValue {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, deserialize_with = "opt_u64_compat")]
    uint: Option<u64>,
    bytes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawScratchChange {
    #[serde(deserialize_with = "u64_compat")]
    slot: u64,
    new_value: Option<RawAvmValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawStateChange {
    app_state_type: String,
    operation: String,
    key: String,
    new_value: Option<RawAvmValue>,
    account: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSourcesDescriptor {
    #[serde(rename = "txn-group-sources")]
    sources: Vec<RawSourceEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSourceEntry {
    hash: String,
    filename: String,
    source_map: Option<RawSourceMap>,
    source_map_path: Option<String>,
}

// ---------------------------------- normalization ----------------------------------

fn normalize_exec_trace(raw: RawExecTrace) -> Result<ExecTrace> {
    let logic_sig = normalize_program(ProgramKind::LogicSig, raw.logic_sig_trace, raw.logic_sig_hash)?;
    let approval = normalize_program(
        ProgramKind::Approval,
        raw.approval_program_trace,
        raw.approval_program_hash,
    )?;
    let clear_state = normalize_program(
        ProgramKind::ClearState,
        raw.clear_state_program_trace,
        raw.clear_state_program_hash,
    )?;

    let inner = raw
        .inner_trace
        .into_iter()
        .map(normalize_exec_trace)
        .collect::<Result<Vec<_>>>()?;

    Ok(ExecTrace {
        logic_sig,
        approval,
        clear_state,
        inner,
    })
}

fn normalize_program(
    kind: ProgramKind,
    trace: Option<Vec<RawOpcodeUnit>>,
    hash: Option<String>,
) -> Result<Option<ProgramTrace>> {
    let Some(units) = trace else {
        return Ok(None);
    };
    let hash = hash.ok_or_else(|| {
        Error::bad_trace(format!("{} trace carries no program hash", kind.label()))
    })?;

    let events = units
        .into_iter()
        .map(normalize_unit)
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(ProgramTrace {
        kind,
        hash: ProgramHash::from_base64(&hash)?,
        events,
    }))
}

fn normalize_unit(raw: RawOpcodeUnit) -> Result<OpcodeEvent> {
    let mut deltas = Vec::new();

    for change in raw.scratch_changes {
        let slot = u8::try_from(change.slot)
            .map_err(|_| Error::bad_trace(format!("scratch slot {} out of range", change.slot)))?;
        let value = match change.new_value {
            Some(v) => normalize_value(v)?,
            None => AvmValue::Uint(0),
        };
        deltas.push(Delta::ScratchWrite { slot, value });
    }

    for change in raw.state_changes {
        deltas.push(normalize_state_change(change)?);
    }

    Ok(OpcodeEvent {
        pc: raw.pc,
        stack_pop_count: raw.stack_pop_count.unwrap_or(0) as usize,
        stack_additions: raw
            .stack_additions
            .into_iter()
            .map(normalize_value)
            .collect::<Result<Vec<_>>>()?,
        deltas,
        spawned_inners: raw.spawned_inners,
    })
}

fn normalize_state_change(raw: RawStateChange) -> Result<Delta> {
    let key = BASE64
        .decode(&raw.key)
        .map_err(|e| Error::bad_trace(format!("state key is not base64: {e}")))?;

    let value = || -> Result<AvmValue> {
        raw.new_value
            .ok_or_else(|| Error::bad_trace("state write carries no new-value"))
            .and_then(normalize_value)
    };
    let account = || -> Result<String> {
        raw.account
            .clone()
            .ok_or_else(|| Error::bad_trace("local state change carries no account"))
    };

    match (raw.app_state_type.as_str(), raw.operation.as_str()) {
        ("g", "w") => Ok(Delta::GlobalWrite { key, value: value()? }),
        ("g", "d") => Ok(Delta::GlobalDelete { key }),
        ("l", "w") => Ok(Delta::LocalWrite {
            account: account()?,
            key,
            value: value()?,
        }),
        ("l", "d") => Ok(Delta::LocalDelete {
            account: account()?,
            key,
        }),
        ("b", "w") => Ok(Delta::BoxWrite { key, value: value()? }),
        ("b", "d") => Ok(Delta::BoxDelete { key }),
        (state, op) => Err(Error::bad_trace(format!(
            "unknown state change {state:?}/{op:?}"
        ))),
    }
}

fn normalize_value(raw: RawAvmValue) -> Result<AvmValue> {
    match raw.kind {
        1 => {
            let bytes = match raw.bytes {
                Some(b64) => BASE64
                    .decode(&b64)
                    .map_err(|e| Error::bad_trace(format!("avm value is not base64: {e}")))?,
                None => Vec::new(),
            };
            Ok(AvmValue::Bytes(bytes))
        }
        2 => Ok(AvmValue::Uint(raw.uint.unwrap_or(0))),
        other => Err(Error::bad_trace(format!("unknown avm value type {other}"))),
    }
}

/// Accepts both `42` and `"42"`; nodes stringify integers above 2^53.
fn u64_compat<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Compat {
        Num(u64),
        Str(String),
    }

    match Compat::deserialize(deserializer)? {
        Compat::Num(n) => Ok(n),
        Compat::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn opt_u64_compat<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Compat {
        Num(u64),
        Str(String),
    }

    match Option::<Compat>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Compat::Num(n)) => Ok(Some(n)),
        Some(Compat::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
