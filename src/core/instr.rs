// This module provides the instruction list the engine operates on, standing in for the
// host's block representation. An InstrList is an ordered sequence of Instr nodes, each
// with a process-unique InstrId so that identities survive insertion and never collide
// between copies of the same block. Nodes are either application instructions decoded
// from the original block, meta instructions added by the engine or by instrumentation
// (both wrapping iced_x86::Instruction), labels, label-targeted jumps used by dispatch,
// or clean calls into Rust runtime helpers. `duplicate` produces a structurally
// independent copy with fresh ids and remapped labels. `decode_block` plays the role of
// the host's block builder: it decodes x86-64 bytes up to and including the first
// control-transfer instruction.

//! Instruction lists and block decoding.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};

use super::error::{DupError, DupResult};
use super::slot::RuntimeCtx;

static NEXT_INSTR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LABEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one instruction node, unique for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u64);

impl InstrId {
    fn fresh() -> Self {
        Self(NEXT_INSTR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A jump target inside an instruction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(u64);

impl LabelId {
    /// Allocate a new, unplaced label.
    pub fn fresh() -> Self {
        Self(NEXT_LABEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Jump conditions for label-targeted branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
}

/// Signature of a Rust runtime helper reached through a clean call.
pub type CleanCallFn = dyn Fn(&RuntimeCtx<'_>) + Send + Sync;

/// A call from generated code into a Rust helper with the application state
/// saved around it. The host lowers it; `target` is the helper's address in
/// the code cache, or zero until the host resolves it.
#[derive(Clone)]
pub struct CleanCall {
    name: String,
    target: u64,
    callee: Arc<CleanCallFn>,
}

impl CleanCall {
    pub fn new<F>(name: impl Into<String>, callee: F) -> Self
    where
        F: Fn(&RuntimeCtx<'_>) + Send + Sync + 'static,
    {
        Self { name: name.into(), target: 0, callee: Arc::new(callee) }
    }

    /// Set the address the call lowers to.
    pub fn with_target(mut self, target: u64) -> Self {
        self.target = target;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Run the helper.
    pub fn invoke(&self, ctx: &RuntimeCtx<'_>) {
        (self.callee)(ctx)
    }
}

impl fmt::Debug for CleanCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanCall")
            .field("name", &self.name)
            .field("target", &format_args!("{:#x}", self.target))
            .finish()
    }
}

/// What an instruction node holds.
#[derive(Debug, Clone)]
pub enum InstrKind {
    /// Application instruction from the original block.
    App(Instruction),
    /// Instruction added by the engine or by instrumentation.
    Meta(Instruction),
    /// Placement of a jump target.
    Label(LabelId),
    /// Jump to a label, unconditional when `cond` is `None`.
    Jump { cond: Option<JumpCondition>, target: LabelId },
    /// Call into a Rust runtime helper.
    CleanCall(CleanCall),
}

/// One node of an [`InstrList`].
#[derive(Debug, Clone)]
pub struct Instr {
    id: InstrId,
    kind: InstrKind,
}

impl Instr {
    fn new(kind: InstrKind) -> Self {
        Self { id: InstrId::fresh(), kind }
    }

    pub fn app(instruction: Instruction) -> Self {
        Self::new(InstrKind::App(instruction))
    }

    pub fn meta(instruction: Instruction) -> Self {
        Self::new(InstrKind::Meta(instruction))
    }

    pub fn label(label: LabelId) -> Self {
        Self::new(InstrKind::Label(label))
    }

    pub fn jump(target: LabelId) -> Self {
        Self::new(InstrKind::Jump { cond: None, target })
    }

    pub fn jump_if(cond: JumpCondition, target: LabelId) -> Self {
        Self::new(InstrKind::Jump { cond: Some(cond), target })
    }

    pub fn clean_call(call: CleanCall) -> Self {
        Self::new(InstrKind::CleanCall(call))
    }

    pub fn id(&self) -> InstrId {
        self.id
    }

    pub fn kind(&self) -> &InstrKind {
        &self.kind
    }

    pub fn is_app(&self) -> bool {
        matches!(self.kind, InstrKind::App(_))
    }

    /// The machine instruction for app and meta nodes.
    pub fn instruction(&self) -> Option<&Instruction> {
        match &self.kind {
            InstrKind::App(i) | InstrKind::Meta(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InstrKind::App(i) => write!(f, "    {i}"),
            InstrKind::Meta(i) => write!(f, "  m {i}"),
            InstrKind::Label(l) => write!(f, "{l}:"),
            InstrKind::Jump { cond: None, target } => write!(f, "  m jmp {target}"),
            InstrKind::Jump { cond: Some(JumpCondition::Equal), target } => {
                write!(f, "  m je {target}")
            }
            InstrKind::Jump { cond: Some(JumpCondition::NotEqual), target } => {
                write!(f, "  m jne {target}")
            }
            InstrKind::CleanCall(c) => write!(f, "  m call <{}>", c.name),
        }
    }
}

/// Ordered list of instruction nodes.
#[derive(Debug, Default)]
pub struct InstrList {
    instrs: Vec<Instr>,
}

impl InstrList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list of app instructions.
    pub fn from_app<I>(instructions: I) -> Self
    where
        I: IntoIterator<Item = Instruction>,
    {
        Self { instrs: instructions.into_iter().map(Instr::app).collect() }
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instr> + '_ {
        self.instrs.iter()
    }

    /// Append a node, returning its id.
    pub fn push(&mut self, instr: Instr) -> InstrId {
        let id = instr.id;
        self.instrs.push(instr);
        id
    }

    /// Move every node of `other` to the end of this list.
    pub fn append(&mut self, other: InstrList) {
        self.instrs.extend(other.instrs);
    }

    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.instrs.iter().position(|i| i.id == id)
    }

    pub fn contains(&self, id: InstrId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: InstrId) -> Option<&Instr> {
        self.instrs.iter().find(|i| i.id == id)
    }

    /// Insert `instr` immediately before `at`.
    pub fn insert_before(&mut self, at: InstrId, instr: Instr) -> DupResult<InstrId> {
        let pos = self
            .position(at)
            .ok_or_else(|| DupError::invalid(format!("instruction {at} is not in this list")))?;
        let id = instr.id;
        self.instrs.insert(pos, instr);
        Ok(id)
    }

    /// Insert `instr` immediately after `at`.
    pub fn insert_after(&mut self, at: InstrId, instr: Instr) -> DupResult<InstrId> {
        let pos = self
            .position(at)
            .ok_or_else(|| DupError::invalid(format!("instruction {at} is not in this list")))?;
        let id = instr.id;
        self.instrs.insert(pos + 1, instr);
        Ok(id)
    }

    /// Ids of the app instructions in program order.
    pub fn app_ids(&self) -> Vec<InstrId> {
        self.instrs.iter().filter(|i| i.is_app()).map(|i| i.id).collect()
    }

    pub fn first_app(&self) -> Option<&Instr> {
        self.instrs.iter().find(|i| i.is_app())
    }

    pub fn last_app(&self) -> Option<&Instr> {
        self.instrs.iter().rev().find(|i| i.is_app())
    }

    /// Address following the last app instruction.
    pub fn fallthrough_pc(&self) -> Option<u64> {
        self.last_app().and_then(Instr::instruction).map(Instruction::next_ip)
    }

    /// Whether execution can continue past the end of the list.
    pub fn falls_through(&self) -> bool {
        match self.last_app().and_then(Instr::instruction) {
            Some(i) => !matches!(
                i.flow_control(),
                FlowControl::Return
                    | FlowControl::UnconditionalBranch
                    | FlowControl::IndirectBranch
                    | FlowControl::Exception
            ),
            None => true,
        }
    }

    /// Structurally independent copy: fresh ids, labels remapped.
    pub fn duplicate(&self) -> InstrList {
        let mut labels: HashMap<LabelId, LabelId> = HashMap::new();
        let mut remap = |l: LabelId| *labels.entry(l).or_insert_with(LabelId::fresh);

        let instrs = self
            .instrs
            .iter()
            .map(|i| {
                let kind = match &i.kind {
                    InstrKind::Label(l) => InstrKind::Label(remap(*l)),
                    InstrKind::Jump { cond, target } => {
                        InstrKind::Jump { cond: *cond, target: remap(*target) }
                    }
                    other => other.clone(),
                };
                Instr::new(kind)
            })
            .collect();
        InstrList { instrs }
    }
}

impl fmt::Display for InstrList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instr in &self.instrs {
            writeln!(f, "{instr}")?;
        }
        Ok(())
    }
}

/// Decode one basic block starting at `pc`.
///
/// Decoding stops after the first control-transfer instruction or at the end
/// of `bytes`.
pub fn decode_block(bytes: &[u8], pc: u64) -> DupResult<InstrList> {
    let mut decoder = Decoder::with_ip(64, bytes, pc, DecoderOptions::NONE);
    let mut list = InstrList::new();

    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(DupError::invalid(format!(
                "undecodable instruction at {:#x}",
                instruction.ip()
            )));
        }
        let ends_block = instruction.flow_control() != FlowControl::Next;
        list.push(Instr::app(instruction));
        if ends_block {
            break;
        }
    }

    if list.is_empty() {
        return Err(DupError::invalid("empty basic block"));
    }
    log::trace!("decoded {} instructions at {:#x}", list.len(), pc);
    Ok(list)
}
