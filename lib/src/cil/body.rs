use crate::cil::{FlowKind, InstrId, Instruction};
use crate::metadata::Token;
use crate::symbols::SequencePoint;
use crate::Error;
use std::collections::HashSet;
use std::ops::Index;

/// What an exception handler does once control reaches it
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandlerKind {
    /// Catches exceptions of the given class
    Catch(Token),
    /// Catches exceptions accepted by the filter block starting at the given instruction
    Filter(InstrId),
    Finally,
    Fault,
}

/// Protected region and its handler
///
/// Ranges are half-open: they start at the `*_start` instruction and stop right before the
/// `*_end` instruction, where `None` means "until the end of the body".
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: InstrId,
    pub try_end: Option<InstrId>,
    pub handler_start: InstrId,
    pub handler_end: Option<InstrId>,
}

impl ExceptionHandler {
    /// Every instruction handle the handler refers to
    pub fn handles(&self) -> Vec<InstrId> {
        let mut handles = vec![self.try_start, self.handler_start];
        handles.extend(self.try_end);
        handles.extend(self.handler_end);
        if let HandlerKind::Filter(filter_start) = self.kind {
            handles.push(filter_start);
        }
        handles
    }

    /// Rewrite boundaries at `from` so they are at `to` instead
    pub fn redirect(&mut self, from: InstrId, to: InstrId) -> usize {
        let mut rewritten = 0;
        let mut swap = |handle: &mut InstrId| {
            if *handle == from {
                *handle = to;
                rewritten += 1;
            }
        };
        swap(&mut self.try_start);
        swap(&mut self.handler_start);
        if let Some(try_end) = &mut self.try_end {
            swap(try_end);
        }
        if let Some(handler_end) = &mut self.handler_end {
            swap(handler_end);
        }
        if let HandlerKind::Filter(filter_start) = &mut self.kind {
            swap(filter_start);
        }
        rewritten
    }

    /// Turn any range running to the end of the body into one that stops right before `end`
    pub fn close_at(&mut self, end: InstrId) {
        self.try_end.get_or_insert(end);
        self.handler_end.get_or_insert(end);
    }
}

/// Decoded method body
///
/// Instructions live in an arena and are addressed by [`InstrId`] handles; the layout is the
/// order in which they are laid out in the IL stream. Branch operands, exception handler
/// boundaries, and sequence points all refer to instructions through handles, so moving an
/// instruction around the layout never invalidates them. Replacing one does (see
/// [`MethodBody::replace_at`] and [`MethodBody::redirect`]).
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody {
    arena: Vec<Instruction>,
    layout: Vec<InstrId>,

    pub handlers: Vec<ExceptionHandler>,

    /// Source positions attached to instructions (the offsets inside are stale until encoding)
    pub sequence_points: Vec<(InstrId, SequencePoint)>,

    pub max_stack: u16,
    pub init_locals: bool,
    pub local_var_sig: Token,

    /// Offsets the instructions were decoded from
    origins: Vec<(InstrId, u32)>,
    original_len: u32,
}

impl Default for MethodBody {
    fn default() -> Self {
        MethodBody::new()
    }
}

impl MethodBody {
    /// New empty body
    pub fn new() -> MethodBody {
        MethodBody {
            arena: vec![],
            layout: vec![],
            handlers: vec![],
            sequence_points: vec![],
            max_stack: 8,
            init_locals: false,
            local_var_sig: Token::NULL,
            origins: vec![],
            original_len: 0,
        }
    }

    /// Add an instruction to the arena without placing it in the layout
    pub(crate) fn alloc(&mut self, instruction: Instruction) -> InstrId {
        let id = InstrId(self.arena.len() as u32);
        self.arena.push(instruction);
        id
    }

    pub(crate) fn set_layout(&mut self, layout: Vec<InstrId>) {
        self.layout = layout;
    }

    pub(crate) fn set_origins(&mut self, origins: Vec<(InstrId, u32)>, original_len: u32) {
        self.origins = origins;
        self.original_len = original_len;
    }

    pub(crate) fn origins(&self) -> &[(InstrId, u32)] {
        &self.origins
    }

    pub(crate) fn original_len(&self) -> u32 {
        self.original_len
    }

    /// Number of instructions in the layout
    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn layout(&self) -> &[InstrId] {
        &self.layout
    }

    /// Instructions in layout order
    pub fn instructions(&self) -> impl Iterator<Item = (InstrId, &Instruction)> + '_ {
        self.layout.iter().map(move |id| (*id, &self.arena[id.index()]))
    }

    pub fn first(&self) -> Option<InstrId> {
        self.layout.first().copied()
    }

    pub fn last(&self) -> Option<InstrId> {
        self.layout.last().copied()
    }

    /// Where in the layout an instruction is (`None` if it isn't placed)
    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.layout.iter().position(|placed| *placed == id)
    }

    pub fn contains(&self, id: InstrId) -> bool {
        self.position(id).is_some()
    }

    pub fn instruction_mut(&mut self, id: InstrId) -> &mut Instruction {
        &mut self.arena[id.index()]
    }

    /// Add an instruction to the end of the layout
    pub fn push(&mut self, instruction: Instruction) -> InstrId {
        let id = self.alloc(instruction);
        self.layout.push(id);
        id
    }

    /// Add an instruction at a layout position, shifting everything after it
    ///
    /// Jumps to the instruction previously at that position keep going to it.
    pub fn insert_at(&mut self, position: usize, instruction: Instruction) -> InstrId {
        let id = self.alloc(instruction);
        self.layout.insert(position, id);
        id
    }

    /// Add an instruction right before `anchor`
    ///
    /// Jumps to `anchor` keep going to `anchor`.
    pub fn insert_before(
        &mut self,
        anchor: InstrId,
        instruction: Instruction,
    ) -> Result<InstrId, Error> {
        let position = self
            .position(anchor)
            .ok_or(Error::UnresolvedHandle(anchor))?;
        Ok(self.insert_at(position, instruction))
    }

    /// Swap out the instruction at a layout position for a new one
    ///
    /// The replacement gets a fresh handle and the old handle is detached from the layout. Any
    /// reference to the old handle is left alone: use [`MethodBody::redirect`] to move them over.
    pub fn replace_at(&mut self, position: usize, instruction: Instruction) -> InstrId {
        let id = self.alloc(instruction);
        self.layout[position] = id;
        id
    }

    /// Rewrite every reference to `from` (branch targets, handler boundaries, sequence points)
    /// so that it refers to `to`
    ///
    /// Returns the number of references rewritten. If `from` was decoded from the original code,
    /// `to` takes over its original offset.
    pub fn redirect(&mut self, from: InstrId, to: InstrId) -> usize {
        let mut rewritten = 0;
        for id in &self.layout {
            rewritten += self.arena[id.index()].redirect(from, to);
        }
        for handler in &mut self.handlers {
            rewritten += handler.redirect(from, to);
        }
        for (at, _) in &mut self.sequence_points {
            if *at == from {
                *at = to;
                rewritten += 1;
            }
        }
        for (id, _) in &mut self.origins {
            if *id == from {
                *id = to;
            }
        }
        rewritten
    }

    /// Instructions control can flow to after `id`
    pub fn successors(&self, id: InstrId) -> Vec<InstrId> {
        let instruction = &self[id];
        let fall_through = || {
            self.position(id)
                .and_then(|position| self.layout.get(position + 1))
                .copied()
        };
        match instruction.flow() {
            FlowKind::Next => fall_through().into_iter().collect(),
            FlowKind::Branch => instruction.targets(),
            FlowKind::CondBranch => {
                let mut successors = instruction.targets();
                successors.extend(fall_through());
                successors
            }
            FlowKind::Return | FlowKind::Exit => vec![],
        }
    }

    /// Places where execution can start: the first instruction, then handler and filter blocks
    pub fn entry_points(&self) -> Vec<InstrId> {
        let mut entries: Vec<InstrId> = self.first().into_iter().collect();
        for handler in &self.handlers {
            entries.push(handler.handler_start);
            if let HandlerKind::Filter(filter_start) = handler.kind {
                entries.push(filter_start);
            }
        }
        entries
    }

    /// Handles that are referenced from somewhere in the body but are not in the layout
    pub fn dangling_references(&self) -> Vec<InstrId> {
        let placed: HashSet<InstrId> = self.layout.iter().copied().collect();
        let mut referenced: Vec<InstrId> = vec![];
        for (_, instruction) in self.instructions() {
            referenced.extend(instruction.targets());
        }
        for handler in &self.handlers {
            referenced.extend(handler.handles());
        }
        referenced.extend(self.sequence_points.iter().map(|(at, _)| *at));

        let mut seen = HashSet::new();
        referenced
            .into_iter()
            .filter(|id| !placed.contains(id) && seen.insert(*id))
            .collect()
    }
}

impl Index<InstrId> for MethodBody {
    type Output = Instruction;

    fn index(&self, id: InstrId) -> &Instruction {
        &self.arena[id.index()]
    }
}
