use crate::cil::{InstrId, Instruction, MethodBody, Opcode};
use crate::metadata::Token;

/// What [`normalize_exits`] did to a body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedExits {
    /// Number of `ret` instructions turned into jumps to the tail
    pub returns_rewritten: usize,

    /// The appended `call <end>`
    pub end_call: InstrId,

    /// The appended `ret` (the only one left in the body)
    pub ret: InstrId,

    /// Replacement of the original last instruction, if that was a `ret`
    pub canonical_tail_jump: Option<InstrId>,

    /// Number of `tail.` prefixes turned into `nop` because their call no longer returns directly
    pub tail_prefixes_dropped: usize,
}

/// Funnel every return of a body through a single `call <end>; ret` tail
///
/// The tail is appended to the body, and every `ret` before it is replaced with a `leave` to the
/// `call <end>`. `leave` is used rather than `br` since a `ret` may well be inside a protected
/// region (and `leave` out of a region is the only legal way to jump to the tail). Anything that
/// referred to a replaced `ret` (branches, `switch` tables, handler boundaries, sequence points)
/// is pointed at its replacement.
///
/// Handler ranges that ran to the end of the body are closed right before the tail, so the tail
/// itself is never protected.
///
/// A `tail.` prefix is only valid on a call that is immediately followed by `ret`. When such a
/// `ret` gets replaced, the prefix is overwritten with a `nop` in place (keeping its handle, so
/// nothing needs redirecting) and the call becomes an ordinary one.
pub fn normalize_exits(body: &mut MethodBody, end: Token) -> NormalizedExits {
    let original_tail: Option<InstrId> = body.last();
    let original_len = body.len();

    let end_call = body.push(Instruction::call(end));
    let ret = body.push(Instruction::ret());
    for handler in &mut body.handlers {
        handler.close_at(end_call);
    }

    let mut replaced: Vec<(InstrId, InstrId)> = vec![];
    let mut tail_prefixes_dropped = 0;
    for position in 0..original_len {
        let id = body.layout()[position];
        if body[id].is_return() {
            if let Some(prefix) = tail_prefix_before(body, position) {
                *body.instruction_mut(prefix) = Instruction::simple(Opcode::Nop);
                tail_prefixes_dropped += 1;
            }
            let jump = body.replace_at(position, Instruction::leave(end_call));
            replaced.push((id, jump));
        }
    }
    if tail_prefixes_dropped > 0 {
        log::debug!("Dropped {} tail call prefix(es)", tail_prefixes_dropped);
    }

    let canonical_tail_jump = original_tail.and_then(|tail| {
        replaced
            .iter()
            .find(|(old, _)| *old == tail)
            .map(|(_, jump)| *jump)
    });
    if canonical_tail_jump.is_none() {
        log::debug!(
            "Last instruction is not a return ({}), no canonical tail jump",
            original_tail.map_or_else(|| String::from("empty body"), |tail| body[tail].to_string())
        );
    }

    // Appended instructions never refer to a replaced `ret`, so this only touches the original
    // instructions, handlers, and sequence points
    for (old, jump) in &replaced {
        let redirected = body.redirect(*old, *jump);
        if redirected > 0 {
            log::trace!("Redirected {} reference(s) from {:?} to {:?}", redirected, old, jump);
        }
    }

    NormalizedExits {
        returns_rewritten: replaced.len(),
        end_call,
        ret,
        canonical_tail_jump,
        tail_prefixes_dropped,
    }
}

/// `tail.` prefix of the call right before the `ret` at `position`, if there is one
fn tail_prefix_before(body: &MethodBody, position: usize) -> Option<InstrId> {
    let layout = body.layout();
    if position < 2 {
        return None;
    }
    let call = &body[layout[position - 1]];
    let prefix = layout[position - 2];
    let is_call = matches!(call.opcode, Opcode::Call | Opcode::Callvirt | Opcode::Calli);
    if is_call && body[prefix].opcode == Opcode::Tail {
        Some(prefix)
    } else {
        None
    }
}
