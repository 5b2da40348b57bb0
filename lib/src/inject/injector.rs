use crate::cil::{Instruction, MethodBody};
use crate::inject::{normalize_exits, NormalizedExits};
use crate::metadata::Token;

/// Wraps method bodies in a begin/end span
///
/// Both callees are `MemberRef` (or `MethodDef`) tokens already valid in the module of the bodies
/// being rewritten.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpanInjector {
    /// `void (string)`
    pub begin: Token,

    /// `void ()`
    pub end: Token,
}

impl SpanInjector {
    pub fn new(begin: Token, end: Token) -> SpanInjector {
        SpanInjector { begin, end }
    }

    /// Wrap the body so that `ldstr <label>; call <begin>` runs first and `call <end>` runs right
    /// before the (single) return
    ///
    /// Jumps back to the first original instruction don't re-open the span. Always reports the
    /// body as changed.
    pub fn inject(&self, body: &mut MethodBody, label: Token) -> bool {
        self.inject_with_exits(body, label);
        true
    }

    /// Same as [`SpanInjector::inject`], but also reports how the exits were rewritten
    pub fn inject_with_exits(&self, body: &mut MethodBody, label: Token) -> NormalizedExits {
        body.insert_at(0, Instruction::ldstr(label));
        body.insert_at(1, Instruction::call(self.begin));

        let exits = normalize_exits(body, self.end);
        body.max_stack = body.max_stack.max(1);
        exits
    }
}

/// Label of the span around a method (eg. `Profilator->Game.Player.Update`)
pub fn span_label(prefix: &str, type_full_name: &str, method_name: &str) -> String {
    format!("{}->{}.{}", prefix, type_full_name, method_name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::{ExceptionHandler, HandlerKind, InstrId, Opcode, Operand};
    use std::collections::HashSet;

    const BEGIN: Token = Token(0x0A00_0001);
    const END: Token = Token(0x0A00_0002);
    const LABEL: Token = Token(0x7000_0001);

    fn injector() -> SpanInjector {
        SpanInjector::new(BEGIN, END)
    }

    fn opcodes(body: &MethodBody) -> Vec<Opcode> {
        body.instructions().map(|(_, insn)| insn.opcode).collect()
    }

    /// Can a `ret` be reached from any entry point without going through `call <end>`?
    fn return_reachable_around(body: &MethodBody, end_call: InstrId) -> bool {
        let mut to_visit: Vec<InstrId> = body.entry_points();
        let mut visited: HashSet<InstrId> = HashSet::new();
        while let Some(id) = to_visit.pop() {
            if id == end_call || !visited.insert(id) {
                continue;
            }
            if body[id].is_return() {
                return true;
            }
            to_visit.extend(body.successors(id));
        }
        false
    }

    fn assert_wrapped(body: &MethodBody, exits: &NormalizedExits) {
        let layout = body.layout();
        assert_eq!(body[layout[0]], Instruction::ldstr(LABEL));
        assert_eq!(body[layout[1]], Instruction::call(BEGIN));
        assert_eq!(
            body.instructions().filter(|(_, insn)| insn.is_return()).count(),
            1
        );
        assert_eq!(body.last(), Some(exits.ret));
        assert_eq!(body.successors(exits.end_call), vec![exits.ret]);
        assert!(!return_reachable_around(body, exits.end_call));
        assert!(body.dangling_references().is_empty());
        assert!(body.max_stack >= 1);
    }

    #[test]
    fn label_format() {
        assert_eq!(
            span_label("Profilator", "Game.Player", "Update"),
            "Profilator->Game.Player.Update"
        );
        assert_eq!(span_label("Profilator", "Hud", "LateUpdate"), "Profilator->Hud.LateUpdate");
    }

    #[test]
    fn empty_body_gets_just_the_span() {
        let mut body = MethodBody::new();
        body.max_stack = 0;
        assert!(injector().inject(&mut body, LABEL));
        assert_eq!(
            body.instructions()
                .map(|(_, insn)| insn.clone())
                .collect::<Vec<_>>(),
            vec![
                Instruction::ldstr(LABEL),
                Instruction::call(BEGIN),
                Instruction::call(END),
                Instruction::ret(),
            ]
        );
        assert_eq!(body.max_stack, 1);
    }

    #[test]
    fn loops_back_to_the_start_do_not_reopen_the_span() {
        // IL_0000: nop
        // IL_0001: ldarg.0
        // IL_0002: brtrue.s IL_0000
        // IL_0004: ret
        let mut body = MethodBody::new();
        let start = body.push(Instruction::simple(Opcode::Nop));
        body.push(Instruction::simple(Opcode::Ldarg_0));
        let back = body.push(Instruction::new(Opcode::Brtrue_S, Operand::Target(start)));
        body.push(Instruction::ret());

        let exits = injector().inject_with_exits(&mut body, LABEL);
        assert_wrapped(&body, &exits);
        assert_eq!(body[back].targets(), vec![start]);
        assert_eq!(body.layout()[2], start);
    }

    #[test]
    fn every_return_goes_through_the_end_call() {
        // if (arg0) return; if (arg1) return; return;
        let mut body = MethodBody::new();
        body.push(Instruction::simple(Opcode::Ldarg_0));
        let first_check = body.push(Instruction::simple(Opcode::Nop));
        body.push(Instruction::ret());
        let second = body.push(Instruction::simple(Opcode::Ldarg_1));
        let second_check = body.push(Instruction::simple(Opcode::Nop));
        body.push(Instruction::ret());
        let last = body.push(Instruction::ret());
        *body.instruction_mut(first_check) =
            Instruction::new(Opcode::Brfalse_S, Operand::Target(second));
        *body.instruction_mut(second_check) =
            Instruction::new(Opcode::Brfalse_S, Operand::Target(last));

        let exits = injector().inject_with_exits(&mut body, LABEL);
        assert_eq!(exits.returns_rewritten, 3);
        assert_wrapped(&body, &exits);
        assert_eq!(
            body[second_check].targets(),
            vec![exits.canonical_tail_jump.unwrap()]
        );
    }

    #[test]
    fn returns_inside_protected_regions() {
        // try { ldarg.0; brfalse.s L; ret; L: leave.s END } finally { endfinally }  END: ret
        let mut body = MethodBody::new();
        let try_start = body.push(Instruction::simple(Opcode::Ldarg_0));
        let check = body.push(Instruction::simple(Opcode::Nop));
        body.push(Instruction::ret());
        let leave = body.push(Instruction::simple(Opcode::Nop));
        let finally = body.push(Instruction::simple(Opcode::Endfinally));
        let end = body.push(Instruction::ret());
        *body.instruction_mut(check) = Instruction::new(Opcode::Brfalse_S, Operand::Target(leave));
        *body.instruction_mut(leave) = Instruction::leave(end);
        body.handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start,
            try_end: Some(finally),
            handler_start: finally,
            handler_end: Some(end),
        });

        let exits = injector().inject_with_exits(&mut body, LABEL);
        assert_wrapped(&body, &exits);
        assert_eq!(
            opcodes(&body),
            vec![
                Opcode::Ldstr,
                Opcode::Call,
                Opcode::Ldarg_0,
                Opcode::Brfalse_S,
                Opcode::Leave_S,
                Opcode::Leave_S,
                Opcode::Endfinally,
                Opcode::Leave_S,
                Opcode::Call,
                Opcode::Ret,
            ]
        );
        // the span opens outside the protected region
        assert_eq!(body.handlers[0].try_start, try_start);
    }

    #[test]
    fn bodies_without_returns_still_get_a_tail() {
        let mut body = MethodBody::new();
        body.push(Instruction::simple(Opcode::Ldnull));
        body.push(Instruction::simple(Opcode::Throw));

        let exits = injector().inject_with_exits(&mut body, LABEL);
        assert_eq!(exits.returns_rewritten, 0);
        assert_eq!(exits.canonical_tail_jump, None);
        assert_eq!(
            opcodes(&body),
            vec![
                Opcode::Ldstr,
                Opcode::Call,
                Opcode::Ldnull,
                Opcode::Throw,
                Opcode::Call,
                Opcode::Ret,
            ]
        );
    }

    #[test]
    fn single_return_body() {
        let mut body = MethodBody::new();
        body.push(Instruction::ret());
        let exits = injector().inject_with_exits(&mut body, LABEL);
        assert_wrapped(&body, &exits);
        assert_eq!(
            opcodes(&body),
            vec![
                Opcode::Ldstr,
                Opcode::Call,
                Opcode::Leave_S,
                Opcode::Call,
                Opcode::Ret
            ]
        );
    }
}
