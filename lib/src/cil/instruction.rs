use crate::cil::{FlowKind, Opcode, OperandKind};
use crate::metadata::Token;
use std::fmt;

/// Handle to an instruction inside a [`MethodBody`](crate::cil::MethodBody) arena
///
/// Handles are never reused within a body. Replacing an instruction mints a new handle and leaves
/// the old one detached, so anything still pointing at the old handle has to be redirected.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InstrId(pub(crate) u32);

impl InstrId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for InstrId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("i{}", self.0))
    }
}

/// Inline operand of an instruction
///
/// Branch operands are handles into the same body rather than byte offsets.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    Int8(i8),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// Argument or local slot (covers both the short and long forms)
    Var(u16),
    /// Method, field, type, or signature token
    Token(Token),
    /// User-string token (only for `ldstr`)
    String(Token),
    Target(InstrId),
    Switch(Vec<InstrId>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: Opcode, operand: Operand) -> Instruction {
        Instruction { opcode, operand }
    }

    /// Instruction without an inline operand
    pub fn simple(opcode: Opcode) -> Instruction {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::None);
        Instruction::new(opcode, Operand::None)
    }

    pub fn ret() -> Instruction {
        Instruction::simple(Opcode::Ret)
    }

    pub fn call(method: Token) -> Instruction {
        Instruction::new(Opcode::Call, Operand::Token(method))
    }

    pub fn ldstr(string: Token) -> Instruction {
        Instruction::new(Opcode::Ldstr, Operand::String(string))
    }

    /// Short `leave`; the encoder widens it if the target ends up out of range
    pub fn leave(target: InstrId) -> Instruction {
        Instruction::new(Opcode::Leave_S, Operand::Target(target))
    }

    /// Short `br`; the encoder widens it if the target ends up out of range
    pub fn br(target: InstrId) -> Instruction {
        Instruction::new(Opcode::Br_S, Operand::Target(target))
    }

    pub fn is_return(&self) -> bool {
        self.opcode == Opcode::Ret
    }

    pub fn flow(&self) -> FlowKind {
        self.opcode.flow()
    }

    /// Instructions this one can jump to (not including fall-through)
    pub fn targets(&self) -> Vec<InstrId> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => vec![],
        }
    }

    /// Rewrite any jump to `from` so that it goes to `to` instead
    ///
    /// Returns how many targets were rewritten.
    pub fn redirect(&mut self, from: InstrId, to: InstrId) -> usize {
        match &mut self.operand {
            Operand::Target(target) if *target == from => {
                *target = to;
                1
            }
            Operand::Switch(targets) => {
                let mut rewritten = 0;
                for target in targets.iter_mut().filter(|target| **target == from) {
                    *target = to;
                    rewritten += 1;
                }
                rewritten
            }
            _ => 0,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Int8(value) => write!(f, " {}", value),
            Operand::Int32(value) => write!(f, " {}", value),
            Operand::Int64(value) => write!(f, " {}", value),
            Operand::Float32(value) => write!(f, " {}", value),
            Operand::Float64(value) => write!(f, " {}", value),
            Operand::Var(slot) => write!(f, " {}", slot),
            Operand::Token(token) | Operand::String(token) => write!(f, " {:?}", token),
            Operand::Target(target) => write!(f, " {:?}", target),
            Operand::Switch(targets) => write!(f, " {:?}", targets),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redirect_rewrites_every_matching_target() {
        let mut switch = Instruction::new(
            Opcode::Switch,
            Operand::Switch(vec![InstrId(3), InstrId(1), InstrId(3)]),
        );
        assert_eq!(switch.redirect(InstrId(3), InstrId(7)), 2);
        assert_eq!(switch.targets(), vec![InstrId(7), InstrId(1), InstrId(7)]);

        let mut branch = Instruction::br(InstrId(1));
        assert_eq!(branch.redirect(InstrId(3), InstrId(7)), 0);
        assert_eq!(branch.redirect(InstrId(1), InstrId(7)), 1);
        assert_eq!(branch.targets(), vec![InstrId(7)]);
    }

    #[test]
    fn display() {
        assert_eq!(Instruction::ldstr(Token(0x7000_0001)).to_string(), "ldstr 0x70000001");
        assert_eq!(Instruction::leave(InstrId(4)).to_string(), "leave.s i4");
        assert_eq!(Instruction::ret().to_string(), "ret");
    }
}
