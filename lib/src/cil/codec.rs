//! Conversion between raw IL bytes and [`MethodBody`]
//!
//! ### Decoding
//!
//! Decoding is two passes: the first walks the byte stream and records every instruction with
//! its branch targets still as absolute byte offsets, the second maps those offsets onto
//! instruction handles. A target that doesn't land on an instruction boundary is an error.
//!
//! ### Encoding
//!
//! Encoding has to pick between the short (`br.s`, 1-byte displacement) and long (`br`, 4-byte
//! displacement) form of each branch. Instructions keep whatever form they already have, and
//! short branches whose displacement doesn't fit are widened. Widening makes the code longer,
//! which can push other short branches out of range, so this repeats until nothing changes.
//! That always terminates because branches are only ever widened, never narrowed.

use crate::cil::{ExceptionHandler, HandlerKind, InstrId, Instruction, MethodBody, Opcode};
use crate::cil::{Operand, OperandKind};
use crate::metadata::{RawBody, RawClause, Token};
use crate::symbols::SequencePoint;
use crate::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

/// Operand whose branch targets haven't been resolved yet
enum PendingOperand {
    Ready(Operand),
    Target(i64),
    Switch(Vec<i64>),
}

impl MethodBody {
    /// Decode raw IL, attaching the given sequence points to the instructions at their offsets
    pub fn decode(raw: &RawBody, sequence_points: &[SequencePoint]) -> Result<MethodBody, Error> {
        let pending = read_instructions(&raw.code)?;

        // Handles are handed out in decoding order, so they can be computed up front
        let offsets: HashMap<u32, InstrId> = pending
            .iter()
            .enumerate()
            .map(|(idx, (offset, _, _))| (*offset, InstrId(idx as u32)))
            .collect();
        let resolve = |offset: u32, target: i64| -> Result<InstrId, Error> {
            u32::try_from(target)
                .ok()
                .and_then(|target| offsets.get(&target))
                .copied()
                .ok_or(Error::BranchOutOfBody { offset, target })
        };
        let resolve_end = |offset: u32, target: u32| -> Result<Option<InstrId>, Error> {
            if target as usize == raw.code.len() {
                Ok(None)
            } else {
                resolve(offset, target as i64).map(Some)
            }
        };

        let mut body = MethodBody::new();
        body.max_stack = raw.max_stack;
        body.init_locals = raw.init_locals;
        body.local_var_sig = raw.local_var_sig;

        let mut layout = Vec::with_capacity(pending.len());
        let mut origins = Vec::with_capacity(pending.len());
        for (offset, opcode, operand) in pending {
            let operand = match operand {
                PendingOperand::Ready(operand) => operand,
                PendingOperand::Target(target) => Operand::Target(resolve(offset, target)?),
                PendingOperand::Switch(targets) => Operand::Switch(
                    targets
                        .into_iter()
                        .map(|target| resolve(offset, target))
                        .collect::<Result<_, _>>()?,
                ),
            };
            let id = body.alloc(Instruction::new(opcode, operand));
            layout.push(id);
            origins.push((id, offset));
        }
        body.set_layout(layout);
        body.set_origins(origins, raw.code.len() as u32);

        for clause in &raw.clauses {
            let at = clause.try_offset;
            let kind = match clause.kind {
                RawClause::CATCH => HandlerKind::Catch(Token(clause.class_or_filter)),
                RawClause::FILTER => {
                    HandlerKind::Filter(resolve(at, clause.class_or_filter as i64)?)
                }
                RawClause::FINALLY => HandlerKind::Finally,
                RawClause::FAULT => HandlerKind::Fault,
                other => return Err(Error::InvalidClause(other)),
            };
            // Lengths come straight from the file, so the ends may not even fit in a `u32`
            let end_of = |start: u32, length: u32| -> Result<u32, Error> {
                start.checked_add(length).ok_or(Error::BranchOutOfBody {
                    offset: at,
                    target: start as i64 + length as i64,
                })
            };
            body.handlers.push(ExceptionHandler {
                kind,
                try_start: resolve(at, clause.try_offset as i64)?,
                try_end: resolve_end(at, end_of(clause.try_offset, clause.try_length)?)?,
                handler_start: resolve(at, clause.handler_offset as i64)?,
                handler_end: resolve_end(
                    at,
                    end_of(clause.handler_offset, clause.handler_length)?,
                )?,
            });
        }

        for point in sequence_points {
            let at = offsets.get(&point.il_offset).copied().ok_or_else(|| {
                Error::InvalidSymbols(format!(
                    "sequence point at IL_{:04x} is not on an instruction boundary",
                    point.il_offset
                ))
            })?;
            body.sequence_points.push((at, point.clone()));
        }

        Ok(body)
    }

    /// Encode back into raw IL
    ///
    /// Also returns the sequence points with their offsets updated to the new layout.
    pub fn encode(&self) -> Result<(RawBody, Vec<SequencePoint>), Error> {
        let (raw, sequence_points, _) = self.encode_with_offsets()?;
        Ok((raw, sequence_points))
    }

    /// Same as [`MethodBody::encode`], but also reporting where the decoded instructions moved
    pub fn encode_with_offsets(&self) -> Result<(RawBody, Vec<SequencePoint>, OffsetMap), Error> {
        if let Some(dangling) = self.dangling_references().first() {
            return Err(Error::UnresolvedHandle(*dangling));
        }

        // Worst case is every branch in its long form
        let upper_bound: usize = self
            .instructions()
            .map(|(_, insn)| width(insn.opcode.widened().unwrap_or(insn.opcode), &insn.operand))
            .sum();
        if upper_bound > i32::MAX as usize {
            return Err(Error::CodeTooLarge(upper_bound));
        }

        let positions: HashMap<InstrId, usize> = self
            .layout()
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect();
        let (opcodes, offsets) = self.select_branch_forms(&positions);
        let code_len = offsets[self.len()] as usize;

        let mut code: Vec<u8> = Vec::with_capacity(code_len);
        for (position, (_, instruction)) in self.instructions().enumerate() {
            let opcode = opcodes[position];
            let next = offsets[position + 1] as i64;
            let displacement = |target: &InstrId| offsets[positions[target]] as i64 - next;

            let encoding = opcode.encoding();
            if opcode.width() == 2 {
                code.write_u8(Opcode::EXTENDED_PREFIX)?;
            }
            code.write_u8((encoding & 0xFF) as u8)?;

            match (opcode.operand_kind(), &instruction.operand) {
                (OperandKind::None, Operand::None) => (),
                (OperandKind::ShortInt, Operand::Int8(value)) => code.write_i8(*value)?,
                (OperandKind::Int, Operand::Int32(value)) => {
                    code.write_i32::<LittleEndian>(*value)?
                }
                (OperandKind::Long, Operand::Int64(value)) => {
                    code.write_i64::<LittleEndian>(*value)?
                }
                (OperandKind::ShortFloat, Operand::Float32(value)) => {
                    code.write_f32::<LittleEndian>(*value)?
                }
                (OperandKind::Float, Operand::Float64(value)) => {
                    code.write_f64::<LittleEndian>(*value)?
                }
                (OperandKind::ShortVar, Operand::Var(slot)) => {
                    let slot = u8::try_from(*slot).map_err(|_| Error::MismatchedOperand(opcode))?;
                    code.write_u8(slot)?
                }
                (OperandKind::Var, Operand::Var(slot)) => code.write_u16::<LittleEndian>(*slot)?,
                (OperandKind::Token, Operand::Token(token))
                | (OperandKind::String, Operand::String(token)) => {
                    code.write_u32::<LittleEndian>(token.0)?
                }
                (OperandKind::ShortBranch, Operand::Target(target)) => {
                    code.write_i8(displacement(target) as i8)?
                }
                (OperandKind::Branch, Operand::Target(target)) => {
                    code.write_i32::<LittleEndian>(displacement(target) as i32)?
                }
                (OperandKind::Switch, Operand::Switch(targets)) => {
                    code.write_u32::<LittleEndian>(targets.len() as u32)?;
                    for target in targets {
                        code.write_i32::<LittleEndian>(displacement(target) as i32)?;
                    }
                }
                _ => return Err(Error::MismatchedOperand(opcode)),
            }
        }
        debug_assert_eq!(code.len(), code_len);

        let offset_of = |id: InstrId| offsets[positions[&id]];
        let end_offset = |id: Option<InstrId>| id.map_or(code_len as u32, offset_of);
        let clauses = self
            .handlers
            .iter()
            .map(|handler| {
                let try_offset = offset_of(handler.try_start);
                let handler_offset = offset_of(handler.handler_start);
                let (kind, class_or_filter) = match handler.kind {
                    HandlerKind::Catch(token) => (RawClause::CATCH, token.0),
                    HandlerKind::Filter(filter_start) => {
                        (RawClause::FILTER, offset_of(filter_start))
                    }
                    HandlerKind::Finally => (RawClause::FINALLY, 0),
                    HandlerKind::Fault => (RawClause::FAULT, 0),
                };
                RawClause {
                    kind,
                    try_offset,
                    try_length: end_offset(handler.try_end) - try_offset,
                    handler_offset,
                    handler_length: end_offset(handler.handler_end) - handler_offset,
                    class_or_filter,
                }
            })
            .collect();

        let mut sequence_points: Vec<SequencePoint> = self
            .sequence_points
            .iter()
            .map(|(at, point)| SequencePoint {
                il_offset: offset_of(*at),
                ..point.clone()
            })
            .collect();
        sequence_points.sort_by_key(|point| point.il_offset);

        let mut moved: Vec<(u32, u32)> = self
            .origins()
            .iter()
            .filter_map(|(id, original)| {
                positions
                    .get(id)
                    .map(|position| (*original, offsets[*position]))
            })
            .collect();
        moved.sort_unstable();
        let offset_map = OffsetMap {
            moved,
            original_len: self.original_len(),
            len: code_len as u32,
        };

        let raw = RawBody {
            max_stack: self.max_stack,
            init_locals: self.init_locals,
            local_var_sig: self.local_var_sig,
            code,
            clauses,
        };
        Ok((raw, sequence_points, offset_map))
    }

    /// Widen short branches until every displacement fits
    ///
    /// Returns the chosen opcode for every layout position along with the offset of every
    /// position (plus one extra entry for the total code length).
    fn select_branch_forms(&self, positions: &HashMap<InstrId, usize>) -> (Vec<Opcode>, Vec<u32>) {
        let mut opcodes: Vec<Opcode> = self
            .instructions()
            .map(|(_, instruction)| instruction.opcode)
            .collect();

        loop {
            let mut offsets: Vec<u32> = Vec::with_capacity(opcodes.len() + 1);
            let mut offset: u32 = 0;
            for (position, (_, instruction)) in self.instructions().enumerate() {
                offsets.push(offset);
                offset += width(opcodes[position], &instruction.operand) as u32;
            }
            offsets.push(offset);

            let mut widened_any = false;
            for (position, (_, instruction)) in self.instructions().enumerate() {
                let opcode = opcodes[position];
                if opcode.operand_kind() != OperandKind::ShortBranch {
                    continue;
                }
                if let Operand::Target(target) = &instruction.operand {
                    let displacement =
                        offsets[positions[target]] as i64 - offsets[position + 1] as i64;
                    if i8::try_from(displacement).is_err() {
                        if let Some(wide) = opcode.widened() {
                            log::trace!(
                                "widening {} at IL_{:04x} (displacement {})",
                                opcode.mnemonic(),
                                offsets[position],
                                displacement
                            );
                            opcodes[position] = wide;
                            widened_any = true;
                        }
                    }
                }
            }

            if !widened_any {
                return (opcodes, offsets);
            }
        }
    }
}

/// Where the instructions of a decoded body ended up after encoding
///
/// Debug information outside the body (local scopes) refers to IL offsets of the code as it was
/// decoded. Offsets of instructions that are still around map to their new offset, offsets in
/// the middle of an instruction keep their distance to its start, and the end of the original
/// code maps to the end of the new code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetMap {
    /// `(original offset, new offset)`, sorted
    moved: Vec<(u32, u32)>,
    original_len: u32,
    len: u32,
}

impl OffsetMap {
    pub fn map(&self, offset: u32) -> u32 {
        if offset >= self.original_len {
            return self.len;
        }
        let idx = self.moved.partition_point(|(original, _)| *original <= offset);
        match idx.checked_sub(1).map(|idx| self.moved[idx]) {
            Some((original, new)) => (new + (offset - original)).min(self.len),
            None => offset.min(self.len),
        }
    }
}

/// Encoded width of an instruction
fn width(opcode: Opcode, operand: &Operand) -> usize {
    let operand_width = match (opcode.operand_kind(), operand) {
        (OperandKind::Switch, Operand::Switch(targets)) => 4 + 4 * targets.len(),
        (kind, _) => kind.width(),
    };
    opcode.width() + operand_width
}

/// First decoding pass: opcodes and operands, with branch targets as absolute offsets
fn read_instructions(code: &[u8]) -> Result<Vec<(u32, Opcode, PendingOperand)>, Error> {
    let mut cursor = Cursor::new(code);
    let mut instructions = vec![];

    while (cursor.position() as usize) < code.len() {
        let offset = cursor.position() as u32;
        let truncated = |_| Error::TruncatedCode { offset };

        let first = cursor.read_u8().map_err(truncated)?;
        let encoding = if first == Opcode::EXTENDED_PREFIX {
            0xFE00 | cursor.read_u8().map_err(truncated)? as u16
        } else {
            first as u16
        };
        let opcode = Opcode::from_encoding(encoding).ok_or(Error::InvalidOpcode {
            offset,
            opcode: encoding,
        })?;

        let operand = match opcode.operand_kind() {
            OperandKind::None => PendingOperand::Ready(Operand::None),
            OperandKind::ShortInt => {
                PendingOperand::Ready(Operand::Int8(cursor.read_i8().map_err(truncated)?))
            }
            OperandKind::Int => PendingOperand::Ready(Operand::Int32(
                cursor.read_i32::<LittleEndian>().map_err(truncated)?,
            )),
            OperandKind::Long => PendingOperand::Ready(Operand::Int64(
                cursor.read_i64::<LittleEndian>().map_err(truncated)?,
            )),
            OperandKind::ShortFloat => PendingOperand::Ready(Operand::Float32(
                cursor.read_f32::<LittleEndian>().map_err(truncated)?,
            )),
            OperandKind::Float => PendingOperand::Ready(Operand::Float64(
                cursor.read_f64::<LittleEndian>().map_err(truncated)?,
            )),
            OperandKind::ShortVar => {
                PendingOperand::Ready(Operand::Var(cursor.read_u8().map_err(truncated)? as u16))
            }
            OperandKind::Var => PendingOperand::Ready(Operand::Var(
                cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            )),
            OperandKind::Token => PendingOperand::Ready(Operand::Token(Token(
                cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            ))),
            OperandKind::String => PendingOperand::Ready(Operand::String(Token(
                cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            ))),
            OperandKind::ShortBranch => {
                let displacement = cursor.read_i8().map_err(truncated)? as i64;
                PendingOperand::Target(cursor.position() as i64 + displacement)
            }
            OperandKind::Branch => {
                let displacement = cursor.read_i32::<LittleEndian>().map_err(truncated)? as i64;
                PendingOperand::Target(cursor.position() as i64 + displacement)
            }
            OperandKind::Switch => {
                let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                let remaining = code.len() - cursor.position() as usize;
                if count.saturating_mul(4) > remaining {
                    return Err(Error::TruncatedCode { offset });
                }
                let mut displacements = Vec::with_capacity(count);
                for _ in 0..count {
                    displacements.push(cursor.read_i32::<LittleEndian>().map_err(truncated)? as i64);
                }
                let base = cursor.position() as i64;
                PendingOperand::Switch(displacements.into_iter().map(|d| base + d).collect())
            }
        };

        instructions.push((offset, opcode, operand));
    }

    Ok(instructions)
}
