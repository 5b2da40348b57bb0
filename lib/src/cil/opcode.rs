/// Shape of the inline operand that follows an opcode in the IL stream (see ECMA-335,
/// Partition VI, C.2)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// `InlineNone`
    None,
    /// `ShortInlineI`
    ShortInt,
    /// `InlineI`
    Int,
    /// `InlineI8`
    Long,
    /// `ShortInlineR`
    ShortFloat,
    /// `InlineR`
    Float,
    /// `ShortInlineVar`
    ShortVar,
    /// `InlineVar`
    Var,
    /// `InlineMethod`, `InlineField`, `InlineType`, `InlineTok`, `InlineSig`
    Token,
    /// `InlineString`
    String,
    /// `ShortInlineBrTarget`
    ShortBranch,
    /// `InlineBrTarget`
    Branch,
    /// `InlineSwitch`
    Switch,
}

impl OperandKind {
    /// Width in bytes of the operand, excluding switch targets
    pub fn width(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::ShortInt | OperandKind::ShortVar | OperandKind::ShortBranch => 1,
            OperandKind::Var => 2,
            OperandKind::Int
            | OperandKind::ShortFloat
            | OperandKind::Token
            | OperandKind::String
            | OperandKind::Branch
            | OperandKind::Switch => 4,
            OperandKind::Long | OperandKind::Float => 8,
        }
    }
}

/// How control leaves an instruction
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlowKind {
    /// Falls through to the next instruction
    Next,
    /// Always transfers to its target (`br`, `leave`)
    Branch,
    /// Transfers to one of its targets or falls through (`brtrue`, `switch`, ...)
    CondBranch,
    /// `ret`
    Return,
    /// Leaves the instruction stream without a static successor (`throw`, `endfinally`, `jmp`)
    Exit,
}

macro_rules! opcodes {
    ($( $variant:ident = $encoding:literal, $mnemonic:literal, $operand:ident, $flow:ident; )*) => {
        /// CIL opcode
        ///
        /// Covers the full standard instruction set from ECMA-335, Partition III. One-byte
        /// opcodes are encoded as `0x00XX` and two-byte opcodes keep their `0xFE` prefix
        /// (`0xFEXX`).
        #[allow(non_camel_case_types)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum Opcode {
            $( $variant, )*
        }

        impl Opcode {
            /// Every opcode, in encoding order
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$variant, )* ];

            pub fn encoding(self) -> u16 {
                match self {
                    $( Opcode::$variant => $encoding, )*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $mnemonic, )*
                }
            }

            pub fn operand_kind(self) -> OperandKind {
                match self {
                    $( Opcode::$variant => OperandKind::$operand, )*
                }
            }

            pub fn flow(self) -> FlowKind {
                match self {
                    $( Opcode::$variant => FlowKind::$flow, )*
                }
            }

            pub fn from_encoding(encoding: u16) -> Option<Opcode> {
                match encoding {
                    $( $encoding => Some(Opcode::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", None, Next;
    Break = 0x01, "break", None, Next;
    Ldarg_0 = 0x02, "ldarg.0", None, Next;
    Ldarg_1 = 0x03, "ldarg.1", None, Next;
    Ldarg_2 = 0x04, "ldarg.2", None, Next;
    Ldarg_3 = 0x05, "ldarg.3", None, Next;
    Ldloc_0 = 0x06, "ldloc.0", None, Next;
    Ldloc_1 = 0x07, "ldloc.1", None, Next;
    Ldloc_2 = 0x08, "ldloc.2", None, Next;
    Ldloc_3 = 0x09, "ldloc.3", None, Next;
    Stloc_0 = 0x0A, "stloc.0", None, Next;
    Stloc_1 = 0x0B, "stloc.1", None, Next;
    Stloc_2 = 0x0C, "stloc.2", None, Next;
    Stloc_3 = 0x0D, "stloc.3", None, Next;
    Ldarg_S = 0x0E, "ldarg.s", ShortVar, Next;
    Ldarga_S = 0x0F, "ldarga.s", ShortVar, Next;
    Starg_S = 0x10, "starg.s", ShortVar, Next;
    Ldloc_S = 0x11, "ldloc.s", ShortVar, Next;
    Ldloca_S = 0x12, "ldloca.s", ShortVar, Next;
    Stloc_S = 0x13, "stloc.s", ShortVar, Next;
    Ldnull = 0x14, "ldnull", None, Next;
    Ldc_I4_M1 = 0x15, "ldc.i4.m1", None, Next;
    Ldc_I4_0 = 0x16, "ldc.i4.0", None, Next;
    Ldc_I4_1 = 0x17, "ldc.i4.1", None, Next;
    Ldc_I4_2 = 0x18, "ldc.i4.2", None, Next;
    Ldc_I4_3 = 0x19, "ldc.i4.3", None, Next;
    Ldc_I4_4 = 0x1A, "ldc.i4.4", None, Next;
    Ldc_I4_5 = 0x1B, "ldc.i4.5", None, Next;
    Ldc_I4_6 = 0x1C, "ldc.i4.6", None, Next;
    Ldc_I4_7 = 0x1D, "ldc.i4.7", None, Next;
    Ldc_I4_8 = 0x1E, "ldc.i4.8", None, Next;
    Ldc_I4_S = 0x1F, "ldc.i4.s", ShortInt, Next;
    Ldc_I4 = 0x20, "ldc.i4", Int, Next;
    Ldc_I8 = 0x21, "ldc.i8", Long, Next;
    Ldc_R4 = 0x22, "ldc.r4", ShortFloat, Next;
    Ldc_R8 = 0x23, "ldc.r8", Float, Next;
    Dup = 0x25, "dup", None, Next;
    Pop = 0x26, "pop", None, Next;
    Jmp = 0x27, "jmp", Token, Exit;
    Call = 0x28, "call", Token, Next;
    Calli = 0x29, "calli", Token, Next;
    Ret = 0x2A, "ret", None, Return;
    Br_S = 0x2B, "br.s", ShortBranch, Branch;
    Brfalse_S = 0x2C, "brfalse.s", ShortBranch, CondBranch;
    Brtrue_S = 0x2D, "brtrue.s", ShortBranch, CondBranch;
    Beq_S = 0x2E, "beq.s", ShortBranch, CondBranch;
    Bge_S = 0x2F, "bge.s", ShortBranch, CondBranch;
    Bgt_S = 0x30, "bgt.s", ShortBranch, CondBranch;
    Ble_S = 0x31, "ble.s", ShortBranch, CondBranch;
    Blt_S = 0x32, "blt.s", ShortBranch, CondBranch;
    Bne_Un_S = 0x33, "bne.un.s", ShortBranch, CondBranch;
    Bge_Un_S = 0x34, "bge.un.s", ShortBranch, CondBranch;
    Bgt_Un_S = 0x35, "bgt.un.s", ShortBranch, CondBranch;
    Ble_Un_S = 0x36, "ble.un.s", ShortBranch, CondBranch;
    Blt_Un_S = 0x37, "blt.un.s", ShortBranch, CondBranch;
    Br = 0x38, "br", Branch, Branch;
    Brfalse = 0x39, "brfalse", Branch, CondBranch;
    Brtrue = 0x3A, "brtrue", Branch, CondBranch;
    Beq = 0x3B, "beq", Branch, CondBranch;
    Bge = 0x3C, "bge", Branch, CondBranch;
    Bgt = 0x3D, "bgt", Branch, CondBranch;
    Ble = 0x3E, "ble", Branch, CondBranch;
    Blt = 0x3F, "blt", Branch, CondBranch;
    Bne_Un = 0x40, "bne.un", Branch, CondBranch;
    Bge_Un = 0x41, "bge.un", Branch, CondBranch;
    Bgt_Un = 0x42, "bgt.un", Branch, CondBranch;
    Ble_Un = 0x43, "ble.un", Branch, CondBranch;
    Blt_Un = 0x44, "blt.un", Branch, CondBranch;
    Switch = 0x45, "switch", Switch, CondBranch;
    Ldind_I1 = 0x46, "ldind.i1", None, Next;
    Ldind_U1 = 0x47, "ldind.u1", None, Next;
    Ldind_I2 = 0x48, "ldind.i2", None, Next;
    Ldind_U2 = 0x49, "ldind.u2", None, Next;
    Ldind_I4 = 0x4A, "ldind.i4", None, Next;
    Ldind_U4 = 0x4B, "ldind.u4", None, Next;
    Ldind_I8 = 0x4C, "ldind.i8", None, Next;
    Ldind_I = 0x4D, "ldind.i", None, Next;
    Ldind_R4 = 0x4E, "ldind.r4", None, Next;
    Ldind_R8 = 0x4F, "ldind.r8", None, Next;
    Ldind_Ref = 0x50, "ldind.ref", None, Next;
    Stind_Ref = 0x51, "stind.ref", None, Next;
    Stind_I1 = 0x52, "stind.i1", None, Next;
    Stind_I2 = 0x53, "stind.i2", None, Next;
    Stind_I4 = 0x54, "stind.i4", None, Next;
    Stind_I8 = 0x55, "stind.i8", None, Next;
    Stind_R4 = 0x56, "stind.r4", None, Next;
    Stind_R8 = 0x57, "stind.r8", None, Next;
    Add = 0x58, "add", None, Next;
    Sub = 0x59, "sub", None, Next;
    Mul = 0x5A, "mul", None, Next;
    Div = 0x5B, "div", None, Next;
    Div_Un = 0x5C, "div.un", None, Next;
    Rem = 0x5D, "rem", None, Next;
    Rem_Un = 0x5E, "rem.un", None, Next;
    And = 0x5F, "and", None, Next;
    Or = 0x60, "or", None, Next;
    Xor = 0x61, "xor", None, Next;
    Shl = 0x62, "shl", None, Next;
    Shr = 0x63, "shr", None, Next;
    Shr_Un = 0x64, "shr.un", None, Next;
    Neg = 0x65, "neg", None, Next;
    Not = 0x66, "not", None, Next;
    Conv_I1 = 0x67, "conv.i1", None, Next;
    Conv_I2 = 0x68, "conv.i2", None, Next;
    Conv_I4 = 0x69, "conv.i4", None, Next;
    Conv_I8 = 0x6A, "conv.i8", None, Next;
    Conv_R4 = 0x6B, "conv.r4", None, Next;
    Conv_R8 = 0x6C, "conv.r8", None, Next;
    Conv_U4 = 0x6D, "conv.u4", None, Next;
    Conv_U8 = 0x6E, "conv.u8", None, Next;
    Callvirt = 0x6F, "callvirt", Token, Next;
    Cpobj = 0x70, "cpobj", Token, Next;
    Ldobj = 0x71, "ldobj", Token, Next;
    Ldstr = 0x72, "ldstr", String, Next;
    Newobj = 0x73, "newobj", Token, Next;
    Castclass = 0x74, "castclass", Token, Next;
    Isinst = 0x75, "isinst", Token, Next;
    Conv_R_Un = 0x76, "conv.r.un", None, Next;
    Unbox = 0x79, "unbox", Token, Next;
    Throw = 0x7A, "throw", None, Exit;
    Ldfld = 0x7B, "ldfld", Token, Next;
    Ldflda = 0x7C, "ldflda", Token, Next;
    Stfld = 0x7D, "stfld", Token, Next;
    Ldsfld = 0x7E, "ldsfld", Token, Next;
    Ldsflda = 0x7F, "ldsflda", Token, Next;
    Stsfld = 0x80, "stsfld", Token, Next;
    Stobj = 0x81, "stobj", Token, Next;
    Conv_Ovf_I1_Un = 0x82, "conv.ovf.i1.un", None, Next;
    Conv_Ovf_I2_Un = 0x83, "conv.ovf.i2.un", None, Next;
    Conv_Ovf_I4_Un = 0x84, "conv.ovf.i4.un", None, Next;
    Conv_Ovf_I8_Un = 0x85, "conv.ovf.i8.un", None, Next;
    Conv_Ovf_U1_Un = 0x86, "conv.ovf.u1.un", None, Next;
    Conv_Ovf_U2_Un = 0x87, "conv.ovf.u2.un", None, Next;
    Conv_Ovf_U4_Un = 0x88, "conv.ovf.u4.un", None, Next;
    Conv_Ovf_U8_Un = 0x89, "conv.ovf.u8.un", None, Next;
    Conv_Ovf_I_Un = 0x8A, "conv.ovf.i.un", None, Next;
    Conv_Ovf_U_Un = 0x8B, "conv.ovf.u.un", None, Next;
    Box = 0x8C, "box", Token, Next;
    Newarr = 0x8D, "newarr", Token, Next;
    Ldlen = 0x8E, "ldlen", None, Next;
    Ldelema = 0x8F, "ldelema", Token, Next;
    Ldelem_I1 = 0x90, "ldelem.i1", None, Next;
    Ldelem_U1 = 0x91, "ldelem.u1", None, Next;
    Ldelem_I2 = 0x92, "ldelem.i2", None, Next;
    Ldelem_U2 = 0x93, "ldelem.u2", None, Next;
    Ldelem_I4 = 0x94, "ldelem.i4", None, Next;
    Ldelem_U4 = 0x95, "ldelem.u4", None, Next;
    Ldelem_I8 = 0x96, "ldelem.i8", None, Next;
    Ldelem_I = 0x97, "ldelem.i", None, Next;
    Ldelem_R4 = 0x98, "ldelem.r4", None, Next;
    Ldelem_R8 = 0x99, "ldelem.r8", None, Next;
    Ldelem_Ref = 0x9A, "ldelem.ref", None, Next;
    Stelem_I = 0x9B, "stelem.i", None, Next;
    Stelem_I1 = 0x9C, "stelem.i1", None, Next;
    Stelem_I2 = 0x9D, "stelem.i2", None, Next;
    Stelem_I4 = 0x9E, "stelem.i4", None, Next;
    Stelem_I8 = 0x9F, "stelem.i8", None, Next;
    Stelem_R4 = 0xA0, "stelem.r4", None, Next;
    Stelem_R8 = 0xA1, "stelem.r8", None, Next;
    Stelem_Ref = 0xA2, "stelem.ref", None, Next;
    Ldelem = 0xA3, "ldelem", Token, Next;
    Stelem = 0xA4, "stelem", Token, Next;
    Unbox_Any = 0xA5, "unbox.any", Token, Next;
    Conv_Ovf_I1 = 0xB3, "conv.ovf.i1", None, Next;
    Conv_Ovf_U1 = 0xB4, "conv.ovf.u1", None, Next;
    Conv_Ovf_I2 = 0xB5, "conv.ovf.i2", None, Next;
    Conv_Ovf_U2 = 0xB6, "conv.ovf.u2", None, Next;
    Conv_Ovf_I4 = 0xB7, "conv.ovf.i4", None, Next;
    Conv_Ovf_U4 = 0xB8, "conv.ovf.u4", None, Next;
    Conv_Ovf_I8 = 0xB9, "conv.ovf.i8", None, Next;
    Conv_Ovf_U8 = 0xBA, "conv.ovf.u8", None, Next;
    Refanyval = 0xC2, "refanyval", Token, Next;
    Ckfinite = 0xC3, "ckfinite", None, Next;
    Mkrefany = 0xC6, "mkrefany", Token, Next;
    Ldtoken = 0xD0, "ldtoken", Token, Next;
    Conv_U2 = 0xD1, "conv.u2", None, Next;
    Conv_U1 = 0xD2, "conv.u1", None, Next;
    Conv_I = 0xD3, "conv.i", None, Next;
    Conv_Ovf_I = 0xD4, "conv.ovf.i", None, Next;
    Conv_Ovf_U = 0xD5, "conv.ovf.u", None, Next;
    Add_Ovf = 0xD6, "add.ovf", None, Next;
    Add_Ovf_Un = 0xD7, "add.ovf.un", None, Next;
    Mul_Ovf = 0xD8, "mul.ovf", None, Next;
    Mul_Ovf_Un = 0xD9, "mul.ovf.un", None, Next;
    Sub_Ovf = 0xDA, "sub.ovf", None, Next;
    Sub_Ovf_Un = 0xDB, "sub.ovf.un", None, Next;
    Endfinally = 0xDC, "endfinally", None, Exit;
    Leave = 0xDD, "leave", Branch, Branch;
    Leave_S = 0xDE, "leave.s", ShortBranch, Branch;
    Stind_I = 0xDF, "stind.i", None, Next;
    Conv_U = 0xE0, "conv.u", None, Next;
    Arglist = 0xFE00, "arglist", None, Next;
    Ceq = 0xFE01, "ceq", None, Next;
    Cgt = 0xFE02, "cgt", None, Next;
    Cgt_Un = 0xFE03, "cgt.un", None, Next;
    Clt = 0xFE04, "clt", None, Next;
    Clt_Un = 0xFE05, "clt.un", None, Next;
    Ldftn = 0xFE06, "ldftn", Token, Next;
    Ldvirtftn = 0xFE07, "ldvirtftn", Token, Next;
    Ldarg = 0xFE09, "ldarg", Var, Next;
    Ldarga = 0xFE0A, "ldarga", Var, Next;
    Starg = 0xFE0B, "starg", Var, Next;
    Ldloc = 0xFE0C, "ldloc", Var, Next;
    Ldloca = 0xFE0D, "ldloca", Var, Next;
    Stloc = 0xFE0E, "stloc", Var, Next;
    Localloc = 0xFE0F, "localloc", None, Next;
    Endfilter = 0xFE11, "endfilter", None, Exit;
    Unaligned = 0xFE12, "unaligned.", ShortInt, Next;
    Volatile = 0xFE13, "volatile.", None, Next;
    Tail = 0xFE14, "tail.", None, Next;
    Initobj = 0xFE15, "initobj", Token, Next;
    Constrained = 0xFE16, "constrained.", Token, Next;
    Cpblk = 0xFE17, "cpblk", None, Next;
    Initblk = 0xFE18, "initblk", None, Next;
    No = 0xFE19, "no.", ShortInt, Next;
    Rethrow = 0xFE1A, "rethrow", None, Exit;
    Sizeof = 0xFE1C, "sizeof", Token, Next;
    Refanytype = 0xFE1D, "refanytype", None, Next;
    Readonly = 0xFE1E, "readonly.", None, Next;
}

impl Opcode {
    /// Prefix byte of two-byte opcodes
    pub const EXTENDED_PREFIX: u8 = 0xFE;

    /// Number of bytes the opcode itself takes up
    pub fn width(self) -> usize {
        if self.encoding() > 0xFF {
            2
        } else {
            1
        }
    }

    /// Long-form equivalent of a short branch (`br.s` to `br`, `leave.s` to `leave`, ...)
    pub fn widened(self) -> Option<Opcode> {
        use Opcode::*;
        Some(match self {
            Br_S => Br,
            Brfalse_S => Brfalse,
            Brtrue_S => Brtrue,
            Beq_S => Beq,
            Bge_S => Bge,
            Bgt_S => Bgt,
            Ble_S => Ble,
            Blt_S => Blt,
            Bne_Un_S => Bne_Un,
            Bge_Un_S => Bge_Un,
            Bgt_Un_S => Bgt_Un,
            Ble_Un_S => Ble_Un,
            Blt_Un_S => Blt_Un,
            Leave_S => Leave,
            _ => return None,
        })
    }

    /// Is this a non-local-exit jump (legal for leaving a protected region)?
    pub fn is_leave(self) -> bool {
        matches!(self, Opcode::Leave | Opcode::Leave_S)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodings_are_unique() {
        for opcode in Opcode::ALL {
            assert_eq!(
                Opcode::from_encoding(opcode.encoding()),
                Some(*opcode),
                "opcode {} does not decode back to itself",
                opcode.mnemonic()
            );
        }
        assert_eq!(Opcode::from_encoding(0x24), None);
        assert_eq!(Opcode::from_encoding(0xFE08), None);
    }

    #[test]
    fn short_branches_widen_to_long_branches() {
        for opcode in Opcode::ALL {
            match opcode.operand_kind() {
                OperandKind::ShortBranch => {
                    let wide = opcode.widened().expect("short branch without a long form");
                    assert_eq!(wide.operand_kind(), OperandKind::Branch);
                    assert_eq!(wide.flow(), opcode.flow());
                    assert_eq!(format!("{}.s", wide.mnemonic()), opcode.mnemonic());
                }
                _ => assert_eq!(opcode.widened(), None),
            }
        }
    }

    #[test]
    fn widths() {
        assert_eq!(Opcode::Ret.width(), 1);
        assert_eq!(Opcode::Ceq.width(), 2);
        assert_eq!(Opcode::Ldstr.operand_kind().width(), 4);
        assert_eq!(Opcode::Leave_S.operand_kind().width(), 1);
    }
}
