//! Editable instruction lists
//!
//! A [`CodeIr`] is decoded from a [`CodeItem`], edited, then written back
//! with [`CodeIr::assemble`]. The handful of opcodes the patcher emits are
//! modelled as structured instructions; everything else is carried as the
//! opaque code units it was decoded from.

use smallvec::SmallVec;
use thiserror::Error;

use super::{ir::CodeItem, opcode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `const/4 vA, #+B`
    Const4 { dst: u8, value: i8 },
    /// `move-result-object vAA`
    MoveResultObject { dst: u8 },
    /// `return vAA`
    Return { src: u8 },
    /// `return-object vAA`
    ReturnObject { src: u8 },
    /// `invoke-static {vC, vD, vE, vF, vG}, meth@BBBB`
    InvokeStatic {
        method: u32,
        args: SmallVec<[u8; 5]>,
    },
    /// `sget-object vAA, field@BBBB`
    SgetObject { dst: u8, field: u32 },
    /// Any other instruction or data payload, verbatim
    Opaque { units: Vec<u16> },
}

impl Instruction {
    /// Appends the code units, checking registers against a frame of `registers`
    fn encode(&self, registers: u16, out: &mut Vec<u16>) -> Result<(), AssemblyError> {
        let check_register = |reg: u8, bits: u8| {
            if u32::from(reg) >= 1 << bits {
                Err(AssemblyError::OperandTooWide {
                    operand: "register",
                    value: i64::from(reg),
                    bits,
                })
            } else if u16::from(reg) >= registers {
                Err(AssemblyError::RegisterOutOfFrame {
                    register: reg,
                    registers,
                })
            } else {
                Ok(u16::from(reg))
            }
        };
        let check_index = |index: u32| {
            u16::try_from(index).map_err(|_| AssemblyError::IndexTooWide { index })
        };
        let op_aa = |op: u8, reg: u16| (reg << 8) | u16::from(op);

        match self {
            Instruction::Const4 { dst, value } => {
                if !(-8..=7).contains(value) {
                    return Err(AssemblyError::OperandTooWide {
                        operand: "literal",
                        value: i64::from(*value),
                        bits: 4,
                    });
                }
                let dst = check_register(*dst, 4)?;
                let literal = (*value as u16) & 0xf;
                out.push((literal << 12) | (dst << 8) | u16::from(opcode::CONST_4));
            }
            Instruction::MoveResultObject { dst } => {
                out.push(op_aa(opcode::MOVE_RESULT_OBJECT, check_register(*dst, 8)?));
            }
            Instruction::Return { src } => {
                out.push(op_aa(opcode::RETURN, check_register(*src, 8)?));
            }
            Instruction::ReturnObject { src } => {
                out.push(op_aa(opcode::RETURN_OBJECT, check_register(*src, 8)?));
            }
            Instruction::InvokeStatic { method, args } => {
                if args.len() > 5 {
                    return Err(AssemblyError::OperandTooWide {
                        operand: "argument count",
                        value: args.len() as i64,
                        bits: 4,
                    });
                }
                let mut regs = [0u16; 5];
                for (slot, &reg) in regs.iter_mut().zip(args.iter()) {
                    *slot = check_register(reg, 4)?;
                }
                let [c, d, e, f, g] = regs;
                let count = args.len() as u16;
                out.push((count << 12) | (g << 8) | u16::from(opcode::INVOKE_STATIC));
                out.push(check_index(*method)?);
                out.push(c | (d << 4) | (e << 8) | (f << 12));
            }
            Instruction::SgetObject { dst, field } => {
                out.push(op_aa(opcode::SGET_OBJECT, check_register(*dst, 8)?));
                out.push(check_index(*field)?);
            }
            Instruction::Opaque { units } => {
                if units.is_empty() {
                    return Err(AssemblyError::MalformedBody { pc: out.len() });
                }
                out.extend_from_slice(units);
            }
        }
        Ok(())
    }

    fn decode(units: &[u16]) -> Instruction {
        let first = units[0];
        let op = (first & 0xff) as u8;
        let aa = (first >> 8) as u8;
        // Payload pseudo-instructions share opcode 0x00 with nop
        if op == opcode::NOP && aa != 0 {
            return Instruction::Opaque {
                units: units.to_vec(),
            };
        }
        match op {
            opcode::CONST_4 => Instruction::Const4 {
                dst: aa & 0xf,
                value: ((first as i16) >> 12) as i8,
            },
            opcode::MOVE_RESULT_OBJECT => Instruction::MoveResultObject { dst: aa },
            opcode::RETURN => Instruction::Return { src: aa },
            opcode::RETURN_OBJECT => Instruction::ReturnObject { src: aa },
            opcode::INVOKE_STATIC => {
                let count = usize::from(first >> 12);
                let packed = units[2];
                let all = [
                    (packed & 0xf) as u8,
                    ((packed >> 4) & 0xf) as u8,
                    ((packed >> 8) & 0xf) as u8,
                    ((packed >> 12) & 0xf) as u8,
                    aa & 0xf,
                ];
                if count > all.len() {
                    return Instruction::Opaque {
                        units: units.to_vec(),
                    };
                }
                Instruction::InvokeStatic {
                    method: u32::from(units[1]),
                    args: all[..count].iter().copied().collect(),
                }
            }
            opcode::SGET_OBJECT => Instruction::SgetObject {
                dst: aa,
                field: u32::from(units[1]),
            },
            _ => Instruction::Opaque {
                units: units.to_vec(),
            },
        }
    }

    /// Whether control can never fall through past this instruction
    fn is_terminal(&self) -> bool {
        match self {
            Instruction::Return { .. } | Instruction::ReturnObject { .. } => true,
            Instruction::Const4 { .. }
            | Instruction::MoveResultObject { .. }
            | Instruction::InvokeStatic { .. }
            | Instruction::SgetObject { .. } => false,
            Instruction::Opaque { units } => units.first().is_some_and(|&first| {
                let is_payload = first & 0xff == 0 && first >> 8 != 0;
                is_payload || opcode::is_terminal((first & 0xff) as u8)
            }),
        }
    }

    fn outgoing_args(&self) -> u16 {
        match self {
            Instruction::InvokeStatic { args, .. } => args.len() as u16,
            Instruction::Opaque { units } => units
                .first()
                .and_then(|&first| opcode::invoke_arg_count(first))
                .unwrap_or(0),
            _ => 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("instruction list is empty")]
    Empty,
    #[error("register v{register} is outside a frame of {registers} registers")]
    RegisterOutOfFrame { register: u8, registers: u16 },
    #[error("{operand} {value} does not fit in {bits} bits")]
    OperandTooWide {
        operand: &'static str,
        value: i64,
        bits: u8,
    },
    #[error("pool index {index} does not fit a 16-bit operand")]
    IndexTooWide { index: u32 },
    #[error("execution falls off the end of the method")]
    FallsOffEnd,
    #[error("malformed method body at code unit {pc}")]
    MalformedBody { pc: usize },
    #[error("method has no body")]
    NoBody,
    #[error("method is no longer present in the container")]
    MissingMethod,
    #[error("register frame of {ins} argument registers cannot grow")]
    FrameOverflow { ins: u16 },
}

/// An editable list of instructions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeIr {
    instructions: Vec<Instruction>,
}

impl CodeIr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(code: &CodeItem) -> Result<Self, AssemblyError> {
        let mut instructions = Vec::new();
        let mut pc = 0;
        while pc < code.insns.len() {
            let width = opcode::width_at(&code.insns, pc)
                .map_err(|_| AssemblyError::MalformedBody { pc })?;
            instructions.push(Instruction::decode(&code.insns[pc..pc + width]));
            pc += width;
        }
        Ok(CodeIr { instructions })
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn insert(&mut self, index: usize, instruction: Instruction) {
        self.instructions.insert(index, instruction);
    }

    pub fn remove(&mut self, index: usize) -> Instruction {
        self.instructions.remove(index)
    }

    pub fn clear(&mut self) {
        self.instructions.clear();
    }

    /// Encodes the list into `code`, recomputing `outs_size`.
    ///
    /// Register numbers are checked against `code.registers_size`, so the
    /// frame must be sized before assembling. `code` is left untouched on
    /// error.
    pub fn assemble(&self, code: &mut CodeItem) -> Result<(), AssemblyError> {
        let last = self.instructions.last().ok_or(AssemblyError::Empty)?;
        if !last.is_terminal() {
            return Err(AssemblyError::FallsOffEnd);
        }

        let mut insns = Vec::with_capacity(self.instructions.len() * 2);
        for instruction in &self.instructions {
            instruction.encode(code.registers_size, &mut insns)?;
        }

        let insns_len = insns.len() as u64;
        for try_item in &code.tries {
            let end = u64::from(try_item.start_addr) + u64::from(try_item.insn_count);
            if end > insns_len {
                return Err(AssemblyError::MalformedBody {
                    pc: try_item.start_addr as usize,
                });
            }
        }

        code.outs_size = self
            .instructions
            .iter()
            .map(Instruction::outgoing_args)
            .max()
            .unwrap_or(0);
        code.insns = insns;
        Ok(())
    }
}

impl<'a> IntoIterator for &'a CodeIr {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

impl FromIterator<Instruction> for CodeIr {
    fn from_iter<T: IntoIterator<Item = Instruction>>(iter: T) -> Self {
        CodeIr {
            instructions: iter.into_iter().collect(),
        }
    }
}
