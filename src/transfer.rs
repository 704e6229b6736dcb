// Data movement: MOV in all its encodings, XCHG, LEA, the stack instructions,
// flag transfers and port I/O. Nothing here computes; the ALU module owns the
// flag laws.

use crate::alu::R;
use crate::decoder::{self, Instr};
use crate::devices::Signal;
use crate::error::Fault;
use crate::fields::{SegReg, Width};
use crate::processor::{Operand, CPU};
use crate::registers::{CpuMode, Flag, RAX, RBP, RBX, RDX, RSP};

// PUSH/POP and friends default to 64-bit operands in 64-bit code; the 0x66
// prefix still selects 16.
pub fn stack_op_width(cpu: &CPU, instr: &Instr) -> Width {
    if cpu.regs.long64() {
        if instr.prefixes.operand_size {
            Width::Word
        } else {
            Width::Quad
        }
    } else {
        instr.op_width
    }
}

// IN/OUT/INS/OUTS are IOPL-gated outside real mode.
pub fn check_io(cpu: &CPU) -> Result<(), Fault> {
    if cpu.regs.mode() != CpuMode::Real && cpu.regs.cpl > cpu.regs.iopl() {
        return Err(Fault::GeneralProtection(0));
    }
    Ok(())
}

fn io_width(instr: &Instr) -> Width {
    if instr.opcode & 1 == 0 {
        Width::Byte
    } else if instr.op_width == Width::Quad {
        Width::Long
    } else {
        instr.op_width
    }
}

// ------------------------------------------------------------------- MOV

pub fn mov_rm_r(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let w = instr.width_by_parity();
    let value = cpu.read_operand(&decoder::reg_operand(instr, w), w)?;
    cpu.write_operand(&decoder::rm_operand(instr, w), w, value)?;
    Ok(Signal::Ok)
}

pub fn mov_r_rm(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let w = instr.width_by_parity();
    let value = cpu.read_operand(&decoder::rm_operand(instr, w), w)?;
    cpu.write_operand(&decoder::reg_operand(instr, w), w, value)?;
    Ok(Signal::Ok)
}

// Group 11: C6/C7 carry the immediate form in /0 only.
pub fn mov_rm_imm(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    if instr.digit() != 0 {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    let w = instr.width_by_parity();
    let imm = cpu.fetch_imm(w)?;
    cpu.write_operand(&decoder::rm_operand(instr, w), w, imm)?;
    Ok(Signal::Ok)
}

// B0..BF; the B8+r form with REX.W is the one instruction with a true 64-bit
// immediate.
pub fn mov_r_imm(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = if instr.opcode < 0xb8 { Width::Byte } else { instr.op_width };
    let imm = if w == Width::Quad { cpu.fetch_wide(Width::Quad)? } else { cpu.fetch_imm(w)? };
    let reg = decoder::opcode_reg(instr, w);
    cpu.write_operand(&reg, w, imm)?;
    Ok(Signal::Ok)
}

// A0..A3: accumulator to/from a direct offset of address-size width.
pub fn mov_moffs(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = instr.width_by_parity();
    let offset = cpu.fetch_wide(instr.addr_width)?;
    let seg = instr.prefixes.segment.unwrap_or(SegReg::Ds);
    if instr.opcode < 0xa2 {
        let value = cpu.read_mem(seg, offset, w)?;
        cpu.regs.write(w, RAX, value);
    } else {
        let value = cpu.regs.read(w, RAX);
        cpu.write_mem(seg, offset, w, value)?;
    }
    Ok(Signal::Ok)
}

pub fn mov_rm_sreg(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let seg = SegReg::from_index(instr.reg_field() & 7)
        .ok_or(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false })?;
    let selector = cpu.regs.seg(seg).selector as u64;
    let w = if instr.modrm_is_register() { instr.op_width } else { Width::Word };
    cpu.write_operand(&decoder::rm_operand(instr, w), w, selector)?;
    Ok(Signal::Ok)
}

pub fn mov_sreg_rm(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let seg = SegReg::from_index(instr.reg_field() & 7)
        .ok_or(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false })?;
    if seg == SegReg::Cs {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    let selector = cpu.read_operand(&decoder::rm_operand(instr, Width::Word), Width::Word)?;
    cpu.load_segment(seg, selector as u16)?;
    Ok(Signal::Ok)
}

pub fn lea(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let rm = decoder::rm_operand(instr, instr.op_width);
    let offset = cpu
        .operand_offset(&rm)
        .ok_or(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false })?;
    cpu.regs.write(instr.op_width, instr.reg_field(), offset);
    Ok(Signal::Ok)
}

// ------------------------------------------------------------------ XCHG

pub fn xchg_rm_r(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let w = instr.width_by_parity();
    let rm = decoder::rm_operand(instr, w);
    let reg = decoder::reg_operand(instr, w);
    let a = cpu.read_operand(&rm, w)?;
    let b = cpu.read_operand(&reg, w)?;
    cpu.write_operand(&rm, w, b)?;
    cpu.write_operand(&reg, w, a)?;
    Ok(Signal::Ok)
}

// 90..97. Plain 0x90 (no REX.B) stays NOP, including its F3 PAUSE spelling.
pub fn xchg_acc_r(cpu: &mut CPU, instr: &mut Instr) -> R {
    let index = (instr.opcode & 7) as usize | instr.prefixes.rex_b();
    if index == 0 {
        return Ok(Signal::Ok);
    }
    let w = instr.op_width;
    let a = cpu.regs.read(w, RAX);
    let b = cpu.regs.read(w, index);
    cpu.regs.write(w, RAX, b);
    cpu.regs.write(w, index, a);
    Ok(Signal::Ok)
}

pub fn xlat(cpu: &mut CPU, instr: &mut Instr) -> R {
    let seg = instr.prefixes.segment.unwrap_or(SegReg::Ds);
    let aw = instr.addr_width;
    let offset =
        cpu.regs.read(aw, RBX).wrapping_add(cpu.regs.read(Width::Byte, RAX)) & aw.mask();
    let value = cpu.read_mem(seg, offset, Width::Byte)?;
    cpu.regs.write(Width::Byte, RAX, value);
    Ok(Signal::Ok)
}

// ----------------------------------------------------------------- stack

pub fn push_r(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let index = (instr.opcode & 7) as usize | instr.prefixes.rex_b();
    let value = cpu.regs.read(w, index);
    cpu.push(w, value)?;
    Ok(Signal::Ok)
}

pub fn pop_r(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let index = (instr.opcode & 7) as usize | instr.prefixes.rex_b();
    let value = cpu.pop(w)?;
    cpu.regs.write(w, index, value);
    Ok(Signal::Ok)
}

pub fn push_imm(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let imm = if instr.opcode == 0x6a { w.truncate(cpu.fetch_i8()? as u64) } else { cpu.fetch_imm(w)? };
    cpu.push(w, imm)?;
    Ok(Signal::Ok)
}

// Group 1A: 8F /0 POP r/m.
pub fn group_8f(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    if instr.digit() != 0 {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    let w = stack_op_width(cpu, instr);
    let value = cpu.pop(w)?;
    cpu.write_operand(&decoder::rm_operand(instr, w), w, value)?;
    Ok(Signal::Ok)
}

fn push_sreg_common(cpu: &mut CPU, instr: &Instr, seg: SegReg) -> R {
    let w = stack_op_width(cpu, instr);
    let selector = cpu.regs.seg(seg).selector as u64;
    cpu.push(w, selector)?;
    Ok(Signal::Ok)
}
fn pop_sreg_common(cpu: &mut CPU, instr: &Instr, seg: SegReg) -> R {
    let w = stack_op_width(cpu, instr);
    let value = cpu.pop(w)?;
    cpu.load_segment(seg, value as u16)?;
    Ok(Signal::Ok)
}

// 06/0E/16/1E and their POP counterparts.
pub fn push_sreg(cpu: &mut CPU, instr: &mut Instr) -> R {
    let seg = SegReg::from_index((instr.opcode >> 3 & 3) as usize).unwrap();
    push_sreg_common(cpu, instr, seg)
}
pub fn pop_sreg(cpu: &mut CPU, instr: &mut Instr) -> R {
    let seg = SegReg::from_index((instr.opcode >> 3 & 3) as usize).unwrap();
    pop_sreg_common(cpu, instr, seg)
}
// 0F A0/A1 and 0F A8/A9.
pub fn push_fs_gs(cpu: &mut CPU, instr: &mut Instr) -> R {
    let seg = if instr.opcode & 8 == 0 { SegReg::Fs } else { SegReg::Gs };
    push_sreg_common(cpu, instr, seg)
}
pub fn pop_fs_gs(cpu: &mut CPU, instr: &mut Instr) -> R {
    let seg = if instr.opcode & 8 == 0 { SegReg::Fs } else { SegReg::Gs };
    pop_sreg_common(cpu, instr, seg)
}

pub fn pusha(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = instr.op_width;
    let original_sp = cpu.regs.read(w, RSP);
    for index in 0..8 {
        let value = if index == RSP { original_sp } else { cpu.regs.read(w, index) };
        cpu.push(w, value)?;
    }
    Ok(Signal::Ok)
}

pub fn popa(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = instr.op_width;
    for index in (0..8).rev() {
        let value = cpu.pop(w)?;
        if index != RSP {
            cpu.regs.write(w, index, value);
        }
    }
    Ok(Signal::Ok)
}

// ------------------------------------------------------------ flag moves

pub fn pushf(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    // RF and VM never reach the stack image
    let value = cpu.regs.rflags & !(1 << Flag::Resume as u32 | 1 << Flag::Virtual8086 as u32);
    cpu.push(w, value)?;
    Ok(Signal::Ok)
}

// POPF privilege rules: IF moves only when CPL <= IOPL, IOPL only in ring 0.
pub fn write_flags(cpu: &mut CPU, value: u64, w: Width) {
    let mut keep = 1u64 << Flag::Resume as u32 | 1 << Flag::Virtual8086 as u32;
    if cpu.regs.mode() != CpuMode::Real {
        if cpu.regs.cpl > 0 {
            keep |= crate::registers::IOPL_MASK;
        }
        if cpu.regs.cpl > cpu.regs.iopl() {
            keep |= 1 << Flag::Interrupt as u32;
        }
    }
    if w == Width::Word {
        keep |= !0xffffu64;
    }
    cpu.regs.rflags = (cpu.regs.rflags & keep | value & !keep) & !0x8028 | crate::registers::RFLAGS_FIXED1;
}

pub fn popf(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let value = cpu.pop(w)?;
    write_flags(cpu, value, w);
    Ok(Signal::Ok)
}

pub fn sahf(cpu: &mut CPU, _instr: &mut Instr) -> R {
    let ah = cpu.regs.read8h(RAX);
    cpu.regs.rflags = cpu.regs.rflags & !0xd5 | ah & 0xd5 | crate::registers::RFLAGS_FIXED1;
    Ok(Signal::Ok)
}

pub fn lahf(cpu: &mut CPU, _instr: &mut Instr) -> R {
    let flags = cpu.regs.rflags & 0xd5 | crate::registers::RFLAGS_FIXED1;
    cpu.regs.write8h(RAX, flags);
    Ok(Signal::Ok)
}

pub fn clc(cpu: &mut CPU, _instr: &mut Instr) -> R {
    cpu.regs.set_flag(Flag::Carry, false);
    Ok(Signal::Ok)
}
pub fn stc(cpu: &mut CPU, _instr: &mut Instr) -> R {
    cpu.regs.set_flag(Flag::Carry, true);
    Ok(Signal::Ok)
}
pub fn cmc(cpu: &mut CPU, _instr: &mut Instr) -> R {
    let carry = cpu.regs.flag(Flag::Carry);
    cpu.regs.set_flag(Flag::Carry, !carry);
    Ok(Signal::Ok)
}
pub fn cld(cpu: &mut CPU, _instr: &mut Instr) -> R {
    cpu.regs.set_flag(Flag::Direction, false);
    Ok(Signal::Ok)
}
pub fn std(cpu: &mut CPU, _instr: &mut Instr) -> R {
    cpu.regs.set_flag(Flag::Direction, true);
    Ok(Signal::Ok)
}
pub fn cli(cpu: &mut CPU, _instr: &mut Instr) -> R {
    check_io(cpu)?;
    cpu.regs.set_flag(Flag::Interrupt, false);
    Ok(Signal::Ok)
}
pub fn sti(cpu: &mut CPU, _instr: &mut Instr) -> R {
    check_io(cpu)?;
    if !cpu.regs.flag(Flag::Interrupt) {
        // interrupt shadow: the next instruction runs before delivery
        cpu.inhibit_interrupts = 1;
    }
    cpu.regs.set_flag(Flag::Interrupt, true);
    Ok(Signal::Ok)
}

pub fn salc(cpu: &mut CPU, _instr: &mut Instr) -> R {
    let value = if cpu.regs.flag(Flag::Carry) { 0xff } else { 0 };
    cpu.regs.write(Width::Byte, RAX, value);
    Ok(Signal::Ok)
}

// ------------------------------------------------------- far pointer loads

fn load_far_pointer(cpu: &mut CPU, instr: &mut Instr, seg: SegReg) -> R {
    decoder::modrm(cpu, instr)?;
    let w = instr.op_width;
    let rm = decoder::rm_operand(instr, w);
    let (mem_seg, offset) = match rm {
        Operand::Mem { seg, offset } => (seg, offset),
        _ => return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: instr.two_byte }),
    };
    let pointer = cpu.read_mem(mem_seg, offset, w)?;
    let selector = cpu.read_mem(mem_seg, offset.wrapping_add(w.bytes()), Width::Word)?;
    cpu.load_segment(seg, selector as u16)?;
    cpu.regs.write(w, instr.reg_field(), pointer);
    Ok(Signal::Ok)
}

pub fn les(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.long64() {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    load_far_pointer(cpu, instr, SegReg::Es)
}
pub fn lds(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.long64() {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    load_far_pointer(cpu, instr, SegReg::Ds)
}
pub fn lss(cpu: &mut CPU, instr: &mut Instr) -> R {
    load_far_pointer(cpu, instr, SegReg::Ss)
}
pub fn lfs(cpu: &mut CPU, instr: &mut Instr) -> R {
    load_far_pointer(cpu, instr, SegReg::Fs)
}
pub fn lgs(cpu: &mut CPU, instr: &mut Instr) -> R {
    load_far_pointer(cpu, instr, SegReg::Gs)
}

// --------------------------------------------------------------- port I/O

pub fn in_imm(cpu: &mut CPU, instr: &mut Instr) -> R {
    check_io(cpu)?;
    let port = cpu.fetch_u8()? as u16;
    let w = io_width(instr);
    let value = cpu.bus.borrow_mut().read_port(port, w);
    cpu.regs.write(w, RAX, value);
    Ok(Signal::Ok)
}

pub fn out_imm(cpu: &mut CPU, instr: &mut Instr) -> R {
    check_io(cpu)?;
    let port = cpu.fetch_u8()? as u16;
    let w = io_width(instr);
    let value = cpu.regs.read(w, RAX);
    let signal = cpu.bus.borrow_mut().write_port(port, w, value);
    Ok(signal)
}

pub fn in_dx(cpu: &mut CPU, instr: &mut Instr) -> R {
    check_io(cpu)?;
    let port = cpu.regs.read(Width::Word, RDX) as u16;
    let w = io_width(instr);
    let value = cpu.bus.borrow_mut().read_port(port, w);
    cpu.regs.write(w, RAX, value);
    Ok(Signal::Ok)
}

pub fn out_dx(cpu: &mut CPU, instr: &mut Instr) -> R {
    check_io(cpu)?;
    let port = cpu.regs.read(Width::Word, RDX) as u16;
    let w = io_width(instr);
    let value = cpu.regs.read(w, RAX);
    let signal = cpu.bus.borrow_mut().write_port(port, w, value);
    Ok(signal)
}

// ------------------------------------------------------------ frame ops

pub fn enter(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let size = cpu.fetch_u16()? as u64;
    let nesting = (cpu.fetch_u8()? & 0x1f) as u64;
    let sw = cpu.stack_width();
    cpu.push(w, cpu.regs.read(w, RBP))?;
    let frame = cpu.regs.read(sw, RSP);
    for level in 1..nesting {
        let bp = cpu.regs.read(sw, RBP).wrapping_sub(level * w.bytes()) & sw.mask();
        let saved = cpu.read_mem(SegReg::Ss, bp, w)?;
        cpu.push(w, saved)?;
    }
    if nesting > 0 {
        cpu.push(w, frame)?;
    }
    cpu.regs.write(w, RBP, frame);
    let sp = cpu.regs.read(sw, RSP).wrapping_sub(size) & sw.mask();
    cpu.regs.write(sw, RSP, sp);
    Ok(Signal::Ok)
}

pub fn leave(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let sw = cpu.stack_width();
    let bp = cpu.regs.read(sw, RBP);
    cpu.regs.write(sw, RSP, bp);
    let value = cpu.pop(w)?;
    cpu.regs.write(w, RBP, value);
    Ok(Signal::Ok)
}

// BOUND faults #BR when the index is outside the signed pair at the operand.
pub fn bound(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.long64() {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    decoder::modrm(cpu, instr)?;
    let w = instr.op_width;
    let rm = decoder::rm_operand(instr, w);
    let (seg, offset) = match rm {
        Operand::Mem { seg, offset } => (seg, offset),
        _ => return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false }),
    };
    let index = w.sign_extend(cpu.regs.read(w, instr.reg_field()));
    let lower = w.sign_extend(cpu.read_mem(seg, offset, w)?);
    let upper = w.sign_extend(cpu.read_mem(seg, offset.wrapping_add(w.bytes()), w)?);
    if index < lower || index > upper {
        return Err(Fault::BoundRange);
    }
    Ok(Signal::Ok)
}

// 0x63 is ARPL in legacy modes and MOVSXD in 64-bit code.
pub fn arpl_movsxd(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    if cpu.regs.long64() {
        let value = cpu.read_operand(&decoder::rm_operand(instr, Width::Long), Width::Long)?;
        let w = instr.op_width;
        let extended =
            if w == Width::Quad { Width::Long.sign_extend(value) as u64 } else { value };
        cpu.regs.write(w, instr.reg_field(), extended);
        return Ok(Signal::Ok);
    }
    if cpu.regs.mode() == CpuMode::Real {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    let rm = decoder::rm_operand(instr, Width::Word);
    let dest = cpu.read_operand(&rm, Width::Word)?;
    let src = cpu.read_operand(&decoder::reg_operand(instr, Width::Word), Width::Word)?;
    if dest & 3 < src & 3 {
        cpu.regs.set_flag(Flag::Zero, true);
        cpu.write_operand(&rm, Width::Word, dest & !3 | src & 3)?;
    } else {
        cpu.regs.set_flag(Flag::Zero, false);
    }
    Ok(Signal::Ok)
}
