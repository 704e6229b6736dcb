// This is where the dirty grunt work of making sense of the byte stream
// happens: the prefix loop, ModR/M and SIB, and effective-address formation.
//
// One invariant is load-bearing: displacement bytes are consumed exactly once,
// when the ModR/M operand is first resolved. Handlers that also carry an
// immediate must resolve the operand first and fetch the immediate afterwards,
// which is the encoding order anyway.

use crate::error::Fault;
use crate::fields::{Prefixes, RepKind, Rex, SegReg, Width};
use crate::processor::{Operand, CPU};
use crate::registers::{RBP, RBX, RDI, RSI};

pub struct Instr {
    pub prefixes: Prefixes,
    pub opcode: u8,
    pub two_byte: bool,
    pub op_width: Width,
    pub addr_width: Width,
    pub modrm: Option<u8>,
    pub rm: Option<Operand>,
}

impl Instr {
    // ModR/M reg field extended by REX.R: a register number or group digit.
    pub fn reg_field(&self) -> usize {
        (self.modrm.unwrap_or(0) >> 3 & 7) as usize | self.prefixes.rex_r()
    }
    pub fn digit(&self) -> u8 {
        self.modrm.unwrap_or(0) >> 3 & 7
    }
    pub fn modrm_is_register(&self) -> bool {
        self.modrm.map_or(false, |byte| byte >> 6 == 3)
    }
    // Effective width for the opcode's byte/word split (even opcodes are the
    // byte form across most of the map).
    pub fn width_by_parity(&self) -> Width {
        if self.opcode & 1 == 0 {
            Width::Byte
        } else {
            self.op_width
        }
    }
}

// Run the prefix loop and terminal opcode fetch. Prefix effects last for the
// single decoded instruction. REX is only recognized in 64-bit code and must
// be the byte directly before the opcode; an intervening prefix voids it.
pub fn decode(cpu: &mut CPU) -> Result<Instr, Fault> {
    let long64 = cpu.regs.long64();
    let mut prefixes = Prefixes::new();
    let opcode = loop {
        let byte = cpu.fetch_u8()?;
        match byte {
            0xf0 => {
                prefixes.lock = true;
                prefixes.rex = None;
            }
            0xf2 => {
                prefixes.rep = Some(RepKind::Repne);
                prefixes.rex = None;
            }
            0xf3 => {
                prefixes.rep = Some(RepKind::Rep);
                prefixes.rex = None;
            }
            0x26 => {
                prefixes.segment = Some(SegReg::Es);
                prefixes.rex = None;
            }
            0x2e => {
                prefixes.segment = Some(SegReg::Cs);
                prefixes.rex = None;
            }
            0x36 => {
                prefixes.segment = Some(SegReg::Ss);
                prefixes.rex = None;
            }
            0x3e => {
                prefixes.segment = Some(SegReg::Ds);
                prefixes.rex = None;
            }
            0x64 => {
                prefixes.segment = Some(SegReg::Fs);
                prefixes.rex = None;
            }
            0x65 => {
                prefixes.segment = Some(SegReg::Gs);
                prefixes.rex = None;
            }
            0x66 => {
                prefixes.operand_size = true;
                prefixes.rex = None;
            }
            0x67 => {
                prefixes.address_size = true;
                prefixes.rex = None;
            }
            0x40..=0x4f if long64 => {
                prefixes.rex = Some(Rex::from_byte(byte));
            }
            opcode => break opcode,
        }
    };
    let (two_byte, opcode) = if opcode == 0x0f {
        (true, cpu.fetch_u8()?)
    } else {
        (false, opcode)
    };

    let (op_width, addr_width) = if long64 {
        let op = if prefixes.rex_w() {
            Width::Quad
        } else if prefixes.operand_size {
            Width::Word
        } else {
            Width::Long
        };
        let addr = if prefixes.address_size { Width::Long } else { Width::Quad };
        (op, addr)
    } else {
        let default32 = cpu.regs.seg(SegReg::Cs).cache.default_big();
        let op = if default32 != prefixes.operand_size { Width::Long } else { Width::Word };
        let addr = if default32 != prefixes.address_size { Width::Long } else { Width::Word };
        (op, addr)
    };

    Ok(Instr { prefixes, opcode, two_byte, op_width, addr_width, modrm: None, rm: None })
}

// Fetch the ModR/M byte and resolve the r/m operand, exactly once per
// instruction. Safe to call again; later calls see the cached result.
pub fn modrm(cpu: &mut CPU, instr: &mut Instr) -> Result<(), Fault> {
    if instr.modrm.is_some() {
        return Ok(());
    }
    let byte = cpu.fetch_u8()?;
    instr.modrm = Some(byte);
    let md = byte >> 6;
    let rm = (byte & 7) as usize;
    if md == 3 {
        instr.rm = Some(Operand::Reg(rm | instr.prefixes.rex_b()));
        return Ok(());
    }
    let operand = match instr.addr_width {
        Width::Word => ea16(cpu, instr, md, rm)?,
        _ => ea32(cpu, instr, md, rm)?,
    };
    instr.rm = Some(operand);
    Ok(())
}

// The legacy 16-bit addressing table.
fn ea16(cpu: &mut CPU, instr: &Instr, md: u8, rm: usize) -> Result<Operand, Fault> {
    let regs = &cpu.regs;
    let (base, default_seg) = match rm {
        0 => (regs.read(Width::Word, RBX) + regs.read(Width::Word, RSI), SegReg::Ds),
        1 => (regs.read(Width::Word, RBX) + regs.read(Width::Word, RDI), SegReg::Ds),
        2 => (regs.read(Width::Word, RBP) + regs.read(Width::Word, RSI), SegReg::Ss),
        3 => (regs.read(Width::Word, RBP) + regs.read(Width::Word, RDI), SegReg::Ss),
        4 => (regs.read(Width::Word, RSI), SegReg::Ds),
        5 => (regs.read(Width::Word, RDI), SegReg::Ds),
        6 if md == 0 => (0, SegReg::Ds),
        6 => (regs.read(Width::Word, RBP), SegReg::Ss),
        _ => (regs.read(Width::Word, RBX), SegReg::Ds),
    };
    let disp = match md {
        0 if rm == 6 => cpu.fetch_u16()? as u64,
        0 => 0,
        1 => cpu.fetch_i8()? as u64,
        _ => cpu.fetch_u16()? as i16 as i64 as u64,
    };
    let offset = base.wrapping_add(disp) & 0xffff;
    let seg = instr.prefixes.segment.unwrap_or(default_seg);
    Ok(Operand::Mem { seg, offset })
}

// 32/64-bit addressing: base register, optional SIB, optional displacement.
// In 64-bit code `[disp32]` with mod=00 r/m=101 becomes RIP-relative.
fn ea32(cpu: &mut CPU, instr: &Instr, md: u8, rm: usize) -> Result<Operand, Fault> {
    let aw = instr.addr_width;
    let long64 = cpu.regs.long64();
    let mut default_seg = SegReg::Ds;
    let mut offset: u64;
    if rm == 4 {
        // SIB byte: scale | index | base
        let sib = cpu.fetch_u8()?;
        let scale = sib >> 6;
        let index_enc = (sib >> 3 & 7) as usize | instr.prefixes.rex_x();
        let base_enc = (sib & 7) as usize | instr.prefixes.rex_b();
        // index 100 without REX.X means "no index"
        let index = if index_enc == 4 { 0 } else { cpu.regs.read(aw, index_enc) << scale };
        if sib & 7 == 5 && md == 0 {
            // no base, disp32 follows
            let disp = cpu.fetch_u32()? as i32 as i64 as u64;
            offset = disp.wrapping_add(index);
        } else {
            if base_enc & 7 == 4 || base_enc & 7 == 5 {
                default_seg = SegReg::Ss;
            }
            offset = cpu.regs.read(aw, base_enc).wrapping_add(index);
        }
    } else if rm == 5 && md == 0 {
        let disp = cpu.fetch_u32()? as i32 as i64;
        if long64 {
            let seg = instr.prefixes.segment.unwrap_or(SegReg::Ds);
            return Ok(Operand::MemRipRel { seg, disp });
        }
        offset = disp as u64;
    } else {
        if rm == 5 {
            default_seg = SegReg::Ss;
        }
        offset = cpu.regs.read(aw, rm | instr.prefixes.rex_b());
    }
    match md {
        1 => offset = offset.wrapping_add(cpu.fetch_i8()? as u64),
        2 => offset = offset.wrapping_add(cpu.fetch_u32()? as i32 as i64 as u64),
        _ => {}
    }
    let seg = instr.prefixes.segment.unwrap_or(default_seg);
    Ok(Operand::Mem { seg, offset: offset & aw.mask() })
}

// Byte-width register operands without REX reach AH/CH/DH/BH for
// encodings 4..7; with any REX present they reach SPL/BPL/SIL/DIL.
fn byte_reg(index: usize, has_rex: bool) -> Operand {
    if !has_rex && (4..8).contains(&index) {
        Operand::Reg8H(index - 4)
    } else {
        Operand::Reg(index)
    }
}

// The resolved r/m operand, adjusted for the high-byte register file when the
// access width is one byte.
pub fn rm_operand(instr: &Instr, width: Width) -> Operand {
    let op = instr.rm.expect("ModR/M not resolved");
    match op {
        Operand::Reg(index) if width == Width::Byte => {
            byte_reg(index, instr.prefixes.rex.is_some())
        }
        other => other,
    }
}

// The reg-field operand at the given width.
pub fn reg_operand(instr: &Instr, width: Width) -> Operand {
    if width == Width::Byte {
        byte_reg(instr.reg_field(), instr.prefixes.rex.is_some())
    } else {
        Operand::Reg(instr.reg_field())
    }
}

// Register operand encoded in the low opcode bits (B0+r, 50+r, 91+r ...).
pub fn opcode_reg(instr: &Instr, width: Width) -> Operand {
    let index = (instr.opcode & 7) as usize | instr.prefixes.rex_b();
    if width == Width::Byte {
        byte_reg(index, instr.prefixes.rex.is_some())
    } else {
        Operand::Reg(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Bus, BusPtr};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cpu_with_code(code: &[u8]) -> CPU {
        let bus: BusPtr = Rc::new(RefCell::new(Bus::new()));
        bus.borrow_mut().write_bytes(0x1000, code);
        let mut cpu = CPU::new(bus);
        *cpu.regs.seg_mut(SegReg::Cs) = crate::registers::Segment::real_mode(0x100);
        cpu.regs.rip = 0;
        cpu
    }

    #[test]
    fn last_segment_prefix_wins() {
        let mut cpu = cpu_with_code(&[0x26, 0x3e, 0x64, 0x90]);
        let instr = decode(&mut cpu).unwrap();
        assert_eq!(instr.opcode, 0x90);
        assert_eq!(instr.prefixes.segment, Some(SegReg::Fs));
    }

    #[test]
    fn operand_size_toggles_width() {
        let mut cpu = cpu_with_code(&[0x66, 0xb8]);
        let instr = decode(&mut cpu).unwrap();
        // real mode defaults to 16; 0x66 selects 32
        assert_eq!(instr.op_width, Width::Long);
        assert_eq!(instr.addr_width, Width::Word);
    }

    #[test]
    fn modrm_disp16_direct() {
        // 8B 1E 34 12: MOV BX, [0x1234]
        let mut cpu = cpu_with_code(&[0x8b, 0x1e, 0x34, 0x12]);
        let mut instr = decode(&mut cpu).unwrap();
        modrm(&mut cpu, &mut instr).unwrap();
        match instr.rm.unwrap() {
            Operand::Mem { seg, offset } => {
                assert_eq!(seg, SegReg::Ds);
                assert_eq!(offset, 0x1234);
            }
            other => panic!("unexpected operand {:?}", other),
        }
        assert_eq!(instr.reg_field(), RBX);
    }

    #[test]
    fn modrm_bp_defaults_to_stack_segment() {
        // 8A 46 02: MOV AL, [BP+2]
        let mut cpu = cpu_with_code(&[0x8a, 0x46, 0x02]);
        cpu.regs.write(Width::Word, RBP, 0x100);
        let mut instr = decode(&mut cpu).unwrap();
        modrm(&mut cpu, &mut instr).unwrap();
        match instr.rm.unwrap() {
            Operand::Mem { seg, offset } => {
                assert_eq!(seg, SegReg::Ss);
                assert_eq!(offset, 0x102);
            }
            other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn modrm_is_resolved_only_once() {
        let mut cpu = cpu_with_code(&[0x8b, 0x1e, 0x34, 0x12, 0x55]);
        let mut instr = decode(&mut cpu).unwrap();
        modrm(&mut cpu, &mut instr).unwrap();
        let rip = cpu.regs.rip;
        modrm(&mut cpu, &mut instr).unwrap();
        // a second call must not consume more displacement bytes
        assert_eq!(cpu.regs.rip, rip);
    }

    #[test]
    fn high_byte_registers_without_rex() {
        match byte_reg(4, false) {
            Operand::Reg8H(0) => {}
            other => panic!("expected AH, got {:?}", other),
        }
        match byte_reg(4, true) {
            Operand::Reg(4) => {}
            other => panic!("expected SPL, got {:?}", other),
        }
    }
}
