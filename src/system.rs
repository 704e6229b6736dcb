// The privileged/system instruction surface: control-register moves,
// descriptor-table loads and stores, MSR access, CPUID/RDTSC, HLT, and the
// minimal FPU/SSE presence DOS-era loaders probe for. SSE data movement is
// modeled; SSE arithmetic is not.

use crate::alu::R;
use crate::decoder::{self, Instr};
use crate::devices::Signal;
use crate::error::Fault;
use crate::fields::{SegReg, Width};
use crate::processor::{Operand, CPU};
use crate::registers::{
    Cr0, Cr4, CpuMode, Efer, Flag, Segment, MSR_APIC_BASE, MSR_EFER, MSR_FS_BASE, MSR_GS_BASE,
    MSR_KERNEL_GS_BASE, MSR_SYSENTER_CS, MSR_SYSENTER_EIP, MSR_SYSENTER_ESP, MSR_TSC, RAX, RCX,
    RDX, SYS_TSS16_AVAIL, SYS_TSS32_AVAIL,
};

fn require_ring0(cpu: &CPU) -> Result<(), Fault> {
    if cpu.regs.mode() != CpuMode::Real && cpu.regs.cpl != 0 {
        return Err(Fault::GeneralProtection(0));
    }
    Ok(())
}

pub fn hlt(cpu: &mut CPU, _instr: &mut Instr) -> R {
    require_ring0(cpu)?;
    cpu.halted = true;
    Ok(Signal::Ok)
}

// ------------------------------------------------- group 6: 0F 00 /digit

pub fn group_0f00(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    match instr.digit() {
        0 => {
            // SLDT
            let w = if instr.modrm_is_register() { instr.op_width } else { Width::Word };
            let selector = cpu.regs.ldtr.selector as u64;
            cpu.write_operand(&decoder::rm_operand(instr, w), w, selector)?;
        }
        1 => {
            // STR
            let w = if instr.modrm_is_register() { instr.op_width } else { Width::Word };
            let selector = cpu.regs.tr.selector as u64;
            cpu.write_operand(&decoder::rm_operand(instr, w), w, selector)?;
        }
        2 => {
            // LLDT
            require_ring0(cpu)?;
            let selector =
                cpu.read_operand(&decoder::rm_operand(instr, Width::Word), Width::Word)? as u16;
            cpu.load_ldt(selector)?;
        }
        3 => {
            // LTR
            require_ring0(cpu)?;
            let selector =
                cpu.read_operand(&decoder::rm_operand(instr, Width::Word), Width::Word)? as u16;
            load_task_register(cpu, selector)?;
        }
        4 | 5 => {
            // VERR / VERW
            let selector =
                cpu.read_operand(&decoder::rm_operand(instr, Width::Word), Width::Word)? as u16;
            let readable = verify_selector(cpu, selector, instr.digit() == 5);
            cpu.regs.set_flag(Flag::Zero, readable);
        }
        _ => return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: true }),
    }
    Ok(Signal::Ok)
}

fn load_task_register(cpu: &mut CPU, selector: u16) -> Result<(), Fault> {
    if selector & !3 == 0 || selector & 4 != 0 {
        return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
    }
    let desc = cpu.fetch_descriptor(selector)?;
    if desc.is_code_data()
        || !matches!(desc.system_type(), SYS_TSS16_AVAIL | SYS_TSS32_AVAIL)
    {
        return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
    }
    if !desc.present() {
        return Err(Fault::NotPresent(selector & 0xfffc));
    }
    // mark it busy in the GDT and in the cache
    let access = (desc.attrs & 0xff) as u8 | 0x02;
    cpu.write_descriptor_access(selector, access)?;
    let mut cache = desc;
    cache.attrs |= 0x02;
    cpu.regs.tr = Segment { selector, cache };
    Ok(())
}

fn verify_selector(cpu: &mut CPU, selector: u16, for_write: bool) -> bool {
    if selector & !3 == 0 {
        return false;
    }
    let desc = match cpu.fetch_descriptor(selector) {
        Ok(desc) => desc,
        Err(_) => return false,
    };
    if !desc.is_code_data() || !desc.present() {
        return false;
    }
    let rpl = (selector & 3) as u8;
    if !desc.conforming() && (desc.dpl() < cpu.regs.cpl || desc.dpl() < rpl) {
        return false;
    }
    if for_write {
        desc.writable()
    } else {
        desc.readable()
    }
}

// ------------------------------------------------- group 7: 0F 01 /digit

pub fn group_0f01(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let digit = instr.digit();
    match digit {
        0 | 1 => {
            // SGDT / SIDT
            let rm = decoder::rm_operand(instr, instr.op_width);
            let (seg, offset) = mem_operand(cpu, instr, &rm)?;
            let table = if digit == 0 { cpu.regs.gdtr } else { cpu.regs.idtr };
            cpu.write_mem(seg, offset, Width::Word, table.limit as u64)?;
            let base_w = if cpu.regs.mode() == CpuMode::Long { Width::Quad } else { Width::Long };
            cpu.write_mem(seg, offset.wrapping_add(2), base_w, table.base)?;
        }
        2 | 3 => {
            // LGDT / LIDT
            require_ring0(cpu)?;
            let rm = decoder::rm_operand(instr, instr.op_width);
            let (seg, offset) = mem_operand(cpu, instr, &rm)?;
            let limit = cpu.read_mem(seg, offset, Width::Word)? as u16;
            let base_w = if cpu.regs.mode() == CpuMode::Long { Width::Quad } else { Width::Long };
            let mut base = cpu.read_mem(seg, offset.wrapping_add(2), base_w)?;
            if instr.op_width == Width::Word && cpu.regs.mode() != CpuMode::Long {
                base &= 0xff_ffff;
            }
            if digit == 2 {
                cpu.regs.gdtr = crate::registers::TableReg { base, limit };
            } else {
                cpu.regs.idtr = crate::registers::TableReg { base, limit };
            }
            log::debug!(
                "{} <- base {:#x} limit {:#x}",
                if digit == 2 { "gdtr" } else { "idtr" },
                base,
                limit
            );
        }
        4 => {
            // SMSW
            let w = if instr.modrm_is_register() { instr.op_width } else { Width::Word };
            let value = cpu.regs.cr0.bits() & 0xffff;
            cpu.write_operand(&decoder::rm_operand(instr, w), w, value)?;
        }
        6 => {
            // LMSW: low four CR0 bits, and PE can only be set
            require_ring0(cpu)?;
            let value =
                cpu.read_operand(&decoder::rm_operand(instr, Width::Word), Width::Word)?;
            let mut cr0 = cpu.regs.cr0.bits();
            cr0 = cr0 & !0xe | value & 0xe;
            if value & 1 != 0 {
                cr0 |= 1;
            }
            write_cr0(cpu, cr0)?;
        }
        7 => {
            // INVLPG: consume the address operand; there is no TLB to flush
            let rm = decoder::rm_operand(instr, instr.op_width);
            if mem_operand(cpu, instr, &rm).is_err() {
                return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: true });
            }
            require_ring0(cpu)?;
        }
        _ => return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: true }),
    }
    Ok(Signal::Ok)
}

fn mem_operand(
    cpu: &CPU,
    instr: &Instr,
    rm: &Operand,
) -> Result<(SegReg, u64), Fault> {
    match *rm {
        Operand::Mem { seg, offset } => Ok((seg, offset)),
        Operand::MemRipRel { seg, disp } => {
            Ok((seg, cpu.regs.rip.wrapping_add(disp as u64)))
        }
        _ => Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: instr.two_byte }),
    }
}

// --------------------------------------------------------- control registers

// CR0 writes are where mode changes happen: PE enters protected mode, PG with
// EFER.LME set activates long mode.
pub fn write_cr0(cpu: &mut CPU, value: u64) -> Result<(), Fault> {
    let new = Cr0::from_bits_truncate(value) | Cr0::ET;
    let old = cpu.regs.cr0;
    if new.contains(Cr0::PG) && !new.contains(Cr0::PE) {
        return Err(Fault::GeneralProtection(0));
    }
    cpu.regs.cr0 = new;
    if new.contains(Cr0::PG) && !old.contains(Cr0::PG) && cpu.regs.efer.contains(Efer::LME) {
        cpu.regs.efer |= Efer::LMA;
        log::debug!("long mode activated");
    }
    if !new.contains(Cr0::PG) && cpu.regs.efer.contains(Efer::LMA) {
        cpu.regs.efer -= Efer::LMA;
    }
    if new.contains(Cr0::PE) != old.contains(Cr0::PE) {
        log::debug!(
            "{} protected mode",
            if new.contains(Cr0::PE) { "entering" } else { "leaving" }
        );
        if !new.contains(Cr0::PE) {
            // dropping back to real mode re-derives the caches from selectors
            cpu.regs.cpl = 0;
            for seg in
                [SegReg::Es, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs].iter()
            {
                let selector = cpu.regs.seg(*seg).selector;
                *cpu.regs.seg_mut(*seg) = Segment::real_mode(selector);
            }
        }
    }
    Ok(())
}

pub fn mov_from_cr(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    require_ring0(cpu)?;
    let w = if cpu.regs.mode() == CpuMode::Long { Width::Quad } else { Width::Long };
    let value = match instr.reg_field() {
        0 => cpu.regs.cr0.bits(),
        2 => cpu.regs.cr2,
        3 => cpu.regs.cr3,
        4 => cpu.regs.cr4.bits(),
        _ => return Err(Fault::GeneralProtection(0)),
    };
    // mod is ignored: the operand is always a register
    let index = (instr.modrm.unwrap_or(0) & 7) as usize | instr.prefixes.rex_b();
    cpu.regs.write(w, index, value);
    Ok(Signal::Ok)
}

pub fn mov_to_cr(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    require_ring0(cpu)?;
    let w = if cpu.regs.mode() == CpuMode::Long { Width::Quad } else { Width::Long };
    let index = (instr.modrm.unwrap_or(0) & 7) as usize | instr.prefixes.rex_b();
    let value = cpu.regs.read(w, index);
    match instr.reg_field() {
        0 => write_cr0(cpu, value)?,
        2 => cpu.regs.cr2 = value,
        3 => {
            cpu.regs.cr3 = value;
            log::trace!("cr3 <- {:#x}", value);
        }
        4 => cpu.regs.cr4 = Cr4::from_bits_truncate(value),
        _ => return Err(Fault::GeneralProtection(0)),
    }
    Ok(Signal::Ok)
}

pub fn mov_from_dr(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    require_ring0(cpu)?;
    let w = if cpu.regs.mode() == CpuMode::Long { Width::Quad } else { Width::Long };
    let index = (instr.modrm.unwrap_or(0) & 7) as usize | instr.prefixes.rex_b();
    let value = cpu.regs.dr[instr.reg_field() & 7];
    cpu.regs.write(w, index, value);
    Ok(Signal::Ok)
}

pub fn mov_to_dr(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    require_ring0(cpu)?;
    let w = if cpu.regs.mode() == CpuMode::Long { Width::Quad } else { Width::Long };
    let index = (instr.modrm.unwrap_or(0) & 7) as usize | instr.prefixes.rex_b();
    cpu.regs.dr[instr.reg_field() & 7] = cpu.regs.read(w, index);
    Ok(Signal::Ok)
}

pub fn clts(cpu: &mut CPU, _instr: &mut Instr) -> R {
    require_ring0(cpu)?;
    cpu.regs.cr0 -= Cr0::TS;
    Ok(Signal::Ok)
}

// ----------------------------------------------------------------- MSRs

pub fn rdmsr(cpu: &mut CPU, _instr: &mut Instr) -> R {
    require_ring0(cpu)?;
    let msr = cpu.regs.read(Width::Long, RCX) as u32;
    let value = match msr {
        MSR_TSC => cpu.regs.tsc,
        MSR_APIC_BASE => cpu.regs.apic_base,
        MSR_SYSENTER_CS => cpu.regs.sysenter_cs,
        MSR_SYSENTER_ESP => cpu.regs.sysenter_esp,
        MSR_SYSENTER_EIP => cpu.regs.sysenter_eip,
        MSR_EFER => cpu.regs.efer.bits(),
        MSR_FS_BASE => cpu.regs.seg(SegReg::Fs).cache.base,
        MSR_GS_BASE => cpu.regs.seg(SegReg::Gs).cache.base,
        MSR_KERNEL_GS_BASE => cpu.regs.kernel_gs_base,
        other => {
            let value = cpu.regs.msr_extra.get(&other).copied().unwrap_or(0);
            log::warn!("rdmsr of unmodeled MSR {:#x} -> {:#x}", other, value);
            value
        }
    };
    cpu.regs.write(Width::Long, RAX, value & 0xffff_ffff);
    cpu.regs.write(Width::Long, RDX, value >> 32);
    Ok(Signal::Ok)
}

pub fn wrmsr(cpu: &mut CPU, _instr: &mut Instr) -> R {
    require_ring0(cpu)?;
    let msr = cpu.regs.read(Width::Long, RCX) as u32;
    let value = cpu.regs.read(Width::Long, RDX) << 32 | cpu.regs.read(Width::Long, RAX);
    match msr {
        MSR_TSC => cpu.regs.tsc = value,
        MSR_APIC_BASE => cpu.regs.apic_base = value,
        MSR_SYSENTER_CS => cpu.regs.sysenter_cs = value,
        MSR_SYSENTER_ESP => cpu.regs.sysenter_esp = value,
        MSR_SYSENTER_EIP => cpu.regs.sysenter_eip = value,
        MSR_EFER => {
            // LME cannot change while paging is on
            let new = Efer::from_bits_truncate(value);
            if cpu.regs.cr0.contains(Cr0::PG)
                && new.contains(Efer::LME) != cpu.regs.efer.contains(Efer::LME)
            {
                return Err(Fault::GeneralProtection(0));
            }
            let lma = cpu.regs.efer & Efer::LMA;
            cpu.regs.efer = new - Efer::LMA | lma;
        }
        MSR_FS_BASE => cpu.regs.seg_mut(SegReg::Fs).cache.base = value,
        MSR_GS_BASE => cpu.regs.seg_mut(SegReg::Gs).cache.base = value,
        MSR_KERNEL_GS_BASE => cpu.regs.kernel_gs_base = value,
        other => {
            log::warn!("wrmsr to unmodeled MSR {:#x} = {:#x}", other, value);
            cpu.regs.msr_extra.insert(other, value);
        }
    }
    Ok(Signal::Ok)
}

pub fn rdtsc(cpu: &mut CPU, _instr: &mut Instr) -> R {
    if cpu.regs.cr4.contains(Cr4::TSD) && cpu.regs.cpl != 0 {
        return Err(Fault::GeneralProtection(0));
    }
    let tsc = cpu.regs.tsc;
    cpu.regs.write(Width::Long, RAX, tsc & 0xffff_ffff);
    cpu.regs.write(Width::Long, RDX, tsc >> 32);
    Ok(Signal::Ok)
}

pub fn rdpmc(cpu: &mut CPU, _instr: &mut Instr) -> R {
    cpu.regs.write(Width::Long, RAX, 0);
    cpu.regs.write(Width::Long, RDX, 0);
    Ok(Signal::Ok)
}

// ----------------------------------------------------------------- CPUID

pub fn cpuid(cpu: &mut CPU, _instr: &mut Instr) -> R {
    let leaf = cpu.regs.read(Width::Long, RAX) as u32;
    let (a, b, c, d): (u64, u64, u64, u64) = match leaf {
        0 => (1, 0x756e_6547, 0x6c65_746e, 0x4965_6e69), // "GenuineIntel"
        1 => {
            // family 6, model 3: FPU PSE TSC MSR PAE SEP CMOV PGE FXSR MMX SSE SSE2
            let features = 1 | 1 << 3 | 1 << 4 | 1 << 5 | 1 << 6 | 1 << 11 | 1 << 13
                | 1 << 15 | 1 << 23 | 1 << 24 | 1 << 25 | 1 << 26;
            (0x633, 0, 0, features)
        }
        0x8000_0000 => (0x8000_0001, 0, 0, 0),
        0x8000_0001 => (0, 0, 0, 1 << 29), // long mode available
        _ => (0, 0, 0, 0),
    };
    cpu.regs.write(Width::Long, RAX, a);
    cpu.regs.write(Width::Long, crate::registers::RBX, b);
    cpu.regs.write(Width::Long, RCX, c);
    cpu.regs.write(Width::Long, RDX, d);
    Ok(Signal::Ok)
}

// ------------------------------------------------------- LAR / LSL

pub fn lar_lsl(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let w = instr.op_width;
    let selector =
        cpu.read_operand(&decoder::rm_operand(instr, Width::Word), Width::Word)? as u16;
    if selector & !3 == 0 {
        cpu.regs.set_flag(Flag::Zero, false);
        return Ok(Signal::Ok);
    }
    let desc = match cpu.fetch_descriptor(selector) {
        Ok(desc) => desc,
        Err(_) => {
            cpu.regs.set_flag(Flag::Zero, false);
            return Ok(Signal::Ok);
        }
    };
    let rpl = (selector & 3) as u8;
    let visible = desc.present()
        && (desc.conforming()
            || (desc.dpl() >= cpu.regs.cpl && desc.dpl() >= rpl)
            || !desc.is_code_data());
    if !visible {
        cpu.regs.set_flag(Flag::Zero, false);
        return Ok(Signal::Ok);
    }
    let value = if instr.opcode == 0x02 {
        (desc.attrs as u64) << 8 & 0x00f0_ff00
    } else {
        desc.limit as u64
    };
    cpu.regs.write(w, instr.reg_field(), value);
    cpu.regs.set_flag(Flag::Zero, true);
    Ok(Signal::Ok)
}

// --------------------------------------------------------- FPU presence

// D8..DF escape space. Enough x87 exists to satisfy init and status probes;
// everything else consumes its operand and moves on.
pub fn fpu_escape(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.cr0.contains(Cr0::EM) || cpu.regs.cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    decoder::modrm(cpu, instr)?;
    let modrm = instr.modrm.unwrap_or(0);
    match (instr.opcode, modrm) {
        (0xdb, 0xe3) => {
            // FNINIT
            cpu.regs.fpu_control = 0x37f;
            cpu.regs.fpu_status = 0;
        }
        (0xdf, 0xe0) => {
            // FNSTSW AX
            let status = cpu.regs.fpu_status as u64;
            cpu.regs.write(Width::Word, RAX, status);
        }
        (0xd9, _) if instr.digit() == 7 && !instr.modrm_is_register() => {
            // FNSTCW m16
            let control = cpu.regs.fpu_control as u64;
            let rm = decoder::rm_operand(instr, Width::Word);
            cpu.write_operand(&rm, Width::Word, control)?;
        }
        (0xd9, _) if instr.digit() == 5 && !instr.modrm_is_register() => {
            // FLDCW m16
            let rm = decoder::rm_operand(instr, Width::Word);
            cpu.regs.fpu_control = cpu.read_operand(&rm, Width::Word)? as u16;
        }
        _ => {
            log::trace!("x87 escape {:#04x} /{} ignored", instr.opcode, instr.digit());
        }
    }
    Ok(Signal::Ok)
}

pub fn fwait(cpu: &mut CPU, _instr: &mut Instr) -> R {
    if cpu.regs.cr0.contains(Cr0::MP) && cpu.regs.cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    Ok(Signal::Ok)
}

// ------------------------------------------------------ SSE loads/stores

// 0F 10/11 (MOVUPS) and 0F 28/29 (MOVAPS): 16-byte moves between XMM
// registers and memory.
pub fn movps(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.cr0.contains(Cr0::EM) {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: true });
    }
    if cpu.regs.cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    decoder::modrm(cpu, instr)?;
    let xmm = instr.reg_field() & 7;
    let store = instr.opcode & 1 == 1;
    let rm = decoder::rm_operand(instr, Width::Quad);
    match rm {
        Operand::Reg(index) => {
            let index = index & 7;
            if store {
                cpu.regs.xmm[index] = cpu.regs.xmm[xmm];
            } else {
                cpu.regs.xmm[xmm] = cpu.regs.xmm[index];
            }
        }
        _ => {
            let (seg, offset) = mem_operand(cpu, instr, &rm)?;
            if store {
                let value = cpu.regs.xmm[xmm];
                cpu.write_mem(seg, offset, Width::Quad, value as u64)?;
                cpu.write_mem(seg, offset.wrapping_add(8), Width::Quad, (value >> 64) as u64)?;
            } else {
                let low = cpu.read_mem(seg, offset, Width::Quad)?;
                let high = cpu.read_mem(seg, offset.wrapping_add(8), Width::Quad)?;
                cpu.regs.xmm[xmm] = (high as u128) << 64 | low as u128;
            }
        }
    }
    Ok(Signal::Ok)
}

// Group 15: 0F AE. FXSAVE/FXRSTOR use the fixed 512-byte layout; the fence
// encodings are no-ops on an interpreter this strict about ordering already.
pub fn group_0fae(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    if instr.modrm_is_register() {
        // LFENCE/MFENCE/SFENCE
        return Ok(Signal::Ok);
    }
    let rm = decoder::rm_operand(instr, instr.op_width);
    let (seg, offset) = mem_operand(cpu, instr, &rm)?;
    match instr.digit() {
        0 => {
            // FXSAVE
            cpu.write_mem(seg, offset, Width::Word, cpu.regs.fpu_control as u64)?;
            cpu.write_mem(seg, offset.wrapping_add(2), Width::Word, cpu.regs.fpu_status as u64)?;
            cpu.write_mem(seg, offset.wrapping_add(24), Width::Long, cpu.regs.mxcsr as u64)?;
            for j in 0..8u64 {
                let value = cpu.regs.xmm[j as usize];
                cpu.write_mem(seg, offset.wrapping_add(160 + 16 * j), Width::Quad, value as u64)?;
                cpu.write_mem(
                    seg,
                    offset.wrapping_add(168 + 16 * j),
                    Width::Quad,
                    (value >> 64) as u64,
                )?;
            }
        }
        1 => {
            // FXRSTOR
            cpu.regs.fpu_control = cpu.read_mem(seg, offset, Width::Word)? as u16;
            cpu.regs.fpu_status = cpu.read_mem(seg, offset.wrapping_add(2), Width::Word)? as u16;
            cpu.regs.mxcsr = cpu.read_mem(seg, offset.wrapping_add(24), Width::Long)? as u32;
            for j in 0..8u64 {
                let low = cpu.read_mem(seg, offset.wrapping_add(160 + 16 * j), Width::Quad)?;
                let high = cpu.read_mem(seg, offset.wrapping_add(168 + 16 * j), Width::Quad)?;
                cpu.regs.xmm[j as usize] = (high as u128) << 64 | low as u128;
            }
        }
        2 => cpu.regs.mxcsr = cpu.read_mem(seg, offset, Width::Long)? as u32,
        3 => {
            let mxcsr = cpu.regs.mxcsr as u64;
            cpu.write_mem(seg, offset, Width::Long, mxcsr)?;
        }
        7 => {} // CLFLUSH
        _ => return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: true }),
    }
    Ok(Signal::Ok)
}

// 0F 18..1F: hint space, including the canonical long NOP.
pub fn nop_modrm(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    Ok(Signal::Ok)
}

pub fn invd(cpu: &mut CPU, _instr: &mut Instr) -> R {
    require_ring0(cpu)?;
    Ok(Signal::Ok)
}

pub fn ud2(_cpu: &mut CPU, instr: &mut Instr) -> R {
    Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: true })
}
