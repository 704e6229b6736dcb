// Control transfers: relative and indirect jumps and calls, returns, the
// far-transfer machinery with call gates and privilege-changing stacks, task
// switching via the TSS, and the SYSENTER/SYSEXIT fast path. Branch targets
// are always computed as segment offsets; the CS cache base enters only when
// an offset is turned into a linear address.

use crate::alu::{self, R};
use crate::decoder::{self, Instr};
use crate::devices::Signal;
use crate::error::Fault;
use crate::fields::{Cond, SegReg, Width};
use crate::interrupts;
use crate::processor::{Operand, CPU};
use crate::registers::{
    CpuMode, Descriptor, Flag, Gate, Segment, RCX, RDX, RSP, SYS_CALL_GATE16, SYS_CALL_GATE32,
    SYS_TASK_GATE, SYS_TSS16_AVAIL, SYS_TSS16_BUSY, SYS_TSS32_AVAIL, SYS_TSS32_BUSY,
};
use crate::transfer::stack_op_width;

// ------------------------------------------------------------ near branches

// Near targets wrap at the operand width; 64-bit code branches over the full
// canonical range.
fn branch_near(cpu: &mut CPU, instr: &Instr, disp: i64) {
    let w = if cpu.regs.long64() { Width::Quad } else { instr.op_width };
    cpu.set_ip(cpu.regs.rip.wrapping_add(disp as u64), w);
}

pub fn jcc_short(cpu: &mut CPU, instr: &mut Instr) -> R {
    let disp = cpu.fetch_i8()?;
    if Cond::from_nibble(instr.opcode & 0xf).holds(cpu.regs.rflags) {
        branch_near(cpu, instr, disp);
    }
    Ok(Signal::Ok)
}

pub fn jcc_near(cpu: &mut CPU, instr: &mut Instr) -> R {
    let raw = cpu.fetch_imm(instr.op_width)?;
    let disp = instr.op_width.sign_extend(raw);
    if Cond::from_nibble(instr.opcode & 0xf).holds(cpu.regs.rflags) {
        branch_near(cpu, instr, disp);
    }
    Ok(Signal::Ok)
}

pub fn jmp_short(cpu: &mut CPU, instr: &mut Instr) -> R {
    let disp = cpu.fetch_i8()?;
    branch_near(cpu, instr, disp);
    Ok(Signal::Ok)
}

pub fn jmp_near(cpu: &mut CPU, instr: &mut Instr) -> R {
    let raw = cpu.fetch_imm(instr.op_width)?;
    branch_near(cpu, instr, instr.op_width.sign_extend(raw));
    Ok(Signal::Ok)
}

pub fn call_near(cpu: &mut CPU, instr: &mut Instr) -> R {
    let raw = cpu.fetch_imm(instr.op_width)?;
    let disp = instr.op_width.sign_extend(raw);
    let w = stack_op_width(cpu, instr);
    cpu.push(w, cpu.regs.rip)?;
    branch_near(cpu, instr, disp);
    Ok(Signal::Ok)
}

pub fn jcxz(cpu: &mut CPU, instr: &mut Instr) -> R {
    let disp = cpu.fetch_i8()?;
    if cpu.regs.read(instr.addr_width, RCX) == 0 {
        branch_near(cpu, instr, disp);
    }
    Ok(Signal::Ok)
}

// E0..E2: LOOPNE / LOOPE / LOOP, counting at the address width.
pub fn loop_cc(cpu: &mut CPU, instr: &mut Instr) -> R {
    let disp = cpu.fetch_i8()?;
    let aw = instr.addr_width;
    let count = cpu.regs.read(aw, RCX).wrapping_sub(1) & aw.mask();
    cpu.regs.write(aw, RCX, count);
    let zf = cpu.regs.flag(Flag::Zero);
    let taken = count != 0
        && match instr.opcode {
            0xe0 => !zf,
            0xe1 => zf,
            _ => true,
        };
    if taken {
        branch_near(cpu, instr, disp);
    }
    Ok(Signal::Ok)
}

// ------------------------------------------------------------ near returns

pub fn ret_near(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let adjust = if instr.opcode == 0xc2 { cpu.fetch_u16()? as u64 } else { 0 };
    let target = cpu.pop(w)?;
    let sw = cpu.stack_width();
    let sp = cpu.regs.read(sw, RSP).wrapping_add(adjust) & sw.mask();
    cpu.regs.write(sw, RSP, sp);
    cpu.set_ip(target, w);
    Ok(Signal::Ok)
}

// ------------------------------------------------- indirect forms (group 5)

// An indirect transfer that resolves to linear 0 is a chased null pointer;
// abort with the location rather than spinning through #GP.
fn null_transfer_check(cpu: &CPU, offset: u64) -> Result<(), Fault> {
    if cpu.regs.seg(SegReg::Cs).cache.base.wrapping_add(offset) == 0 {
        return Err(Fault::NullTransfer { cs: cpu.instr_start_cs, ip: cpu.instr_start });
    }
    Ok(())
}

pub fn group_ff(cpu: &mut CPU, instr: &mut Instr) -> R {
    decoder::modrm(cpu, instr)?;
    let w = if cpu.regs.long64() { Width::Quad } else { instr.op_width };
    let ow = instr.op_width;
    match instr.digit() {
        0 => alu::inc_dec_rm(cpu, instr, ow, false)?,
        1 => alu::inc_dec_rm(cpu, instr, ow, true)?,
        2 => {
            let target = cpu.read_operand(&decoder::rm_operand(instr, w), w)?;
            null_transfer_check(cpu, target)?;
            let pw = stack_op_width(cpu, instr);
            cpu.push(pw, cpu.regs.rip)?;
            cpu.set_ip(target, w);
        }
        3 | 5 => {
            // far pointer in memory: offset then selector
            let rm = decoder::rm_operand(instr, instr.op_width);
            let (seg, offset) = match rm {
                Operand::Mem { seg, offset } => (seg, offset),
                _ => {
                    return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false })
                }
            };
            let ow = instr.op_width;
            let target = cpu.read_mem(seg, offset, ow)?;
            let selector = cpu.read_mem(seg, offset.wrapping_add(ow.bytes()), Width::Word)?;
            far_transfer(cpu, instr, selector as u16, target, instr.digit() == 3)?;
        }
        4 => {
            let target = cpu.read_operand(&decoder::rm_operand(instr, w), w)?;
            null_transfer_check(cpu, target)?;
            cpu.set_ip(target, w);
        }
        6 => {
            let pw = stack_op_width(cpu, instr);
            let value = cpu.read_operand(&decoder::rm_operand(instr, pw), pw)?;
            cpu.push(pw, value)?;
        }
        _ => return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false }),
    }
    Ok(Signal::Ok)
}

// ------------------------------------------------------------ far transfers

// 9A and EA: ptr16:16/32 immediates. Not encodable in 64-bit code.
pub fn call_far(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.long64() {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    let offset = cpu.fetch_imm(instr.op_width)?;
    let selector = cpu.fetch_u16()?;
    far_transfer(cpu, instr, selector, offset, true)?;
    Ok(Signal::Ok)
}

pub fn jmp_far(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.long64() {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    let offset = cpu.fetch_imm(instr.op_width)?;
    let selector = cpu.fetch_u16()?;
    far_transfer(cpu, instr, selector, offset, false)?;
    Ok(Signal::Ok)
}

// The far CALL/JMP resolution ladder: plain code segment, call gate, task
// gate or TSS.
pub fn far_transfer(
    cpu: &mut CPU,
    instr: &Instr,
    selector: u16,
    offset: u64,
    is_call: bool,
) -> Result<(), Fault> {
    if cpu.regs.mode() == CpuMode::Real {
        if is_call {
            let w = instr.op_width;
            cpu.push(w, cpu.regs.seg(SegReg::Cs).selector as u64)?;
            cpu.push(w, cpu.regs.rip)?;
        }
        *cpu.regs.seg_mut(SegReg::Cs) = Segment::real_mode(selector);
        cpu.set_ip(offset, instr.op_width);
        return Ok(());
    }
    if selector & !3 == 0 {
        return Err(Fault::GeneralProtection(0));
    }
    let raw = cpu.fetch_descriptor_raw(selector)?;
    let desc = Descriptor::from_raw(raw);
    if desc.is_code_data() {
        far_to_code(cpu, instr, selector, desc, offset, is_call)
    } else {
        match desc.system_type() {
            SYS_CALL_GATE16 | SYS_CALL_GATE32 => {
                far_through_gate(cpu, selector, Gate::from_raw(raw), is_call)
            }
            SYS_TASK_GATE => {
                let gate = Gate::from_raw(raw);
                let tss_raw = cpu.fetch_descriptor_raw(gate.selector)?;
                task_switch(
                    cpu,
                    gate.selector,
                    Descriptor::from_raw(tss_raw),
                    if is_call { TaskEntry::Call } else { TaskEntry::Jump },
                )
            }
            SYS_TSS16_AVAIL | SYS_TSS32_AVAIL => task_switch(
                cpu,
                selector,
                desc,
                if is_call { TaskEntry::Call } else { TaskEntry::Jump },
            ),
            _ => Err(Fault::GeneralProtection(selector as u32 & 0xfffc)),
        }
    }
}

fn far_to_code(
    cpu: &mut CPU,
    instr: &Instr,
    selector: u16,
    desc: Descriptor,
    offset: u64,
    is_call: bool,
) -> Result<(), Fault> {
    let cpl = cpu.regs.cpl;
    let rpl = (selector & 3) as u8;
    if !desc.executable() {
        return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
    }
    if desc.conforming() {
        if desc.dpl() > cpl {
            return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
        }
    } else if rpl > cpl || desc.dpl() != cpl {
        return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
    }
    if !desc.present() {
        return Err(Fault::NotPresent(selector & 0xfffc));
    }
    if is_call {
        let w = instr.op_width;
        cpu.push(w, cpu.regs.seg(SegReg::Cs).selector as u64)?;
        cpu.push(w, cpu.regs.rip)?;
    }
    let selector = selector & !3 | cpl as u16;
    *cpu.regs.seg_mut(SegReg::Cs) = Segment { selector, cache: desc };
    let w = if cpu.regs.long64() { Width::Quad } else { instr.op_width };
    cpu.set_ip(offset, w);
    Ok(())
}

// Ring stack pointers live in the current TSS.
pub fn ring_stack(cpu: &mut CPU, ring: u8) -> Result<(u16, u64), Fault> {
    let tr = cpu.regs.tr;
    if tr.selector & !3 == 0 {
        return Err(Fault::InvalidTss(0));
    }
    let base = tr.cache.base;
    match tr.cache.system_type() {
        SYS_TSS16_AVAIL | SYS_TSS16_BUSY => {
            let sp = cpu.linear_read(base + 2 + 4 * ring as u64, Width::Word, crate::paging::Access::Read)?;
            let ss = cpu.linear_read(base + 4 + 4 * ring as u64, Width::Word, crate::paging::Access::Read)?;
            Ok((ss as u16, sp))
        }
        _ => {
            // 32-bit and 64-bit layouts both keep stack slots starting at 4
            let sp_width = if cpu.regs.mode() == CpuMode::Long { Width::Quad } else { Width::Long };
            let sp = cpu.linear_read(base + 4 + 8 * ring as u64, sp_width, crate::paging::Access::Read)?;
            let ss = if cpu.regs.mode() == CpuMode::Long {
                0
            } else {
                cpu.linear_read(base + 8 + 8 * ring as u64, Width::Word, crate::paging::Access::Read)?
            };
            Ok((ss as u16, sp))
        }
    }
}

fn far_through_gate(cpu: &mut CPU, gate_sel: u16, gate: Gate, is_call: bool) -> Result<(), Fault> {
    let cpl = cpu.regs.cpl;
    let rpl = (gate_sel & 3) as u8;
    if gate.dpl < cpl || gate.dpl < rpl {
        return Err(Fault::GeneralProtection(gate_sel as u32 & 0xfffc));
    }
    if !gate.present {
        return Err(Fault::NotPresent(gate_sel & 0xfffc));
    }
    if gate.selector & !3 == 0 {
        return Err(Fault::GeneralProtection(0));
    }
    let target = cpu.fetch_descriptor(gate.selector)?;
    if !target.executable() {
        return Err(Fault::GeneralProtection(gate.selector as u32 & 0xfffc));
    }
    if !target.present() {
        return Err(Fault::NotPresent(gate.selector & 0xfffc));
    }
    let w = gate.push_width();
    if is_call && !target.conforming() && target.dpl() < cpl {
        // privilege escalation: switch to the callee ring's stack and carry
        // `param_count` stack words across
        let new_cpl = target.dpl();
        let (new_ss, new_sp) = ring_stack(cpu, new_cpl)?;
        let old_ss = cpu.regs.seg(SegReg::Ss).selector;
        let old_sp = cpu.regs.read(cpu.stack_width(), RSP);
        let mut params = Vec::new();
        for j in 0..gate.param_count as u64 {
            let offset = old_sp.wrapping_add(j * w.bytes());
            params.push(cpu.read_mem(SegReg::Ss, offset, w)?);
        }
        cpu.regs.cpl = new_cpl;
        let ss_desc = cpu.fetch_descriptor(new_ss)?;
        if !ss_desc.writable() {
            return Err(Fault::InvalidTss(new_ss & 0xfffc));
        }
        *cpu.regs.seg_mut(SegReg::Ss) =
            Segment { selector: new_ss & !3 | new_cpl as u16, cache: ss_desc };
        cpu.regs.write(cpu.stack_width(), RSP, new_sp);
        cpu.push(w, old_ss as u64)?;
        cpu.push(w, old_sp)?;
        for &param in params.iter().rev() {
            cpu.push(w, param)?;
        }
        cpu.push(w, cpu.regs.seg(SegReg::Cs).selector as u64)?;
        cpu.push(w, cpu.regs.rip)?;
        let selector = gate.selector & !3 | new_cpl as u16;
        *cpu.regs.seg_mut(SegReg::Cs) = Segment { selector, cache: target };
        cpu.set_ip(gate.target_offset(), w);
        return Ok(());
    }
    // same-privilege transfer through the gate
    if !target.conforming() && target.dpl() != cpl && is_call {
        return Err(Fault::GeneralProtection(gate.selector as u32 & 0xfffc));
    }
    if is_call {
        cpu.push(w, cpu.regs.seg(SegReg::Cs).selector as u64)?;
        cpu.push(w, cpu.regs.rip)?;
    }
    let selector = gate.selector & !3 | cpl as u16;
    *cpu.regs.seg_mut(SegReg::Cs) = Segment { selector, cache: target };
    cpu.set_ip(gate.target_offset(), w);
    Ok(())
}

// -------------------------------------------------------------- far returns

pub fn ret_far(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = stack_op_width(cpu, instr);
    let adjust = if instr.opcode == 0xca { cpu.fetch_u16()? as u64 } else { 0 };
    let target = cpu.pop(w)?;
    let selector = cpu.pop(w)? as u16;
    let sw = cpu.stack_width();
    let sp = cpu.regs.read(sw, RSP).wrapping_add(adjust) & sw.mask();
    cpu.regs.write(sw, RSP, sp);

    if cpu.regs.mode() == CpuMode::Real {
        *cpu.regs.seg_mut(SegReg::Cs) = Segment::real_mode(selector);
        cpu.set_ip(target, w);
        return Ok(Signal::Ok);
    }
    let cpl = cpu.regs.cpl;
    let rpl = (selector & 3) as u8;
    if rpl < cpl {
        return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
    }
    let desc = cpu.fetch_descriptor(selector)?;
    if !desc.executable() || !desc.present() {
        return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
    }
    if rpl > cpl {
        // return to an outer ring: the caller's SS:SP comes off this stack
        let new_sp = cpu.pop(w)?;
        let new_ss = cpu.pop(w)? as u16;
        cpu.regs.cpl = rpl;
        let ss_desc = cpu.fetch_descriptor(new_ss)?;
        *cpu.regs.seg_mut(SegReg::Ss) = Segment { selector: new_ss, cache: ss_desc };
        let sw = cpu.stack_width();
        cpu.regs.write(sw, RSP, new_sp.wrapping_add(adjust) & sw.mask());
        interrupts::demote_data_segments(cpu);
    }
    *cpu.regs.seg_mut(SegReg::Cs) = Segment { selector, cache: desc };
    cpu.set_ip(target, w);
    Ok(Signal::Ok)
}

// ------------------------------------------------------------- soft ints

pub fn int3(cpu: &mut CPU, _instr: &mut Instr) -> R {
    interrupts::software_int(cpu, 3)
}

pub fn int_imm(cpu: &mut CPU, _instr: &mut Instr) -> R {
    let vector = cpu.fetch_u8()?;
    interrupts::software_int(cpu, vector)
}

pub fn into(cpu: &mut CPU, instr: &mut Instr) -> R {
    if cpu.regs.long64() {
        return Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: false });
    }
    if cpu.regs.flag(Flag::Overflow) {
        return interrupts::software_int(cpu, 4);
    }
    Ok(Signal::Ok)
}

pub fn iret(cpu: &mut CPU, instr: &mut Instr) -> R {
    interrupts::iret(cpu, instr)
}

// -------------------------------------------------------------- task switch

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskEntry {
    // CALL or INT through a task gate: backlink and NT are established and
    // the old task stays busy.
    Call,
    Jump,
    // IRET with NT set: return along the backlink.
    Iret,
}

// 32-bit TSS field offsets.
const TSS_BACKLINK: u64 = 0x00;
const TSS_CR3: u64 = 0x1c;
const TSS_EIP: u64 = 0x20;
const TSS_EFLAGS: u64 = 0x24;
const TSS_GPR: u64 = 0x28;
const TSS_SEG: u64 = 0x48;
const TSS_LDT: u64 = 0x60;

pub fn task_switch(
    cpu: &mut CPU,
    selector: u16,
    desc: Descriptor,
    entry: TaskEntry,
) -> Result<(), Fault> {
    let expected_busy = entry == TaskEntry::Iret;
    let busy = matches!(desc.system_type(), SYS_TSS16_BUSY | SYS_TSS32_BUSY);
    if desc.is_code_data() || busy != expected_busy {
        return Err(Fault::InvalidTss(selector & 0xfffc));
    }
    if !desc.present() {
        return Err(Fault::NotPresent(selector & 0xfffc));
    }
    if desc.limit < 0x67 {
        return Err(Fault::InvalidTss(selector));
    }
    let old_base = cpu.regs.tr.cache.base;
    let new_base = desc.base;
    let rd = |cpu: &mut CPU, base: u64, off: u64| {
        cpu.linear_read(base + off, Width::Long, crate::paging::Access::Read)
    };

    // write the outgoing machine state into the old TSS
    let cr3 = cpu.regs.cr3;
    cpu.linear_write(old_base + TSS_CR3, Width::Long, cr3)?;
    let rip = cpu.regs.rip;
    cpu.linear_write(old_base + TSS_EIP, Width::Long, rip)?;
    let rflags = cpu.regs.rflags;
    cpu.linear_write(old_base + TSS_EFLAGS, Width::Long, rflags)?;
    for index in 0..8 {
        let value = cpu.regs.read(Width::Long, index);
        cpu.linear_write(old_base + TSS_GPR + 4 * index as u64, Width::Long, value)?;
    }
    let seg_order =
        [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs];
    for (j, seg) in seg_order.iter().enumerate() {
        let selector = cpu.regs.seg(*seg).selector as u64;
        cpu.linear_write(old_base + TSS_SEG + 4 * j as u64, Width::Long, selector)?;
    }
    let ldtr = cpu.regs.ldtr.selector as u64;
    cpu.linear_write(old_base + TSS_LDT, Width::Long, ldtr)?;

    // busy-bit bookkeeping
    let old_sel = cpu.regs.tr.selector;
    match entry {
        TaskEntry::Jump | TaskEntry::Iret => {
            let access = (cpu.regs.tr.cache.attrs & 0xff) as u8 & !0x02;
            cpu.write_descriptor_access(old_sel, access)?;
        }
        TaskEntry::Call => {
            cpu.linear_write(new_base + TSS_BACKLINK, Width::Long, old_sel as u64)?;
        }
    }
    if entry != TaskEntry::Iret {
        let access = (desc.attrs & 0xff) as u8 | 0x02;
        cpu.write_descriptor_access(selector, access)?;
    }

    // adopt the incoming task
    let mut tr_cache = desc;
    tr_cache.attrs |= 0x02; // cache records the busy form
    cpu.regs.tr = Segment { selector, cache: tr_cache };
    cpu.regs.cr3 = rd(cpu, new_base, TSS_CR3)?;
    cpu.regs.rip = rd(cpu, new_base, TSS_EIP)?;
    let mut rflags = rd(cpu, new_base, TSS_EFLAGS)? | crate::registers::RFLAGS_FIXED1;
    if entry == TaskEntry::Call {
        rflags |= 1 << Flag::NestedTask as u32;
    }
    cpu.regs.rflags = rflags;
    for index in 0..8 {
        let value = rd(cpu, new_base, TSS_GPR + 4 * index as u64)?;
        cpu.regs.write(Width::Long, index, value);
    }
    let ldt_sel = rd(cpu, new_base, TSS_LDT)? as u16;
    cpu.load_ldt(ldt_sel).map_err(|_| Fault::InvalidTss(ldt_sel))?;

    let mut selectors = [0u16; 6];
    for (j, slot) in selectors.iter_mut().enumerate() {
        *slot = rd(cpu, new_base, TSS_SEG + 4 * j as u64)? as u16;
    }
    // CS decides the new privilege level before the data segments reload
    let cs_sel = selectors[1];
    let cs_desc = cpu.fetch_descriptor(cs_sel).map_err(|_| Fault::InvalidTss(cs_sel))?;
    if !cs_desc.executable() || !cs_desc.present() {
        return Err(Fault::InvalidTss(cs_sel));
    }
    cpu.regs.cpl = (cs_sel & 3) as u8;
    *cpu.regs.seg_mut(SegReg::Cs) = Segment { selector: cs_sel, cache: cs_desc };
    for (j, seg) in seg_order.iter().enumerate() {
        if *seg == SegReg::Cs {
            continue;
        }
        cpu.load_segment(*seg, selectors[j]).map_err(|_| Fault::InvalidTss(selectors[j]))?;
    }
    cpu.regs.cr0 |= crate::registers::Cr0::TS;
    log::debug!("task switch to TSS {:#06x}, entry {:?}", selector, entry);
    Ok(())
}

// ------------------------------------------------------ SYSENTER / SYSEXIT

pub fn sysenter(cpu: &mut CPU, _instr: &mut Instr) -> R {
    if cpu.regs.mode() == CpuMode::Real || cpu.regs.sysenter_cs & !3 == 0 {
        return Err(Fault::GeneralProtection(0));
    }
    let cs = cpu.regs.sysenter_cs as u16 & !3;
    cpu.regs.set_flag(Flag::Interrupt, false);
    cpu.regs.cpl = 0;
    *cpu.regs.seg_mut(SegReg::Cs) =
        Segment { selector: cs, cache: Descriptor::flat_code32(0) };
    *cpu.regs.seg_mut(SegReg::Ss) =
        Segment { selector: cs + 8, cache: Descriptor::flat_data32(0) };
    cpu.regs.write(Width::Long, RSP, cpu.regs.sysenter_esp);
    cpu.set_ip(cpu.regs.sysenter_eip, Width::Long);
    Ok(Signal::Ok)
}

pub fn sysexit(cpu: &mut CPU, _instr: &mut Instr) -> R {
    if cpu.regs.mode() == CpuMode::Real || cpu.regs.sysenter_cs & !3 == 0 || cpu.regs.cpl != 0 {
        return Err(Fault::GeneralProtection(0));
    }
    let base = cpu.regs.sysenter_cs as u16 & !3;
    *cpu.regs.seg_mut(SegReg::Cs) =
        Segment { selector: base + 16 | 3, cache: Descriptor::flat_code32(3) };
    *cpu.regs.seg_mut(SegReg::Ss) =
        Segment { selector: base + 24 | 3, cache: Descriptor::flat_data32(3) };
    cpu.regs.cpl = 3;
    let sp = cpu.regs.read(Width::Long, RCX);
    cpu.regs.write(Width::Long, RSP, sp);
    let target = cpu.regs.read(Width::Long, RDX);
    cpu.set_ip(target, Width::Long);
    Ok(Signal::Ok)
}
