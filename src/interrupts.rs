// The interrupt dispatcher: vectoring through the real-mode IVT or the IDT,
// ring transitions with TSS stack switching, IRET in all three modes, and the
// bridge to the external BIOS/DOS service collaborators. Faults raised while
// delivering are themselves delivered, bounded by a re-entry cap instead of
// full double-fault semantics.

use crate::control::{self, TaskEntry};
use crate::decoder::Instr;
use crate::devices::Signal;
use crate::error::Fault;
use crate::fields::{SegReg, Width};
use crate::paging::Access;
use crate::processor::CPU;
use crate::registers::{
    CpuMode, Descriptor, Flag, Gate, Segment, RSP, SYS_INT_GATE16, SYS_INT_GATE32, SYS_TASK_GATE,
    SYS_TRAP_GATE16, SYS_TRAP_GATE32,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

// The default ROM interrupt stub every IVT entry points at after power-on.
pub const ROM_STUB_SEG: u16 = 0xf000;
pub const ROM_STUB_OFF: u16 = 0xff53;

const MAX_NESTING: u32 = 8;

// External BIOS/DOS service collaborators, keyed by vector. A handler mutates
// the CPU in place of the (no-op) ROM stub and reports Ok or Quit.
pub type ServiceRoutine = Box<dyn FnMut(&mut CPU) -> Result<Signal, Fault>>;
pub type ServiceMap = Rc<RefCell<HashMap<u8, ServiceRoutine>>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Source {
    Software,
    Hardware,
    Exception,
}

// ----------------------------------------------------------- entry points

// INT n / INT3 / INTO. If the IVT entry still points at the ROM stub and a
// collaborator is registered for the vector, the collaborator services it
// without any vectoring.
pub fn software_int(cpu: &mut CPU, vector: u8) -> Result<Signal, Fault> {
    if cpu.regs.mode() == CpuMode::Real && ivt_points_at_stub(cpu, vector) {
        let services = Rc::clone(&cpu.services);
        let mut map = services.borrow_mut();
        if let Some(handler) = map.get_mut(&vector) {
            return handler(cpu);
        }
    }
    deliver(cpu, vector, None, Source::Software)?;
    Ok(Signal::Ok)
}

// A hardware interrupt acknowledged from the PIC.
pub fn vector_interrupt(cpu: &mut CPU, vector: u8) -> Result<(), Fault> {
    deliver(cpu, vector, None, Source::Hardware)
}

// An architectural fault unwound from instruction execution. Faults raised by
// the delivery itself are chained up to the nesting cap.
pub fn deliver_fault(cpu: &mut CPU, fault: Fault) -> Result<(), Fault> {
    let mut current = fault;
    for _ in 0..MAX_NESTING {
        let vector = match current.vector() {
            Some(vector) => vector,
            None => return Err(current),
        };
        if let Fault::PageFault { addr, .. } = current {
            cpu.regs.cr2 = addr;
        }
        log::debug!("delivering {} as vector {}", current, vector);
        match deliver(cpu, vector, current.error_code(), Source::Exception) {
            Ok(()) => return Ok(()),
            Err(next) => current = next,
        }
    }
    Err(Fault::InterruptOverflow(MAX_NESTING))
}

fn ivt_points_at_stub(cpu: &mut CPU, vector: u8) -> bool {
    let entry = cpu
        .linear_read(vector as u64 * 4, Width::Long, Access::Read)
        .unwrap_or(0);
    (entry & 0xffff) as u16 == ROM_STUB_OFF && (entry >> 16) as u16 == ROM_STUB_SEG
}

// ------------------------------------------------------------- delivery

fn deliver(cpu: &mut CPU, vector: u8, error: Option<u32>, source: Source) -> Result<(), Fault> {
    match cpu.regs.mode() {
        CpuMode::Real => deliver_real(cpu, vector),
        _ => deliver_protected(cpu, vector, error, source),
    }
}

// Real mode: IVT entry at physical vector*4 as (offset16, segment16).
fn deliver_real(cpu: &mut CPU, vector: u8) -> Result<(), Fault> {
    let entry = cpu.linear_read(vector as u64 * 4, Width::Long, Access::Read)?;
    let offset = entry & 0xffff;
    let segment = (entry >> 16) as u16;
    cpu.push(Width::Word, cpu.regs.rflags & 0xffff)?;
    cpu.push(Width::Word, cpu.regs.seg(SegReg::Cs).selector as u64)?;
    cpu.push(Width::Word, cpu.regs.rip)?;
    cpu.regs.set_flag(Flag::Interrupt, false);
    cpu.regs.set_flag(Flag::Trap, false);
    *cpu.regs.seg_mut(SegReg::Cs) = Segment::real_mode(segment);
    cpu.set_ip(offset, Width::Word);
    Ok(())
}

fn deliver_protected(
    cpu: &mut CPU,
    vector: u8,
    error: Option<u32>,
    source: Source,
) -> Result<(), Fault> {
    let long = cpu.regs.mode() == CpuMode::Long;
    let entry_size: u64 = if long { 16 } else { 8 };
    let offset = vector as u64 * entry_size;
    if offset + entry_size - 1 > cpu.regs.idtr.limit as u64 {
        return Err(Fault::GeneralProtection((vector as u32) << 3 | 2));
    }
    let raw = cpu.linear_read(cpu.regs.idtr.base + offset, Width::Quad, Access::Read)?;
    let mut gate = Gate::from_raw(raw);
    if long {
        let high = cpu.linear_read(cpu.regs.idtr.base + offset + 8, Width::Quad, Access::Read)?;
        gate.offset |= (high & 0xffff_ffff) << 32;
    }
    if !gate.present {
        return Err(Fault::NotPresent((vector as u16) << 3 | 2));
    }
    // software INT checks the gate DPL against CPL
    if source == Source::Software && gate.dpl < cpu.regs.cpl {
        return Err(Fault::GeneralProtection((vector as u32) << 3 | 2));
    }
    match gate.gate_type {
        SYS_TASK_GATE if !long => {
            let raw = cpu.fetch_descriptor_raw(gate.selector)?;
            control::task_switch(cpu, gate.selector, Descriptor::from_raw(raw), TaskEntry::Call)?;
            if let Some(code) = error {
                let w = if cpu.stack_width() == Width::Word { Width::Word } else { Width::Long };
                cpu.push(w, code as u64)?;
            }
            Ok(())
        }
        SYS_INT_GATE16 | SYS_TRAP_GATE16 | SYS_INT_GATE32 | SYS_TRAP_GATE32 => {
            through_gate(cpu, vector, gate, error, long)
        }
        _ => Err(Fault::GeneralProtection((vector as u32) << 3 | 2)),
    }
}

fn through_gate(
    cpu: &mut CPU,
    vector: u8,
    gate: Gate,
    error: Option<u32>,
    long: bool,
) -> Result<(), Fault> {
    let target_sel = gate.selector;
    if target_sel & !3 == 0 {
        return Err(Fault::GeneralProtection((vector as u32) << 3 | 2));
    }
    let target = cpu.fetch_descriptor(target_sel)?;
    if !target.executable() {
        return Err(Fault::GeneralProtection(target_sel as u32 & 0xfffc));
    }
    if !target.present() {
        return Err(Fault::NotPresent(target_sel & 0xfffc));
    }
    let w = if long { Width::Quad } else { gate.push_width() };
    let cpl = cpu.regs.cpl;
    let escalate = !target.conforming() && target.dpl() < cpl;
    let old_flags = cpu.regs.rflags;
    let old_cs = cpu.regs.seg(SegReg::Cs).selector;
    let old_ip = cpu.regs.rip;

    if escalate || long {
        // interrupt-to-inner-ring (long mode pushes SS:RSP unconditionally):
        // pick up the ring stack from the TSS and push the outer stack on it
        let new_cpl = if escalate { target.dpl() } else { cpl };
        let old_ss = cpu.regs.seg(SegReg::Ss).selector;
        let old_sp = cpu.regs.read(cpu.stack_width(), RSP);
        if escalate {
            let (new_ss, new_sp) = control::ring_stack(cpu, new_cpl)?;
            cpu.regs.cpl = new_cpl;
            if long {
                let mut stack = Segment::default();
                stack.selector = new_ss;
                *cpu.regs.seg_mut(SegReg::Ss) = stack;
                cpu.regs.write(Width::Quad, RSP, new_sp);
            } else {
                let ss_desc = cpu.fetch_descriptor(new_ss)?;
                if !ss_desc.writable() || !ss_desc.present() {
                    return Err(Fault::InvalidTss(new_ss & 0xfffc));
                }
                *cpu.regs.seg_mut(SegReg::Ss) =
                    Segment { selector: new_ss & !3 | new_cpl as u16, cache: ss_desc };
                cpu.regs.write(cpu.stack_width(), RSP, new_sp);
            }
        }
        cpu.push(w, old_ss as u64)?;
        cpu.push(w, old_sp)?;
    }
    cpu.push(w, old_flags)?;
    cpu.push(w, old_cs as u64)?;
    cpu.push(w, old_ip)?;
    if let Some(code) = error {
        cpu.push(w, code as u64)?;
    }
    // interrupt gates mask further interrupts; trap gates do not
    if matches!(gate.gate_type, SYS_INT_GATE16 | SYS_INT_GATE32) {
        cpu.regs.set_flag(Flag::Interrupt, false);
    }
    cpu.regs.set_flag(Flag::Trap, false);
    cpu.regs.set_flag(Flag::NestedTask, false);
    let selector = target_sel & !3 | cpu.regs.cpl as u16;
    *cpu.regs.seg_mut(SegReg::Cs) = Segment { selector, cache: target };
    cpu.set_ip(gate.target_offset(), w);
    Ok(())
}

// ------------------------------------------------------------------- IRET

pub fn iret(cpu: &mut CPU, instr: &Instr) -> Result<Signal, Fault> {
    match cpu.regs.mode() {
        CpuMode::Real => {
            let ip = cpu.pop(Width::Word)?;
            let cs = cpu.pop(Width::Word)? as u16;
            let flags = cpu.pop(Width::Word)?;
            *cpu.regs.seg_mut(SegReg::Cs) = Segment::real_mode(cs);
            cpu.set_ip(ip, Width::Word);
            cpu.regs.rflags =
                cpu.regs.rflags & !0xffff | flags | crate::registers::RFLAGS_FIXED1;
            Ok(Signal::Ok)
        }
        CpuMode::Long => iret_protected(cpu, Width::Quad),
        CpuMode::Protected => {
            if cpu.regs.flag(Flag::NestedTask) {
                return iret_task(cpu);
            }
            iret_protected(cpu, instr.op_width)
        }
    }
}

// NT set: resume the task recorded in the backlink.
fn iret_task(cpu: &mut CPU) -> Result<Signal, Fault> {
    let backlink =
        cpu.linear_read(cpu.regs.tr.cache.base, Width::Word, Access::Read)? as u16;
    let raw = cpu.fetch_descriptor_raw(backlink)?;
    control::task_switch(cpu, backlink, Descriptor::from_raw(raw), TaskEntry::Iret)?;
    Ok(Signal::Ok)
}

fn iret_protected(cpu: &mut CPU, w: Width) -> Result<Signal, Fault> {
    let long = cpu.regs.mode() == CpuMode::Long;
    let ip = cpu.pop(w)?;
    let cs_sel = cpu.pop(w)? as u16;
    let flags = cpu.pop(w)?;
    let cpl = cpu.regs.cpl;
    let rpl = (cs_sel & 3) as u8;
    if rpl < cpl {
        return Err(Fault::GeneralProtection(cs_sel as u32 & 0xfffc));
    }
    let desc = cpu.fetch_descriptor(cs_sel)?;
    if !desc.executable() {
        return Err(Fault::GeneralProtection(cs_sel as u32 & 0xfffc));
    }
    if !desc.present() {
        return Err(Fault::NotPresent(cs_sel & 0xfffc));
    }
    let outer = rpl > cpl;
    if outer || long {
        let new_sp = cpu.pop(w)?;
        let new_ss = cpu.pop(w)? as u16;
        cpu.regs.cpl = rpl;
        if new_ss & !3 == 0 && long {
            let mut stack = Segment::default();
            stack.selector = new_ss;
            *cpu.regs.seg_mut(SegReg::Ss) = stack;
        } else {
            let ss_desc = cpu.fetch_descriptor(new_ss)?;
            *cpu.regs.seg_mut(SegReg::Ss) = Segment { selector: new_ss, cache: ss_desc };
        }
        let sw = cpu.stack_width();
        cpu.regs.write(sw, RSP, new_sp & sw.mask());
        demote_data_segments(cpu);
    }
    *cpu.regs.seg_mut(SegReg::Cs) = Segment { selector: cs_sel, cache: desc };
    cpu.set_ip(ip, w);
    // IRET may restore IF/IOPL subject to privilege, and NT unconditionally
    apply_iret_flags(cpu, flags, w, cpl);
    Ok(Signal::Ok)
}

fn apply_iret_flags(cpu: &mut CPU, flags: u64, w: Width, old_cpl: u8) {
    let mut keep = 1u64 << Flag::Virtual8086 as u32;
    if old_cpl > 0 {
        keep |= crate::registers::IOPL_MASK;
    }
    if old_cpl > cpu.regs.iopl() {
        keep |= 1 << Flag::Interrupt as u32;
    }
    if w == Width::Word {
        keep |= !0xffffu64;
    }
    cpu.regs.rflags = (cpu.regs.rflags & keep | flags & !keep) & !0x8028
        | crate::registers::RFLAGS_FIXED1;
}

// On a return to an outer ring, data segments that the inner ring could see
// but the outer may not are forced null.
pub fn demote_data_segments(cpu: &mut CPU) {
    let cpl = cpu.regs.cpl;
    for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs].iter() {
        let cache = cpu.regs.seg(*seg).cache;
        if cache.present() && cache.is_code_data() && !cache.conforming() && cache.dpl() < cpl {
            *cpu.regs.seg_mut(*seg) = Segment::default();
        }
    }
}
