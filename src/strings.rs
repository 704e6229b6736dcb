// The string engine: MOVS/STOS/LODS/CMPS/SCAS/INS/OUTS and the REP driver.
// The driver owns (E/R)CX bookkeeping and the ZF termination rule; bodies
// execute one iteration and step SI/DI by the direction flag. A fault inside
// an iteration restores the count so an IRET re-entry resumes mid-string.

use crate::alu::{sub_flags, R};
use crate::decoder::Instr;
use crate::devices::Signal;
use crate::error::Fault;
use crate::fields::{RepKind, SegReg, Width};
use crate::processor::CPU;
use crate::registers::{Cr0, Flag, RAX, RCX, RDI, RDX, RSI};
use crate::transfer::check_io;

fn width_of(instr: &Instr) -> Width {
    instr.width_by_parity()
}

fn step(cpu: &CPU, w: Width) -> u64 {
    if cpu.regs.flag(Flag::Direction) {
        (w.bytes() as i64).wrapping_neg() as u64
    } else {
        w.bytes()
    }
}

fn advance(cpu: &mut CPU, aw: Width, index: usize, delta: u64) {
    let value = cpu.regs.read(aw, index).wrapping_add(delta) & aw.mask();
    cpu.regs.write(aw, index, value);
}

fn source_seg(instr: &Instr) -> SegReg {
    instr.prefixes.segment.unwrap_or(SegReg::Ds)
}

// ------------------------------------------------------- single iterations

fn one_movs(cpu: &mut CPU, instr: &Instr, w: Width) -> Result<(), Fault> {
    let aw = instr.addr_width;
    let si = cpu.regs.read(aw, RSI);
    let di = cpu.regs.read(aw, RDI);
    let value = cpu.read_mem(source_seg(instr), si, w)?;
    cpu.write_mem(SegReg::Es, di, w, value)?;
    let delta = step(cpu, w);
    advance(cpu, aw, RSI, delta);
    advance(cpu, aw, RDI, delta);
    Ok(())
}

fn one_stos(cpu: &mut CPU, instr: &Instr, w: Width) -> Result<(), Fault> {
    let aw = instr.addr_width;
    let di = cpu.regs.read(aw, RDI);
    let value = cpu.regs.read(w, RAX);
    cpu.write_mem(SegReg::Es, di, w, value)?;
    advance(cpu, aw, RDI, step(cpu, w));
    Ok(())
}

fn one_lods(cpu: &mut CPU, instr: &Instr, w: Width) -> Result<(), Fault> {
    let aw = instr.addr_width;
    let si = cpu.regs.read(aw, RSI);
    let value = cpu.read_mem(source_seg(instr), si, w)?;
    cpu.regs.write(w, RAX, value);
    advance(cpu, aw, RSI, step(cpu, w));
    Ok(())
}

fn one_cmps(cpu: &mut CPU, instr: &Instr, w: Width) -> Result<(), Fault> {
    let aw = instr.addr_width;
    let si = cpu.regs.read(aw, RSI);
    let di = cpu.regs.read(aw, RDI);
    let left = cpu.read_mem(source_seg(instr), si, w)?;
    let right = cpu.read_mem(SegReg::Es, di, w)?;
    sub_flags(&mut cpu.regs, w, left, right, 0);
    let delta = step(cpu, w);
    advance(cpu, aw, RSI, delta);
    advance(cpu, aw, RDI, delta);
    Ok(())
}

fn one_scas(cpu: &mut CPU, instr: &Instr, w: Width) -> Result<(), Fault> {
    let aw = instr.addr_width;
    let di = cpu.regs.read(aw, RDI);
    let value = cpu.read_mem(SegReg::Es, di, w)?;
    let acc = cpu.regs.read(w, RAX);
    sub_flags(&mut cpu.regs, w, acc, value, 0);
    advance(cpu, aw, RDI, step(cpu, w));
    Ok(())
}

fn one_ins(cpu: &mut CPU, instr: &Instr, w: Width) -> Result<(), Fault> {
    let aw = instr.addr_width;
    let port = cpu.regs.read(Width::Word, RDX) as u16;
    let value = cpu.bus.borrow_mut().read_port(port, w);
    let di = cpu.regs.read(aw, RDI);
    cpu.write_mem(SegReg::Es, di, w, value)?;
    advance(cpu, aw, RDI, step(cpu, w));
    Ok(())
}

fn one_outs(cpu: &mut CPU, instr: &Instr, w: Width) -> Result<(), Fault> {
    let aw = instr.addr_width;
    let si = cpu.regs.read(aw, RSI);
    let value = cpu.read_mem(source_seg(instr), si, w)?;
    let port = cpu.regs.read(Width::Word, RDX) as u16;
    cpu.bus.borrow_mut().write_port(port, w, value);
    advance(cpu, aw, RSI, step(cpu, w));
    Ok(())
}

// --------------------------------------------------------------- REP driver

// ZF termination applies to CMPS/SCAS only: REPE runs while ZF=1, REPNE while
// ZF=0. A fault restores the count of the unfinished iteration.
fn rep_loop(
    cpu: &mut CPU,
    instr: &Instr,
    w: Width,
    zf_gated: bool,
    body: fn(&mut CPU, &Instr, Width) -> Result<(), Fault>,
) -> R {
    let kind = instr.prefixes.rep_kind();
    if kind == RepKind::None {
        body(cpu, instr, w)?;
        return Ok(Signal::Ok);
    }
    let aw = instr.addr_width;
    loop {
        let count = cpu.regs.read(aw, RCX);
        if count == 0 {
            break;
        }
        cpu.regs.write(aw, RCX, count.wrapping_sub(1) & aw.mask());
        if let Err(fault) = body(cpu, instr, w) {
            cpu.regs.write(aw, RCX, count);
            return Err(fault);
        }
        if zf_gated {
            let zf = cpu.regs.flag(Flag::Zero);
            let wanted = kind == RepKind::Rep;
            if zf != wanted {
                break;
            }
        }
        if cpu.halt_request {
            break;
        }
    }
    Ok(Signal::Ok)
}

// ------------------------------------------------------------------ handlers

pub fn movs(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = width_of(instr);
    if bulk_eligible(cpu, instr) {
        return bulk_movs(cpu, instr, w);
    }
    rep_loop(cpu, instr, w, false, one_movs)
}

pub fn stos(cpu: &mut CPU, instr: &mut Instr) -> R {
    let w = width_of(instr);
    rep_loop(cpu, instr, w, false, one_stos)
}

pub fn lods(cpu: &mut CPU, instr: &mut Instr) -> R {
    rep_loop(cpu, instr, width_of(instr), false, one_lods)
}

pub fn cmps(cpu: &mut CPU, instr: &mut Instr) -> R {
    rep_loop(cpu, instr, width_of(instr), true, one_cmps)
}

pub fn scas(cpu: &mut CPU, instr: &mut Instr) -> R {
    rep_loop(cpu, instr, width_of(instr), true, one_scas)
}

pub fn ins(cpu: &mut CPU, instr: &mut Instr) -> R {
    check_io(cpu)?;
    rep_loop(cpu, instr, width_of(instr), false, one_ins)
}

pub fn outs(cpu: &mut CPU, instr: &mut Instr) -> R {
    check_io(cpu)?;
    rep_loop(cpu, instr, width_of(instr), false, one_outs)
}

// ------------------------------------------------------------- bulk fast path

// REP MOVS can run as one range copy when stepping forward with identity
// translation and non-overlapping ranges; the architectural post-state is the
// same as the stepped loop's.
fn bulk_eligible(cpu: &CPU, instr: &Instr) -> bool {
    instr.prefixes.rep_kind() == RepKind::Rep
        && !cpu.regs.flag(Flag::Direction)
        && !cpu.regs.cr0.contains(Cr0::PG)
}

fn bulk_movs(cpu: &mut CPU, instr: &Instr, w: Width) -> R {
    let aw = instr.addr_width;
    let count = cpu.regs.read(aw, RCX);
    if count == 0 {
        return Ok(Signal::Ok);
    }
    let si = cpu.regs.read(aw, RSI);
    let di = cpu.regs.read(aw, RDI);
    let len = count * w.bytes();
    let src = cpu.regs.seg(source_seg(instr)).cache.base.wrapping_add(si);
    let dst = cpu.regs.seg(SegReg::Es).cache.base.wrapping_add(di);
    let overlap = src < dst.wrapping_add(len) && dst < src.wrapping_add(len);
    let wraps = |start: u64| start.checked_add(len).map_or(true, |end| end - 1 > aw.mask());
    if overlap || wraps(si) || wraps(di) {
        return rep_loop(cpu, instr, w, false, one_movs);
    }
    for j in 0..count {
        let offset = j * w.bytes();
        let value = cpu.read_mem(source_seg(instr), si + offset, w)?;
        cpu.write_mem(SegReg::Es, di + offset, w, value)?;
    }
    cpu.regs.write(aw, RCX, 0);
    cpu.regs.write(aw, RSI, si.wrapping_add(len) & aw.mask());
    cpu.regs.write(aw, RDI, di.wrapping_add(len) & aw.mask());
    Ok(Signal::Ok)
}
