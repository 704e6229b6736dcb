// The basic processor implementation: the fetch/execute loop, segmented and
// paged memory access, the stack, and segment-register reloads. The details
// of instruction decoding live in the decoder module; the instruction
// semantics live with the handler modules.

use crate::decoder;
use crate::devices::Signal;
use crate::dispatch;
use crate::error::Fault;
use crate::fields::{SegReg, Width};
use crate::interrupts::{self, ServiceMap};
use crate::memory::BusPtr;
use crate::paging::{self, Access};
use crate::registers::{
    CpuMode, Descriptor, Flag, Registers, Segment, RSP, SYS_LDT,
};
use std::collections::{HashMap, HashSet};
use std::cell::RefCell;
use std::io;
use std::io::prelude::*;
use std::rc::Rc;
use std::fmt;
use termion::{clear, color, cursor};

// An instruction operand as resolved by the decoder: a register slot, a high
// byte register, or a memory reference that is translated afresh on every
// access. RIP-relative references resolve against the instruction *end*, so
// they must be accessed only after all immediate bytes are consumed.
#[derive(Debug, Copy, Clone)]
pub enum Operand {
    Reg(usize),
    Reg8H(usize),
    Mem { seg: SegReg, offset: u64 },
    MemRipRel { seg: SegReg, disp: i64 },
}

pub struct CPU {
    pub regs: Registers,
    pub bus: BusPtr,
    pub halted: bool,
    pub halt_request: bool,
    pub lenient_decode: bool,
    pub services: ServiceMap,
    // STI / MOV SS interrupt shadow, aged once per instruction
    pub inhibit_interrupts: u8,
    // CS:IP of the instruction being executed, for fault delivery and REP resume
    pub instr_start: u64,
    pub instr_start_cs: u16,
}

impl CPU {
    pub fn new(bus: BusPtr) -> Self {
        CPU {
            regs: Registers::new(),
            bus,
            halted: false,
            halt_request: false,
            lenient_decode: false,
            services: Rc::new(RefCell::new(HashMap::new())),
            inhibit_interrupts: 0,
            instr_start: 0,
            instr_start_cs: 0,
        }
    }

    // ------------------------------------------------------ width defaults

    pub fn code_width(&self) -> Width {
        if self.regs.long64() {
            Width::Quad
        } else if self.regs.seg(SegReg::Cs).cache.default_big() {
            Width::Long
        } else {
            Width::Word
        }
    }
    pub fn stack_width(&self) -> Width {
        if self.regs.long64() {
            Width::Quad
        } else if self.regs.seg(SegReg::Ss).cache.default_big() {
            Width::Long
        } else {
            Width::Word
        }
    }

    // --------------------------------------------------------- memory plumbing

    fn is_user(&self) -> bool {
        self.regs.cpl == 3
    }

    // Segment-relative access: limit check against the descriptor cache, then
    // a fresh page walk per byte (no TLB is modeled).
    fn mem_access_linear(
        &mut self,
        seg: SegReg,
        offset: u64,
        len: u64,
        write: bool,
    ) -> Result<u64, Fault> {
        let cache = self.regs.seg(seg).cache;
        match self.regs.mode() {
            CpuMode::Real => Ok(cache.base.wrapping_add(offset)),
            CpuMode::Long if self.regs.long64() => {
                // only FS/GS carry a base in 64-bit code
                match seg {
                    SegReg::Fs | SegReg::Gs => Ok(cache.base.wrapping_add(offset)),
                    _ => Ok(offset),
                }
            }
            _ => {
                if !cache.present() {
                    return Err(match seg {
                        SegReg::Ss => Fault::StackFault(0),
                        _ => Fault::GeneralProtection(0),
                    });
                }
                if offset.wrapping_add(len - 1) > cache.limit as u64 {
                    return Err(match seg {
                        SegReg::Ss => Fault::StackFault(0),
                        _ => Fault::GeneralProtection(0),
                    });
                }
                if write && cache.is_code_data() && cache.executable() {
                    return Err(Fault::GeneralProtection(0));
                }
                Ok(cache.base.wrapping_add(offset))
            }
        }
    }

    pub fn linear_read(&mut self, linear: u64, width: Width, access: Access) -> Result<u64, Fault> {
        let user = self.is_user();
        let mut value = 0u64;
        for j in 0..width.bytes() {
            let phys = {
                let mut bus = self.bus.borrow_mut();
                paging::translate(&mut bus, &self.regs, linear.wrapping_add(j), access, user)?
            };
            value |= self.bus.borrow_mut().read_phys(phys, Width::Byte) << (8 * j);
        }
        Ok(value)
    }
    pub fn linear_write(&mut self, linear: u64, width: Width, value: u64) -> Result<(), Fault> {
        let user = self.is_user();
        for j in 0..width.bytes() {
            let phys = {
                let mut bus = self.bus.borrow_mut();
                paging::translate(&mut bus, &self.regs, linear.wrapping_add(j), Access::Write, user)?
            };
            self.bus.borrow_mut().write_phys(phys, Width::Byte, value >> (8 * j) & 0xff);
        }
        Ok(())
    }

    pub fn read_mem(&mut self, seg: SegReg, offset: u64, width: Width) -> Result<u64, Fault> {
        let linear = self.mem_access_linear(seg, offset, width.bytes(), false)?;
        self.linear_read(linear, width, Access::Read)
    }
    pub fn write_mem(
        &mut self,
        seg: SegReg,
        offset: u64,
        width: Width,
        value: u64,
    ) -> Result<(), Fault> {
        let linear = self.mem_access_linear(seg, offset, width.bytes(), true)?;
        self.linear_write(linear, width, value)
    }

    // Inspection surface for debuggers and service routines: supervisor
    // access, faults reported as None/ignored bytes.
    pub fn read_linear_bytes(&mut self, linear: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for j in 0..len as u64 {
            let byte = self
                .linear_read(linear.wrapping_add(j), Width::Byte, Access::Read)
                .unwrap_or(0);
            out.push(byte as u8);
        }
        out
    }
    pub fn write_linear_bytes(&mut self, linear: u64, bytes: &[u8]) {
        for (j, &byte) in bytes.iter().enumerate() {
            let _ = self.linear_write(linear.wrapping_add(j as u64), Width::Byte, byte as u64);
        }
    }

    // --------------------------------------------------------- code fetch

    pub fn fetch_u8(&mut self) -> Result<u8, Fault> {
        let mask = self.code_width().mask();
        let offset = self.regs.rip & mask;
        let linear = self.mem_access_linear(SegReg::Cs, offset, 1, false)?;
        let byte = self.linear_read(linear, Width::Byte, Access::Execute)?;
        self.regs.rip = offset.wrapping_add(1) & mask;
        Ok(byte as u8)
    }
    pub fn fetch_wide(&mut self, width: Width) -> Result<u64, Fault> {
        let mut value = 0u64;
        for j in 0..width.bytes() {
            value |= (self.fetch_u8()? as u64) << (8 * j);
        }
        Ok(value)
    }
    pub fn fetch_u16(&mut self) -> Result<u16, Fault> {
        Ok(self.fetch_wide(Width::Word)? as u16)
    }
    pub fn fetch_u32(&mut self) -> Result<u32, Fault> {
        Ok(self.fetch_wide(Width::Long)? as u32)
    }
    pub fn fetch_i8(&mut self) -> Result<i64, Fault> {
        Ok(self.fetch_u8()? as i8 as i64)
    }
    // Immediate at operand width, except that 64-bit operations take a
    // sign-extended 32-bit immediate (the MOV B8+r form is special-cased by
    // its handler).
    pub fn fetch_imm(&mut self, width: Width) -> Result<u64, Fault> {
        match width {
            Width::Quad => Ok(self.fetch_u32()? as i32 as i64 as u64),
            w => self.fetch_wide(w),
        }
    }

    // ------------------------------------------------------------- operands

    pub fn read_operand(&mut self, op: &Operand, width: Width) -> Result<u64, Fault> {
        match *op {
            Operand::Reg(index) => Ok(self.regs.read(width, index)),
            Operand::Reg8H(index) => Ok(self.regs.read8h(index)),
            Operand::Mem { seg, offset } => self.read_mem(seg, offset, width),
            Operand::MemRipRel { seg, disp } => {
                let offset = self.regs.rip.wrapping_add(disp as u64);
                self.read_mem(seg, offset, width)
            }
        }
    }
    pub fn write_operand(&mut self, op: &Operand, width: Width, value: u64) -> Result<(), Fault> {
        match *op {
            Operand::Reg(index) => Ok(self.regs.write(width, index, value)),
            Operand::Reg8H(index) => Ok(self.regs.write8h(index, value)),
            Operand::Mem { seg, offset } => self.write_mem(seg, offset, width, value),
            Operand::MemRipRel { seg, disp } => {
                let offset = self.regs.rip.wrapping_add(disp as u64);
                self.write_mem(seg, offset, width, value)
            }
        }
    }
    // The offset an EA-producing operand denotes, for LEA and friends.
    pub fn operand_offset(&self, op: &Operand) -> Option<u64> {
        match *op {
            Operand::Mem { offset, .. } => Some(offset),
            Operand::MemRipRel { disp, .. } => Some(self.regs.rip.wrapping_add(disp as u64)),
            _ => None,
        }
    }

    // ----------------------------------------------------------------- stack

    pub fn push(&mut self, width: Width, value: u64) -> Result<(), Fault> {
        let sw = self.stack_width();
        let sp = self.regs.read(sw, RSP).wrapping_sub(width.bytes()) & sw.mask();
        self.write_mem(SegReg::Ss, sp, width, value)?;
        self.regs.write(sw, RSP, sp);
        Ok(())
    }
    pub fn pop(&mut self, width: Width) -> Result<u64, Fault> {
        let sw = self.stack_width();
        let sp = self.regs.read(sw, RSP);
        let value = self.read_mem(SegReg::Ss, sp, width)?;
        self.regs.write(sw, RSP, sp.wrapping_add(width.bytes()) & sw.mask());
        Ok(value)
    }

    // ------------------------------------------------------------- selectors

    // Raw descriptor-table read. `selector` picks GDT or LDT via TI.
    pub fn fetch_descriptor_raw(&mut self, selector: u16) -> Result<u64, Fault> {
        let (base, limit) = if selector & 4 != 0 {
            let ldt = self.regs.ldtr.cache;
            if !ldt.present() {
                return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
            }
            (ldt.base, ldt.limit)
        } else {
            (self.regs.gdtr.base, self.regs.gdtr.limit as u32)
        };
        let offset = (selector & !7) as u64;
        if offset + 7 > limit as u64 {
            return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
        }
        self.linear_read(base + offset, Width::Quad, Access::Read)
    }

    pub fn fetch_descriptor(&mut self, selector: u16) -> Result<Descriptor, Fault> {
        let raw = self.fetch_descriptor_raw(selector)?;
        let mut desc = Descriptor::from_raw(raw);
        // 16-byte system descriptors carry base bits 32..63 in the following
        // quadword in long mode.
        if self.regs.mode() == CpuMode::Long && !desc.is_code_data() {
            let table = if selector & 4 != 0 { self.regs.ldtr.cache.base } else { self.regs.gdtr.base };
            let high =
                self.linear_read(table + (selector & !7) as u64 + 8, Width::Quad, Access::Read)?;
            desc.base |= (high & 0xffff_ffff) << 32;
        }
        Ok(desc)
    }

    // Rewrite the access byte of a descriptor, for TSS busy-bit flips and
    // the accessed bit on loads.
    pub fn write_descriptor_access(&mut self, selector: u16, access: u8) -> Result<(), Fault> {
        let base = if selector & 4 != 0 {
            self.regs.ldtr.cache.base
        } else {
            self.regs.gdtr.base
        };
        let addr = base + (selector & !7) as u64 + 5;
        self.linear_write(addr, Width::Byte, access as u64)
    }

    // MOV Sreg / POP Sreg semantics. Far control transfers validate CS with
    // their own rules and do not come through here.
    pub fn load_segment(&mut self, seg: SegReg, selector: u16) -> Result<(), Fault> {
        if self.regs.mode() == CpuMode::Real {
            *self.regs.seg_mut(seg) = Segment::real_mode(selector);
            return Ok(());
        }
        if selector & !3 == 0 {
            // Null selector: fine for data segments, fatal for SS.
            if seg == SegReg::Ss {
                return Err(Fault::GeneralProtection(0));
            }
            let mut cleared = Segment::default();
            cleared.selector = selector;
            *self.regs.seg_mut(seg) = cleared;
            return Ok(());
        }
        let desc = self.fetch_descriptor(selector)?;
        let rpl = (selector & 3) as u8;
        let cpl = self.regs.cpl;
        match seg {
            SegReg::Ss => {
                if rpl != cpl || desc.dpl() != cpl || !desc.writable() {
                    return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
                }
                if !desc.present() {
                    return Err(Fault::StackFault(selector & 0xfffc));
                }
                // loading SS inhibits interrupts for one instruction
                self.inhibit_interrupts = 1;
            }
            _ => {
                let readable = desc.readable() && desc.is_code_data();
                if !readable {
                    return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
                }
                if !desc.executable() || !desc.conforming() {
                    if rpl > desc.dpl() || cpl > desc.dpl() {
                        return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
                    }
                }
                if !desc.present() {
                    return Err(Fault::NotPresent(selector & 0xfffc));
                }
            }
        }
        log::debug!("{} <- {:#06x} (base {:#x} limit {:#x})", seg, selector, desc.base, desc.limit);
        *self.regs.seg_mut(seg) = Segment { selector, cache: desc };
        Ok(())
    }

    // LLDT: resolve the selector against the GDT and cache the LDT base.
    pub fn load_ldt(&mut self, selector: u16) -> Result<(), Fault> {
        if selector & !3 == 0 {
            self.regs.ldtr = Segment::default();
            return Ok(());
        }
        if selector & 4 != 0 {
            return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
        }
        let desc = self.fetch_descriptor(selector)?;
        if desc.is_code_data() || desc.system_type() != SYS_LDT {
            return Err(Fault::GeneralProtection(selector as u32 & 0xfffc));
        }
        if !desc.present() {
            return Err(Fault::NotPresent(selector & 0xfffc));
        }
        self.regs.ldtr = Segment { selector, cache: desc };
        Ok(())
    }

    // ------------------------------------------------------------ branching

    pub fn set_ip(&mut self, offset: u64, width: Width) {
        self.regs.rip = offset & width.mask();
    }

    // ------------------------------------------------------------- main loop

    // Execute exactly one instruction; faults unwind to the caller.
    pub fn step(&mut self) -> Result<Signal, Fault> {
        self.instr_start = self.regs.rip;
        self.instr_start_cs = self.regs.seg(SegReg::Cs).selector;
        let mut instr = decoder::decode(self)?;
        let handler = dispatch::lookup(&instr);
        let signal = handler(self, &mut instr)?;
        self.regs.tsc = self.regs.tsc.wrapping_add(1);
        Ok(signal)
    }

    // One turn of the crank: run an instruction and, on a fault, re-enter
    // through the interrupt dispatcher. Engine aborts quit the run.
    pub fn clock_cycle(&mut self) -> Signal {
        if self.halted {
            return Signal::NoOp;
        }
        match self.step() {
            Ok(signal) => signal,
            Err(fault) => {
                if fault.is_abort() {
                    log::error!(
                        "aborting at {:#06x}:{:#x}: {}",
                        self.instr_start_cs,
                        self.instr_start,
                        fault
                    );
                    return Signal::Quit;
                }
                // Faults report the address of the faulting instruction.
                self.regs.rip = self.instr_start;
                match interrupts::deliver_fault(self, fault) {
                    Ok(()) => Signal::Ok,
                    Err(inner) => {
                        log::error!("exception delivery failed: {} (while delivering {})", inner, fault);
                        Signal::Quit
                    }
                }
            }
        }
    }

    // Between instructions: age device timers and deliver one pending IRQ if
    // the interrupt flag allows it.
    pub fn serve_interrupt_requests(&mut self) -> Signal {
        self.bus.borrow_mut().poll_devices();
        if self.inhibit_interrupts > 0 {
            // STI/MOV SS shadow: one instruction runs before delivery
            self.inhibit_interrupts -= 1;
            return Signal::NoOp;
        }
        if !self.regs.flag(Flag::Interrupt) {
            return Signal::NoOp;
        }
        let vector = match self.bus.borrow_mut().pic.acknowledge() {
            Some(vector) => vector,
            None => return Signal::NoOp,
        };
        self.halted = false;
        match interrupts::vector_interrupt(self, vector) {
            Ok(()) => Signal::Ok,
            Err(fault) => {
                log::error!("IRQ vector {:#04x} delivery failed: {}", vector, fault);
                Signal::Quit
            }
        }
    }

    // ------------------------------------------------- inspection surface

    pub fn gpr(&self, index: usize, width: Width) -> u64 {
        self.regs.read(width, index)
    }
    pub fn write_gpr(&mut self, index: usize, width: Width, value: u64) {
        self.regs.write(width, index, value)
    }
    pub fn segment(&self, seg: SegReg) -> (u16, u64, u32, u16) {
        let s = self.regs.seg(seg);
        (s.selector, s.cache.base, s.cache.limit, s.cache.attrs)
    }
    pub fn rflags(&self) -> u64 {
        self.regs.rflags
    }
    pub fn rip(&self) -> u64 {
        self.regs.rip
    }
}

impl fmt::Display for CPU {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
        let mut s = String::new();
        s.push_str(&format!("{}╔═══════════════════════════════════════╗", cursor::Goto(1, 2)));
        s.push_str(&format!("{}║ CPU state                             ║", cursor::Goto(1, 3)));
        s.push_str(&format!("{}╟───────────────────────────────────────╢", cursor::Goto(1, 4)));
        for j in 0..4 {
            s.push_str(&format!(
                "{r}║ r{a} {av:016x}  r{b} {bv:016x} ║",
                a = names[2 * j],
                av = self.regs.read(Width::Quad, 2 * j),
                b = names[2 * j + 1],
                bv = self.regs.read(Width::Quad, 2 * j + 1),
                r = cursor::Goto(1, (j + 5) as u16),
            ));
        }
        let segs = [SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs];
        for (j, seg) in segs.iter().enumerate() {
            let reg = self.regs.seg(*seg);
            s.push_str(&format!(
                "{r}║ {n}  {sel:04x} @ {base:08x}                   ║",
                n = seg,
                sel = reg.selector,
                base = reg.cache.base,
                r = cursor::Goto(1, (j + 9) as u16),
            ));
        }
        s.push_str(&format!(
            "{r}║ rip {ip:016x}  O{o}S{sf}Z{z}A{a}P{p}C{c} IF{i} ║",
            ip = self.regs.rip,
            o = self.regs.flag(Flag::Overflow) as u8,
            sf = self.regs.flag(Flag::Sign) as u8,
            z = self.regs.flag(Flag::Zero) as u8,
            a = self.regs.flag(Flag::Adjust) as u8,
            p = self.regs.flag(Flag::Parity) as u8,
            c = self.regs.flag(Flag::Carry) as u8,
            i = self.regs.flag(Flag::Interrupt) as u8,
            r = cursor::Goto(1, 15),
        ));
        s.push_str(&format!("{}╚═══════════════════════════════════════╝", cursor::Goto(1, 16)));
        write!(f, "{}", s)
    }
}

pub struct Debugger {
    code_running: bool,
    last_cmd: DebugCommand,
    breakpoints: HashSet<u64>,
    watches: HashSet<u64>,
}

#[derive(PartialEq, Clone)]
enum DebugCommand {
    Quit,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Continue,
    Step,
    Jump(Option<String>),
    Watch(Option<String>),
    Unwatch(Option<String>),
}

impl Debugger {
    pub fn new() -> Box<Self> {
        Box::new(Debugger {
            code_running: false,
            last_cmd: DebugCommand::Step,
            breakpoints: HashSet::new(),
            watches: HashSet::new(),
        })
    }
    fn current_linear(cpu: &CPU) -> u64 {
        cpu.regs.seg(SegReg::Cs).cache.base.wrapping_add(cpu.regs.rip)
    }
    fn get_command(&mut self) -> DebugCommand {
        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            return DebugCommand::Quit;
        }
        let mut cmd = input.split_whitespace();
        match cmd.next() {
            Some("q") => DebugCommand::Quit,
            Some("s") | Some("n") => DebugCommand::Step,
            Some("b") => DebugCommand::SetBreakpoint(cmd.next().map(String::from)),
            Some("d") => DebugCommand::DeleteBreakpoint(cmd.next().map(String::from)),
            Some("j") => DebugCommand::Jump(cmd.next().map(String::from)),
            Some("w") => DebugCommand::Watch(cmd.next().map(String::from)),
            Some("u") => DebugCommand::Unwatch(cmd.next().map(String::from)),
            Some("c") => DebugCommand::Continue,
            _ => self.last_cmd.clone(),
        }
    }
    fn draw_user_interface(&mut self, cpu: &mut CPU) {
        print!("{c}{tl}{cpu}", c = clear::All, tl = cursor::Goto(1, 1), cpu = cpu);
        let linear = Self::current_linear(cpu);
        let bytes = cpu.read_linear_bytes(linear, 8);
        let mut hex = String::new();
        for byte in &bytes {
            hex.push_str(&format!("{:02x} ", byte));
        }
        print!(
            "{r} next: {g}{m}{n}  [{h}]",
            r = cursor::Goto(44, 3),
            g = color::Fg(color::Green),
            m = dispatch::mnemonic(&bytes),
            n = color::Fg(color::Reset),
            h = hex.trim_end(),
        );
        if !self.watches.is_empty() {
            println!("{}Watched memory:", cursor::Goto(1, 18));
            for &watch in self.watches.iter() {
                let bytes = cpu.read_linear_bytes(watch, 8);
                println!("  {:08x}: {:02x?}", watch, bytes);
            }
        }
        println!(
            "{}Debugger attached. n steps, c continues, b/d <addr> toggles a breakpoint, j <addr> jumps, w/u <addr> watches, q quits.",
            cursor::Goto(1, (19 + self.watches.len()) as u16)
        );
        print!("{}> ", cursor::Goto(1, (20 + self.watches.len()) as u16));
        io::stdout().flush().expect("");
    }
    pub fn update(&mut self, cpu: &mut CPU) -> Signal {
        if self.code_running && !self.breakpoints.contains(&Self::current_linear(cpu)) {
            return Signal::Ok;
        }
        self.code_running = false;
        self.draw_user_interface(cpu);
        let cmd = self.get_command();
        match &cmd {
            DebugCommand::Quit => Signal::Quit,
            DebugCommand::SetBreakpoint(addr) => {
                if let Some(addr) = parse_address(addr) {
                    self.breakpoints.insert(addr);
                }
                Signal::NoOp
            }
            DebugCommand::DeleteBreakpoint(addr) => {
                if let Some(addr) = parse_address(addr) {
                    self.breakpoints.remove(&addr);
                }
                Signal::NoOp
            }
            DebugCommand::Watch(addr) => {
                if let Some(addr) = parse_address(addr) {
                    self.watches.insert(addr);
                }
                Signal::NoOp
            }
            DebugCommand::Unwatch(addr) => {
                if let Some(addr) = parse_address(addr) {
                    self.watches.remove(&addr);
                }
                Signal::NoOp
            }
            DebugCommand::Continue => {
                self.code_running = true;
                Signal::Ok
            }
            DebugCommand::Step => {
                self.last_cmd = cmd;
                Signal::Ok
            }
            DebugCommand::Jump(addr) => {
                if let Some(addr) = parse_address(addr) {
                    cpu.regs.rip = addr;
                    self.last_cmd = cmd;
                    Signal::Ok
                } else {
                    Signal::NoOp
                }
            }
        }
    }
}

fn parse_address(address: &Option<String>) -> Option<u64> {
    address.as_ref().and_then(|addr| u64::from_str_radix(addr, 16).ok())
}
