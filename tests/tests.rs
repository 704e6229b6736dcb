// End-to-end scenarios: boot a machine configuration, drop machine code into
// memory, crank the CPU and assert on the architectural state afterwards.

use emx86::devices::{KeyboardController, Serial, Signal};
use emx86::fields::{SegReg, Width};
use emx86::memory::Bus;
use emx86::pc;
use emx86::registers::{Flag, RAX, RBX, RCX, RDI, RSI, RSP};
use emx86::{Configuration, Emulator};
use std::cell::RefCell;
use std::rc::Rc;

fn boot(code: &[u8]) -> Emulator {
    let mut config = pc::ibm_pc();
    config.start = pc::BOOT_SECTOR;
    let mut em = Emulator::new(config);
    em.load_bytes(code, pc::BOOT_SECTOR.1);
    em
}

fn read_mem(em: &mut Emulator, phys: u64, width: Width) -> u64 {
    em.cpu.bus.borrow_mut().read_phys(phys, width)
}

#[test]
fn mov_immediate_advances_ip_and_touches_no_flags() {
    // MOV AX, 0x1234; HLT
    let mut em = boot(&[0xb8, 0x34, 0x12, 0xf4]);
    em.run_until_halt(10);
    assert!(em.cpu.halted);
    assert_eq!(em.cpu.gpr(RAX, Width::Word), 0x1234);
    assert_eq!(em.cpu.rip(), 0x7c04);
    assert_eq!(em.cpu.rflags(), 0x2);
}

#[test]
fn add_wraps_with_full_flag_set() {
    // MOV AL, 0xFF; ADD AL, 1; HLT
    let mut em = boot(&[0xb0, 0xff, 0x04, 0x01, 0xf4]);
    em.run_until_halt(10);
    assert_eq!(em.cpu.gpr(RAX, Width::Byte), 0);
    assert!(em.cpu.regs.flag(Flag::Carry));
    assert!(em.cpu.regs.flag(Flag::Zero));
    assert!(em.cpu.regs.flag(Flag::Adjust));
    assert!(em.cpu.regs.flag(Flag::Parity));
    assert!(!em.cpu.regs.flag(Flag::Sign));
    assert!(!em.cpu.regs.flag(Flag::Overflow));
}

#[test]
fn operand_size_prefix_selects_32_bit_add() {
    // MOV EAX, 0xFFFF; ADD EAX, 1 (sign-extended imm8); HLT
    let mut em = boot(&[0x66, 0xb8, 0xff, 0xff, 0x00, 0x00, 0x66, 0x83, 0xc0, 0x01, 0xf4]);
    em.run_until_halt(10);
    assert_eq!(em.cpu.gpr(RAX, Width::Long), 0x0001_0000);
    assert!(!em.cpu.regs.flag(Flag::Carry));
    assert!(!em.cpu.regs.flag(Flag::Zero));
    assert!(!em.cpu.regs.flag(Flag::Overflow));
    assert!(em.cpu.regs.flag(Flag::Adjust));
}

#[test]
fn rep_movsb_copies_and_leaves_computed_post_state() {
    // MOV SI, 0x2000; MOV DI, 0x3000; MOV CX, 0x10; CLD; REP MOVSB; HLT
    let mut em = boot(&[
        0xbe, 0x00, 0x20, 0xbf, 0x00, 0x30, 0xb9, 0x10, 0x00, 0xfc, 0xf3, 0xa4, 0xf4,
    ]);
    let src: Vec<u8> = (0u8..16).map(|j| j.wrapping_mul(7) ^ 0x5a).collect();
    em.load_bytes(&src, 0x2000);
    em.run_until_halt(100);
    assert_eq!(em.cpu.gpr(RCX, Width::Word), 0);
    assert_eq!(em.cpu.gpr(RSI, Width::Word), 0x2010);
    assert_eq!(em.cpu.gpr(RDI, Width::Word), 0x3010);
    for (j, &byte) in src.iter().enumerate() {
        assert_eq!(read_mem(&mut em, 0x3000 + j as u64, Width::Byte), byte as u64);
    }
}

#[test]
fn rep_movsb_backward_copy_steps_per_iteration() {
    // overlapping downward copy: SI=0x2007, DI=0x2008, CX=8, STD
    let mut em = boot(&[
        0xbe, 0x07, 0x20, 0xbf, 0x08, 0x20, 0xb9, 0x08, 0x00, 0xfd, 0xf3, 0xa4, 0xf4,
    ]);
    em.load_bytes(&[1, 2, 3, 4, 5, 6, 7, 8], 0x2000);
    em.run_until_halt(100);
    // the shifted range must hold the original bytes
    for j in 0..8u64 {
        assert_eq!(read_mem(&mut em, 0x2001 + j, Width::Byte), j + 1);
    }
    assert_eq!(em.cpu.gpr(RSI, Width::Word), 0x1fff);
    assert_eq!(em.cpu.gpr(RDI, Width::Word), 0x2000);
}

#[test]
fn repe_cmpsb_stops_at_first_mismatch() {
    let mut em = boot(&[
        0xbe, 0x00, 0x20, 0xbf, 0x00, 0x30, 0xb9, 0x08, 0x00, 0xfc, 0xf3, 0xa6, 0xf4,
    ]);
    em.load_bytes(b"AAAABAAA", 0x2000);
    em.load_bytes(b"AAAACAAA", 0x3000);
    em.run_until_halt(100);
    // five comparisons ran; SI/DI sit one past the mismatch
    assert_eq!(em.cpu.gpr(RCX, Width::Word), 3);
    assert_eq!(em.cpu.gpr(RSI, Width::Word), 0x2005);
    assert_eq!(em.cpu.gpr(RDI, Width::Word), 0x3005);
    assert!(!em.cpu.regs.flag(Flag::Zero));
}

#[test]
fn divide_by_zero_vectors_through_ivt() {
    // MOV SP, 0x9000; MOV AX, 0; DIV AX -> #DE
    let mut em = boot(&[0xbc, 0x00, 0x90, 0xb8, 0x00, 0x00, 0xf7, 0xf0, 0xf4]);
    // vector 0 -> 0000:0500, where a HLT waits
    em.load_bytes(&[0x00, 0x05, 0x00, 0x00], 0);
    em.load_bytes(&[0xf4], 0x500);
    em.run_until_halt(20);
    assert!(em.cpu.halted);
    assert_eq!(em.cpu.rip(), 0x501);
    // the frame points back at the faulting DIV, not past it
    assert_eq!(read_mem(&mut em, 0x8ffa, Width::Word), 0x7c06);
    assert_eq!(read_mem(&mut em, 0x8ffc, Width::Word), 0x0000);
}

#[test]
fn call_ret_round_trip_restores_stack() {
    let mut em = boot(&[
        0xbc, 0x00, 0x90, // mov sp, 0x9000
        0xe8, 0x05, 0x00, // call +5 (0x7c0b)
        0xb8, 0x01, 0x00, // mov ax, 1
        0xf4, // hlt
        0x90, // nop
        0xbb, 0x02, 0x00, // mov bx, 2
        0xc3, // ret
    ]);
    em.run_until_halt(20);
    assert!(em.cpu.halted);
    assert_eq!(em.cpu.gpr(RAX, Width::Word), 1);
    assert_eq!(em.cpu.gpr(RBX, Width::Word), 2);
    assert_eq!(em.cpu.gpr(RSP, Width::Word), 0x9000);
}

#[test]
fn int_iret_round_trip() {
    // MOV SP, 0x9000; STC; INT 0x21; HLT -- handler sets AX and IRETs
    let mut em = boot(&[0xbc, 0x00, 0x90, 0xf9, 0xcd, 0x21, 0xf4]);
    em.load_bytes(&[0x00, 0x06, 0x00, 0x00], 0x21 * 4);
    em.load_bytes(&[0xb8, 0x34, 0x12, 0xcf], 0x600);
    em.run_until_halt(20);
    assert!(em.cpu.halted);
    assert_eq!(em.cpu.gpr(RAX, Width::Word), 0x1234);
    assert_eq!(em.cpu.gpr(RSP, Width::Word), 0x9000);
    // CF survived the round trip through the pushed FLAGS image
    assert!(em.cpu.regs.flag(Flag::Carry));
    assert_eq!(em.cpu.rip(), 0x7c07);
}

#[test]
fn bios_service_bridge_bypasses_stub_vectoring() {
    let mut em = boot(&[0xcd, 0x10, 0xf4]);
    em.install_service(
        0x10,
        Box::new(|cpu| {
            cpu.write_gpr(RAX, Width::Word, 0x0999);
            Ok(Signal::Ok)
        }),
    );
    let executed = em.run_until_halt(10);
    assert!(em.cpu.halted);
    assert_eq!(em.cpu.gpr(RAX, Width::Word), 0x0999);
    // INT plus HLT only: no vectoring, no stub round trip
    assert_eq!(executed, 2);
}

#[test]
fn null_indirect_call_aborts_instead_of_faulting() {
    // XOR AX, AX; CALL AX -> linear 0
    let mut em = boot(&[0x31, 0xc0, 0xff, 0xd0, 0xf4]);
    em.run_until_halt(10);
    assert!(!em.cpu.halted);
    // the abort left IP at the faulting instruction
    assert_eq!(em.cpu.instr_start, 0x7c02);
}

#[test]
fn lenient_decode_turns_unknown_two_byte_into_nop() {
    let code = [0x0f, 0xff, 0xf4];
    let mut config = pc::ibm_pc();
    config.start = pc::BOOT_SECTOR;
    config.lenient_decode = true;
    let mut em = Emulator::new(config);
    em.load_bytes(&code, pc::BOOT_SECTOR.1);
    em.run_until_halt(10);
    assert!(em.cpu.halted);
}

#[test]
fn serial_output_reaches_the_device() {
    let uart = Rc::new(RefCell::new(*Serial::new(0x3f8)));
    let mut bus = Bus::new();
    bus.attach_ports(0x3f8, 0x3ff, Box::new(Rc::clone(&uart)));
    let mut em = Emulator::new(Configuration {
        start: (0, 0x7c00),
        bus,
        memory_layout: Vec::new(),
        lenient_decode: false,
    });
    // MOV DX, 0x3F8; MOV AL, 'h'; OUT DX, AL; MOV AL, 'i'; OUT DX, AL; HLT
    em.load_bytes(&[0xba, 0xf8, 0x03, 0xb0, b'h', 0xee, 0xb0, b'i', 0xee, 0xf4], 0x7c00);
    em.run_until_halt(10);
    assert_eq!(uart.borrow().output, b"hi");
}

#[test]
fn hlt_resumes_on_keyboard_irq() {
    let kbc = Rc::new(RefCell::new(*KeyboardController::new()));
    let mut config = pc::ibm_pc();
    config.start = pc::BOOT_SECTOR;
    let mut bus = Bus::new();
    bus.attach_ports(0x60, 0x64, Box::new(Rc::clone(&kbc)));
    config.bus = bus;
    let mut em = Emulator::new(config);
    // IVT[9] -> 0000:0600
    em.load_bytes(&[0x00, 0x06, 0x00, 0x00], 9 * 4);
    // handler: MOV byte [0x500], 0xAB; IRET
    em.load_bytes(&[0xc6, 0x06, 0x00, 0x05, 0xab, 0xcf], 0x600);
    // MOV SP, 0x9000; STI; HLT; MOV byte [0x501], 0xCD; HLT
    em.load_bytes(
        &[0xbc, 0x00, 0x90, 0xfb, 0xf4, 0xc6, 0x06, 0x01, 0x05, 0xcd, 0xf4],
        0x7c00,
    );
    kbc.borrow_mut().push_scancode(0x1c);
    em.run_until_halt(200);
    assert_eq!(read_mem(&mut em, 0x500, Width::Byte), 0xab);
    assert_eq!(read_mem(&mut em, 0x501, Width::Byte), 0xcd);
}

// ------------------------------------------------------- protected mode

// GDT used by the protected-mode scenarios:
//   0x08 ring-0 code, 0x10 ring-0 data, 0x18 ring-3 code, 0x20 ring-3 data,
//   0x28 TSS at 0x8000
fn protected_mode_fixture() -> Vec<u8> {
    let mut gdt = vec![0u8; 8];
    gdt.extend_from_slice(&[0xff, 0xff, 0x00, 0x00, 0x00, 0x9a, 0xcf, 0x00]);
    gdt.extend_from_slice(&[0xff, 0xff, 0x00, 0x00, 0x00, 0x92, 0xcf, 0x00]);
    gdt.extend_from_slice(&[0xff, 0xff, 0x00, 0x00, 0x00, 0xfa, 0xcf, 0x00]);
    gdt.extend_from_slice(&[0xff, 0xff, 0x00, 0x00, 0x00, 0xf2, 0xcf, 0x00]);
    gdt.extend_from_slice(&[0x67, 0x00, 0x00, 0x80, 0x00, 0x89, 0x00, 0x00]);
    gdt
}

fn enter_protected_mode() -> Vec<u8> {
    let mut code = vec![
        0xfa, // cli
        0x0f, 0x01, 0x16, 0x60, 0x7e, // lgdt [0x7e60]
        0x0f, 0x20, 0xc0, // mov eax, cr0
        0x66, 0x83, 0xc8, 0x01, // or eax, 1
        0x0f, 0x22, 0xc0, // mov cr0, eax
        0xea, 0x20, 0x7c, 0x08, 0x00, // jmp far 0008:7c20
    ];
    code.resize(0x20, 0x90);
    code
}

#[test]
fn protected_mode_transition_reloads_cs_cache() {
    let mut em = boot(&[]);
    em.load_bytes(&protected_mode_fixture(), 0x7e00);
    em.load_bytes(&[0x2f, 0x00, 0x00, 0x7e, 0x00, 0x00], 0x7e60); // GDTR image
    let mut code = enter_protected_mode();
    // 32-bit entry at 0x7c20:
    code.extend_from_slice(&[
        0x66, 0xb8, 0x10, 0x00, // mov ax, 0x10
        0x8e, 0xd8, // mov ds, ax
        0x8e, 0xd0, // mov ss, ax
        0xbc, 0x00, 0x90, 0x00, 0x00, // mov esp, 0x9000
        0xf4, // hlt
    ]);
    em.load_bytes(&code, 0x7c00);
    em.run_until_halt(50);
    assert!(em.cpu.halted);
    let (selector, base, limit, _) = em.cpu.segment(SegReg::Cs);
    assert_eq!(selector, 0x08);
    assert_eq!(base, 0);
    assert_eq!(limit, 0xffff_ffff);
    assert_eq!(em.cpu.regs.cpl, 0);
    // segment cache coherence after MOV DS
    let (selector, base, limit, _) = em.cpu.segment(SegReg::Ds);
    assert_eq!(selector, 0x10);
    assert_eq!(base, 0);
    assert_eq!(limit, 0xffff_ffff);
}

#[test]
fn iret_to_ring3_and_interrupt_gate_back() {
    let mut em = boot(&[]);
    em.load_bytes(&protected_mode_fixture(), 0x7e00);
    em.load_bytes(&[0x2f, 0x00, 0x00, 0x7e, 0x00, 0x00], 0x7e60); // GDTR image
    em.load_bytes(&[0xff, 0x01, 0x00, 0x7f, 0x00, 0x00], 0x7e80); // IDTR image
    // TSS: SS0:ESP0 = 0x10:0x6000
    em.load_bytes(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x60, 0x00, 0x00, 0x10, 0x00], 0x8000);
    // IDT vector 0x30: 32-bit interrupt gate, DPL 3, target 0008:7c70
    em.load_bytes(&[0x70, 0x7c, 0x08, 0x00, 0x00, 0xee, 0x00, 0x00], 0x7f00 + 0x30 * 8);

    let mut code = enter_protected_mode();
    code.extend_from_slice(&[
        0x66, 0xb8, 0x10, 0x00, // mov ax, 0x10
        0x8e, 0xd8, // mov ds, ax
        0x8e, 0xd0, // mov ss, ax
        0xbc, 0x00, 0x90, 0x00, 0x00, // mov esp, 0x9000
        0x66, 0xb8, 0x28, 0x00, // mov ax, 0x28
        0x0f, 0x00, 0xd8, // ltr ax
        0x0f, 0x01, 0x1d, 0x80, 0x7e, 0x00, 0x00, // lidt [0x7e80]
        0x6a, 0x23, // push 0x23 (ring-3 SS)
        0x68, 0x00, 0x50, 0x00, 0x00, // push 0x5000 (ring-3 ESP)
        0x68, 0x02, 0x00, 0x00, 0x00, // push 0x002 (EFLAGS, IF off)
        0x6a, 0x1b, // push 0x1b (ring-3 CS)
        0x68, 0x60, 0x7c, 0x00, 0x00, // push 0x7c60 (EIP)
        0xcf, // iret
    ]);
    code.resize(0x60, 0x90);
    // ring-3 code at 0x7c60
    code.extend_from_slice(&[0xcd, 0x30]); // int 0x30
    code.resize(0x70, 0x90);
    // ring-0 handler at 0x7c70
    code.push(0xf4); // hlt
    em.load_bytes(&code, 0x7c00);

    em.run_until_halt(100);
    assert!(em.cpu.halted);
    assert_eq!(em.cpu.regs.cpl, 0);
    // the gate stacked the outer SS:ESP on the TSS ring-0 stack
    assert_eq!(read_mem(&mut em, 0x5ffc, Width::Long), 0x23);
    assert_eq!(read_mem(&mut em, 0x5ff8, Width::Long), 0x5000);
    assert_eq!(read_mem(&mut em, 0x5ff0, Width::Long), 0x1b);
    assert_eq!(read_mem(&mut em, 0x5fec, Width::Long), 0x7c62);
    let (selector, ..) = em.cpu.segment(SegReg::Cs);
    assert_eq!(selector, 0x08);
}

#[test]
fn paged_write_then_read_round_trips() {
    use emx86::paging::Access;
    use emx86::registers::Cr0;
    let mut em = boot(&[]);
    {
        let mut bus = em.cpu.bus.borrow_mut();
        // identity-map the first 4 MiB through a single page table
        bus.write_phys(0x10000, Width::Long, 0x11000 | 0x3);
        for j in 0..1024u64 {
            bus.write_phys(0x11000 + j * 4, Width::Long, j << 12 | 0x3);
        }
    }
    em.cpu.regs.cr3 = 0x10000;
    em.cpu.regs.cr0 |= Cr0::PE | Cr0::PG;
    em.cpu.linear_write(0x1234, Width::Long, 0xdead_beef).unwrap();
    assert_eq!(em.cpu.linear_read(0x1234, Width::Long, Access::Read).unwrap(), 0xdead_beef);
    // unmapped linear addresses fault
    assert!(em.cpu.linear_read(0x40_0000, Width::Long, Access::Read).is_err());
}
