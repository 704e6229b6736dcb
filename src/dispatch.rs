// Handler dispatch: one flat table per opcode map, indexed by the terminal
// opcode byte. Group opcodes resolve their ModR/M digit inside the handler.
// Prefix bytes never reach these tables; the decoder consumes them first, so
// their slots alias the invalid handler.

use crate::alu;
use crate::control;
use crate::decoder::Instr;
use crate::devices::Signal;
use crate::error::Fault;
use crate::processor::CPU;
use crate::strings;
use crate::system;
use crate::transfer;

pub type Handler = fn(&mut CPU, &mut Instr) -> Result<Signal, Fault>;

pub fn lookup(instr: &Instr) -> Handler {
    if instr.two_byte {
        SECONDARY[instr.opcode as usize]
    } else {
        PRIMARY[instr.opcode as usize]
    }
}

// Unknown opcodes are #UD; a lenient configuration lets legacy-mode probe
// sequences slide through as logged NOPs.
pub fn invalid(cpu: &mut CPU, instr: &mut Instr) -> Result<Signal, Fault> {
    if cpu.lenient_decode && !cpu.regs.long64() {
        log::warn!(
            "lenient decode: {}{:02x} executed as NOP at {:#06x}:{:#x}",
            if instr.two_byte { "0f " } else { "" },
            instr.opcode,
            cpu.instr_start_cs,
            cpu.instr_start
        );
        return Ok(Signal::Ok);
    }
    Err(Fault::InvalidOpcode { opcode: instr.opcode, two_byte: instr.two_byte })
}

fn nop(_cpu: &mut CPU, _instr: &mut Instr) -> Result<Signal, Fault> {
    Ok(Signal::Ok)
}

pub static PRIMARY: [Handler; 256] = [
    alu::binop_rm_r,      // 00 ADD r/m8, r8
    alu::binop_rm_r,      // 01 ADD r/m, r
    alu::binop_r_rm,      // 02 ADD r8, r/m8
    alu::binop_r_rm,      // 03 ADD r, r/m
    alu::binop_acc_imm,   // 04 ADD AL, imm8
    alu::binop_acc_imm,   // 05 ADD eAX, imm
    transfer::push_sreg,  // 06 PUSH ES
    transfer::pop_sreg,   // 07 POP ES
    alu::binop_rm_r,      // 08 OR r/m8, r8
    alu::binop_rm_r,      // 09 OR r/m, r
    alu::binop_r_rm,      // 0A OR r8, r/m8
    alu::binop_r_rm,      // 0B OR r, r/m
    alu::binop_acc_imm,   // 0C OR AL, imm8
    alu::binop_acc_imm,   // 0D OR eAX, imm
    transfer::push_sreg,  // 0E PUSH CS
    invalid,              // 0F two-byte escape (consumed by the decoder)
    alu::binop_rm_r,      // 10 ADC r/m8, r8
    alu::binop_rm_r,      // 11 ADC r/m, r
    alu::binop_r_rm,      // 12 ADC r8, r/m8
    alu::binop_r_rm,      // 13 ADC r, r/m
    alu::binop_acc_imm,   // 14 ADC AL, imm8
    alu::binop_acc_imm,   // 15 ADC eAX, imm
    transfer::push_sreg,  // 16 PUSH SS
    transfer::pop_sreg,   // 17 POP SS
    alu::binop_rm_r,      // 18 SBB r/m8, r8
    alu::binop_rm_r,      // 19 SBB r/m, r
    alu::binop_r_rm,      // 1A SBB r8, r/m8
    alu::binop_r_rm,      // 1B SBB r, r/m
    alu::binop_acc_imm,   // 1C SBB AL, imm8
    alu::binop_acc_imm,   // 1D SBB eAX, imm
    transfer::push_sreg,  // 1E PUSH DS
    transfer::pop_sreg,   // 1F POP DS
    alu::binop_rm_r,      // 20 AND r/m8, r8
    alu::binop_rm_r,      // 21 AND r/m, r
    alu::binop_r_rm,      // 22 AND r8, r/m8
    alu::binop_r_rm,      // 23 AND r, r/m
    alu::binop_acc_imm,   // 24 AND AL, imm8
    alu::binop_acc_imm,   // 25 AND eAX, imm
    invalid,              // 26 ES prefix
    alu::daa,             // 27 DAA
    alu::binop_rm_r,      // 28 SUB r/m8, r8
    alu::binop_rm_r,      // 29 SUB r/m, r
    alu::binop_r_rm,      // 2A SUB r8, r/m8
    alu::binop_r_rm,      // 2B SUB r, r/m
    alu::binop_acc_imm,   // 2C SUB AL, imm8
    alu::binop_acc_imm,   // 2D SUB eAX, imm
    invalid,              // 2E CS prefix
    alu::das,             // 2F DAS
    alu::binop_rm_r,      // 30 XOR r/m8, r8
    alu::binop_rm_r,      // 31 XOR r/m, r
    alu::binop_r_rm,      // 32 XOR r8, r/m8
    alu::binop_r_rm,      // 33 XOR r, r/m
    alu::binop_acc_imm,   // 34 XOR AL, imm8
    alu::binop_acc_imm,   // 35 XOR eAX, imm
    invalid,              // 36 SS prefix
    alu::aaa,             // 37 AAA
    alu::binop_rm_r,      // 38 CMP r/m8, r8
    alu::binop_rm_r,      // 39 CMP r/m, r
    alu::binop_r_rm,      // 3A CMP r8, r/m8
    alu::binop_r_rm,      // 3B CMP r, r/m
    alu::binop_acc_imm,   // 3C CMP AL, imm8
    alu::binop_acc_imm,   // 3D CMP eAX, imm
    invalid,              // 3E DS prefix
    alu::aas,             // 3F AAS
    alu::inc_r,           // 40 INC eAX (REX in 64-bit code)
    alu::inc_r,           // 41 INC eCX
    alu::inc_r,           // 42 INC eDX
    alu::inc_r,           // 43 INC eBX
    alu::inc_r,           // 44 INC eSP
    alu::inc_r,           // 45 INC eBP
    alu::inc_r,           // 46 INC eSI
    alu::inc_r,           // 47 INC eDI
    alu::dec_r,           // 48 DEC eAX
    alu::dec_r,           // 49 DEC eCX
    alu::dec_r,           // 4A DEC eDX
    alu::dec_r,           // 4B DEC eBX
    alu::dec_r,           // 4C DEC eSP
    alu::dec_r,           // 4D DEC eBP
    alu::dec_r,           // 4E DEC eSI
    alu::dec_r,           // 4F DEC eDI
    transfer::push_r,     // 50 PUSH rAX
    transfer::push_r,     // 51 PUSH rCX
    transfer::push_r,     // 52 PUSH rDX
    transfer::push_r,     // 53 PUSH rBX
    transfer::push_r,     // 54 PUSH rSP
    transfer::push_r,     // 55 PUSH rBP
    transfer::push_r,     // 56 PUSH rSI
    transfer::push_r,     // 57 PUSH rDI
    transfer::pop_r,      // 58 POP rAX
    transfer::pop_r,      // 59 POP rCX
    transfer::pop_r,      // 5A POP rDX
    transfer::pop_r,      // 5B POP rBX
    transfer::pop_r,      // 5C POP rSP
    transfer::pop_r,      // 5D POP rBP
    transfer::pop_r,      // 5E POP rSI
    transfer::pop_r,      // 5F POP rDI
    transfer::pusha,      // 60 PUSHA
    transfer::popa,       // 61 POPA
    transfer::bound,      // 62 BOUND
    transfer::arpl_movsxd, // 63 ARPL / MOVSXD
    invalid,              // 64 FS prefix
    invalid,              // 65 GS prefix
    invalid,              // 66 operand-size prefix
    invalid,              // 67 address-size prefix
    transfer::push_imm,   // 68 PUSH imm
    alu::imul_imm,        // 69 IMUL r, r/m, imm
    transfer::push_imm,   // 6A PUSH imm8
    alu::imul_imm,        // 6B IMUL r, r/m, imm8
    strings::ins,         // 6C INSB
    strings::ins,         // 6D INSW/D
    strings::outs,        // 6E OUTSB
    strings::outs,        // 6F OUTSW/D
    control::jcc_short,   // 70 JO rel8
    control::jcc_short,   // 71 JNO rel8
    control::jcc_short,   // 72 JB rel8
    control::jcc_short,   // 73 JNB rel8
    control::jcc_short,   // 74 JE rel8
    control::jcc_short,   // 75 JNE rel8
    control::jcc_short,   // 76 JBE rel8
    control::jcc_short,   // 77 JA rel8
    control::jcc_short,   // 78 JS rel8
    control::jcc_short,   // 79 JNS rel8
    control::jcc_short,   // 7A JP rel8
    control::jcc_short,   // 7B JNP rel8
    control::jcc_short,   // 7C JL rel8
    control::jcc_short,   // 7D JGE rel8
    control::jcc_short,   // 7E JLE rel8
    control::jcc_short,   // 7F JG rel8
    alu::group_imm,       // 80 group 1 r/m8, imm8
    alu::group_imm,       // 81 group 1 r/m, imm
    alu::group_imm,       // 82 group 1 alias of 80
    alu::group_imm,       // 83 group 1 r/m, imm8 (sign-extended)
    alu::test_rm_r,       // 84 TEST r/m8, r8
    alu::test_rm_r,       // 85 TEST r/m, r
    transfer::xchg_rm_r,  // 86 XCHG r/m8, r8
    transfer::xchg_rm_r,  // 87 XCHG r/m, r
    transfer::mov_rm_r,   // 88 MOV r/m8, r8
    transfer::mov_rm_r,   // 89 MOV r/m, r
    transfer::mov_r_rm,   // 8A MOV r8, r/m8
    transfer::mov_r_rm,   // 8B MOV r, r/m
    transfer::mov_rm_sreg, // 8C MOV r/m16, Sreg
    transfer::lea,        // 8D LEA
    transfer::mov_sreg_rm, // 8E MOV Sreg, r/m16
    transfer::group_8f,   // 8F POP r/m
    transfer::xchg_acc_r, // 90 NOP / XCHG rAX, r8
    transfer::xchg_acc_r, // 91 XCHG rAX, rCX
    transfer::xchg_acc_r, // 92 XCHG rAX, rDX
    transfer::xchg_acc_r, // 93 XCHG rAX, rBX
    transfer::xchg_acc_r, // 94 XCHG rAX, rSP
    transfer::xchg_acc_r, // 95 XCHG rAX, rBP
    transfer::xchg_acc_r, // 96 XCHG rAX, rSI
    transfer::xchg_acc_r, // 97 XCHG rAX, rDI
    alu::cbw,             // 98 CBW/CWDE/CDQE
    alu::cwd,             // 99 CWD/CDQ/CQO
    control::call_far,    // 9A CALL ptr16:16/32
    system::fwait,        // 9B WAIT
    transfer::pushf,      // 9C PUSHF
    transfer::popf,       // 9D POPF
    transfer::sahf,       // 9E SAHF
    transfer::lahf,       // 9F LAHF
    transfer::mov_moffs,  // A0 MOV AL, moffs8
    transfer::mov_moffs,  // A1 MOV eAX, moffs
    transfer::mov_moffs,  // A2 MOV moffs8, AL
    transfer::mov_moffs,  // A3 MOV moffs, eAX
    strings::movs,        // A4 MOVSB
    strings::movs,        // A5 MOVSW/D/Q
    strings::cmps,        // A6 CMPSB
    strings::cmps,        // A7 CMPSW/D/Q
    alu::test_acc_imm,    // A8 TEST AL, imm8
    alu::test_acc_imm,    // A9 TEST eAX, imm
    strings::stos,        // AA STOSB
    strings::stos,        // AB STOSW/D/Q
    strings::lods,        // AC LODSB
    strings::lods,        // AD LODSW/D/Q
    strings::scas,        // AE SCASB
    strings::scas,        // AF SCASW/D/Q
    transfer::mov_r_imm,  // B0 MOV AL, imm8
    transfer::mov_r_imm,  // B1 MOV CL, imm8
    transfer::mov_r_imm,  // B2 MOV DL, imm8
    transfer::mov_r_imm,  // B3 MOV BL, imm8
    transfer::mov_r_imm,  // B4 MOV AH, imm8
    transfer::mov_r_imm,  // B5 MOV CH, imm8
    transfer::mov_r_imm,  // B6 MOV DH, imm8
    transfer::mov_r_imm,  // B7 MOV BH, imm8
    transfer::mov_r_imm,  // B8 MOV rAX, imm
    transfer::mov_r_imm,  // B9 MOV rCX, imm
    transfer::mov_r_imm,  // BA MOV rDX, imm
    transfer::mov_r_imm,  // BB MOV rBX, imm
    transfer::mov_r_imm,  // BC MOV rSP, imm
    transfer::mov_r_imm,  // BD MOV rBP, imm
    transfer::mov_r_imm,  // BE MOV rSI, imm
    transfer::mov_r_imm,  // BF MOV rDI, imm
    alu::shift_group,     // C0 shift r/m8, imm8
    alu::shift_group,     // C1 shift r/m, imm8
    control::ret_near,    // C2 RET imm16
    control::ret_near,    // C3 RET
    transfer::les,        // C4 LES
    transfer::lds,        // C5 LDS
    transfer::mov_rm_imm, // C6 MOV r/m8, imm8
    transfer::mov_rm_imm, // C7 MOV r/m, imm
    transfer::enter,      // C8 ENTER
    transfer::leave,      // C9 LEAVE
    control::ret_far,     // CA RETF imm16
    control::ret_far,     // CB RETF
    control::int3,        // CC INT3
    control::int_imm,     // CD INT imm8
    control::into,        // CE INTO
    control::iret,        // CF IRET
    alu::shift_group,     // D0 shift r/m8, 1
    alu::shift_group,     // D1 shift r/m, 1
    alu::shift_group,     // D2 shift r/m8, CL
    alu::shift_group,     // D3 shift r/m, CL
    alu::aam,             // D4 AAM imm8
    alu::aad,             // D5 AAD imm8
    transfer::salc,       // D6 SALC
    transfer::xlat,       // D7 XLAT
    system::fpu_escape,   // D8 x87
    system::fpu_escape,   // D9 x87
    system::fpu_escape,   // DA x87
    system::fpu_escape,   // DB x87
    system::fpu_escape,   // DC x87
    system::fpu_escape,   // DD x87
    system::fpu_escape,   // DE x87
    system::fpu_escape,   // DF x87
    control::loop_cc,     // E0 LOOPNE rel8
    control::loop_cc,     // E1 LOOPE rel8
    control::loop_cc,     // E2 LOOP rel8
    control::jcxz,        // E3 JCXZ rel8
    transfer::in_imm,     // E4 IN AL, imm8
    transfer::in_imm,     // E5 IN eAX, imm8
    transfer::out_imm,    // E6 OUT imm8, AL
    transfer::out_imm,    // E7 OUT imm8, eAX
    control::call_near,   // E8 CALL rel
    control::jmp_near,    // E9 JMP rel
    control::jmp_far,     // EA JMP ptr16:16/32
    control::jmp_short,   // EB JMP rel8
    transfer::in_dx,      // EC IN AL, DX
    transfer::in_dx,      // ED IN eAX, DX
    transfer::out_dx,     // EE OUT DX, AL
    transfer::out_dx,     // EF OUT DX, eAX
    invalid,              // F0 LOCK prefix
    invalid,              // F1 INT1
    invalid,              // F2 REPNE prefix
    invalid,              // F3 REP prefix
    system::hlt,          // F4 HLT
    transfer::cmc,        // F5 CMC
    alu::group_f6,        // F6 group 3 r/m8
    alu::group_f6,        // F7 group 3 r/m
    transfer::clc,        // F8 CLC
    transfer::stc,        // F9 STC
    transfer::cli,        // FA CLI
    transfer::sti,        // FB STI
    transfer::cld,        // FC CLD
    transfer::std,        // FD STD
    alu::group_fe,        // FE group 4 INC/DEC r/m8
    control::group_ff,    // FF group 5
];

pub static SECONDARY: [Handler; 256] = [
    system::group_0f00,   // 0F 00 group 6 SLDT/STR/LLDT/LTR/VERR/VERW
    system::group_0f01,   // 0F 01 group 7 SGDT/SIDT/LGDT/LIDT/SMSW/LMSW/INVLPG
    system::lar_lsl,      // 0F 02 LAR
    system::lar_lsl,      // 0F 03 LSL
    invalid,              // 0F 04
    invalid,              // 0F 05 SYSCALL (not modeled)
    system::clts,         // 0F 06 CLTS
    invalid,              // 0F 07 SYSRET (not modeled)
    system::invd,         // 0F 08 INVD
    system::invd,         // 0F 09 WBINVD
    invalid,              // 0F 0A
    system::ud2,          // 0F 0B UD2
    invalid,              // 0F 0C
    invalid,              // 0F 0D
    invalid,              // 0F 0E
    invalid,              // 0F 0F
    system::movps,        // 0F 10 MOVUPS xmm, m128
    system::movps,        // 0F 11 MOVUPS m128, xmm
    invalid,              // 0F 12
    invalid,              // 0F 13
    invalid,              // 0F 14
    invalid,              // 0F 15
    invalid,              // 0F 16
    invalid,              // 0F 17
    system::nop_modrm,    // 0F 18 PREFETCH hints
    system::nop_modrm,    // 0F 19 hint NOP
    system::nop_modrm,    // 0F 1A hint NOP
    system::nop_modrm,    // 0F 1B hint NOP
    system::nop_modrm,    // 0F 1C hint NOP
    system::nop_modrm,    // 0F 1D hint NOP
    system::nop_modrm,    // 0F 1E hint NOP
    system::nop_modrm,    // 0F 1F long NOP
    system::mov_from_cr,  // 0F 20 MOV r, CRn
    system::mov_from_dr,  // 0F 21 MOV r, DRn
    system::mov_to_cr,    // 0F 22 MOV CRn, r
    system::mov_to_dr,    // 0F 23 MOV DRn, r
    invalid,              // 0F 24
    invalid,              // 0F 25
    invalid,              // 0F 26
    invalid,              // 0F 27
    system::movps,        // 0F 28 MOVAPS xmm, m128
    system::movps,        // 0F 29 MOVAPS m128, xmm
    invalid,              // 0F 2A
    invalid,              // 0F 2B
    invalid,              // 0F 2C
    invalid,              // 0F 2D
    invalid,              // 0F 2E
    invalid,              // 0F 2F
    system::wrmsr,        // 0F 30 WRMSR
    system::rdtsc,        // 0F 31 RDTSC
    system::rdmsr,        // 0F 32 RDMSR
    system::rdpmc,        // 0F 33 RDPMC
    control::sysenter,    // 0F 34 SYSENTER
    control::sysexit,     // 0F 35 SYSEXIT
    invalid,              // 0F 36
    invalid,              // 0F 37
    invalid,              // 0F 38 three-byte escape (not modeled)
    invalid,              // 0F 39
    invalid,              // 0F 3A three-byte escape (not modeled)
    invalid,              // 0F 3B
    invalid,              // 0F 3C
    invalid,              // 0F 3D
    invalid,              // 0F 3E
    invalid,              // 0F 3F
    alu::cmovcc,          // 0F 40 CMOVO
    alu::cmovcc,          // 0F 41 CMOVNO
    alu::cmovcc,          // 0F 42 CMOVB
    alu::cmovcc,          // 0F 43 CMOVNB
    alu::cmovcc,          // 0F 44 CMOVE
    alu::cmovcc,          // 0F 45 CMOVNE
    alu::cmovcc,          // 0F 46 CMOVBE
    alu::cmovcc,          // 0F 47 CMOVA
    alu::cmovcc,          // 0F 48 CMOVS
    alu::cmovcc,          // 0F 49 CMOVNS
    alu::cmovcc,          // 0F 4A CMOVP
    alu::cmovcc,          // 0F 4B CMOVNP
    alu::cmovcc,          // 0F 4C CMOVL
    alu::cmovcc,          // 0F 4D CMOVGE
    alu::cmovcc,          // 0F 4E CMOVLE
    alu::cmovcc,          // 0F 4F CMOVG
    invalid,              // 0F 50
    invalid,              // 0F 51
    invalid,              // 0F 52
    invalid,              // 0F 53
    invalid,              // 0F 54
    invalid,              // 0F 55
    invalid,              // 0F 56
    invalid,              // 0F 57
    invalid,              // 0F 58
    invalid,              // 0F 59
    invalid,              // 0F 5A
    invalid,              // 0F 5B
    invalid,              // 0F 5C
    invalid,              // 0F 5D
    invalid,              // 0F 5E
    invalid,              // 0F 5F
    invalid,              // 0F 60
    invalid,              // 0F 61
    invalid,              // 0F 62
    invalid,              // 0F 63
    invalid,              // 0F 64
    invalid,              // 0F 65
    invalid,              // 0F 66
    invalid,              // 0F 67
    invalid,              // 0F 68
    invalid,              // 0F 69
    invalid,              // 0F 6A
    invalid,              // 0F 6B
    invalid,              // 0F 6C
    invalid,              // 0F 6D
    invalid,              // 0F 6E
    invalid,              // 0F 6F
    invalid,              // 0F 70
    invalid,              // 0F 71
    invalid,              // 0F 72
    invalid,              // 0F 73
    invalid,              // 0F 74
    invalid,              // 0F 75
    invalid,              // 0F 76
    nop,                  // 0F 77 EMMS
    invalid,              // 0F 78
    invalid,              // 0F 79
    invalid,              // 0F 7A
    invalid,              // 0F 7B
    invalid,              // 0F 7C
    invalid,              // 0F 7D
    invalid,              // 0F 7E
    invalid,              // 0F 7F
    control::jcc_near,    // 0F 80 JO rel
    control::jcc_near,    // 0F 81 JNO rel
    control::jcc_near,    // 0F 82 JB rel
    control::jcc_near,    // 0F 83 JNB rel
    control::jcc_near,    // 0F 84 JE rel
    control::jcc_near,    // 0F 85 JNE rel
    control::jcc_near,    // 0F 86 JBE rel
    control::jcc_near,    // 0F 87 JA rel
    control::jcc_near,    // 0F 88 JS rel
    control::jcc_near,    // 0F 89 JNS rel
    control::jcc_near,    // 0F 8A JP rel
    control::jcc_near,    // 0F 8B JNP rel
    control::jcc_near,    // 0F 8C JL rel
    control::jcc_near,    // 0F 8D JGE rel
    control::jcc_near,    // 0F 8E JLE rel
    control::jcc_near,    // 0F 8F JG rel
    alu::setcc,           // 0F 90 SETO
    alu::setcc,           // 0F 91 SETNO
    alu::setcc,           // 0F 92 SETB
    alu::setcc,           // 0F 93 SETNB
    alu::setcc,           // 0F 94 SETE
    alu::setcc,           // 0F 95 SETNE
    alu::setcc,           // 0F 96 SETBE
    alu::setcc,           // 0F 97 SETA
    alu::setcc,           // 0F 98 SETS
    alu::setcc,           // 0F 99 SETNS
    alu::setcc,           // 0F 9A SETP
    alu::setcc,           // 0F 9B SETNP
    alu::setcc,           // 0F 9C SETL
    alu::setcc,           // 0F 9D SETGE
    alu::setcc,           // 0F 9E SETLE
    alu::setcc,           // 0F 9F SETG
    transfer::push_fs_gs, // 0F A0 PUSH FS
    transfer::pop_fs_gs,  // 0F A1 POP FS
    system::cpuid,        // 0F A2 CPUID
    alu::bit_test_reg,    // 0F A3 BT r/m, r
    alu::shift_double,    // 0F A4 SHLD r/m, r, imm8
    alu::shift_double,    // 0F A5 SHLD r/m, r, CL
    invalid,              // 0F A6
    invalid,              // 0F A7
    transfer::push_fs_gs, // 0F A8 PUSH GS
    transfer::pop_fs_gs,  // 0F A9 POP GS
    invalid,              // 0F AA RSM
    alu::bit_test_reg,    // 0F AB BTS r/m, r
    alu::shift_double,    // 0F AC SHRD r/m, r, imm8
    alu::shift_double,    // 0F AD SHRD r/m, r, CL
    system::group_0fae,   // 0F AE group 15 FXSAVE/FXRSTOR/LDMXCSR/fences
    alu::imul_r_rm,       // 0F AF IMUL r, r/m
    alu::cmpxchg,         // 0F B0 CMPXCHG r/m8, r8
    alu::cmpxchg,         // 0F B1 CMPXCHG r/m, r
    transfer::lss,        // 0F B2 LSS
    alu::bit_test_reg,    // 0F B3 BTR r/m, r
    transfer::lfs,        // 0F B4 LFS
    transfer::lgs,        // 0F B5 LGS
    alu::movzx,           // 0F B6 MOVZX r, r/m8
    alu::movzx,           // 0F B7 MOVZX r, r/m16
    invalid,              // 0F B8 POPCNT (not modeled)
    invalid,              // 0F B9 UD1
    alu::group_bt_imm,    // 0F BA group 8 BT/BTS/BTR/BTC imm8
    alu::bit_test_reg,    // 0F BB BTC r/m, r
    alu::bit_scan,        // 0F BC BSF
    alu::bit_scan,        // 0F BD BSR
    alu::movsx,           // 0F BE MOVSX r, r/m8
    alu::movsx,           // 0F BF MOVSX r, r/m16
    alu::xadd,            // 0F C0 XADD r/m8, r8
    alu::xadd,            // 0F C1 XADD r/m, r
    invalid,              // 0F C2
    invalid,              // 0F C3
    invalid,              // 0F C4
    invalid,              // 0F C5
    invalid,              // 0F C6
    alu::group_c7,        // 0F C7 group 9 CMPXCHG8B
    alu::bswap,           // 0F C8 BSWAP rAX
    alu::bswap,           // 0F C9 BSWAP rCX
    alu::bswap,           // 0F CA BSWAP rDX
    alu::bswap,           // 0F CB BSWAP rBX
    alu::bswap,           // 0F CC BSWAP rSP
    alu::bswap,           // 0F CD BSWAP rBP
    alu::bswap,           // 0F CE BSWAP rSI
    alu::bswap,           // 0F CF BSWAP rDI
    invalid,              // 0F D0
    invalid,              // 0F D1
    invalid,              // 0F D2
    invalid,              // 0F D3
    invalid,              // 0F D4
    invalid,              // 0F D5
    invalid,              // 0F D6
    invalid,              // 0F D7
    invalid,              // 0F D8
    invalid,              // 0F D9
    invalid,              // 0F DA
    invalid,              // 0F DB
    invalid,              // 0F DC
    invalid,              // 0F DD
    invalid,              // 0F DE
    invalid,              // 0F DF
    invalid,              // 0F E0
    invalid,              // 0F E1
    invalid,              // 0F E2
    invalid,              // 0F E3
    invalid,              // 0F E4
    invalid,              // 0F E5
    invalid,              // 0F E6
    invalid,              // 0F E7
    invalid,              // 0F E8
    invalid,              // 0F E9
    invalid,              // 0F EA
    invalid,              // 0F EB
    invalid,              // 0F EC
    invalid,              // 0F ED
    invalid,              // 0F EE
    invalid,              // 0F EF
    invalid,              // 0F F0
    invalid,              // 0F F1
    invalid,              // 0F F2
    invalid,              // 0F F3
    invalid,              // 0F F4
    invalid,              // 0F F5
    invalid,              // 0F F6
    invalid,              // 0F F7
    invalid,              // 0F F8
    invalid,              // 0F F9
    invalid,              // 0F FA
    invalid,              // 0F FB
    invalid,              // 0F FC
    invalid,              // 0F FD
    invalid,              // 0F FE
    invalid,              // 0F FF
];

// A coarse name for the debugger's next-instruction line. Skims prefixes the
// way the decoder would, then labels the opcode.
pub fn mnemonic(bytes: &[u8]) -> &'static str {
    let mut iter = bytes.iter().copied();
    let mut byte = match iter.next() {
        Some(byte) => byte,
        None => return "?",
    };
    for _ in 0..bytes.len() {
        match byte {
            0xf0 | 0xf2 | 0xf3 | 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 => {
                byte = match iter.next() {
                    Some(byte) => byte,
                    None => return "?",
                };
            }
            _ => break,
        }
    }
    if byte == 0x0f {
        return match iter.next() {
            Some(0x00) => "group6",
            Some(0x01) => "group7",
            Some(0x06) => "clts",
            Some(0x20..=0x23) => "mov cr/dr",
            Some(0x30) => "wrmsr",
            Some(0x31) => "rdtsc",
            Some(0x32) => "rdmsr",
            Some(0x34) => "sysenter",
            Some(0x35) => "sysexit",
            Some(0x40..=0x4f) => "cmovcc",
            Some(0x80..=0x8f) => "jcc",
            Some(0x90..=0x9f) => "setcc",
            Some(0xa2) => "cpuid",
            Some(0xaf) => "imul",
            Some(0xb6) | Some(0xb7) => "movzx",
            Some(0xbe) | Some(0xbf) => "movsx",
            Some(0xbc) | Some(0xbd) => "bsf/bsr",
            Some(0xc8..=0xcf) => "bswap",
            _ => "0f ..",
        };
    }
    match byte {
        0x00..=0x05 => "add",
        0x08..=0x0d => "or",
        0x10..=0x15 => "adc",
        0x18..=0x1d => "sbb",
        0x20..=0x25 => "and",
        0x28..=0x2d => "sub",
        0x30..=0x35 => "xor",
        0x38..=0x3d => "cmp",
        0x06 | 0x0e | 0x16 | 0x1e => "push sreg",
        0x07 | 0x17 | 0x1f => "pop sreg",
        0x27 => "daa",
        0x2f => "das",
        0x37 => "aaa",
        0x3f => "aas",
        0x40..=0x47 => "inc",
        0x48..=0x4f => "dec",
        0x50..=0x57 => "push",
        0x58..=0x5f => "pop",
        0x60 => "pusha",
        0x61 => "popa",
        0x62 => "bound",
        0x63 => "arpl",
        0x68 | 0x6a => "push",
        0x69 | 0x6b => "imul",
        0x6c..=0x6f => "ins/outs",
        0x70..=0x7f => "jcc",
        0x80..=0x83 => "group1",
        0x84 | 0x85 => "test",
        0x86 | 0x87 => "xchg",
        0x88..=0x8b => "mov",
        0x8c | 0x8e => "mov sreg",
        0x8d => "lea",
        0x8f => "pop",
        0x90 => "nop",
        0x91..=0x97 => "xchg",
        0x98 => "cbw",
        0x99 => "cwd",
        0x9a => "call far",
        0x9c => "pushf",
        0x9d => "popf",
        0x9e => "sahf",
        0x9f => "lahf",
        0xa0..=0xa3 => "mov moffs",
        0xa4 | 0xa5 => "movs",
        0xa6 | 0xa7 => "cmps",
        0xa8 | 0xa9 => "test",
        0xaa | 0xab => "stos",
        0xac | 0xad => "lods",
        0xae | 0xaf => "scas",
        0xb0..=0xbf => "mov imm",
        0xc0 | 0xc1 | 0xd0..=0xd3 => "shift",
        0xc2 | 0xc3 => "ret",
        0xc4 => "les",
        0xc5 => "lds",
        0xc6 | 0xc7 => "mov imm",
        0xc8 => "enter",
        0xc9 => "leave",
        0xca | 0xcb => "retf",
        0xcc | 0xcd => "int",
        0xce => "into",
        0xcf => "iret",
        0xd4 => "aam",
        0xd5 => "aad",
        0xd6 => "salc",
        0xd7 => "xlat",
        0xd8..=0xdf => "x87",
        0xe0..=0xe2 => "loop",
        0xe3 => "jcxz",
        0xe4..=0xe7 | 0xec..=0xef => "in/out",
        0xe8 => "call",
        0xe9 | 0xeb => "jmp",
        0xea => "jmp far",
        0xf4 => "hlt",
        0xf5 => "cmc",
        0xf6 | 0xf7 => "group3",
        0xf8 => "clc",
        0xf9 => "stc",
        0xfa => "cli",
        0xfb => "sti",
        0xfc => "cld",
        0xfd => "std",
        0xfe => "group4",
        0xff => "group5",
        _ => "db",
    }
}
