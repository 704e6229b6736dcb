// The single error channel of the execution engine. Architectural faults are
// re-delivered through the interrupt dispatcher; the remaining variants abort
// the run with a diagnostic instead of being vectored.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("#DE divide error")]
    Divide,
    #[error("#UD invalid opcode {opcode:#04x} (two-byte: {two_byte})")]
    InvalidOpcode { opcode: u8, two_byte: bool },
    #[error("#BR bound range exceeded")]
    BoundRange,
    #[error("#NM device not available")]
    DeviceNotAvailable,
    #[error("#DF double fault")]
    DoubleFault,
    #[error("#TS invalid TSS, selector {0:#06x}")]
    InvalidTss(u16),
    #[error("#NP segment not present, selector {0:#06x}")]
    NotPresent(u16),
    #[error("#SS stack fault, selector {0:#06x}")]
    StackFault(u16),
    #[error("#GP general protection, error code {0:#x}")]
    GeneralProtection(u32),
    #[error("#PF page fault at linear {addr:#x}, code {code:#07b}")]
    PageFault { addr: u64, code: u32 },
    // An indirect CALL/JMP that resolved to linear address 0. Boot code that
    // lands here has chased a bad function pointer; the harness wants an
    // immediate abort with the location, not a #GP loop.
    #[error("indirect transfer through null pointer from {cs:#06x}:{ip:#x}")]
    NullTransfer { cs: u16, ip: u64 },
    #[error("interrupt delivery nested more than {0} levels deep")]
    InterruptOverflow(u32),
}

impl Fault {
    // Exception vector for the architectural faults; None for engine aborts.
    pub fn vector(&self) -> Option<u8> {
        match *self {
            Self::Divide => Some(0),
            Self::InvalidOpcode { .. } => Some(6),
            Self::BoundRange => Some(5),
            Self::DeviceNotAvailable => Some(7),
            Self::DoubleFault => Some(8),
            Self::InvalidTss(_) => Some(10),
            Self::NotPresent(_) => Some(11),
            Self::StackFault(_) => Some(12),
            Self::GeneralProtection(_) => Some(13),
            Self::PageFault { .. } => Some(14),
            Self::NullTransfer { .. } | Self::InterruptOverflow(_) => None,
        }
    }
    // The error code pushed by the faults that have one.
    pub fn error_code(&self) -> Option<u32> {
        match *self {
            Self::DoubleFault => Some(0),
            Self::InvalidTss(sel) | Self::NotPresent(sel) | Self::StackFault(sel) => {
                Some(sel as u32)
            }
            Self::GeneralProtection(code) => Some(code),
            Self::PageFault { code, .. } => Some(code),
            _ => None,
        }
    }
    pub fn is_abort(&self) -> bool {
        self.vector().is_none()
    }
}
