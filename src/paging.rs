// Linear-to-physical translation. No TLB: every access walks the page
// tables, which keeps A/D bookkeeping trivially coherent. Three walk shapes
// share the entry checks: classic 32-bit (2 levels, 4 MiB large pages), PAE
// (3 levels, 2 MiB) and 4-level long mode (1 GiB / 2 MiB / 4 KiB).

use crate::error::Fault;
use crate::fields::Width;
use crate::memory::Bus;
use crate::registers::{Cr0, Cr4, Registers};
use bitflags::bitflags;

bitflags! {
    pub struct Pte: u64 {
        const PRESENT = 1;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
    }
}

// Physical address bits of a 64-bit entry (52-bit address space).
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

// #PF error code: {P, W, U, RSVD, I}.
fn fault_code(access: Access, user: bool, present: bool) -> u32 {
    present as u32
        | ((access == Access::Write) as u32) << 1
        | (user as u32) << 2
        | ((access == Access::Execute) as u32) << 4
}

struct Walker<'a> {
    bus: &'a mut Bus,
    linear: u64,
    access: Access,
    user: bool,
    write_protect: bool,
    // permission accumulators across levels
    writable: bool,
    user_ok: bool,
}

impl<'a> Walker<'a> {
    fn page_fault(&self, present: bool) -> Fault {
        Fault::PageFault { addr: self.linear, code: fault_code(self.access, self.user, present) }
    }
    // Load one table entry, check it, fold its permissions in, and mark it
    // accessed (and dirty when it maps the final page of a write).
    fn entry(&mut self, addr: u64, width: Width, terminal: bool) -> Result<u64, Fault> {
        let mut entry = self.bus.read_phys(addr, width);
        let flags = Pte::from_bits_truncate(entry);
        if !flags.contains(Pte::PRESENT) {
            return Err(self.page_fault(false));
        }
        self.writable &= flags.contains(Pte::WRITE);
        self.user_ok &= flags.contains(Pte::USER);
        if terminal {
            if self.user && !self.user_ok {
                return Err(self.page_fault(true));
            }
            if self.access == Access::Write && !self.writable && (self.user || self.write_protect)
            {
                return Err(self.page_fault(true));
            }
        }
        entry |= Pte::ACCESSED.bits();
        if terminal && self.access == Access::Write {
            entry |= Pte::DIRTY.bits();
        }
        self.bus.write_phys(addr, width, entry);
        Ok(entry)
    }
}

pub fn translate(
    bus: &mut Bus,
    regs: &Registers,
    linear: u64,
    access: Access,
    user: bool,
) -> Result<u64, Fault> {
    if !regs.cr0.contains(Cr0::PG) {
        return Ok(linear);
    }
    let mut walker = Walker {
        bus,
        linear,
        access,
        user,
        write_protect: regs.cr0.contains(Cr0::WP),
        writable: true,
        user_ok: true,
    };
    if regs.efer.contains(crate::registers::Efer::LMA) {
        walk_long(&mut walker, regs.cr3)
    } else if regs.cr4.contains(Cr4::PAE) {
        walk_pae(&mut walker, regs.cr3)
    } else {
        walk_legacy(&mut walker, regs.cr3, regs.cr4.contains(Cr4::PSE))
    }
}

fn walk_legacy(walker: &mut Walker, cr3: u64, pse: bool) -> Result<u64, Fault> {
    let linear = walker.linear;
    let pde_addr = (cr3 & 0xffff_f000) + (linear >> 22 & 0x3ff) * 4;
    let pde = walker.entry(pde_addr, Width::Long, false)?;
    if pse && pde & Pte::PAGE_SIZE.bits() != 0 {
        // re-check permissions now that this level is terminal
        walker.entry(pde_addr, Width::Long, true)?;
        return Ok((pde & 0xffc0_0000) | (linear & 0x3f_ffff));
    }
    let pte_addr = (pde & 0xffff_f000) + (linear >> 12 & 0x3ff) * 4;
    let pte = walker.entry(pte_addr, Width::Long, true)?;
    Ok((pte & 0xffff_f000) | (linear & 0xfff))
}

fn walk_pae(walker: &mut Walker, cr3: u64) -> Result<u64, Fault> {
    let linear = walker.linear;
    // The PDPT is a 32-byte table of four 64-bit entries; its entries carry
    // no R/W or U/S bits, so only presence is meaningful here.
    let pdpte_addr = (cr3 & 0xffff_ffe0) + (linear >> 30 & 0x3) * 8;
    let pdpte = walker.bus.read_phys(pdpte_addr, Width::Quad);
    if pdpte & Pte::PRESENT.bits() == 0 {
        return Err(walker.page_fault(false));
    }
    let pde_addr = (pdpte & ENTRY_ADDR_MASK) + (linear >> 21 & 0x1ff) * 8;
    let pde = walker.entry(pde_addr, Width::Quad, false)?;
    if pde & Pte::PAGE_SIZE.bits() != 0 {
        walker.entry(pde_addr, Width::Quad, true)?;
        return Ok((pde & 0x000f_ffff_ffe0_0000) | (linear & 0x1f_ffff));
    }
    let pte_addr = (pde & ENTRY_ADDR_MASK) + (linear >> 12 & 0x1ff) * 8;
    let pte = walker.entry(pte_addr, Width::Quad, true)?;
    Ok((pte & ENTRY_ADDR_MASK) | (linear & 0xfff))
}

fn walk_long(walker: &mut Walker, cr3: u64) -> Result<u64, Fault> {
    let linear = walker.linear;
    let pml4e_addr = (cr3 & ENTRY_ADDR_MASK) + (linear >> 39 & 0x1ff) * 8;
    let pml4e = walker.entry(pml4e_addr, Width::Quad, false)?;
    let pdpte_addr = (pml4e & ENTRY_ADDR_MASK) + (linear >> 30 & 0x1ff) * 8;
    let pdpte = walker.entry(pdpte_addr, Width::Quad, false)?;
    if pdpte & Pte::PAGE_SIZE.bits() != 0 {
        walker.entry(pdpte_addr, Width::Quad, true)?;
        return Ok((pdpte & 0x000f_ffff_c000_0000) | (linear & 0x3fff_ffff));
    }
    let pde_addr = (pdpte & ENTRY_ADDR_MASK) + (linear >> 21 & 0x1ff) * 8;
    let pde = walker.entry(pde_addr, Width::Quad, false)?;
    if pde & Pte::PAGE_SIZE.bits() != 0 {
        walker.entry(pde_addr, Width::Quad, true)?;
        return Ok((pde & 0x000f_ffff_ffe0_0000) | (linear & 0x1f_ffff));
    }
    let pte_addr = (pde & ENTRY_ADDR_MASK) + (linear >> 12 & 0x1ff) * 8;
    let pte = walker.entry(pte_addr, Width::Quad, true)?;
    Ok((pte & ENTRY_ADDR_MASK) | (linear & 0xfff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Efer;

    fn paged_regs() -> Registers {
        let mut regs = Registers::new();
        regs.cr0 |= Cr0::PE | Cr0::PG;
        regs.cr3 = 0x1000;
        regs
    }

    #[test]
    fn identity_when_paging_disabled() {
        let mut bus = Bus::new();
        let regs = Registers::new();
        assert_eq!(translate(&mut bus, &regs, 0xdead_beef, Access::Read, false), Ok(0xdead_beef));
    }

    #[test]
    fn legacy_4k_walk_sets_accessed_and_dirty() {
        let mut bus = Bus::new();
        let regs = paged_regs();
        // PD at 0x1000, PT at 0x2000, page frame 0x5000 mapping linear 0x400000
        bus.write_phys(0x1000 + 1 * 4, Width::Long, 0x2000 | 0x3);
        bus.write_phys(0x2000, Width::Long, 0x5000 | 0x3);
        let phys = translate(&mut bus, &regs, 0x40_0123, Access::Write, false).unwrap();
        assert_eq!(phys, 0x5123);
        assert_eq!(bus.read_phys(0x1004, Width::Long) & 0x20, 0x20);
        assert_eq!(bus.read_phys(0x2000, Width::Long) & 0x60, 0x60);
    }

    #[test]
    fn legacy_4m_page() {
        let mut bus = Bus::new();
        let mut regs = paged_regs();
        regs.cr4 |= Cr4::PSE;
        bus.write_phys(0x1000, Width::Long, 0x0040_0000 | 0x83);
        let phys = translate(&mut bus, &regs, 0x0012_3456, Access::Read, false).unwrap();
        assert_eq!(phys, 0x0052_3456);
    }

    #[test]
    fn not_present_faults_with_code() {
        let mut bus = Bus::new();
        let regs = paged_regs();
        match translate(&mut bus, &regs, 0x8000_0000, Access::Write, true) {
            Err(Fault::PageFault { addr, code }) => {
                assert_eq!(addr, 0x8000_0000);
                assert_eq!(code, 0b110); // user write, not present
            }
            other => panic!("expected #PF, got {:?}", other),
        }
    }

    #[test]
    fn user_cannot_touch_supervisor_page() {
        let mut bus = Bus::new();
        let regs = paged_regs();
        // supervisor-only mapping
        bus.write_phys(0x1000, Width::Long, 0x2000 | 0x3);
        bus.write_phys(0x2000, Width::Long, 0x5000 | 0x3);
        match translate(&mut bus, &regs, 0x123, Access::Read, true) {
            Err(Fault::PageFault { code, .. }) => assert_eq!(code, 0b101),
            other => panic!("expected #PF, got {:?}", other),
        }
    }

    #[test]
    fn supervisor_write_honors_wp() {
        let mut bus = Bus::new();
        let mut regs = paged_regs();
        // read-only user page
        bus.write_phys(0x1000, Width::Long, 0x2000 | 0x7);
        bus.write_phys(0x2000, Width::Long, 0x5000 | 0x5);
        assert!(translate(&mut bus, &regs, 0x123, Access::Write, false).is_ok());
        regs.cr0 |= Cr0::WP;
        assert!(translate(&mut bus, &regs, 0x123, Access::Write, false).is_err());
    }

    #[test]
    fn long_mode_walk() {
        let mut bus = Bus::new();
        let mut regs = paged_regs();
        regs.cr4 |= Cr4::PAE;
        regs.efer |= Efer::LME | Efer::LMA;
        // PML4 @1000 -> PDPT @2000 -> PD @3000 -> PT @4000 -> frame 0x7000
        bus.write_phys(0x1000, Width::Quad, 0x2000 | 0x3);
        bus.write_phys(0x2000, Width::Quad, 0x3000 | 0x3);
        bus.write_phys(0x3000, Width::Quad, 0x4000 | 0x3);
        bus.write_phys(0x4000 + 8, Width::Quad, 0x7000 | 0x3);
        let phys = translate(&mut bus, &regs, 0x1abc, Access::Read, false).unwrap();
        assert_eq!(phys, 0x7abc);
    }

    #[test]
    fn pae_2m_page() {
        let mut bus = Bus::new();
        let mut regs = paged_regs();
        regs.cr4 |= Cr4::PAE;
        // PDPT @1000 entry 0 -> PD @2000; PDE 1 maps 2M at 0x0060_0000
        bus.write_phys(0x1000, Width::Quad, 0x2000 | 0x1);
        bus.write_phys(0x2000 + 8, Width::Quad, 0x0060_0000 | 0x83);
        let phys = translate(&mut bus, &regs, 0x0020_1234, Access::Read, false).unwrap();
        assert_eq!(phys, 0x0060_1234);
    }
}
