//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.1 Operations that Invalidate Cached Mappings
//!
//! The INVEPT instruction invalidates entries in the translation lookaside buffer (TLB) and other processor structures
//! that cache translations derived from EPT. Hooks are only considered installed or removed once every processor has
//! executed it.

/// Represents the types of INVEPT operations.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InveptType {
    /// Invalidate mappings associated with a single EPTP value.
    SingleContext = 1,

    /// Invalidate mappings associated with all EPTP values.
    AllContexts = 2,
}

/// Memory type of the EPT paging structures: write-back.
const EPT_MEMORY_TYPE_WB: u64 = 6;

/// Page-walk length minus one, for a 4-level walk.
const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;

/// Builds an EPT pointer for a PML4 at `pml4_pa`.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
/// - Table 25-9. Format of Extended-Page-Table Pointer
pub fn eptp_from_pml4(pml4_pa: u64) -> u64 {
    (pml4_pa & !0xFFF) | EPT_PAGE_WALK_LENGTH_4 | EPT_MEMORY_TYPE_WB
}

/// Executes the INVEPT instruction.
///
/// # Arguments
/// * `invept_type` - The type of INVEPT operation to perform.
/// * `eptp` - The EPT pointer used for Single Context INVEPT. Ignored for All Contexts.
#[cfg(windows)]
pub fn invept(invept_type: InveptType, eptp: u64) {
    // The INVEPT descriptor is a 128-bit value: the EPTP followed by 64 reserved bits.
    let descriptor: [u64; 2] = [eptp, 0];

    unsafe {
        core::arch::asm!(
            "invept {0}, [{1}]",
            in(reg) invept_type as u64,
            in(reg) &descriptor,
            options(nostack)
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eptp_layout() {
        assert_eq!(eptp_from_pml4(0x1234_5000), 0x1234_5000 | 0x18 | 6);
        assert_eq!(eptp_from_pml4(0x1234_5FFF) & !0xFFF, 0x1234_5000);
    }
}
