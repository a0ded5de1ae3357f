//! The interrupt descriptor table used while the processor is in VMX root.
//!
//! VM exits load the host IDTR, so every exception a VM-exit handler raises arrives here rather
//! than at the operating system. A fault on one of the probing instructions in this module is
//! recovered: execution resumes after the instruction and the probe reports the vector. Any other
//! exception is fatal. An NMI is held back by opening the NMI window, so the guest gets it (or the
//! exit it was meant to force happens) right after the next VM entry.

use alloc::{boxed::Box, vec::Vec};

/// Set in a probe's status when the probed instruction faulted. The low byte holds the vector.
pub const HOST_FAULT: u64 = 1 << 63;

const NMI_VECTOR: u64 = 2;

/// 64-bit interrupt gate, present, DPL 0.
const INTERRUPT_GATE: u64 = 0x8E;

/// Saved by the common entry stub, lowest address first.
#[repr(C)]
#[derive(Debug, Default)]
pub struct InterruptFrame {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A faulting instruction and the address execution continues at.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Fixup {
    pub site: u64,
    pub resume: u64,
}

/// Encodes a 16-byte interrupt gate.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 6.14.1 64-Bit Mode IDT
/// - Figure 6-8. 64-Bit IDT Gate Descriptors
pub fn gate_descriptor(handler: u64, selector: u16) -> [u64; 2] {
    let low = (handler & 0xFFFF) | (u64::from(selector) << 16) | (INTERRUPT_GATE << 40) | ((handler >> 16) & 0xFFFF) << 48;
    [low, handler >> 32]
}

/// Redirects a faulting probe to its resume address.
///
/// # Returns
///
/// `true` if `frame.rip` was a probe site, in which case RIP and RAX of the frame were updated.
pub fn recover(frame: &mut InterruptFrame, fixups: &[Fixup]) -> bool {
    let Some(fixup) = fixups.iter().find(|fixup| fixup.site == frame.rip) else {
        return false;
    };

    frame.rip = fixup.resume;
    frame.rax = HOST_FAULT | (frame.vector & 0xFF);
    true
}

/// The 256 gates of the host IDT.
#[repr(C, align(16))]
pub struct HostIdt {
    entries: [[u64; 2]; 256],
}

impl HostIdt {
    /// Points the first 32 vectors at `exception_handlers` and every other vector at
    /// `default_handler`.
    ///
    /// # Arguments
    ///
    /// * `exception_handlers` - Entry points of the architectural exception vectors.
    /// * `default_handler` - Entry point for vectors 32 to 255.
    /// * `selector` - The host code segment selector.
    pub fn new(exception_handlers: &[u64], default_handler: u64, selector: u16) -> Box<Self> {
        let entries = (0..256)
            .map(|vector| gate_descriptor(exception_handlers.get(vector).copied().unwrap_or(default_handler), selector))
            .collect::<Vec<_>>();

        let mut idt = Box::new(Self { entries: [[0; 2]; 256] });
        idt.entries.copy_from_slice(&entries);
        idt
    }

    /// The IDTR value describing this table.
    pub fn register(&self) -> crate::intel::descriptor::TableRegister {
        crate::intel::descriptor::TableRegister {
            base: self.entries.as_ptr() as u64,
            limit: (core::mem::size_of::<[[u64; 2]; 256]>() - 1) as u16,
        }
    }
}

#[cfg(windows)]
pub use native::*;

#[cfg(windows)]
mod native {
    use {super::*, x86::vmx::vmcs};

    extern "C" {
        static host_isr_table: [u64; 32];
        static host_fault_fixups: [Fixup; 4];
        fn host_isr_default();

        /// Reads an MSR into `value`. Returns 0 or a [`HOST_FAULT`] status.
        pub fn probe_rdmsr(msr: u32, value: *mut u64) -> u64;
        pub fn probe_wrmsr(msr: u32, value: u64) -> u64;
        pub fn probe_rdpmc(counter: u32, value: *mut u64) -> u64;
        /// Copies `len` bytes from `source` to `destination`.
        pub fn probe_copy(destination: *mut u8, source: *const u8, len: usize) -> u64;
    }

    /// Builds the host IDT for the code segment `selector`.
    pub fn build(selector: u16) -> Box<HostIdt> {
        let handlers = unsafe { host_isr_table };
        HostIdt::new(&handlers, host_isr_default as usize as u64, selector)
    }

    #[no_mangle]
    extern "C" fn host_exception_handler(frame: &mut InterruptFrame) {
        if frame.vector == NMI_VECTOR {
            let primary = crate::intel::support::vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
            crate::intel::support::vmwrite(
                vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
                primary | u64::from(vmcs::control::PrimaryControls::NMI_WINDOW_EXITING.bits()),
            );
            return;
        }

        if frame.vector >= 32 {
            return;
        }

        let fixups = unsafe { &host_fault_fixups };
        if recover(frame, fixups) {
            return;
        }

        log::error!(
            "Unrecoverable host exception {} (error code {:#x}) at {:#x}, rsp {:#x}",
            frame.vector,
            frame.error_code,
            frame.rip,
            frame.rsp
        );

        loop {
            unsafe { x86::halt() };
        }
    }

    core::arch::global_asm!(
        r#"
.macro HOST_ISR_NOERR vector
host_isr_\vector:
    push 0
    push \vector
    jmp host_isr_common
.endm

.macro HOST_ISR_ERR vector
host_isr_\vector:
    push \vector
    jmp host_isr_common
.endm

HOST_ISR_NOERR 0
HOST_ISR_NOERR 1
HOST_ISR_NOERR 2
HOST_ISR_NOERR 3
HOST_ISR_NOERR 4
HOST_ISR_NOERR 5
HOST_ISR_NOERR 6
HOST_ISR_NOERR 7
HOST_ISR_ERR 8
HOST_ISR_NOERR 9
HOST_ISR_ERR 10
HOST_ISR_ERR 11
HOST_ISR_ERR 12
HOST_ISR_ERR 13
HOST_ISR_ERR 14
HOST_ISR_NOERR 15
HOST_ISR_NOERR 16
HOST_ISR_ERR 17
HOST_ISR_NOERR 18
HOST_ISR_NOERR 19
HOST_ISR_NOERR 20
HOST_ISR_ERR 21
HOST_ISR_NOERR 22
HOST_ISR_NOERR 23
HOST_ISR_NOERR 24
HOST_ISR_NOERR 25
HOST_ISR_NOERR 26
HOST_ISR_NOERR 27
HOST_ISR_NOERR 28
HOST_ISR_ERR 29
HOST_ISR_ERR 30
HOST_ISR_NOERR 31

.global host_isr_default
host_isr_default:
    push 0
    push 0xFF
    jmp host_isr_common

host_isr_common:
    push r11
    push r10
    push r9
    push r8
    push rdx
    push rcx
    push rax
    mov rcx, rsp

    push rbp
    mov rbp, rsp
    and rsp, -16
    sub rsp, 0x60
    movdqa [rsp + 0x00], xmm0
    movdqa [rsp + 0x10], xmm1
    movdqa [rsp + 0x20], xmm2
    movdqa [rsp + 0x30], xmm3
    movdqa [rsp + 0x40], xmm4
    movdqa [rsp + 0x50], xmm5
    sub rsp, 0x20
    call host_exception_handler
    add rsp, 0x20
    movdqa xmm0, [rsp + 0x00]
    movdqa xmm1, [rsp + 0x10]
    movdqa xmm2, [rsp + 0x20]
    movdqa xmm3, [rsp + 0x30]
    movdqa xmm4, [rsp + 0x40]
    movdqa xmm5, [rsp + 0x50]
    mov rsp, rbp
    pop rbp

    pop rax
    pop rcx
    pop rdx
    pop r8
    pop r9
    pop r10
    pop r11
    add rsp, 0x10
    iretq

.global probe_rdmsr
probe_rdmsr:
    mov r8, rdx
probe_rdmsr_site:
    rdmsr
    shl rdx, 32
    or rax, rdx
    mov [r8], rax
    xor eax, eax
probe_rdmsr_resume:
    ret

.global probe_wrmsr
probe_wrmsr:
    mov rax, rdx
    shr rdx, 32
probe_wrmsr_site:
    wrmsr
    xor eax, eax
probe_wrmsr_resume:
    ret

.global probe_rdpmc
probe_rdpmc:
    mov r8, rdx
probe_rdpmc_site:
    rdpmc
    shl rdx, 32
    or rax, rdx
    mov [r8], rax
    xor eax, eax
probe_rdpmc_resume:
    ret

.global probe_copy
probe_copy:
    push rsi
    push rdi
    mov rdi, rcx
    mov rsi, rdx
    mov rcx, r8
probe_copy_site:
    rep movsb
    xor eax, eax
probe_copy_resume:
    pop rdi
    pop rsi
    ret

.section .rdata,"dr"
.balign 8
.global host_isr_table
host_isr_table:
    .quad host_isr_0, host_isr_1, host_isr_2, host_isr_3, host_isr_4, host_isr_5, host_isr_6, host_isr_7
    .quad host_isr_8, host_isr_9, host_isr_10, host_isr_11, host_isr_12, host_isr_13, host_isr_14, host_isr_15
    .quad host_isr_16, host_isr_17, host_isr_18, host_isr_19, host_isr_20, host_isr_21, host_isr_22, host_isr_23
    .quad host_isr_24, host_isr_25, host_isr_26, host_isr_27, host_isr_28, host_isr_29, host_isr_30, host_isr_31

.global host_fault_fixups
host_fault_fixups:
    .quad probe_rdmsr_site, probe_rdmsr_resume
    .quad probe_wrmsr_site, probe_wrmsr_resume
    .quad probe_rdpmc_site, probe_rdpmc_resume
    .quad probe_copy_site, probe_copy_resume
.text
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_descriptor_layout() {
        let gate = gate_descriptor(0xFFFF_F800_1234_5678, 0x10);

        assert_eq!(gate[0], 0x1234_8E00_0010_5678);
        assert_eq!(gate[1], 0xFFFF_F800);
    }

    #[test]
    fn test_fault_on_probe_site_resumes() {
        let fixups = [Fixup { site: 0x1000, resume: 0x1010 }];
        let mut frame = InterruptFrame { vector: 13, rip: 0x1000, ..Default::default() };

        assert!(recover(&mut frame, &fixups));
        assert_eq!(frame.rip, 0x1010);
        assert_eq!(frame.rax, HOST_FAULT | 13);

        let mut other = InterruptFrame { vector: 14, rip: 0x2000, ..Default::default() };
        assert!(!recover(&mut other, &fixups));
        assert_eq!(other.rip, 0x2000);
    }

    #[test]
    fn test_unlisted_vectors_use_default_handler() {
        let idt = HostIdt::new(&[0x1000, 0x2000], 0x9000, 0x10);

        assert_eq!(idt.entries[1], gate_descriptor(0x2000, 0x10));
        assert_eq!(idt.entries[40], gate_descriptor(0x9000, 0x10));
        assert_eq!(idt.register().limit, 0xFFF);
    }
}
