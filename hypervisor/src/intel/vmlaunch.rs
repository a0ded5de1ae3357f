//! VM entry, the VM-exit entry point and the return path out of VMX operation.
//!
//! `launch_vm` only returns when VMLAUNCH fails. Every VM exit lands in `vmexit_stub` on the
//! processor's host stack, saves the guest registers and calls [`vmexit_handler`]. A nonzero
//! return from the handler means VMX operation was turned off during the exit: the stub then
//! restores the guest registers, switches to the guest stack and returns to the guest RIP as
//! ordinary code.

use {
    crate::{
        error::HypervisorError,
        intel::{
            descriptor::{DescriptorTables, TableRegister},
            registers::GuestRegisters,
            vmexit::handle_vmexit,
            vmx::leave_vmx_operation,
        },
        platform::{native, Platform},
    },
    x86::{
        msr,
        vmx::vmcs::{guest, ro},
    },
};

extern "C" {
    /// Loads the guest registers and executes VMLAUNCH with HOST_RSP at `host_rsp - 16`.
    ///
    /// Returns only if VMLAUNCH fails.
    ///
    /// # Arguments
    ///
    /// * `registers` - The registers the guest starts with. Must outlive VMX operation.
    /// * `host_rsp` - 16-byte aligned top of the host stack.
    fn launch_vm(registers: *mut GuestRegisters, host_rsp: u64) -> u64;

    /// The VM-exit entry point written to HOST_RIP.
    pub fn vmexit_stub();
}

/// Launches the guest on the current processor.
///
/// On success execution continues in the guest at the RIP in the VMCS and this function never
/// returns.
pub fn launch(registers: &mut GuestRegisters, host_rsp: u64) -> HypervisorError {
    unsafe { launch_vm(registers, host_rsp) };
    HypervisorError::VmlaunchFailed
}

core::arch::global_asm!(
    r#"
.set registers_rax, 0x0
.set registers_rbx, 0x8
.set registers_rcx, 0x10
.set registers_rdx, 0x18
.set registers_rdi, 0x20
.set registers_rsi, 0x28
.set registers_rbp, 0x30
.set registers_r8,  0x38
.set registers_r9,  0x40
.set registers_r10, 0x48
.set registers_r11, 0x50
.set registers_r12, 0x58
.set registers_r13, 0x60
.set registers_r14, 0x68
.set registers_r15, 0x70
.set registers_rip, 0x78
.set registers_rsp, 0x80
.set registers_rflags, 0x88
.set registers_xmm0, 0x90
.set registers_xmm1, 0xA0
.set registers_xmm2, 0xB0
.set registers_xmm3, 0xC0
.set registers_xmm4, 0xD0
.set registers_xmm5, 0xE0
.set registers_xmm6, 0xF0
.set registers_xmm7, 0x100
.set registers_xmm8, 0x110
.set registers_xmm9, 0x120
.set registers_xmm10, 0x130
.set registers_xmm11, 0x140
.set registers_xmm12, 0x150
.set registers_xmm13, 0x160
.set registers_xmm14, 0x170
.set registers_xmm15, 0x180

.macro LOAD_GUEST_XMM
    movdqa  xmm0, [r15 + registers_xmm0]
    movdqa  xmm1, [r15 + registers_xmm1]
    movdqa  xmm2, [r15 + registers_xmm2]
    movdqa  xmm3, [r15 + registers_xmm3]
    movdqa  xmm4, [r15 + registers_xmm4]
    movdqa  xmm5, [r15 + registers_xmm5]
    movdqa  xmm6, [r15 + registers_xmm6]
    movdqa  xmm7, [r15 + registers_xmm7]
    movdqa  xmm8, [r15 + registers_xmm8]
    movdqa  xmm9, [r15 + registers_xmm9]
    movdqa  xmm10, [r15 + registers_xmm10]
    movdqa  xmm11, [r15 + registers_xmm11]
    movdqa  xmm12, [r15 + registers_xmm12]
    movdqa  xmm13, [r15 + registers_xmm13]
    movdqa  xmm14, [r15 + registers_xmm14]
    movdqa  xmm15, [r15 + registers_xmm15]
.endm

.macro LOAD_GUEST_GPRS
    mov     rax, [r15 + registers_rax]
    mov     rbx, [r15 + registers_rbx]
    mov     rcx, [r15 + registers_rcx]
    mov     rdx, [r15 + registers_rdx]
    mov     rdi, [r15 + registers_rdi]
    mov     rsi, [r15 + registers_rsi]
    mov     rbp, [r15 + registers_rbp]
    mov      r8, [r15 + registers_r8]
    mov      r9, [r15 + registers_r9]
    mov     r10, [r15 + registers_r10]
    mov     r11, [r15 + registers_r11]
    mov     r12, [r15 + registers_r12]
    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
.endm

.global launch_vm
launch_vm:
    // Preserve the caller's non-volatile registers for the failure path.
    push    rbx
    push    rbp
    push    rdi
    push    rsi
    push    r12
    push    r13
    push    r14
    push    r15
    sub     rsp, 0xA8
    movdqa  [rsp + 0x00], xmm6
    movdqa  [rsp + 0x10], xmm7
    movdqa  [rsp + 0x20], xmm8
    movdqa  [rsp + 0x30], xmm9
    movdqa  [rsp + 0x40], xmm10
    movdqa  [rsp + 0x50], xmm11
    movdqa  [rsp + 0x60], xmm12
    movdqa  [rsp + 0x70], xmm13
    movdqa  [rsp + 0x80], xmm14
    movdqa  [rsp + 0x90], xmm15

    // Host stack: [top - 8] caller frame, [top - 16] guest registers pointer.
    mov     rax, rsp
    mov     rsp, rdx
    push    rax
    push    rcx

    mov     r14, 0x6C14 // VMCS_HOST_RSP
    vmwrite r14, rsp
    lea     r13, [rip + vmexit_stub]
    mov     r14, 0x6C16 // VMCS_HOST_RIP
    vmwrite r14, r13

    mov     r15, rcx
    LOAD_GUEST_XMM
    LOAD_GUEST_GPRS
    mov     r15, [r15 + registers_r15]

    vmlaunch

    // VMLAUNCH failed: return 1 on the caller's stack.
    mov     rsp, [rsp + 8]
    movdqa  xmm6, [rsp + 0x00]
    movdqa  xmm7, [rsp + 0x10]
    movdqa  xmm8, [rsp + 0x20]
    movdqa  xmm9, [rsp + 0x30]
    movdqa  xmm10, [rsp + 0x40]
    movdqa  xmm11, [rsp + 0x50]
    movdqa  xmm12, [rsp + 0x60]
    movdqa  xmm13, [rsp + 0x70]
    movdqa  xmm14, [rsp + 0x80]
    movdqa  xmm15, [rsp + 0x90]
    add     rsp, 0xA8
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rsi
    pop     rdi
    pop     rbp
    pop     rbx
    mov     eax, 1
    ret

.global vmexit_stub
vmexit_stub:
    xchg    r15, [rsp]

    mov     [r15 + registers_rax], rax
    mov     [r15 + registers_rbx], rbx
    mov     [r15 + registers_rcx], rcx
    mov     [r15 + registers_rdx], rdx
    mov     [r15 + registers_rsi], rsi
    mov     [r15 + registers_rdi], rdi
    mov     [r15 + registers_rbp], rbp
    mov     [r15 + registers_r8],  r8
    mov     [r15 + registers_r9],  r9
    mov     [r15 + registers_r10], r10
    mov     [r15 + registers_r11], r11
    mov     [r15 + registers_r12], r12
    mov     [r15 + registers_r13], r13
    mov     [r15 + registers_r14], r14

    movdqa  [r15 + registers_xmm0], xmm0
    movdqa  [r15 + registers_xmm1], xmm1
    movdqa  [r15 + registers_xmm2], xmm2
    movdqa  [r15 + registers_xmm3], xmm3
    movdqa  [r15 + registers_xmm4], xmm4
    movdqa  [r15 + registers_xmm5], xmm5
    movdqa  [r15 + registers_xmm6], xmm6
    movdqa  [r15 + registers_xmm7], xmm7
    movdqa  [r15 + registers_xmm8], xmm8
    movdqa  [r15 + registers_xmm9], xmm9
    movdqa  [r15 + registers_xmm10], xmm10
    movdqa  [r15 + registers_xmm11], xmm11
    movdqa  [r15 + registers_xmm12], xmm12
    movdqa  [r15 + registers_xmm13], xmm13
    movdqa  [r15 + registers_xmm14], xmm14
    movdqa  [r15 + registers_xmm15], xmm15

    // Put the guest's r15 in place and the registers pointer back on the stack.
    mov     rcx, r15
    mov     rax, [rsp]
    xchg    r15, [rsp]
    mov     [rcx + registers_r15], rax

    sub     rsp, 0x20
    call    vmexit_handler
    add     rsp, 0x20

    mov     r15, [rsp]
    test    rax, rax
    jnz     vmexit_leave_vmx

    LOAD_GUEST_XMM
    LOAD_GUEST_GPRS
    mov     r15, [r15 + registers_r15]

    vmresume
    call    vmresume_failed

vmexit_leave_vmx:
    LOAD_GUEST_XMM
    LOAD_GUEST_GPRS
    mov     rsp, [r15 + registers_rsp]
    push    qword ptr [r15 + registers_rip]
    push    qword ptr [r15 + registers_rflags]
    mov     r15, [r15 + registers_r15]
    popfq
    ret
"#
);

/// Handles one VM exit on the host stack.
///
/// # Returns
///
/// Nonzero when the guest asked to leave VMX operation and VMXOFF has been executed, in which
/// case the stub resumes the guest without VMRESUME.
#[no_mangle]
extern "C" fn vmexit_handler(registers: &mut GuestRegisters) -> u64 {
    let (Some(platform), Some(state)) = (native::platform(), crate::core_state()) else {
        log::error!("VM exit before the engine was initialized");
        halt_processor();
    };

    platform.set_in_root(true);
    let result = handle_vmexit(platform, state, registers);
    platform.set_in_root(false);

    if let Err(error) = result {
        log::error!("VM exit handling failed: {}", error);
    }

    let core = platform.current_core() as usize;
    let leave = state.vcpus.get(core).is_some_and(|vcpu| vcpu.lock().vmxoff_requested);
    if !leave {
        return 0;
    }

    match leave_to_guest(platform) {
        Ok(()) => {
            log::info!("Processor {} left VMX operation", core);
            1
        }
        Err(error) => {
            log::error!("Processor {} could not leave VMX operation: {}", core, error);
            if let Some(vcpu) = state.vcpus.get(core) {
                vcpu.lock().vmxoff_requested = false;
            }
            0
        }
    }
}

/// Turns VMX off and reloads the guest's address space, descriptor tables and segment bases,
/// which the host state had replaced.
fn leave_to_guest(platform: &dyn Platform) -> Result<(), HypervisorError> {
    let cr3 = platform.vmread(guest::CR3);
    let gdtr = TableRegister { base: platform.vmread(guest::GDTR_BASE), limit: platform.vmread(guest::GDTR_LIMIT) as u16 };
    let idtr = TableRegister { base: platform.vmread(guest::IDTR_BASE), limit: platform.vmread(guest::IDTR_LIMIT) as u16 };
    let fs_base = platform.vmread(guest::FS_BASE);
    let gs_base = platform.vmread(guest::GS_BASE);

    leave_vmx_operation()?;

    DescriptorTables::load(gdtr, idtr);
    unsafe {
        x86::controlregs::cr3_write(cr3);
        x86::msr::wrmsr(msr::IA32_FS_BASE, fs_base);
        x86::msr::wrmsr(msr::IA32_GS_BASE, gs_base);
    }
    Ok(())
}

#[no_mangle]
extern "C" fn vmresume_failed() -> ! {
    let instruction_error = crate::intel::support::vmread(ro::VM_INSTRUCTION_ERROR);
    log::error!("VMRESUME failed with instruction error {}", instruction_error);
    halt_processor();
}

fn halt_processor() -> ! {
    loop {
        unsafe { x86::halt() };
    }
}
