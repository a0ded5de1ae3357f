//! Initial contents of the VMCS: the guest-state area, the host-state area and the execution,
//! exit and entry controls.
//!
//! The guest starts exactly where the processor was when its state was captured, so the guest
//! state is a copy of the live registers. Interception-driven controls are left to
//! [`crate::intel::vcpu::VcpuState::apply_interceptions`]; only the base set is written here.

use {
    crate::{
        intel::{
            controls::{adjust_vmx_controls, VmxControl},
            descriptor::DescriptorTables,
            vcpu::{BaseControls, VcpuState},
        },
        platform::Platform,
    },
    x86::vmx::vmcs::{
        control::{self, EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls},
        guest, host, ro,
    },
};

/// Register state of a processor at the moment it is virtualized.
#[derive(Debug, Default, Copy, Clone)]
pub struct ProcessorSnapshot {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldtr: u16,
    pub tr: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub debugctl: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub efer: u64,
    pub pat: u64,
}

/// Physical addresses referenced by the execution controls.
#[derive(Debug, Default, Copy, Clone)]
pub struct ControlAddresses {
    pub msr_bitmap: u64,
    pub io_bitmap_a: u64,
    pub io_bitmap_b: u64,
    pub eptp: u64,
}

/// Extracts the revision identifier a VMXON or VMCS region must start with.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.1 BASIC VMX INFORMATION
pub fn revision_id(platform: &dyn Platform) -> u32 {
    platform.rdmsr(x86::msr::IA32_VMX_BASIC).unwrap_or(0) as u32 & 0x7FFF_FFFF
}

/// Initialize the guest state for the currently loaded VMCS.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4 GUEST-STATE AREA
///
/// # Arguments
/// * `platform` - The processor whose current VMCS is written.
/// * `snapshot` - The captured registers the guest resumes with.
/// * `tables` - The guest's descriptor tables.
#[rustfmt::skip]
pub fn setup_guest_state(platform: &dyn Platform, snapshot: &ProcessorSnapshot, tables: &DescriptorTables) {
    platform.vmwrite(guest::CR0, snapshot.cr0);
    platform.vmwrite(guest::CR3, snapshot.cr3);
    platform.vmwrite(guest::CR4, snapshot.cr4);
    platform.vmwrite(guest::DR7, snapshot.dr7);

    platform.vmwrite(guest::RSP, snapshot.rsp);
    platform.vmwrite(guest::RIP, snapshot.rip);
    platform.vmwrite(guest::RFLAGS, snapshot.rflags);

    let segments = [
        (snapshot.cs, guest::CS_SELECTOR, guest::CS_BASE, guest::CS_LIMIT, guest::CS_ACCESS_RIGHTS),
        (snapshot.ss, guest::SS_SELECTOR, guest::SS_BASE, guest::SS_LIMIT, guest::SS_ACCESS_RIGHTS),
        (snapshot.ds, guest::DS_SELECTOR, guest::DS_BASE, guest::DS_LIMIT, guest::DS_ACCESS_RIGHTS),
        (snapshot.es, guest::ES_SELECTOR, guest::ES_BASE, guest::ES_LIMIT, guest::ES_ACCESS_RIGHTS),
        (snapshot.fs, guest::FS_SELECTOR, guest::FS_BASE, guest::FS_LIMIT, guest::FS_ACCESS_RIGHTS),
        (snapshot.gs, guest::GS_SELECTOR, guest::GS_BASE, guest::GS_LIMIT, guest::GS_ACCESS_RIGHTS),
        (snapshot.ldtr, guest::LDTR_SELECTOR, guest::LDTR_BASE, guest::LDTR_LIMIT, guest::LDTR_ACCESS_RIGHTS),
        (snapshot.tr, guest::TR_SELECTOR, guest::TR_BASE, guest::TR_LIMIT, guest::TR_ACCESS_RIGHTS),
    ];

    for (selector, selector_field, base_field, limit_field, access_rights_field) in segments {
        let descriptor = tables.segment(selector);
        platform.vmwrite(selector_field, u64::from(selector));
        platform.vmwrite(base_field, descriptor.base_address);
        platform.vmwrite(limit_field, u64::from(descriptor.segment_limit));
        platform.vmwrite(access_rights_field, u64::from(descriptor.access_rights.bits()));
    }

    // In 64-bit mode the FS and GS bases come from their MSRs, not from the GDT.
    platform.vmwrite(guest::FS_BASE, snapshot.fs_base);
    platform.vmwrite(guest::GS_BASE, snapshot.gs_base);

    platform.vmwrite(guest::GDTR_BASE, tables.gdtr.base);
    platform.vmwrite(guest::GDTR_LIMIT, u64::from(tables.gdtr.limit));
    platform.vmwrite(guest::IDTR_BASE, tables.idtr.base);
    platform.vmwrite(guest::IDTR_LIMIT, u64::from(tables.idtr.limit));

    platform.vmwrite(guest::IA32_DEBUGCTL_FULL, snapshot.debugctl);
    platform.vmwrite(guest::IA32_SYSENTER_CS, snapshot.sysenter_cs);
    platform.vmwrite(guest::IA32_SYSENTER_ESP, snapshot.sysenter_esp);
    platform.vmwrite(guest::IA32_SYSENTER_EIP, snapshot.sysenter_eip);
    platform.vmwrite(guest::IA32_EFER_FULL, snapshot.efer);
    platform.vmwrite(guest::IA32_PAT_FULL, snapshot.pat);
    platform.vmwrite(guest::LINK_PTR_FULL, u64::MAX);
}

/// Initialize the host state for the currently loaded VMCS.
///
/// The host shares the kernel's address space and segments, and runs on its own GDT copy, IDT
/// and stack.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.5 HOST-STATE AREA
///
/// # Arguments
/// * `platform` - The processor whose current VMCS is written.
/// * `snapshot` - The captured registers of the processor.
/// * `tables` - The host's descriptor tables.
/// * `host_rsp` - Top of the stack VM exits run on.
/// * `host_rip` - The VM-exit entry point.
#[rustfmt::skip]
pub fn setup_host_state(platform: &dyn Platform, snapshot: &ProcessorSnapshot, tables: &DescriptorTables, host_rsp: u64, host_rip: u64) {
    const SELECTOR_MASK: u16 = 0xF8;

    platform.vmwrite(host::CR0, snapshot.cr0);
    platform.vmwrite(host::CR3, snapshot.cr3);
    platform.vmwrite(host::CR4, snapshot.cr4);

    platform.vmwrite(host::RSP, host_rsp);
    platform.vmwrite(host::RIP, host_rip);

    platform.vmwrite(host::CS_SELECTOR, u64::from(snapshot.cs & SELECTOR_MASK));
    platform.vmwrite(host::SS_SELECTOR, u64::from(snapshot.ss & SELECTOR_MASK));
    platform.vmwrite(host::DS_SELECTOR, u64::from(snapshot.ds & SELECTOR_MASK));
    platform.vmwrite(host::ES_SELECTOR, u64::from(snapshot.es & SELECTOR_MASK));
    platform.vmwrite(host::FS_SELECTOR, u64::from(snapshot.fs & SELECTOR_MASK));
    platform.vmwrite(host::GS_SELECTOR, u64::from(snapshot.gs & SELECTOR_MASK));
    platform.vmwrite(host::TR_SELECTOR, u64::from(snapshot.tr & SELECTOR_MASK));

    platform.vmwrite(host::FS_BASE, snapshot.fs_base);
    platform.vmwrite(host::GS_BASE, snapshot.gs_base);
    platform.vmwrite(host::TR_BASE, tables.segment(snapshot.tr).base_address);
    platform.vmwrite(host::GDTR_BASE, tables.gdtr.base);
    platform.vmwrite(host::IDTR_BASE, tables.idtr.base);

    platform.vmwrite(host::IA32_SYSENTER_CS, snapshot.sysenter_cs);
    platform.vmwrite(host::IA32_SYSENTER_ESP, snapshot.sysenter_esp);
    platform.vmwrite(host::IA32_SYSENTER_EIP, snapshot.sysenter_eip);
    platform.vmwrite(host::IA32_EFER_FULL, snapshot.efer);
    platform.vmwrite(host::IA32_PAT_FULL, snapshot.pat);
}

/// Initialize the VMCS control values for the currently loaded VMCS and record the base
/// controls in `vcpu`.
///
/// NMIs always exit so that other processors can force this one into VMX root. EFER is loaded
/// and saved on every transition so that syscall trapping can hide EFER.SCE.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// - 25.6 VM-EXECUTION CONTROL FIELDS
/// - 25.7 VM-EXIT CONTROL FIELDS
/// - 25.8 VM-ENTRY CONTROL FIELDS
///
/// # Arguments
/// * `platform` - The processor whose current VMCS is written.
/// * `vcpu` - The processor's VMM state.
/// * `snapshot` - The captured registers, used for the CR0 and CR4 read shadows.
/// * `addresses` - Physical addresses of the bitmaps and the EPT pointer.
#[rustfmt::skip]
pub fn setup_controls(platform: &dyn Platform, vcpu: &mut VcpuState, snapshot: &ProcessorSnapshot, addresses: &ControlAddresses) {
    const PRIMARY_CTL: u32 = PrimaryControls::SECONDARY_CONTROLS.bits() | PrimaryControls::USE_MSR_BITMAPS.bits() | PrimaryControls::USE_IO_BITMAPS.bits();
    const SECONDARY_CTL: u32 = SecondaryControls::ENABLE_EPT.bits() | SecondaryControls::ENABLE_RDTSCP.bits() | SecondaryControls::ENABLE_XSAVES_XRSTORS.bits() | SecondaryControls::ENABLE_INVPCID.bits();
    const ENTRY_CTL: u32 = EntryControls::IA32E_MODE_GUEST.bits() | EntryControls::LOAD_DEBUG_CONTROLS.bits() | EntryControls::LOAD_IA32_EFER.bits() | EntryControls::LOAD_IA32_PAT.bits();
    const EXIT_CTL: u32 = ExitControls::HOST_ADDRESS_SPACE_SIZE.bits() | ExitControls::SAVE_DEBUG_CONTROLS.bits() | ExitControls::SAVE_IA32_EFER.bits() | ExitControls::LOAD_IA32_EFER.bits() | ExitControls::SAVE_IA32_PAT.bits() | ExitControls::LOAD_IA32_PAT.bits();
    const PINBASED_CTL: u32 = PinbasedControls::NMI_EXITING.bits() | PinbasedControls::VIRTUAL_NMIS.bits();

    vcpu.base = BaseControls { primary: PRIMARY_CTL, pin: PINBASED_CTL, exception_bitmap: 0 };

    platform.vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(platform, VmxControl::ProcessorBased, u64::from(PRIMARY_CTL)));
    platform.vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(platform, VmxControl::ProcessorBased2, u64::from(SECONDARY_CTL)));
    platform.vmwrite(control::VMENTRY_CONTROLS, adjust_vmx_controls(platform, VmxControl::VmEntry, u64::from(ENTRY_CTL)));
    platform.vmwrite(control::VMEXIT_CONTROLS, adjust_vmx_controls(platform, VmxControl::VmExit, u64::from(EXIT_CTL)));
    platform.vmwrite(control::PINBASED_EXEC_CONTROLS, adjust_vmx_controls(platform, VmxControl::PinBased, u64::from(PINBASED_CTL)));
    platform.vmwrite(control::EXCEPTION_BITMAP, 0);

    platform.vmwrite(control::CR0_GUEST_HOST_MASK, 0);
    platform.vmwrite(control::CR4_GUEST_HOST_MASK, 0);
    platform.vmwrite(control::CR0_READ_SHADOW, snapshot.cr0);
    platform.vmwrite(control::CR4_READ_SHADOW, snapshot.cr4);

    platform.vmwrite(control::MSR_BITMAPS_ADDR_FULL, addresses.msr_bitmap);
    platform.vmwrite(control::IO_BITMAP_A_ADDR_FULL, addresses.io_bitmap_a);
    platform.vmwrite(control::IO_BITMAP_B_ADDR_FULL, addresses.io_bitmap_b);
    platform.vmwrite(control::EPTP_FULL, addresses.eptp);
}

/// Logs the fields that usually explain a failed VM entry.
#[rustfmt::skip]
pub fn log_entry_failure(platform: &dyn Platform) {
    log::error!("VM instruction error: {}", platform.vmread(ro::VM_INSTRUCTION_ERROR));
    log::error!("Guest CR0 {:#x} CR3 {:#x} CR4 {:#x}", platform.vmread(guest::CR0), platform.vmread(guest::CR3), platform.vmread(guest::CR4));
    log::error!("Guest RIP {:#x} RSP {:#x} RFLAGS {:#x}", platform.vmread(guest::RIP), platform.vmread(guest::RSP), platform.vmread(guest::RFLAGS));
    log::error!("Guest CS {:#x} AR {:#x} TR {:#x} AR {:#x}", platform.vmread(guest::CS_SELECTOR), platform.vmread(guest::CS_ACCESS_RIGHTS), platform.vmread(guest::TR_SELECTOR), platform.vmread(guest::TR_ACCESS_RIGHTS));
    log::error!("Host RIP {:#x} RSP {:#x} CR3 {:#x}", platform.vmread(host::RIP), platform.vmread(host::RSP), platform.vmread(host::CR3));
    log::error!("Primary {:#x} secondary {:#x} pin {:#x} entry {:#x} exit {:#x}",
        platform.vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS),
        platform.vmread(control::SECONDARY_PROCBASED_EXEC_CONTROLS),
        platform.vmread(control::PINBASED_EXEC_CONTROLS),
        platform.vmread(control::VMENTRY_CONTROLS),
        platform.vmread(control::VMEXIT_CONTROLS));
}
