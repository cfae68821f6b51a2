//! # KVM — Linux Hypervisor Backend
//!
//! Implements `Hypervisor` / `IsolatedContext` on `/dev/kvm` with raw ioctls
//! through `libc`. One VM, one memory slot at guest-physical 0, one vCPU.
//!
//! ## Bootstrap Sequence
//!
//! 1. Open `/dev/kvm`, require `KVM_GET_API_VERSION` == 12.
//! 2. `KVM_CREATE_VM`, `KVM_SET_TSS_ADDR`, map guest RAM (`MAP_NORESERVE`)
//!    and register it with `KVM_SET_USER_MEMORY_REGION`.
//! 3. `KVM_CREATE_VCPU` and map its shared `kvm_run` page.
//! 4. `install_flat_mapping`: write page tables into guest RAM, then
//!    `KVM_GET_SREGS` → patch CR0/CR3/CR4/EFER and segments → `KVM_SET_SREGS`.
//! 5. `set_entry_point`: `KVM_SET_REGS` with RIP = entry, RFLAGS = 2.
//! 6. `resume`: `KVM_RUN`; whatever made it return is the exit reason.
//!
//! The structs below mirror `<linux/kvm.h>` for x86 and must keep its layout.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use tracing::debug;

use crate::handoff::{ExitReason, HandoffError, Hypervisor, IsolatedContext};
use crate::paging::{self, FlatMapping, ProtectedModeState, Segment};
use crate::region::{MappedRegion, RegionError};

pub const KVM_API_VERSION: i32 = 12;

/// Guest-physical address of the three pages KVM needs for its real-mode TSS.
pub const TSS_ADDRESS: u64 = 0xfffb_d000;

const KVM_GET_API_VERSION: u64 = 0xAE00;
const KVM_CREATE_VM: u64 = 0xAE01;
const KVM_GET_VCPU_MMAP_SIZE: u64 = 0xAE04;
const KVM_CREATE_VCPU: u64 = 0xAE41;
const KVM_SET_USER_MEMORY_REGION: u64 = 0x4020_AE46;
const KVM_SET_TSS_ADDR: u64 = 0xAE47;
const KVM_RUN: u64 = 0xAE80;
const KVM_GET_REGS: u64 = 0x8090_AE81;
const KVM_SET_REGS: u64 = 0x4090_AE82;
const KVM_GET_SREGS: u64 = 0x8138_AE83;
const KVM_SET_SREGS: u64 = 0x4138_AE84;

const KVM_EXIT_EXCEPTION: u32 = 1;
const KVM_EXIT_IO: u32 = 2;
const KVM_EXIT_HLT: u32 = 5;
const KVM_EXIT_MMIO: u32 = 6;
const KVM_EXIT_SHUTDOWN: u32 = 8;
const KVM_EXIT_FAIL_ENTRY: u32 = 9;
const KVM_EXIT_INTERNAL_ERROR: u32 = 17;

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct KvmUserspaceMemoryRegion {
    slot: u32,
    flags: u32,
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct KvmRegs {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    rsp: u64,
    rbp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    rflags: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct KvmSegment {
    base: u64,
    limit: u32,
    selector: u16,
    type_: u8,
    present: u8,
    dpl: u8,
    db: u8,
    s: u8,
    l: u8,
    g: u8,
    avl: u8,
    unusable: u8,
    padding: u8,
}

impl From<Segment> for KvmSegment {
    fn from(seg: Segment) -> Self {
        KvmSegment {
            base: seg.base,
            limit: seg.limit,
            selector: seg.selector,
            type_: seg.type_,
            present: seg.present as u8,
            dpl: seg.dpl,
            db: seg.db as u8,
            s: seg.s as u8,
            l: seg.l as u8,
            g: seg.g as u8,
            avl: 0,
            unusable: 0,
            padding: 0,
        }
    }
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct KvmDtable {
    base: u64,
    limit: u16,
    padding: [u16; 3],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct KvmSregs {
    cs: KvmSegment,
    ds: KvmSegment,
    es: KvmSegment,
    fs: KvmSegment,
    gs: KvmSegment,
    ss: KvmSegment,
    tr: KvmSegment,
    ldt: KvmSegment,
    gdt: KvmDtable,
    idt: KvmDtable,
    cr0: u64,
    cr2: u64,
    cr3: u64,
    cr4: u64,
    cr8: u64,
    efer: u64,
    apic_base: u64,
    interrupt_bitmap: [u64; 4],
}

impl KvmSregs {
    fn apply(&mut self, state: &ProtectedModeState) {
        self.cr0 = state.cr0;
        self.cr3 = state.cr3;
        self.cr4 = state.cr4;
        self.efer = state.efer;
        self.cs = state.code.into();
        let data: KvmSegment = state.data.into();
        self.ds = data;
        self.es = data;
        self.fs = data;
        self.gs = data;
        self.ss = data;
    }
}

/// Leading fields of `struct kvm_run`, up to the start of the exit union.
#[repr(C)]
#[allow(dead_code)]
struct KvmRunHeader {
    request_interrupt_window: u8,
    immediate_exit: u8,
    padding1: [u8; 6],
    exit_reason: u32,
    ready_for_interrupt_injection: u8,
    if_flag: u8,
    flags: u16,
    cr8: u64,
    apic_base: u64,
    exit_data: [u32; 4],
}

fn ioctl(fd: &File, request: u64, arg: libc::c_ulong, step: &'static str) -> Result<i32, HandoffError> {
    // SAFETY: every request passed here is a KVM ioctl whose argument is
    // either an integer or a pointer to a live, correctly laid out struct.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) };
    if rc < 0 {
        return Err(HandoffError::Setup {
            step,
            source: io::Error::last_os_error(),
        });
    }
    Ok(rc)
}

/// Take ownership of a file descriptor returned by an ioctl.
fn owned(fd: i32) -> File {
    // SAFETY: `fd` was just returned by the kernel and is owned by nobody else.
    unsafe { File::from_raw_fd(fd) }
}

/// Handle on `/dev/kvm`.
pub struct Kvm {
    sys: File,
}

impl Kvm {
    pub fn open() -> Result<Self, HandoffError> {
        let sys = File::options()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .map_err(|source| HandoffError::Setup {
                step: "open /dev/kvm",
                source,
            })?;
        let found = ioctl(&sys, KVM_GET_API_VERSION, 0, "KVM_GET_API_VERSION")?;
        if found != KVM_API_VERSION {
            return Err(HandoffError::ApiVersion {
                found,
                expected: KVM_API_VERSION,
            });
        }
        Ok(Kvm { sys })
    }
}

impl Hypervisor for Kvm {
    type Context = KvmContext;

    fn create_isolated_context(&self, memory_size: u64) -> Result<KvmContext, HandoffError> {
        let vm = owned(ioctl(&self.sys, KVM_CREATE_VM, 0, "KVM_CREATE_VM")?);
        ioctl(&vm, KVM_SET_TSS_ADDR, TSS_ADDRESS as libc::c_ulong, "KVM_SET_TSS_ADDR")?;

        let memory = MappedRegion::guest_memory(memory_size as usize).map_err(|e| {
            let source = match e {
                RegionError::MapFailed { source, .. } => source,
                RegionError::Empty => io::Error::from(io::ErrorKind::InvalidInput),
            };
            HandoffError::Setup {
                step: "mmap guest memory",
                source,
            }
        })?;
        let slot = KvmUserspaceMemoryRegion {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size,
            userspace_addr: memory.base_address(),
        };
        ioctl(
            &vm,
            KVM_SET_USER_MEMORY_REGION,
            &slot as *const _ as libc::c_ulong,
            "KVM_SET_USER_MEMORY_REGION",
        )?;

        let vcpu = owned(ioctl(&vm, KVM_CREATE_VCPU, 0, "KVM_CREATE_VCPU")?);
        let run_size = ioctl(&self.sys, KVM_GET_VCPU_MMAP_SIZE, 0, "KVM_GET_VCPU_MMAP_SIZE")? as usize;
        // SAFETY: shared mapping of the vCPU's kvm_run page, sized as KVM asks.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                run_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                vcpu.as_raw_fd(),
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(HandoffError::Setup {
                step: "mmap kvm_run",
                source: io::Error::last_os_error(),
            });
        }
        let run = NonNull::new(raw.cast::<KvmRunHeader>()).ok_or_else(|| HandoffError::Setup {
            step: "mmap kvm_run",
            source: io::Error::other("null mapping"),
        })?;

        debug!(
            memory = format_args!("{:#x}", memory_size),
            host_base = format_args!("{:#x}", memory.base_address()),
            run_size,
            "KVM guest created"
        );
        Ok(KvmContext {
            _vm: vm,
            vcpu,
            run,
            run_size,
            memory,
        })
    }
}

/// A KVM virtual machine with one vCPU.
pub struct KvmContext {
    _vm: File,
    vcpu: File,
    run: NonNull<KvmRunHeader>,
    run_size: usize,
    memory: MappedRegion,
}

impl KvmContext {
    fn exit_reason(&self) -> ExitReason {
        // SAFETY: `run` points at the live kvm_run mapping; KVM_RUN has
        // returned, so the kernel is not writing it concurrently.
        let header = unsafe { std::ptr::read_volatile(self.run.as_ptr()) };
        let data = header.exit_data;
        match header.exit_reason {
            KVM_EXIT_HLT => ExitReason::Halt,
            KVM_EXIT_SHUTDOWN => ExitReason::Shutdown,
            KVM_EXIT_IO => ExitReason::Io,
            KVM_EXIT_MMIO => ExitReason::Mmio,
            KVM_EXIT_FAIL_ENTRY => ExitReason::FailEntry {
                hardware_reason: data[0] as u64 | (data[1] as u64) << 32,
            },
            KVM_EXIT_INTERNAL_ERROR => ExitReason::InternalError { suberror: data[0] },
            KVM_EXIT_EXCEPTION => ExitReason::Exception {
                vector: data[0],
                error_code: data[1],
            },
            code => ExitReason::Other { code },
        }
    }
}

impl IsolatedContext for KvmContext {
    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }

    fn install_flat_mapping(&mut self) -> Result<FlatMapping, HandoffError> {
        let mapping = paging::install_flat_page_tables(self.memory.as_mut_slice())?;
        let state = ProtectedModeState::for_mapping(&mapping);

        let mut sregs = KvmSregs::default();
        ioctl(
            &self.vcpu,
            KVM_GET_SREGS,
            &mut sregs as *mut _ as libc::c_ulong,
            "KVM_GET_SREGS",
        )?;
        sregs.apply(&state);
        ioctl(
            &self.vcpu,
            KVM_SET_SREGS,
            &sregs as *const _ as libc::c_ulong,
            "KVM_SET_SREGS",
        )?;
        debug!(
            cr3 = format_args!("{:#x}", mapping.directory),
            tables = mapping.table_count,
            "guest paging enabled"
        );
        Ok(mapping)
    }

    fn set_entry_point(&mut self, address: u64) -> Result<(), HandoffError> {
        let mut regs = KvmRegs::default();
        ioctl(
            &self.vcpu,
            KVM_GET_REGS,
            &mut regs as *mut _ as libc::c_ulong,
            "KVM_GET_REGS",
        )?;
        regs.rip = address;
        regs.rflags = paging::INITIAL_RFLAGS;
        ioctl(
            &self.vcpu,
            KVM_SET_REGS,
            &regs as *const _ as libc::c_ulong,
            "KVM_SET_REGS",
        )?;
        Ok(())
    }

    fn resume(&mut self) -> Result<ExitReason, HandoffError> {
        ioctl(&self.vcpu, KVM_RUN, 0, "KVM_RUN")?;
        Ok(self.exit_reason())
    }
}

impl Drop for KvmContext {
    fn drop(&mut self) {
        // SAFETY: unmapping the kvm_run mapping created in create_isolated_context.
        unsafe {
            libc::munmap(self.run.as_ptr().cast(), self.run_size);
        }
    }
}
