//! Boot hand-off from Limine
//!
//! Checks the bootloader responses, then brings the kernel up in order:
//! logging, descriptor tables, memory, scheduler.

use core::fmt;

use arrayvec::ArrayVec;
use limine::{
    memory_map::{Entry, EntryType},
    request::{
        FramebufferRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker,
    },
    BaseRevision,
};

use crate::{
    halt_forever, interrupts, logging,
    memory::{
        self,
        regions::{MemoryRegion, RegionKind},
    },
    processes::{process::Pid, scheduler},
};

/// Entries beyond this are ignored; real maps have a few dozen.
const MAX_REGIONS: usize = 256;

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

fn fatal(reason: impl fmt::Display) -> ! {
    log::error!("Fatal: {}", reason);
    halt_forever()
}

fn region_kind(entry_type: EntryType) -> RegionKind {
    match entry_type {
        EntryType::USABLE => RegionKind::Usable,
        EntryType::ACPI_RECLAIMABLE => RegionKind::AcpiReclaimable,
        EntryType::ACPI_NVS => RegionKind::AcpiNvs,
        EntryType::BAD_MEMORY => RegionKind::BadMemory,
        EntryType::BOOTLOADER_RECLAIMABLE => RegionKind::BootloaderReclaimable,
        EntryType::KERNEL_AND_MODULES => RegionKind::KernelAndModules,
        EntryType::FRAMEBUFFER => RegionKind::Framebuffer,
        _ => RegionKind::Reserved,
    }
}

fn to_region(entry: &Entry) -> MemoryRegion {
    MemoryRegion::new(entry.base, entry.length, region_kind(entry.entry_type))
}

/// Brings the kernel up on the boot CPU. Interrupts stay disabled.
///
/// Returns the pid of the boot context, which is the running process from
/// here on. Halts if anything the kernel cannot run without is missing.
pub fn init() -> Pid {
    if logging::init().is_err() {
        crate::serial_println!("Logger already installed");
    }

    if !BASE_REVISION.is_supported() {
        fatal("Unsupported Limine base revision");
    }

    interrupts::init();

    let Some(framebuffer) = FRAMEBUFFER_REQUEST
        .get_response()
        .and_then(|response| response.framebuffers().next())
    else {
        fatal("No framebuffer");
    };
    log::info!(
        "Framebuffer {}x{} at {:p}",
        framebuffer.width(),
        framebuffer.height(),
        framebuffer.addr()
    );

    let Some(memory_map) = MEMORY_MAP_REQUEST.get_response() else {
        fatal("No memory map");
    };
    let Some(hhdm) = HHDM_REQUEST.get_response() else {
        fatal("No HHDM offset");
    };

    let entries = memory_map.entries();
    if entries.len() > MAX_REGIONS {
        log::warn!("Memory map has {} entries, using {}", entries.len(), MAX_REGIONS);
    }
    let regions: ArrayVec<MemoryRegion, MAX_REGIONS> =
        entries.iter().take(MAX_REGIONS).map(|entry| to_region(entry)).collect();

    for region in &regions {
        log::debug!(
            "{:#018x}-{:#018x} {:?}",
            region.base,
            region.base + region.length,
            region.kind
        );
    }

    let summary = match memory::init(&regions, hhdm.offset()) {
        Ok(summary) => summary,
        Err(e) => fatal(e),
    };
    log::info!(
        "Memory: {} KiB total, {} KiB usable, {} KiB reserved",
        summary.total / 1024,
        summary.usable / 1024,
        summary.reserved / 1024
    );

    let boot = scheduler::SCHEDULER.lock().create_boot_proc();
    match boot.and_then(scheduler::register_proc) {
        Ok(pid) => pid,
        Err(e) => fatal(e),
    }
}
