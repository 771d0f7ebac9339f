// =============================================================================
// Trellis — Limine Boot Protocol Interface
// =============================================================================
//
// The kernel binary contains static "request" structures; Limine finds them
// by their magic bytes, fulfils them and leaves a pointer to a "response"
// in each before jumping to `kmain`.
//
// WHAT WE ASK FOR:
//   - HHDM offset   every physical frame is mapped at phys + offset
//   - Memory map    which physical regions are free RAM
//   - MP            the application processors and their APIC ids
//   - Command line  boot options (`cpus=`, `hz=`, `sched=`, `log=`)
//
// A missing mandatory response is a boot protocol error; the kernel cannot
// continue without it.
// =============================================================================

use limine::BaseRevision;
use limine::memory_map::Entry;
use limine::request::{ExecutableCmdlineRequest, HhdmRequest, MemoryMapRequest, MpRequest};
use limine::response::MpResponse;

/// Limine base revision tag, required by the Limine v1+ protocol.
#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// Limine parks every application processor and tells us how to start it.
#[used]
#[unsafe(link_section = ".limine_requests")]
static MP_REQUEST: MpRequest = MpRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static CMDLINE_REQUEST: ExecutableCmdlineRequest = ExecutableCmdlineRequest::new();

/// Whether the bootloader speaks our protocol revision.
pub fn revision_supported() -> bool {
    BASE_REVISION.is_supported()
}

pub fn hhdm_offset() -> Option<u64> {
    HHDM_REQUEST.get_response().map(|response| response.offset())
}

/// Physical memory map, sorted by base address and non-overlapping.
pub fn memory_map() -> Option<&'static [&'static Entry]> {
    MEMORY_MAP_REQUEST.get_response().map(|response| response.entries())
}

/// The CPUs Limine found. Absent on a single-processor boot with an old
/// loader; the kernel then runs on the boot CPU alone.
pub fn mp() -> Option<&'static MpResponse> {
    MP_REQUEST.get_response()
}

/// Kernel command line, empty if none was given or it is not UTF-8.
pub fn cmdline() -> &'static str {
    CMDLINE_REQUEST
        .get_response()
        .and_then(|response| response.cmdline().to_str().ok())
        .unwrap_or("")
}
