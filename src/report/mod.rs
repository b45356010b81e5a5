//! Turning a detected fault into a report, and deciding what happens next.

pub mod dump;
pub mod sink;

use serde::Serialize;

pub use self::{
    dump::{DumpRow, HexDump},
    sink::{AnsiSink, JsonSink, LogSink, ReportSink},
};
use crate::{
    config::OnFault,
    shadow::{AddrInfo, ShadowMap, ShadowValue},
};

/// What the program was doing when we caught it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    Load,
    Store,
    Free,
    /// A free of a block in a state that is neither live nor freed
    Unknown,
}

impl FaultKind {
    pub fn label(self) -> &'static str {
        match self {
            FaultKind::Load => "READ",
            FaultKind::Store => "WRITE",
            FaultKind::Free => "Double free",
            FaultKind::Unknown => "Unknown mode",
        }
    }
}

/// What the shadow says is wrong with the address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Diagnosis {
    UseAfterFree,
    HeapBufferOverflow,
    NoError,
    Unknown,
}

impl Diagnosis {
    pub fn of(value: ShadowValue) -> Self {
        match value {
            ShadowValue::AfterFree => Diagnosis::UseAfterFree,
            ShadowValue::Redzone => Diagnosis::HeapBufferOverflow,
            ShadowValue::Accessible => Diagnosis::NoError,
            ShadowValue::Paint => Diagnosis::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Diagnosis::UseAfterFree => "use-after-free",
            Diagnosis::HeapBufferOverflow => "heap-buffer-overflow",
            Diagnosis::NoError => "no error",
            Diagnosis::Unknown => "unknown",
        }
    }

    fn headline(self) -> &'static str {
        match self {
            Diagnosis::UseAfterFree => "Use after free error detected!",
            Diagnosis::HeapBufferOverflow => "Heap buffer overflow error detected!",
            Diagnosis::NoError => "No error!",
            Diagnosis::Unknown => "Unknown error detected!",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub diagnosis: Diagnosis,
    /// The access as the program made it
    pub access_addr: usize,
    pub access_size: usize,
    /// The address the diagnosis is about: the start of the access, or its
    /// last byte if the start was fine
    pub info: AddrInfo,
    pub dump: Vec<DumpRow>,
}

impl FaultReport {
    /// Snapshot everything about the faulting access `addr..addr + size`.
    ///
    /// # Safety
    /// - See [`dump::dump_around()`]
    pub unsafe fn collect(map: &ShadowMap, addr: usize, size: usize, kind: FaultKind) -> Self {
        let mut info = map.addr_info(addr);
        if info.value.is_accessible() && size > 1 {
            info = map.addr_info(addr.wrapping_add(size - 1));
        }
        Self {
            kind,
            diagnosis: Diagnosis::of(info.value),
            access_addr: addr,
            access_size: size,
            info,
            dump: unsafe { dump::dump_around(map, info.mem_addr) },
        }
    }

    /// Write the human-readable report to `sink`, then hand it the report
    pub fn emit(&self, sink: &dyn ReportSink) {
        sink.error(format_args!(""));
        sink.error(format_args!("*****  Heap Sanitizer Error Detected  *****"));
        sink.error(format_args!("{}", self.diagnosis.headline()));
        match self.kind {
            FaultKind::Unknown => sink.error(format_args!(
                "Unknown error mode at: [{:#x}]",
                self.info.mem_addr
            )),
            kind => sink.error(format_args!(
                "Illegal {} address at: [{:#x}]",
                kind.label(),
                self.info.mem_addr
            )),
        }
        sink.info(format_args!(
            "Shadow memory address: [{:#x} : {}]  Shadow memory value: [{}]",
            self.info.shadow_addr,
            self.info.bit_offset,
            self.info.value.bits()
        ));
        sink.info(format_args!(""));
        sink.info(format_args!("{:<25}{}", "Accessible heap addr", ShadowValue::Accessible.bits()));
        sink.info(format_args!("{:<25}{}", "Heap red zone", ShadowValue::Redzone.bits()));
        sink.info(format_args!("{:<25}{}", "Heap freed buffer", ShadowValue::AfterFree.bits()));
        sink.info(format_args!(""));
        sink.info(format_args!("Dump info around address [{:#x}]:", self.info.mem_addr));
        for row in &self.dump {
            sink.info(format_args!("{row}"));
        }
        sink.error(format_args!("*****  Heap Sanitizer Error Detected End  *****"));
        sink.fault(self);
    }
}

/// Apply the fault policy once a report has been emitted. Only returns in
/// [`OnFault::Continue`] mode.
pub fn conclude(on_fault: OnFault, backtrace: bool, sink: &dyn ReportSink) {
    match on_fault {
        OnFault::Crash => crash(),
        OnFault::Continue if backtrace => print_trace(sink),
        OnFault::Continue => {}
    }
}

#[cold]
fn crash() -> ! {
    // SAFETY: raising a signal on ourselves is always allowed; we want the
    // default SIGSEGV action, a core dump pointing right here
    unsafe {
        libc::raise(libc::SIGSEGV);
    }
    // Somebody handled it and returned
    std::process::abort()
}

fn print_trace(sink: &dyn ReportSink) {
    let trace = backtrace::Backtrace::new();
    sink.info(format_args!("Backtrace:"));
    for (i, frame) in trace.frames().iter().enumerate() {
        match frame.symbols().first().and_then(|s| s.name()) {
            Some(name) => sink.info(format_args!("  #{i:<2} {:p} {name}", frame.ip())),
            None => sink.info(format_args!("  #{i:<2} {:p} <unknown>", frame.ip())),
        }
    }
}
