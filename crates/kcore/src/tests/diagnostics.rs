//! What a fatal violation leaves in the log.
//!
//! The `log` facade accepts one logger per process, so the capture logger
//! is installed once and these tests take turns on it. Other tests keep
//! logging meanwhile, so every record carries the thread that wrote it.

use std::sync::{Mutex, Once};
use std::thread::{self, ThreadId};

use log::{Level, LevelFilter, Log, Metadata, Record};
use serial_test::serial;

use crate::arch::hosted::boot_cpu;
use crate::tests::mock::MockFactory;
use crate::{KernelConfig, KernelState, Pid, ProcessDescriptor, Scheduler, TrivialScheduler};

struct Capture {
    records: Mutex<Vec<(ThreadId, Level, String)>>,
}

impl Log for Capture {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let line = format!("{}", record.args());
        if let Ok(mut records) = self.records.lock() {
            records.push((thread::current().id(), record.level(), line));
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture {
    records: Mutex::new(Vec::new()),
};

fn capture() -> &'static Capture {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&CAPTURE).expect("no other logger in the test binary");
        log::set_max_level(LevelFilter::Trace);
    });
    CAPTURE.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    &CAPTURE
}

/// Error records written by `cpu`.
fn errors(capture: &Capture, cpu: ThreadId) -> Vec<String> {
    capture
        .records
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter(|(thread, level, _)| *thread == cpu && *level == Level::Error)
        .map(|(_, _, line)| line.clone())
        .collect()
}

#[test]
#[serial]
fn fatal_record_names_location_and_condition() {
    let capture = capture();
    let factory = MockFactory::new();
    let sched = TrivialScheduler::new();

    let (cpu, halted) = thread::scope(|s| {
        let handle = s.spawn(|| {
            boot_cpu(5);
            let stray: Pid = ProcessDescriptor::create(&factory, 0x1000).unwrap().pid();
            sched.dequeue(stray);
        });
        (handle.thread().id(), handle.join())
    });
    assert!(halted.is_err());

    let errors = errors(capture, cpu);
    let fatal = errors
        .iter()
        .find(|line| line.contains("not enqueued"))
        .expect("fatal diagnostic logged");
    assert!(fatal.starts_with("fatal at "), "{fatal}");
    assert!(fatal.contains("trivial.rs:"), "{fatal}");
}

#[test]
#[serial]
fn failed_assertion_logs_its_condition() {
    let capture = capture();
    let handle = thread::spawn(|| {
        boot_cpu(0);
        let lock = crate::RawSpinLock::new();
        lock.unlock();
    });
    let cpu = handle.thread().id();
    assert!(handle.join().is_err());

    let errors = errors(capture, cpu);
    assert!(
        errors
            .iter()
            .any(|line| line.contains("assertion `owner == me.0` failed")),
        "{errors:?}"
    );
}

#[test]
#[serial]
fn boot_logs_layout_and_policy() {
    let capture = capture();
    boot_cpu(0);
    let _state = KernelState::new(KernelConfig::default(), &[0], Box::new(MockFactory::new()));

    let me = thread::current().id();
    let records = capture.records.lock().unwrap_or_else(|e| e.into_inner());
    let mine: Vec<_> = records
        .iter()
        .filter(|(thread, _, _)| *thread == me)
        .collect();
    assert!(mine.iter().any(|(_, level, line)| {
        *level == Level::Info && line.starts_with("per-cpu: 1 areas")
    }));
    assert!(mine.iter().any(|(_, _, line)| line.contains("trivial")));
}
