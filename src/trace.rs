use anyhow::{anyhow, Context, Result};
use memoffset::offset_of;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio;
use nix::sys::wait;
use nix::unistd::Pid;
use serde::Serialize;
use spawn_ptrace::CommandPtraceSpawn;

use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::io::IoSliceMut;
use std::path::Path;
use std::process::Command;

use crate::sink::EventSink;
use crate::symbol::WatchedSymbol;

/// Represents the width of a watched variable.
///
/// x86 debug registers can cover 1, 2, 4, or 8 bytes; this tool watches
/// integer globals and supports the 4- and 8-byte widths only. Anything else
/// is rejected when the symbol is resolved.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WatchWidth {
    DWord = 4,
    QWord = 8,
}

impl TryFrom<u64> for WatchWidth {
    type Error = anyhow::Error;

    fn try_from(size: u64) -> Result<Self> {
        Ok(match size {
            4 => WatchWidth::DWord,
            8 => WatchWidth::QWord,
            _ => return Err(anyhow!("size {} is not watchable (expected 4 or 8)", size)),
        })
    }
}

/// A watched value, signed at the session's width.
///
/// Classification compares full-width signed integers; the raw bytes are
/// decoded once, right after each cross-process read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WatchValue {
    DWord(i32),
    QWord(i64),
}

impl fmt::Display for WatchValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WatchValue::DWord(v) => write!(f, "{}", v),
            WatchValue::QWord(v) => write!(f, "{}", v),
        }
    }
}

/// A single observed access to the watched variable.
///
/// Events are emitted in the exact order the hardware delivered the traps.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "access", rename_all = "lowercase")]
pub enum AccessEvent {
    Read {
        symbol: String,
        value: WatchValue,
    },
    Write {
        symbol: String,
        before: WatchValue,
        after: WatchValue,
    },
}

impl AccessEvent {
    /// Classifies a post-step observation against the last value seen at the
    /// watched address. An unchanged value means the trapped instruction only
    /// read the variable.
    pub fn observe(symbol: &str, last: WatchValue, seen: WatchValue) -> Self {
        if seen == last {
            AccessEvent::Read {
                symbol: symbol.to_string(),
                value: seen,
            }
        } else {
            AccessEvent::Write {
                symbol: symbol.to_string(),
                before: last,
                after: seen,
            }
        }
    }
}

/// Holds everything needed to launch and supervise one tracee.
#[derive(Debug)]
pub struct Tracer {
    pub binary_path: String,
    pub symbol: WatchedSymbol,
    pub tracee_args: Vec<String>,
}

impl Tracer {
    /// Launch the target under ptrace, arm the watchpoint, and supervise the
    /// tracee until it exits. Returns the tracee's exit code.
    pub fn watch(&self, sink: &mut dyn EventSink) -> Result<i32> {
        let child = Command::new(&self.binary_path)
            .args(&self.tracee_args)
            .spawn_ptrace()
            .with_context(|| format!("failed to spawn {} for tracing", self.binary_path))?;

        log::debug!(
            "spawned {} for tracing as child {}",
            self.binary_path,
            child.id()
        );

        let tracee_pid = Pid::from_raw(child.id() as i32);

        // The tracee is sitting in its exec-stop: the image is mapped, but
        // nothing in it has run yet. Tear the tracee down with us if we die.
        ptrace::setoptions(tracee_pid, ptrace::Options::PTRACE_O_EXITKILL)
            .context("ptrace SETOPTIONS failed")?;

        let mut tracee = Tracee::new(tracee_pid, self)?;
        tracee.run(sink)
    }
}

/// One supervised tracee, from its exec-stop until it exits.
///
/// `last_value` always mirrors the most recently observed value of the
/// watched variable; the width is fixed for the session.
pub struct Tracee<'a> {
    tracee_pid: Pid,
    tracer: &'a Tracer,
    watch_addr: u64,
    last_value: WatchValue,
}

impl<'a> Tracee<'a> {
    /// Arms the watchpoint while the freshly exec'd tracee is still stopped
    /// and seeds the session with the variable's initial value.
    fn new(tracee_pid: Pid, tracer: &'a Tracer) -> Result<Self> {
        let load_base = if tracer.symbol.pie {
            load_base(tracee_pid, &tracer.binary_path)?
        } else {
            0
        };
        let watch_addr = load_base + tracer.symbol.image_offset;

        log::debug!(
            "watching {} at {:#x} (load base {:#x} + image offset {:#x})",
            tracer.symbol.name,
            watch_addr,
            load_base,
            tracer.symbol.image_offset
        );

        arm_watchpoint(tracee_pid, watch_addr, tracer.symbol.width)?;

        let last_value = read_watched(tracee_pid, watch_addr, tracer.symbol.width)?;

        Ok(Self {
            tracee_pid,
            tracer,
            watch_addr,
            last_value,
        })
    }

    /// Resumes the tracee and services its stops until it exits, emitting one
    /// event per watchpoint hit. Returns the tracee's exit code.
    fn run(&mut self, sink: &mut dyn EventSink) -> Result<i32> {
        ptrace::cont(self.tracee_pid, None).context("ptrace CONT failed")?;

        loop {
            match wait::waitpid(self.tracee_pid, None).context("waitpid failed")? {
                wait::WaitStatus::Exited(_, code) => {
                    log::debug!("tracee exited with {}", code);
                    return Ok(code);
                }
                wait::WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    if let Some(code) = self.handle_watchpoint_stop(sink)? {
                        return Ok(code);
                    }
                }
                wait::WaitStatus::Stopped(_, signal) => {
                    return Err(anyhow!("unexpected stop signal from tracee: {:?}", signal));
                }
                wait::WaitStatus::Signaled(_, signal, _) => {
                    return Err(anyhow!("tracee killed by {:?}", signal));
                }
                status => {
                    return Err(anyhow!("unexpected tracee status: {:?}", status));
                }
            }
        }
    }

    /// Services one watchpoint hit.
    ///
    /// The trap is delivered before the triggering instruction retires, so
    /// the access kind isn't knowable yet: single-step past the instruction,
    /// re-read the variable, and compare against the last observed value.
    /// Returns the tracee's exit code if it terminates inside the step.
    fn handle_watchpoint_stop(&mut self, sink: &mut dyn EventSink) -> Result<Option<i32>> {
        ptrace::step(self.tracee_pid, None).context("ptrace SINGLESTEP failed")?;

        match wait::waitpid(self.tracee_pid, None).context("waitpid failed")? {
            wait::WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            wait::WaitStatus::Exited(_, code) => {
                log::debug!("tracee exited with {} inside the step window", code);
                return Ok(Some(code));
            }
            status => {
                return Err(anyhow!("tracee did not stop after single-step: {:?}", status));
            }
        }

        let seen = read_watched(self.tracee_pid, self.watch_addr, self.tracer.symbol.width)?;
        let event = AccessEvent::observe(&self.tracer.symbol.name, self.last_value, seen);
        log::debug!("{:?}", event);

        sink.emit(&event)?;
        self.last_value = seen;

        ptrace::cont(self.tracee_pid, None).context("ptrace CONT failed")?;

        Ok(None)
    }
}

/// Returns the load base of the main executable image in the tracee, i.e. the
/// start of the first mapping backed by the target binary.
fn load_base(pid: Pid, binary_path: &str) -> Result<u64> {
    let target = Path::new(binary_path)
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", binary_path))?;

    let maps = proc_maps::get_process_maps(pid.as_raw() as proc_maps::Pid)
        .with_context(|| format!("failed to read the memory maps of pid {}", pid))?;

    maps.iter()
        .find(|map| map.filename().and_then(|p| p.file_name()) == Some(target))
        .map(|map| map.start() as u64)
        .ok_or_else(|| anyhow!("{} is not mapped in the tracee", binary_path))
}

/// Programs DR0/DR7 in the tracee's user area so that any data access of
/// `width` bytes at `addr` raises a SIGTRAP. Only slot 0 is used; DR1-DR3 and
/// their control fields stay zero.
fn arm_watchpoint(pid: Pid, addr: u64, width: WatchWidth) -> Result<()> {
    poke_user(pid, debugreg_offset(0), addr)?;
    // DR6 is sticky; discard hit bits that predate arming.
    poke_user(pid, debugreg_offset(6), 0)?;
    poke_user(pid, debugreg_offset(7), dr7_value(width))?;

    Ok(())
}

/// DR7 for slot 0: bit 0 is the local-enable bit, bits 16-17 the access kind
/// (0b11 = break on data read or write), bits 18-19 the length (0b11 = 4
/// bytes, 0b10 = 8 bytes).
fn dr7_value(width: WatchWidth) -> u64 {
    let len_bits: u64 = match width {
        WatchWidth::DWord => 0b11,
        WatchWidth::QWord => 0b10,
    };

    (len_bits << 18) | (0b11 << 16) | 0b1
}

fn debugreg_offset(reg: usize) -> u64 {
    (offset_of!(libc::user, u_debugreg) + reg * 8) as u64
}

fn poke_user(pid: Pid, offset: u64, value: u64) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            offset as *mut libc::c_void,
            value as *mut libc::c_void,
        )
    };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
    .with_context(|| format!("ptrace POKEUSER at user offset {:#x} failed", offset))
}

/// Reads the watched value out of the tracee with a single vectored read.
fn read_watched(pid: Pid, addr: u64, width: WatchWidth) -> Result<WatchValue> {
    let mut bytes = [0u8; 8];
    let len = width as usize;

    let local_iov = IoSliceMut::new(&mut bytes[..len]);
    let remote_iov = uio::RemoteIoVec {
        base: addr as usize,
        len,
    };

    let nread = uio::process_vm_readv(pid, &mut [local_iov], &[remote_iov])
        .with_context(|| format!("failed to read watched value at {:#x}", addr))?;
    if nread != len {
        return Err(anyhow!(
            "short read of watched value at {:#x}: {} of {} bytes",
            addr,
            nread,
            len
        ));
    }

    Ok(match width {
        WatchWidth::DWord => WatchValue::DWord(i32::from_le_bytes(bytes[..4].try_into()?)),
        WatchWidth::QWord => WatchValue::QWord(i64::from_le_bytes(bytes[..8].try_into()?)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_width_try_from() {
        assert_eq!(WatchWidth::try_from(4).unwrap(), WatchWidth::DWord);
        assert_eq!(WatchWidth::try_from(8).unwrap(), WatchWidth::QWord);

        for bad in &[0u64, 1, 2, 3, 5, 6, 7, 9, 16] {
            assert!(WatchWidth::try_from(*bad).is_err());
        }
    }

    #[test]
    fn test_dr7_encoding() {
        // Slot 0: local enable | break on read or write | 4- or 8-byte length.
        assert_eq!(dr7_value(WatchWidth::DWord), 0xf0001);
        assert_eq!(dr7_value(WatchWidth::QWord), 0xb0001);
    }

    #[test]
    fn test_debugreg_offsets_are_word_spaced() {
        assert_eq!(debugreg_offset(1) - debugreg_offset(0), 8);
        assert_eq!(debugreg_offset(7) - debugreg_offset(0), 56);
    }

    #[test]
    fn test_value_display_is_signed() {
        assert_eq!(WatchValue::DWord(-7).to_string(), "-7");
        assert_eq!(WatchValue::QWord(12).to_string(), "12");
        assert_eq!(WatchValue::DWord(i32::MIN).to_string(), "-2147483648");
    }

    #[test]
    fn test_observe_read() {
        let event = AccessEvent::observe("xd4", WatchValue::DWord(7), WatchValue::DWord(7));
        assert_eq!(
            event,
            AccessEvent::Read {
                symbol: "xd4".to_string(),
                value: WatchValue::DWord(7),
            }
        );
    }

    #[test]
    fn test_observe_write() {
        let event = AccessEvent::observe("xd8", WatchValue::QWord(11), WatchValue::QWord(12));
        match event {
            AccessEvent::Write { before, after, .. } => {
                assert_ne!(before, after);
                assert_eq!(before, WatchValue::QWord(11));
                assert_eq!(after, WatchValue::QWord(12));
            }
            other => panic!("expected a write event, got {:?}", other),
        }
    }
}
