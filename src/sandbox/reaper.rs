//! Per-step reaper for the subprocess backend
//!
//! The spawned step forks once more before exec. The program runs in the
//! forked child; the parent stays behind as a child subreaper, so every
//! process the program creates is reparented to it when orphaned, including
//! ones that called `setsid()` or `setpgid()`. When the program exits, or when
//! the backend sends [`TEARDOWN_SIGNAL`], the reaper kills and reaps all of its
//! remaining children and then exits with the program's status.
//!
//! Everything below runs between fork and exec: raw syscalls on stack buffers
//! only, no allocation and no locks.

use nix::errno::Errno;
use nix::libc;
use nix::sys::prctl;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, raise, signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

/// Signal the backend sends to the reaper to tear a running step down
pub const TEARDOWN_SIGNAL: Signal = Signal::SIGTERM;

/// Exit code of a reaper that was torn down before the program finished
const TORN_DOWN_EXIT: i32 = 128 + 9;

/// Split the pre-exec process into reaper and program.
///
/// Returns only in the program half, which goes on to exec.
///
/// # Safety
/// Must only be called from a `pre_exec` hook.
pub unsafe fn split() -> std::io::Result<()> {
    prctl::set_child_subreaper(true)?;

    // Blocked before the fork so no SIGCHLD or teardown request is lost
    let mut watched = SigSet::empty();
    watched.add(Signal::SIGCHLD);
    watched.add(TEARDOWN_SIGNAL);
    let mut previous = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&watched), Some(&mut previous))?;

    match fork()? {
        ForkResult::Child => {
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)?;
            Ok(())
        }
        ForkResult::Parent { child } => {
            // Drops the spawn error pipe among others; the parent waits on it
            close_inherited_fds();
            supervise(child, &watched)
        }
    }
}

fn supervise(program: Pid, watched: &SigSet) -> ! {
    loop {
        match watched.wait() {
            Ok(Signal::SIGCHLD) => {
                if let Some(status) = reap_exited(program) {
                    sweep();
                    exit_like(status);
                }
            }
            Ok(sig) if sig == TEARDOWN_SIGNAL => {
                sweep();
                // SAFETY: _exit is async-signal-safe
                unsafe { libc::_exit(TORN_DOWN_EXIT) }
            }
            _ => {}
        }
    }
}

/// Reap every exited child; report the program's status if it was among them
fn reap_exited(program: Pid) -> Option<WaitStatus> {
    let mut found = None;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                if status.pid() == Some(program) {
                    found = Some(status);
                }
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    found
}

/// Kill children until none are left.
///
/// Killing a child reparents its own children here, so each round picks up
/// the next generation.
fn sweep() {
    let me = getpid();
    loop {
        kill_children(me);
        match waitpid(Pid::from_raw(-1), None) {
            Err(Errno::ECHILD) => return,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// SIGKILL every live process whose parent is `parent`
fn kill_children(parent: Pid) {
    // SAFETY: NUL-terminated literal
    let fd = unsafe {
        libc::open(
            b"/proc\0".as_ptr().cast(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return;
    }

    let mut buf = [0u8; 4096];
    loop {
        // SAFETY: the kernel writes at most buf.len() bytes
        let n = unsafe { libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len()) };
        if n <= 0 {
            break;
        }
        for name in dirent_names(&buf[..n as usize]) {
            let Some(pid) = parse_pid(name) else { continue };
            if parent_of(pid) == Some(parent.as_raw()) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    // SAFETY: fd was opened above
    unsafe { libc::close(fd) };
}

/// Names in a `getdents64` buffer
///
/// Each record is `d_ino: u64, d_off: i64, d_reclen: u16, d_type: u8` followed
/// by the NUL-terminated name.
fn dirent_names(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let header = buf.get(offset..offset + 19)?;
        let reclen = u16::from_ne_bytes([header[16], header[17]]) as usize;
        if reclen < 20 {
            return None;
        }
        let record = buf.get(offset + 19..offset + reclen)?;
        offset += reclen;
        let end = record.iter().position(|&b| b == 0).unwrap_or(record.len());
        Some(&record[..end])
    })
}

fn parse_pid(name: &[u8]) -> Option<i32> {
    if name.is_empty() || !name.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(name).ok()?.parse().ok()
}

fn parent_of(pid: i32) -> Option<i32> {
    let path = stat_path(pid);
    // SAFETY: stat_path always leaves a trailing NUL
    let fd = unsafe { libc::open(path.as_ptr().cast(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return None;
    }
    let mut buf = [0u8; 512];
    // SAFETY: reads at most buf.len() bytes into buf
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    // SAFETY: fd was opened above
    unsafe { libc::close(fd) };
    if n <= 0 {
        return None;
    }
    parse_ppid(&buf[..n as usize])
}

/// `/proc/<pid>/stat` as a NUL-terminated path
fn stat_path(pid: i32) -> [u8; 32] {
    let mut path = [0u8; 32];
    let mut len = 0;
    for &b in b"/proc/" {
        path[len] = b;
        len += 1;
    }

    let mut digits = [0u8; 10];
    let mut count = 0;
    let mut rest = pid.unsigned_abs();
    loop {
        digits[count] = b'0' + (rest % 10) as u8;
        count += 1;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    for &d in digits[..count].iter().rev() {
        path[len] = d;
        len += 1;
    }

    for &b in b"/stat" {
        path[len] = b;
        len += 1;
    }
    path
}

/// Parent pid from a `/proc/<pid>/stat` line.
///
/// The command name may itself contain `)` or spaces, so fields are counted
/// from the last `)`.
fn parse_ppid(stat: &[u8]) -> Option<i32> {
    let close = stat.iter().rposition(|&b| b == b')')?;
    let rest = std::str::from_utf8(&stat[close + 1..]).ok()?;
    let mut fields = rest.split_ascii_whitespace();
    fields.next()?; // state
    fields.next()?.parse().ok()
}

fn close_inherited_fds() {
    // SAFETY: closes descriptors only; stdio stays open
    unsafe {
        if libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, 0u32) != 0 {
            for fd in 3..1024 {
                libc::close(fd);
            }
        }
    }
}

/// Exit the way the program did, so the backend sees its status
fn exit_like(status: WaitStatus) -> ! {
    match status {
        // SAFETY: _exit is async-signal-safe
        WaitStatus::Exited(_, code) => unsafe { libc::_exit(code) },
        WaitStatus::Signaled(_, sig, _) => {
            // No core dump of the reaper itself
            let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);
            // SAFETY: restoring the default disposition installs no handler
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
            let _ = raise(sig);
            unsafe { libc::_exit(128 + sig as i32) }
        }
        _ => unsafe { libc::_exit(1) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ppid_skips_odd_command_names() {
        assert_eq!(parse_ppid(b"4242 (sleep) S 17 4242 4242 0 -1"), Some(17));
        assert_eq!(parse_ppid(b"4242 (a) b (c) R 99 1 1 0"), Some(99));
        assert_eq!(parse_ppid(b"4242 (truncated"), None);
    }

    #[test]
    fn test_parse_pid_only_accepts_numeric_entries() {
        assert_eq!(parse_pid(b"1234"), Some(1234));
        assert_eq!(parse_pid(b"self"), None);
        assert_eq!(parse_pid(b"+12"), None);
        assert_eq!(parse_pid(b""), None);
    }

    #[test]
    fn test_stat_path_is_nul_terminated() {
        let path = stat_path(31337);
        let end = path.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&path[..end], b"/proc/31337/stat");
    }

    #[test]
    fn test_own_parent_is_found_through_proc() {
        let me = std::process::id() as i32;
        assert_eq!(parent_of(me), Some(std::os::unix::process::parent_id() as i32));
    }

    #[test]
    fn test_dirent_names_walks_records() {
        let mut buf = Vec::new();
        for name in [&b"."[..], b"1", b"self"] {
            let reclen = (19 + name.len() + 1 + 7) / 8 * 8;
            let mut record = vec![0u8; reclen];
            record[16..18].copy_from_slice(&(reclen as u16).to_ne_bytes());
            record[19..19 + name.len()].copy_from_slice(name);
            buf.extend_from_slice(&record);
        }
        let names: Vec<&[u8]> = dirent_names(&buf).collect();
        assert_eq!(names, vec![&b"."[..], b"1", b"self"]);
    }
}
