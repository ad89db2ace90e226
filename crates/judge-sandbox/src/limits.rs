//! Pre-exec setup for a sandboxed child: runs between `fork` and `exec`, so it must
//! stay async-signal-safe (no allocation, no locks, no logging).

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildLimits {
    pub cpu_seconds: u64,
    pub address_space_bytes: u64,
    pub open_files: u64,
    pub max_processes: u64,
    pub isolate_namespaces: bool,
}

fn set_limit(resource: libc::c_int, value: u64) -> std::io::Result<()> {
    let lim = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // The resource parameter type differs between libc targets.
    if unsafe { libc::setrlimit(resource as _, &lim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn apply_child_limits(limits: &ChildLimits) -> std::io::Result<()> {
    // Own process group: teardown signals the whole group, descendants included.
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    if limits.isolate_namespaces {
        // Only returns in the init process of the new PID namespace.
        enter_namespaces()?;
    }

    set_limit(libc::RLIMIT_CPU as libc::c_int, limits.cpu_seconds)?;
    set_limit(libc::RLIMIT_AS as libc::c_int, limits.address_space_bytes)?;
    set_limit(libc::RLIMIT_FSIZE as libc::c_int, 0)?;
    set_limit(libc::RLIMIT_NOFILE as libc::c_int, limits.open_files)?;
    set_limit(libc::RLIMIT_NPROC as libc::c_int, limits.max_processes)?;
    set_limit(libc::RLIMIT_CORE as libc::c_int, 0)?;
    Ok(())
}

#[cfg(target_os = "linux")]
const NAMESPACE_FLAGS: libc::c_int = libc::CLONE_NEWUSER
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC;

/// Unshares user, mount, PID, network and IPC namespaces, then forks so the caller
/// execs as init of the new PID namespace. Killing that init kills every process the
/// submission starts, including ones that called `setsid`.
///
/// The process that called this stays behind as a supervisor: it closes every
/// inherited descriptor, waits for the namespace init, and exits the same way.
#[cfg(target_os = "linux")]
pub(crate) fn enter_namespaces() -> std::io::Result<()> {
    if unsafe { libc::unshare(NAMESPACE_FLAGS) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()),
        0 => {
            if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) } != 0
            {
                return Err(std::io::Error::last_os_error());
            }
            seal_filesystem()
        }
        pid => supervise(pid),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn enter_namespaces() -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "namespaces are only available on linux",
    ))
}

#[cfg(target_os = "linux")]
const AT_RECURSIVE: libc::c_uint = 0x8000;
#[cfg(target_os = "linux")]
const MOUNT_ATTR_RDONLY: u64 = 0x1;
#[cfg(target_os = "linux")]
const MOUNT_ATTR_NOSUID: u64 = 0x2;

#[cfg(target_os = "linux")]
#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

/// Makes every mount visible to the child read-only. The child keeps the harness's
/// kernel uid, so this is what stops it from deleting or truncating host files.
#[cfg(target_os = "linux")]
fn seal_filesystem() -> std::io::Result<()> {
    let root = b"/\0".as_ptr().cast::<libc::c_char>();
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            root,
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Best effort: a fresh /proc hides host processes. Some container runtimes
    // refuse it; the host /proc is then left in place, read-only.
    unsafe {
        libc::mount(
            b"proc\0".as_ptr().cast(),
            b"/proc\0".as_ptr().cast(),
            b"proc\0".as_ptr().cast(),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            std::ptr::null(),
        );
    }

    let attr = MountAttr {
        attr_set: MOUNT_ATTR_RDONLY | MOUNT_ATTR_NOSUID,
        attr_clr: 0,
        propagation: 0,
        userns_fd: 0,
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mount_setattr,
            libc::AT_FDCWD,
            root,
            AT_RECURSIVE,
            &attr as *const MountAttr,
            std::mem::size_of::<MountAttr>(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn supervise(init: libc::pid_t) -> ! {
    // The spawn status pipe is among these; the harness's spawn waits for it to close.
    close_inherited_fds();

    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(init, &mut status, 0) };
        if rc == init {
            break;
        }
        if rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        unsafe { libc::_exit(127) }
    }

    if libc::WIFEXITED(status) {
        unsafe { libc::_exit(libc::WEXITSTATUS(status)) }
    }
    if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::kill(libc::getpid(), sig);
        }
    }
    unsafe { libc::_exit(127) }
}

#[cfg(target_os = "linux")]
fn close_inherited_fds() {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            0 as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        )
    };
    if rc == 0 {
        return;
    }
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let max = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } == 0
        && lim.rlim_max != libc::RLIM_INFINITY
    {
        lim.rlim_max.min(1 << 20) as libc::c_int
    } else {
        1 << 16
    };
    for fd in 0..max {
        unsafe {
            libc::close(fd);
        }
    }
}

/// SIGKILL the child's whole process group, then the child itself in case the group
/// was never formed. Under the namespaces backend the group holds the namespace init,
/// whose death takes every remaining process in the namespace with it.
pub(crate) fn kill_process_group(child: &mut std::process::Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

/// True for the signals our ceilings deliver: SIGXCPU from `RLIMIT_CPU`, SIGKILL from
/// the kernel OOM killer.
pub(crate) fn is_resource_signal(sig: i32) -> bool {
    sig == libc::SIGXCPU || sig == libc::SIGKILL
}
