//! Process-tree termination.
//!
//! The engine forks CUDA worker children that must not be orphaned when an
//! instance stops. On Unix the engine child is spawned as the leader of its
//! own process group, so signalling the group reaches every descendant. On
//! Windows there is no group signal; the tree is taken down the way
//! `taskkill /T /F` does it — walk the system process table, gather the
//! subtree under the root pid, and terminate members deepest-first so
//! parents cannot respawn work while their children die.

use anyhow::Result;

/// Ask the tree rooted at `pid` to terminate (SIGTERM to its process group).
/// On Windows graceful termination is not distinguishable; this forces.
pub fn terminate_tree(pid: u32) -> Result<()> {
    #[cfg(unix)]
    return signal_group(pid, libc::SIGTERM);
    #[cfg(windows)]
    return force_kill_tree(pid);
    #[cfg(not(any(unix, windows)))]
    anyhow::bail!("tree termination not supported on this platform");
}

/// Forcibly kill the tree rooted at `pid` (SIGKILL to its process group).
pub fn kill_tree(pid: u32) -> Result<()> {
    #[cfg(unix)]
    return signal_group(pid, libc::SIGKILL);
    #[cfg(windows)]
    return force_kill_tree(pid);
    #[cfg(not(any(unix, windows)))]
    anyhow::bail!("tree termination not supported on this platform");
}

#[cfg(unix)]
fn signal_group(pid: u32, signum: libc::c_int) -> Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and valid signal number.
    // Negative pid addresses the whole process group led by `pid`.
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), signum) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH (3): No such process — already gone, treat as success.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}

/// Child pids of every live process, keyed by parent pid, from one Toolhelp
/// snapshot. The snapshot is a point-in-time view; a process that forks
/// between snapshot and termination can be missed, which is the same window
/// `taskkill /T` has.
#[cfg(windows)]
fn child_map() -> Result<std::collections::HashMap<u32, Vec<u32>>> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32First, Process32Next, PROCESSENTRY32,
        TH32CS_SNAPPROCESS,
    };

    let mut children: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
            .map_err(|e| anyhow::anyhow!("snapshot process table: {e}"))?;

        let mut entry = PROCESSENTRY32 {
            dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
            ..Default::default()
        };
        let mut more = Process32First(snapshot, &mut entry).is_ok();
        while more {
            children
                .entry(entry.th32ParentProcessID)
                .or_default()
                .push(entry.th32ProcessID);
            more = Process32Next(snapshot, &mut entry).is_ok();
        }
        let _ = CloseHandle(snapshot);
    }
    Ok(children)
}

#[cfg(windows)]
fn force_kill_tree(root_pid: u32) -> Result<()> {
    let children = child_map()?;

    // Depth-first, recording visit order; pid reuse means parent links can
    // form apparent cycles, so track what has been gathered.
    let mut ordered: Vec<u32> = Vec::new();
    let mut pending = vec![root_pid];
    while let Some(pid) = pending.pop() {
        if ordered.contains(&pid) {
            continue;
        }
        ordered.push(pid);
        if let Some(kids) = children.get(&pid) {
            pending.extend(kids.iter().copied());
        }
    }

    // Deepest entries were gathered last; kill in reverse so no parent
    // outlives its children.
    let mut first_failure: Option<anyhow::Error> = None;
    for &pid in ordered.iter().rev() {
        if let Err(e) = terminate_one(pid) {
            first_failure.get_or_insert(e);
        }
    }
    match first_failure {
        // A survivor anywhere in the tree means termination cannot be
        // confirmed; the caller escalates or abandons.
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(windows)]
fn terminate_one(pid: u32) -> Result<()> {
    use windows::Win32::Foundation::{CloseHandle, ERROR_INVALID_PARAMETER};
    use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = match OpenProcess(PROCESS_TERMINATE, false, pid) {
            Ok(handle) => handle,
            // An unopenable pid has already exited; anything else (access
            // denied, protected process) leaves a live survivor.
            Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => return Ok(()),
            Err(e) => anyhow::bail!("open process {pid}: {e}"),
        };
        let result = TerminateProcess(handle, 1);
        let _ = CloseHandle(handle);
        result.map_err(|e| anyhow::anyhow!("terminate process {pid}: {e}"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn killing_a_dead_group_is_not_an_error() {
        // A process group that no longer exists reports ESRCH, which both
        // entry points treat as success.
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(kill_tree(pid).is_ok());
        assert!(terminate_tree(pid).is_ok());
    }
}
