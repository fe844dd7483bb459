/// Process Tree Reaper - Descendant Cleanup for Sandboxed Runs
///
/// A process group alone does not contain a submission: a child that calls
/// `setsid()` leaves the group and survives `killpg`. On Linux two things
/// close that gap:
///
/// 1. Every sandbox root is made a child subreaper before exec, so anything
///    it forks stays in its tree while it runs, however it detaches.
/// 2. The host is made a child subreaper too, so once a root has exited its
///    leftovers come back to the host instead of init.
///
/// Cleanup then walks `/proc`: `kill_descendants` while the root is alive,
/// `sweep_orphans` after it has been reaped.
///
/// Invariant: every child the host spawns goes through the engine and is
/// registered in `LIVE_ROOTS` for as long as it runs. Any other direct child
/// of the host is a leftover and gets killed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, Once, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on kill passes; each pass waits `PASS_INTERVAL`
const MAX_PASSES: usize = 50;

const PASS_INTERVAL: Duration = Duration::from_millis(2);

static LIVE_ROOTS: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();

static HOST_SUBREAPER: Once = Once::new();

/// Registry of sandbox roots currently owned by the engine.
///
/// Hold the guard across `spawn` so a concurrent sweep never sees an
/// unregistered root.
pub fn live_roots() -> MutexGuard<'static, HashSet<i32>> {
    LIVE_ROOTS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Make the host adopt orphaned sandbox processes (once per process)
pub fn adopt_orphans() {
    HOST_SUBREAPER.call_once(|| {
        if let Err(e) = set_child_subreaper() {
            warn!(
                error = %e,
                "Could not become child subreaper; detached sandbox processes may escape cleanup"
            );
        }
    });
}

/// Mark the calling process as a child subreaper. Also called in the sandbox
/// child between fork and exec; the flag survives exec.
#[cfg(target_os = "linux")]
pub fn set_child_subreaper() -> std::io::Result<()> {
    let on: libc::c_ulong = 1;
    let unused: libc::c_ulong = 0;
    // SAFETY: only flips a flag on the calling process; async-signal-safe.
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, on, unused, unused, unused) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_child_subreaper() -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    zombie: bool,
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are read after the last `)`.
fn parse_stat(stat: &str) -> Option<ProcEntry> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let pid = stat[..open].trim().parse().ok()?;
    let mut rest = stat[close + 1..].split_whitespace();
    let state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcEntry {
        pid,
        ppid,
        zombie: state == "Z" || state == "X",
    })
}

#[cfg(target_os = "linux")]
fn process_table() -> Vec<ProcEntry> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn process_table() -> Vec<ProcEntry> {
    Vec::new()
}

/// Tasks (threads included) owned by the current real uid, which is what
/// `RLIMIT_NPROC` counts against
#[cfg(target_os = "linux")]
pub fn user_task_count() -> u64 {
    // SAFETY: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("status")).ok())
        .filter_map(|status| owned_threads(&status, uid))
        .sum()
}

/// Thread count from `/proc/<pid>/status` when the real uid matches
fn owned_threads(status: &str, uid: u32) -> Option<u64> {
    let mut real_uid = None;
    let mut threads = None;
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("Uid:") {
            real_uid = value.split_whitespace().next().and_then(|v| v.parse::<u32>().ok());
        } else if let Some(value) = line.strip_prefix("Threads:") {
            threads = value.trim().parse::<u64>().ok();
        }
    }
    (real_uid? == uid).then_some(threads?)
}

/// Living (non-zombie) descendants of `root`, excluding `root` itself
fn descendants(table: &[ProcEntry], root: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<&ProcEntry>> = HashMap::new();
    for entry in table {
        children.entry(entry.ppid).or_default().push(entry);
    }

    let mut found = Vec::new();
    let mut stack = vec![root];
    let mut seen = HashSet::from([root]);
    while let Some(pid) = stack.pop() {
        for child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child.pid) {
                if !child.zombie {
                    found.push(child.pid);
                }
                stack.push(child.pid);
            }
        }
    }
    found
}

fn sigkill(pid: i32) {
    // SAFETY: kill has no memory-safety preconditions; ESRCH is ignored.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

/// Kill everything below a still-running root. Repeats until a pass finds
/// nothing, so processes forked mid-sweep are caught by the next pass.
pub fn kill_descendants(root: i32) -> usize {
    let mut killed = HashSet::new();
    for _ in 0..MAX_PASSES {
        let found = descendants(&process_table(), root);
        if found.is_empty() {
            break;
        }
        for pid in found {
            sigkill(pid);
            killed.insert(pid);
        }
        std::thread::sleep(PASS_INTERVAL);
    }
    if !killed.is_empty() {
        debug!(root, killed = killed.len(), "Killed sandbox descendants");
    }
    killed.len()
}

/// Kill and reap host children that are not live sandbox roots
pub fn sweep_orphans() -> usize {
    let host = std::process::id() as i32;
    let roots = live_roots();
    let mut swept = HashSet::new();

    for pass in 0..MAX_PASSES {
        let orphans: Vec<ProcEntry> = process_table()
            .into_iter()
            .filter(|entry| entry.ppid == host && !roots.contains(&entry.pid))
            .collect();
        if orphans.is_empty() {
            break;
        }
        for orphan in orphans {
            if !orphan.zombie {
                sigkill(orphan.pid);
            }
            swept.insert(orphan.pid);
            let mut status = 0;
            // SAFETY: `status` is a valid out-pointer; WNOHANG never blocks.
            unsafe {
                libc::waitpid(orphan.pid, &mut status, libc::WNOHANG);
            }
        }
        if pass + 1 == MAX_PASSES {
            warn!(remaining = swept.len(), "Orphan sweep gave up");
        }
        std::thread::sleep(PASS_INTERVAL);
    }

    if !swept.is_empty() {
        debug!(swept = swept.len(), "Reaped orphaned sandbox processes");
    }
    swept.len()
}

/// True while `pid` exists and has not exited
#[cfg(test)]
pub fn process_running(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_stat(&stat))
        .is_some_and(|entry| !entry.zombie)
}

/// Poll for up to two seconds until `pid` is gone
#[cfg(test)]
pub async fn wait_until_gone(pid: i32) -> bool {
    for _ in 0..100 {
        if !process_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_threads() {
        let status = "Name:\tpython3\nState:\tS (sleeping)\nUid:\t1000\t1000\t1000\t1000\nThreads:\t3\n";
        assert_eq!(owned_threads(status, 1000), Some(3));
        assert_eq!(owned_threads(status, 0), None);
        assert_eq!(owned_threads("Name:\tkworker\n", 1000), None);
    }

    #[test]
    fn test_parse_stat_with_odd_command_name() {
        let entry = parse_stat("4242 (we ird) (name)) S 17 4242 4242 0 -1 4194560").unwrap();
        assert_eq!(
            entry,
            ProcEntry {
                pid: 4242,
                ppid: 17,
                zombie: false
            }
        );

        let zombie = parse_stat("99 (sleep) Z 1 99 99").unwrap();
        assert!(zombie.zombie);

        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_descendants_walks_whole_tree() {
        let entry = |pid, ppid, zombie| ProcEntry { pid, ppid, zombie };
        let table = vec![
            entry(10, 1, false),
            entry(11, 10, false),
            entry(12, 11, false),
            entry(13, 11, true),
            entry(14, 13, false),
            entry(20, 1, false),
            entry(21, 20, false),
        ];

        let mut found = descendants(&table, 10);
        found.sort();
        assert_eq!(found, vec![11, 12, 14]);
        assert!(descendants(&table, 12).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_table_sees_self() {
        let me = std::process::id() as i32;
        assert!(process_table().iter().any(|e| e.pid == me));
    }
}
