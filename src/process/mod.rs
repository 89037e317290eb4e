//! Multi-process worker utilities.
//!
//! Workers are independent OS processes sharing no memory or sockets after
//! the fork; each creates its own reactor. The parent must not have created
//! a reactor before forking, or the poller fd and its state would be
//! duplicated into every child.

#![cfg(unix)]

use std::collections::HashMap;
use std::io;

use tracing::{info, warn};

/// Returns the number of processors on this machine, defaulting to 1 when
/// detection fails.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or_else(|e| {
            warn!(error = %e, "could not detect number of processors; assuming 1");
            1
        })
}

/// Forks `num_workers` child processes (auto-detecting the core count when
/// `num_workers <= 0`).
///
/// Returns `Some(task_id)` in each child, with `task_id` between 0 and the
/// worker count; the child should create its reactor and proceed. In the
/// parent this call blocks reaping children: a child that exits abnormally
/// (signal or non-zero status) is restarted with the same task id, up to
/// `max_restarts` times across all workers, and the restarted process again
/// observes `Some(task_id)`. Once every child has exited normally the
/// parent observes `None`.
pub fn fork_workers(num_workers: i32, max_restarts: u32) -> io::Result<Option<usize>> {
    let count = if num_workers <= 0 {
        cpu_count()
    } else {
        num_workers as usize
    };
    info!(count, "starting worker processes");

    let mut children: HashMap<libc::pid_t, usize> = HashMap::new();
    for task_id in 0..count {
        if let Some(task_id) = spawn_worker(task_id, &mut children)? {
            return Ok(Some(task_id));
        }
    }

    let mut restarts = 0u32;
    while !children.is_empty() {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::wait(&mut status) };
        if pid < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        let Some(task_id) = children.remove(&pid) else {
            continue;
        };
        if libc::WIFSIGNALED(status) {
            warn!(
                task_id,
                pid,
                signal = libc::WTERMSIG(status),
                "worker killed by signal, restarting"
            );
        } else if libc::WEXITSTATUS(status) != 0 {
            warn!(
                task_id,
                pid,
                status = libc::WEXITSTATUS(status),
                "worker exited with error, restarting"
            );
        } else {
            info!(task_id, pid, "worker exited normally");
            continue;
        }
        restarts += 1;
        if restarts > max_restarts {
            return Err(io::Error::other("too many worker restarts"));
        }
        if let Some(task_id) = spawn_worker(task_id, &mut children)? {
            return Ok(Some(task_id));
        }
    }
    Ok(None)
}

/// Forks one worker. Returns `Some(task_id)` in the child, `None` in the
/// parent (after recording the child's pid).
fn spawn_worker(
    task_id: usize,
    children: &mut HashMap<libc::pid_t, usize>,
) -> io::Result<Option<usize>> {
    // SAFETY: single fork with no locks held by this thread; the child
    // proceeds straight into its own reactor setup.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        return Ok(Some(task_id));
    }
    children.insert(pid, task_id);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_count_is_positive() {
        assert!(cpu_count() >= 1);
    }
}
