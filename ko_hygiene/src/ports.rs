//! ABOUTME: Maps reserved listen ports to owning pids via procfs
//! ABOUTME: Best effort; failures yield an empty set rather than an error

use std::collections::HashSet;
use tracing::debug;

/// Pids of processes listening on any of the given ports
///
/// Linux-only: walks /proc/net/tcp{,6} for LISTEN sockets on the ports,
/// then matches socket inodes against /proc/<pid>/fd entries. Anywhere
/// that fails, the answer degrades to "nobody" rather than blocking a scan.
#[cfg(target_os = "linux")]
pub fn pids_listening_on(ports: &[u16]) -> HashSet<u32> {
    let inodes = listen_inodes(ports);
    if inodes.is_empty() {
        return HashSet::new();
    }
    pids_for_inodes(&inodes)
}

#[cfg(not(target_os = "linux"))]
pub fn pids_listening_on(_ports: &[u16]) -> HashSet<u32> {
    HashSet::new()
}

#[cfg(target_os = "linux")]
fn listen_inodes(ports: &[u16]) -> HashSet<u64> {
    const TCP_LISTEN: &str = "0A";
    let mut inodes = HashSet::new();

    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(contents) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // sl local_address rem_address st ... inode at index 9
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                continue;
            }
            let Some(port_hex) = fields[1].rsplit(':').next() else {
                continue;
            };
            let Ok(port) = u16::from_str_radix(port_hex, 16) else {
                continue;
            };
            if !ports.contains(&port) {
                continue;
            }
            if let Ok(inode) = fields[9].parse::<u64>() {
                inodes.insert(inode);
            }
        }
    }
    debug!(count = inodes.len(), "Reserved-port listen sockets found");
    inodes
}

#[cfg(target_os = "linux")]
fn pids_for_inodes(inodes: &HashSet<u64>) -> HashSet<u32> {
    let mut pids = HashSet::new();
    let Ok(proc_entries) = std::fs::read_dir("/proc") else {
        return pids;
    };

    for entry in proc_entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(fd_dir) else {
            continue; // other users' processes are unreadable, skip
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode_str) = target
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
            {
                if let Ok(inode) = inode_str.parse::<u64>() {
                    if inodes.contains(&inode) {
                        pids.insert(pid);
                        break;
                    }
                }
            }
        }
    }
    pids
}
