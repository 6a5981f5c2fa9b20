//! Private socket path generation.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Portable floor of `sockaddr_un.sun_path` across the platforms we build
/// for (104 on the BSDs and macOS, 108 on Linux).
const SUN_PATH_MAX: usize = 104;

static NEXT_SUFFIX: AtomicU32 = AtomicU32::new(0);

/// A fresh, collision-resistant socket path under the temp directory.
///
/// Between generating the name and binding it, another process could in
/// principle create the file; that is safe, the bind simply fails and the
/// monitor exits before anything was spawned.
pub fn socket_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let suffix = NEXT_SUFFIX.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "retguard-{}-{nanos:x}{suffix}.sock",
        std::process::id()
    ))
}

/// Reject paths the kernel's address structure would truncate.
pub fn check_addr_len(path: &Path) -> io::Result<()> {
    if path.as_os_str().len() >= SUN_PATH_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "socket path `{}` exceeds the {SUN_PATH_MAX}-byte socket address limit",
                path.display()
            ),
        ));
    }
    Ok(())
}
