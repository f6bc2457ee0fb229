//! Thread and fiber introspection helpers.

use std::cell::Cell;
use std::ffi::CString;

thread_local! {
    static THREAD_ID: Cell<u64> = Cell::new(0);
}

/// OS id of the calling thread (`gettid`, not `pthread_self`). Cached
/// per thread after the first call.
pub fn thread_id() -> u64 {
    THREAD_ID
        .try_with(|c| {
            let mut id = c.get();
            if id == 0 {
                id = os_thread_id();
                c.set(id);
            }
            id
        })
        // The cache is gone during thread-local destruction; ask the OS.
        .unwrap_or_else(|_| os_thread_id())
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u64 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// Id of the fiber currently executing on the calling thread, or 0 when
/// the thread has not touched the fiber machinery yet.
#[inline]
pub fn fiber_id() -> u64 {
    crate::fiber::try_current().map(|f| f.id()).unwrap_or(0)
}

/// Renames the calling thread. Worker threads are named through
/// `thread::Builder`; the caller thread in caller mode goes through here.
pub(crate) fn set_thread_name(name: &str) {
    let Ok(cname) = CString::new(name) else {
        return;
    };
    #[cfg(target_os = "linux")]
    unsafe {
        // Silently truncated by the kernel past 15 bytes.
        libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
    }
    #[cfg(not(target_os = "linux"))]
    let _ = cname;
}

#[cfg(test)]
mod tests {
    use super::thread_id;

    #[test]
    fn thread_id_is_stable_within_a_thread() {
        assert_eq!(thread_id(), thread_id());
    }

    #[test]
    fn thread_id_differs_across_threads() {
        let here = thread_id();
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
