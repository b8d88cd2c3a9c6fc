use std::sync::atomic::AtomicBool;
use tracing::debug;

static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Set once SIGINT or SIGTERM arrives. The campaign only looks at it
/// between iterations, so the iteration in flight always completes.
pub fn cancel_flag() -> &'static AtomicBool {
    &CANCEL_REQUESTED
}

pub fn install() {
    #[cfg(unix)]
    {
        extern "C" fn request_cancel(_: libc::c_int) {
            CANCEL_REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        unsafe {
            libc::signal(libc::SIGINT, request_cancel as libc::sighandler_t);
            libc::signal(libc::SIGTERM, request_cancel as libc::sighandler_t);
        }
        debug!("Signal handlers installed");
    }
    #[cfg(not(unix))]
    debug!("Signal handling unavailable on this platform");
}
