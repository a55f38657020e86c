//! Crash reporting
//!
//! Installs observers for fatal signals and panics. Each observer records
//! which fault occurred and then lets the default behavior run, so the OS
//! still produces its core dump or crash report. Nothing here ever tries to
//! resume execution.

use std::sync::Once;

static PANIC_HOOK: Once = Once::new();

/// Signals treated as fatal engine crashes
#[cfg(unix)]
pub const FATAL_SIGNALS: [libc::c_int; 4] = [libc::SIGSEGV, libc::SIGABRT, libc::SIGILL, libc::SIGFPE];

/// Human-readable name of a fatal signal
#[cfg(unix)]
pub fn signal_name(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        _ => "UNKNOWN",
    }
}

/// Line written to stderr when a fatal signal arrives.
///
/// Static strings only: the handler must not allocate.
#[cfg(unix)]
fn crash_line(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGSEGV => "CRITICAL ENGINE CRASH: SIGSEGV\n",
        libc::SIGABRT => "CRITICAL ENGINE CRASH: SIGABRT\n",
        libc::SIGILL => "CRITICAL ENGINE CRASH: SIGILL\n",
        libc::SIGFPE => "CRITICAL ENGINE CRASH: SIGFPE\n",
        _ => "CRITICAL ENGINE CRASH: UNKNOWN\n",
    }
}

#[cfg(unix)]
extern "C" fn on_fatal_signal(signum: libc::c_int) {
    let line = crash_line(signum);
    // SAFETY: write, signal and raise are async-signal-safe.
    unsafe {
        libc::write(libc::STDERR_FILENO, line.as_ptr().cast(), line.len());
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

/// Installs the fatal-signal handlers and, once per process, the panic hook.
///
/// Safe to call repeatedly; every call re-registers the signal handlers in
/// case something else replaced them in between.
pub fn install() {
    #[cfg(unix)]
    for signum in FATAL_SIGNALS {
        let handler = on_fatal_signal as extern "C" fn(libc::c_int);
        // SAFETY: the handler only performs async-signal-safe calls.
        let previous = unsafe { libc::signal(signum, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            tracing::warn!("Could not install crash handler for {}", signal_name(signum));
        }
    }

    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown location".to_string());
            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!("CRITICAL ENGINE PANIC at {}: {}", location, message);
            previous(info);
        }));
        tracing::debug!("Crash reporter installed");
    });
}
