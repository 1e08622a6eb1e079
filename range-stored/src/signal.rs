use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use range::error::CResult;

/// Installs the termination handlers. The signal-safe top half only sets
/// the shared shutdown flag; the supervisor's run loop is the bottom half
/// that notices it and tears the workers down.
pub fn install(shutdown: &Arc<AtomicBool>) -> CResult<()> {
    for sig in [
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGQUIT,
    ] {
        signal_hook::flag::register(sig, Arc::clone(shutdown))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    #[ignore = "raises a real signal; run alone"]
    fn sigterm_sets_the_flag() -> CResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        install(&shutdown)?;
        unsafe { libc::raise(libc::SIGTERM) };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(shutdown.load(Ordering::SeqCst));
        Ok(())
    }
}
