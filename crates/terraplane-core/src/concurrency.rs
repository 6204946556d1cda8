use std::sync::atomic::{AtomicUsize, Ordering};

static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

/// Install a Ctrl-C handler that raises the shutdown flag.
///
/// Further Ctrl-Cs never exit the process: tools run in their own process
/// group and only the owning worker can terminate them and release the
/// workspace lock. Only the first call in a process installs a handler.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if record_interrupt(&INTERRUPTS) == 1 {
            eprintln!("\nshutdown requested, cancelling running requests...");
        } else {
            eprintln!("\nstill cancelling, waiting for running tools to terminate...");
        }
    });
}

/// Count one interrupt; returns how many have been seen so far.
fn record_interrupt(counter: &AtomicUsize) -> usize {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

pub fn shutdown_requested() -> bool {
    INTERRUPTS.load(Ordering::SeqCst) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_not_requested_by_default() {
        install_signal_handler();
        assert!(!shutdown_requested());
    }

    #[test]
    fn repeated_interrupts_only_count() {
        let counter = AtomicUsize::new(0);
        assert_eq!(record_interrupt(&counter), 1);
        assert_eq!(record_interrupt(&counter), 2);
        assert_eq!(record_interrupt(&counter), 3);
        assert!(counter.load(Ordering::SeqCst) > 0);
    }
}
