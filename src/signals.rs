//! Ctrl-C handling: SIGINT cancels the running exchange instead of killing
//! the process.

use std::io;
use std::thread::{self, JoinHandle};

use signal_hook::iterator::{Handle, Signals};

use crate::session::Canceller;

/// Stops the SIGINT listener thread when dropped.
pub struct InterruptGuard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn install_interrupt_handler(canceller: Canceller) -> io::Result<InterruptGuard> {
    let mut signals = Signals::new([libc::SIGINT])?;
    let handle = signals.handle();

    let thread = thread::Builder::new()
        .name("shellmate-sigint".to_string())
        .spawn(move || {
            for _ in signals.forever() {
                tracing::info!("interrupt received; cancelling current exchange");
                canceller.cancel();
            }
        })?;

    Ok(InterruptGuard {
        handle,
        thread: Some(thread),
    })
}
