use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::Lazy;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::debug;

static INTERRUPTED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

extern "C" fn raise_flag(_: nix::libc::c_int) {
    // only touches the atomic, the Lazy is forced before the handler is installed
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM into the returned flag. The run checks it between waves, the
/// backend cancels the units of a wave it is waiting on.
pub fn install() -> Result<Arc<AtomicBool>, nix::Error> {
    let flag = INTERRUPTED.clone();
    let action = SigAction::new(
        SigHandler::Handler(raise_flag),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores into an already initialized atomic
        unsafe { sigaction(signal, &action) }?;
        debug!("Installed handler for {signal:?}");
    }

    Ok(flag)
}
