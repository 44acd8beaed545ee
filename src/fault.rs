//! Detection of the long-poll "poll status" transport fault.
//!
//! The long-poll fallback is known to fail with a malformed poll status that
//! can surface as a structured error callback, an unhandled panic, or a raw
//! error log line. All three channels funnel through the signature filter
//! here into one recovery signal; the connection manager drains it and runs
//! the dedicated recovery path instead of generic error handling.
//!
//! The guard is installed once per process and does exactly one thing:
//! match the signature, forward the text. It is not a general logging or
//! panic override.

use std::sync::Once;

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;

/// Case-sensitive substrings identifying the poll-status fault class.
const POLL_STATUS_SIGNATURES: [&str; 2] = ["unhandled poll status", "Unhandled poll status"];

static FAULT_TX: OnceCell<mpsc::UnboundedSender<String>> = OnceCell::new();
static GUARD_INSTALL: Once = Once::new();

/// True if the error text carries the poll-status fault signature.
pub fn is_poll_status_fault(text: &str) -> bool {
    POLL_STATUS_SIGNATURES.iter().any(|sig| text.contains(sig))
}

/// Entry point for structured error paths (socket error callbacks, logging
/// layers). Matching text is forwarded to the recovery task; anything else
/// is ignored. Returns `true` if the text was recognized and forwarded.
pub fn report_error_text(text: &str) -> bool {
    if !is_poll_status_fault(text) {
        return false;
    }
    if let Some(tx) = FAULT_TX.get() {
        if tx.send(text.to_string()).is_ok() {
            tracing::warn!("poll status fault detected, routing to recovery");
            return true;
        }
    }
    tracing::warn!("poll status fault detected but no recovery task is listening");
    false
}

/// Install the process-wide guard and return the receiving end of the
/// recovery signal. Only the first call installs and receives; later calls
/// get `None` (the guard and its funnel already exist).
pub fn install_guard() -> Option<mpsc::UnboundedReceiver<String>> {
    let mut receiver = None;

    GUARD_INSTALL.call_once(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        // call_once guarantees a single set.
        let _ = FAULT_TX.set(tx);
        receiver = Some(rx);

        // Chain onto the existing panic hook so a fault surfacing as an
        // unhandled panic is still routed into recovery.
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let text = panic_message(info);
            if is_poll_status_fault(&text) {
                report_error_text(&text);
            }
            previous(info);
        }));
    });

    receiver
}

fn panic_message(info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        String::new()
    }
}
