use crate::sync::CancellationToken;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
    low_level::emulate_default_handler,
};
use std::{
    io,
    thread::{self, JoinHandle},
};
use tracing::{error, warn};

/// Cancel `token` on the first SIGINT or SIGTERM
///
/// Running jobs then abort at the next cancellation point and their records are persisted.
/// A second signal terminates the process the way it would without the handler.
pub fn cancel_on_signals(token: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("shutdown".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                if token.is_cancelled() {
                    error!(signal, "Received a second shutdown signal, exiting immediately");
                    if let Err(error) = emulate_default_handler(signal) {
                        error!(error = ?error, "Failed to exit on signal {signal}");
                    }
                    continue;
                }

                warn!(signal, "Received shutdown signal, finishing the current step");
                token.cancel();
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::low_level::raise;
    use std::time::Duration;

    #[test]
    fn first_signal_cancels_the_token() {
        let token = CancellationToken::new();
        cancel_on_signals(token.clone()).unwrap();

        raise(SIGTERM).unwrap();

        // the handler thread cancels asynchronously
        for _ in 0..100 {
            if token.is_cancelled() {
                break;
            }
            token.sleep(Duration::from_millis(10));
        }
        assert!(token.is_cancelled());
    }
}
