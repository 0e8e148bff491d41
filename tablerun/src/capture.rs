//! Buffered diagnostics for agent attempts.
//!
//! Without `--debug`, an agent attempt runs under a scoped `tracing`
//! subscriber that writes into memory. The buffer is mailed if the attempt
//! fails and dropped otherwise.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing::Level;

/// Shared in-memory sink for a scoped fmt subscriber.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with every `tracing` event on this thread (debug and above)
/// redirected into a buffer; returns the result and the captured text.
pub fn capture<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = CaptureBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, buffer.contents())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, trace};

    #[test]
    fn events_inside_the_scope_are_captured() {
        let (value, text) = capture(|| {
            info!(table = "jobs", "claiming");
            debug!("settling");
            trace!("too chatty");
            7
        });
        assert_eq!(value, 7);
        assert!(text.contains("claiming"));
        assert!(text.contains("table=\"jobs\""));
        assert!(text.contains("settling"));
        assert!(!text.contains("too chatty"));
    }

    #[test]
    fn events_after_the_scope_are_not_captured() {
        let (_, first) = capture(|| info!("inside"));
        info!("outside");
        assert!(first.contains("inside"));
        assert!(!first.contains("outside"));
    }
}
