//! Root logger construction helpers.

use slog::{Drain, Logger};

/// Create a logger that writes human-readable output to stdout.
pub fn console() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!())
}

/// Create a logger that discards everything. Used in tests.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}
