//! Tracing subscriber setup for embedders and tests.

use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a formatting subscriber filtered by `RUST_LOG`. Returns `false`
/// and leaves the existing subscriber in place when one is already set.
pub fn init_tracing() -> bool {
    match tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
    {
        Ok(()) => true,
        Err(err) => {
            debug!("Tracing subscriber already installed: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_keeps_existing_subscriber() {
        init_tracing();
        assert!(!init_tracing());
        debug!("tracing initialized twice without panicking");
    }
}
