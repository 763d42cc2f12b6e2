/// Opt-in `tracing` subscriber for hosts that do not install their own.
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, Result};

pub const DEFAULT_FILTER: &str = "info";

/// Install a stderr subscriber filtered by `directive` (e.g. `"debug"` or
/// `"embedder_bridge=trace"`).
///
/// Fails if the directive does not parse or a global subscriber is already
/// set.
pub fn init(directive: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directive)
        .map_err(|e| BridgeError::invalid(format!("log filter {directive:?}: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| BridgeError::Logging(format!("a global subscriber is already set: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_directive_rejected() {
        let err = init("embedder_bridge=notalevel").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)), "got: {err}");
    }

    #[test]
    fn test_second_init_is_not_an_argument_error() {
        // Only the first successful init in the test binary installs a
        // subscriber, so at least the second call must fail.
        let first = init(DEFAULT_FILTER);
        let err = init(DEFAULT_FILTER).unwrap_err();
        assert!(matches!(err, BridgeError::Logging(_)), "got: {err}");
        assert!(err.to_string().starts_with("logging setup failed"));
        if let Err(e) = first {
            assert!(matches!(e, BridgeError::Logging(_)), "got: {e}");
        }
    }
}
