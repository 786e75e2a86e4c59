use log::SetLoggerError;
use std::sync::Once;

static INIT: Once = Once::new();

/// Install the built-in logger the first time any heap is built in this
/// process. Later heaps reuse it. A logger installed by the embedder wins.
pub(crate) fn init() {
    INIT.call_once(|| match try_init() {
        Ok(()) => debug!("genheap: env_logger installed"),
        Err(e) => debug!("genheap: using the existing logger ({})", e),
    });
}

/// Attempt to init an env_logger with `info` as the default filter.
/// Does nothing if the "builtin_env_logger" feature is disabled.
fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}
