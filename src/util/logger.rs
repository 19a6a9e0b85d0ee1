//! The built-in logger.
//!
//! The crate logs through the `log` facade, and the embedding runtime is free
//! to install any logger implementation. With the default `builtin_env_logger`
//! feature, [`try_initialize`] installs an `env_logger` configured from the
//! `MANTLE_LOG` environment variable (default level: `warn`) so the library
//! produces output without any setup. Disable the feature to strip the
//! dependency and leave logger installation entirely to the embedder.

/// Attempt to initialize the built-in logger once. Does nothing if another
/// logger is already installed, or if the feature is disabled.
pub fn try_initialize() {
    #[cfg(feature = "builtin_env_logger")]
    {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let env = env_logger::Env::default().filter_or("MANTLE_LOG", "warn");
            if env_logger::Builder::from_env(env).try_init().is_ok() {
                debug!("built-in env_logger initialized");
            }
        });
    }
}
