//! Logger initialization for embedders.
//!
//! The library only emits records through the `log` facade. Hosts that do not
//! already install a logger can call [`init_logging`] once at startup.

use log::LevelFilter;

/// Tag used for Android logcat output.
#[cfg(target_os = "android")]
const LOG_TAG: &str = "VncMux-Rust";

/// Installs a logging backend with the given maximum level.
///
/// On Android this routes to logcat through `android_logger`; everywhere else
/// `env_logger` is used, still honoring `RUST_LOG` overrides. Calling this more
/// than once is harmless.
pub fn init_logging(level: LevelFilter) {
    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag(LOG_TAG),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        // Already initialized (e.g. by another test) is fine
        let _ = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .is_test(cfg!(test))
            .try_init();
    }
}
