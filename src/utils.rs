use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indicatif::ProgressStyle;

// A panicking task body is caught at the node boundary, so a poisoned lock
// still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn get_style_run() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

pub(crate) fn get_style_task() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?)
}

/// Installs a `tracing` subscriber that prints through the progress bars.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Calling this
/// more than once is harmless: later calls leave the first subscriber in place.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init();

    if let Err(e) = result {
        tracing::debug!("logging already initialised: {e}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_styles_parse() {
        assert!(get_style_run().is_ok());
        assert!(get_style_task().is_ok());
    }

    #[test]
    fn test_poisoned_lock_recovers() {
        let mutex = Mutex::new(1);
        let _ = std::panic::catch_unwind(|| {
            let _guard = mutex.lock().unwrap();
            panic!("poison");
        });

        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 1);
    }
}
