//! Pluggable diagnostic sink backing this crate's `error!`/`warn!`/`info!`/
//! `debug!` macros.
//!
//! This stands in for the VESA framebuffer writer the rest of this
//! codebase uses for its own `println!`/`error!`/`info!` macros: same
//! call shape (an optional leading context literal), but backed by
//! whatever sink the embedder installs instead of a display.

use core::fmt::Arguments;

use spin::Once;

/// Severity of a diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

/// Receives formatted diagnostic lines from this crate.
///
/// Implementations are expected to be cheap to call repeatedly and safe to
/// invoke while `fs_lock` is held; this crate calls `DiagSink` from inside
/// locked sections.
pub trait DiagSink: Sync {
    fn write_line(&self, level: Level, target: &str, args: Arguments<'_>);
}

static SINK: Once<&'static dyn DiagSink> = Once::new();

/// Install the process-wide diagnostic sink. Calling this more than once
/// has no effect after the first call.
pub fn set_sink(sink: &'static dyn DiagSink) {
    SINK.call_once(|| sink);
}

#[doc(hidden)]
pub fn dispatch(level: Level, target: &str, args: Arguments<'_>) {
    if let Some(sink) = SINK.get() {
        sink.write_line(level, target, args);
    }
}

#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Error, $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Error, "", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Warn, $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Warn, "", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Info, $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Info, "", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Debug, $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::diag::dispatch($crate::diag::Level::Debug, "", format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::sync::Arc;
    use spin::Mutex;

    struct VecSink(Arc<Mutex<alloc::vec::Vec<String>>>);

    impl DiagSink for VecSink {
        fn write_line(&self, level: Level, target: &str, args: Arguments<'_>) {
            self.0
                .lock()
                .push(alloc::format!("[{:?}] {}: {}", level, target, args));
        }
    }

    #[test]
    fn dispatch_without_sink_is_noop() {
        // No sink installed in this isolated call; must not panic.
        dispatch(Level::Info, "test", format_args!("hello"));
    }
}
