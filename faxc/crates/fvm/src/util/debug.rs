//! Debug Utilities
//!
//! Helper functions for diagnostics and thread dumps.

/// Debug formatter for memory addresses
pub fn format_address(address: usize) -> String {
    format!("0x{:016X}", address)
}

/// Trace macro for very chatty paths
#[macro_export]
macro_rules! trace_sync {
    ($($arg:tt)*) => {
        if cfg!(feature = "trace") {
            log::trace!($($arg)*);
        }
    };
}
