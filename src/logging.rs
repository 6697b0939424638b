//! Level macros that forward to `tracing` behind the `logging` feature.
//!
//! Without the feature every macro expands to nothing, so they may only be
//! used in statement position and their arguments are never evaluated.
//!
//! Levels as used by rankcall:
//!
//! - `trace`: one event per argument or frame region;
//! - `debug`: one event per call sent, applied or failed;
//! - `info`: node start and shutdown;
//! - `warn`: a posted call failed and nobody is waiting for the error;
//! - `error`: a reply could not be delivered.
//!
//! ```rust,ignore
//! use crate::logging::{debug, trace};
//!
//! debug!(function = handle.name(), dest, "sending invocation");
//! trace!(param = param.type_name, offset = at.offset(), "unmarshalling argument");
//! ```

// `$d` carries a literal `$` into the generated macro.
macro_rules! level {
    ($d:tt $name:ident => $level:ident) => {
        #[cfg(feature = "logging")]
        macro_rules! $name {
            ($d($d arg:tt)*) => { tracing::$level!($d($d arg)*) };
        }

        #[cfg(not(feature = "logging"))]
        macro_rules! $name {
            ($d($d arg:tt)*) => {};
        }
    };
}

level!($ log_trace => trace);
level!($ log_debug => debug);
level!($ log_info => info);
level!($ log_warn => warn);
level!($ log_error => error);

pub(crate) use log_debug as debug;
pub(crate) use log_error as error;
pub(crate) use log_info as info;
pub(crate) use log_trace as trace;
pub(crate) use log_warn as warn;
