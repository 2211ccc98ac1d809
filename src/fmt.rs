//! Logging macros used throughout the crate.
//!
//! On hardware the firmware logs through `defmt` over RTT. Host builds can opt into the
//! `log` facade instead; with neither feature enabled the macros only type-check their
//! arguments so unit tests link without a global logger.
#![allow(unused_macros)]

macro_rules! log_dispatch {
    ($level:ident, $($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::$level!($($arg)*);
        #[cfg(all(feature = "log", not(feature = "defmt")))]
        ::log::$level!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "log")))]
        discard!($($arg)*);
    }};
}

macro_rules! discard {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        let _ = $fmt;
        $( let _ = &$arg; )*
    }};
}

macro_rules! trace {
    ($($arg:tt)*) => { log_dispatch!(trace, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { log_dispatch!(debug, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { log_dispatch!(info, $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { log_dispatch!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { log_dispatch!(error, $($arg)*) };
}

#[cfg(test)]
mod tests {
    #[test]
    fn every_level_accepts_format_arguments() {
        let register = 0x13u8;
        trace!("trace {}", register);
        debug!("debug {:#x}", register);
        info!("info {}", register,);
        warn!("warn {:?}", Some(register));
        error!("error");
    }
}
