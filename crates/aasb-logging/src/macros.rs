//! ---
//! aasb_section: "03-logging"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Structured logging adapters for message routing."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Context-aware logging macros.
//!
//! Each macro accepts an optional `context = <LogContext>` prefix followed by
//! regular `format!` arguments.

/// Internal helper shared by the level-specific macros.
#[doc(hidden)]
#[macro_export]
macro_rules! __aasb_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            topic = ctx.topic.unwrap_or(""),
            action = ctx.action.unwrap_or(""),
            message_id = ctx.message_id.unwrap_or(""),
            stream_id = ctx.stream_id.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a debug log enriched with envelope context.
#[macro_export]
macro_rules! aasb_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an informational log enriched with envelope context.
#[macro_export]
macro_rules! aasb_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with envelope context.
#[macro_export]
macro_rules! aasb_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with envelope context.
#[macro_export]
macro_rules! aasb_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__aasb_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
