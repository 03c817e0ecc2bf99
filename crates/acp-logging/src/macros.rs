//! ---
//! acp_section: "03-logging"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Structured logging adapters and sinks."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Context-enriched logging macros.

/// Shared expansion used by the level-specific macros.
#[doc(hidden)]
#[macro_export]
macro_rules! __acp_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            transport = ctx.transport.unwrap_or(""),
            endpoint = ctx.endpoint.unwrap_or(""),
            peer = ctx.peer.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with transport context.
#[macro_export]
macro_rules! acp_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with transport context.
#[macro_export]
macro_rules! acp_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with transport context.
#[macro_export]
macro_rules! acp_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with transport context.
#[macro_export]
macro_rules! acp_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__acp_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
