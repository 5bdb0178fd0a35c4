//! ---
//! ads_section: "03-logging"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Structured logging context shared by adapters and hosts."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
/// Emit an informational log enriched with adapter context.
#[macro_export]
macro_rules! ads_info {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::INFO,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::INFO,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a debug log enriched with adapter context.
#[macro_export]
macro_rules! ads_debug {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::DEBUG,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::DEBUG,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a warning log enriched with adapter context.
#[macro_export]
macro_rules! ads_warn {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::WARN,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::WARN,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an error log enriched with adapter context.
#[macro_export]
macro_rules! ads_error {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::ERROR,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::ERROR,
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}
