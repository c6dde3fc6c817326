//! Structured log macros with the field names used across the gateway.
//!
//! Every event carries a `component` field; route, client and table events
//! add `route`, `client_id`, `observable_id` or `channel_id` so one filter
//! finds every line about the same subscription.

/// Log an event for a component.
///
/// ```rust
/// qs_telemetry::log_event!(info, "registry", "route installed", route = "region");
/// ```
#[macro_export]
macro_rules! log_event {
    ($level:ident, $component:expr, $msg:expr $(, $($field:tt)*)?) => {
        $crate::__private::tracing::$level!(
            component = $component,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an event about a route.
#[macro_export]
macro_rules! log_route_event {
    ($level:ident, $component:expr, $msg:expr, $route:expr $(, $($field:tt)*)?) => {
        $crate::__private::tracing::$level!(
            component = $component,
            route = %$route,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an event about one connected client.
#[macro_export]
macro_rules! log_client_event {
    ($level:ident, $component:expr, $msg:expr, $client_id:expr, $ip:expr $(, $($field:tt)*)?) => {
        $crate::__private::tracing::$level!(
            component = $component,
            client_id = %$client_id,
            ip = %$ip,
            $($($field)*,)?
            $msg
        )
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_macros_expand() {
        // no subscriber installed: the events are dropped, this checks the
        // macro arms compile with and without extra fields
        log_event!(info, "test", "plain");
        log_event!(warn, "test", "with fields", count = 3, name = "x");
        log_route_event!(debug, "test", "route", "region", observable_id = 7u64);
        log_client_event!(info, "test", "client", "c-1", std::net::Ipv4Addr::LOCALHOST);
    }
}
