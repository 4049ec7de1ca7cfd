//! Skips socket-bound tests on hosts that forbid binding localhost.
//!
//! Set `HARVEST_REQUIRE_SOCKET_TESTS=1` to turn a skip into a failure.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "HARVEST_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_ENV)
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[track_caller]
pub fn start_mock_server_or_skip() -> impl std::future::Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    let can_bind = TcpListener::bind("127.0.0.1:0").is_ok();
    async move {
        if can_bind {
            return Some(MockServer::start().await);
        }
        let message = format!(
            "[socket-bound-test] {}:{} cannot bind a localhost socket",
            caller.file(),
            caller.line()
        );
        assert!(!sockets_required(), "{message} and {REQUIRE_ENV} is set");
        eprintln!("{message}; skipping");
        None
    }
}
