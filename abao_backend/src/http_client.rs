use std::time::Duration;

const USER_AGENT: &str = concat!("abao/", env!("CARGO_PKG_VERSION"));

pub fn build_http_client() -> reqwest::Client {
    build_http_client_with_timeout(None)
}

/// Build a client that ignores system proxies unless `ABAO_ENABLE_SYSTEM_PROXY` is set.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> reqwest::Client {
    let allow_system_proxy = std::env::var("ABAO_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return client,
            Err(error) => tracing::warn!(
                "HTTP client with system proxy failed ({}); retrying with no_proxy",
                error
            ),
        }
    }

    match attempt_build(timeout, true) {
        Ok(client) => client,
        Err(error) => {
            tracing::error!("HTTP client builder failed ({}); using plain client", error);
            reqwest::Client::new()
        }
    }
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
