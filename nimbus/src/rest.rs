//! Minimal REST client for `/gateway/bot`.

use nimbus_gateway::info::{GatewayBot, GatewayInfoProvider, InfoError};
use std::{fmt::Debug, future::Future, pin::Pin};

/// Base URL of the HTTP API.
const API_BASE: &str = "https://discord.com/api/v10";

/// HTTP-backed [`GatewayInfoProvider`].
#[derive(Debug)]
pub struct RestClient {
    http: reqwest::Client,
    token: String,
    base: String,
}

impl RestClient {
    /// Create a client authenticating with the given bot token.
    pub fn new(token: &str) -> Self {
        let token = if token.starts_with("Bot ") {
            token.to_owned()
        } else {
            format!("Bot {token}")
        };

        Self {
            http: reqwest::Client::new(),
            token,
            base: API_BASE.to_owned(),
        }
    }

    /// Override the API base URL, for proxies and tests.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();

        self
    }
}

impl GatewayInfoProvider for RestClient {
    fn gateway_bot(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayBot, InfoError>> + Send + '_>> {
        Box::pin(async move {
            let response = self
                .http
                .get(format!("{}/gateway/bot", self.base))
                .header(reqwest::header::AUTHORIZATION, &self.token)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(InfoError::requesting)?;

            response
                .json::<GatewayBot>()
                .await
                .map_err(InfoError::deserializing)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RestClient;
    use nimbus_gateway::info::GatewayInfoProvider;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(RestClient: Debug, GatewayInfoProvider, Send, Sync);

    #[test]
    fn token_is_prefixed_once() {
        let plain = RestClient::new("abc");
        assert_eq!("Bot abc", plain.token);

        let prefixed = RestClient::new("Bot abc");
        assert_eq!("Bot abc", prefixed.token);
    }
}
