//! HTTP client for the host's web control endpoint.
//!
//! The endpoint can run registered actions and read or write the host's
//! key/value store, nothing more. That is enough to launch the agent.

use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::debug;
use url::Url;

const ACTION_PREFIX: &str = "_";
const EXT_STATE: &str = "EXTSTATE";
const EXT_STATE_PERSIST: &str = "EXTSTATEPERSIST";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("host control endpoint {url} is unreachable: {source}")]
    HostUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("host control endpoint {url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("key {section}/{key} is not defined in the host store")]
    UndefinedKey { section: String, key: String },
    #[error("invalid control endpoint address {address}: {source}")]
    InvalidUrl {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unexpected reply from host control endpoint: {body:?}")]
    MalformedReply { body: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ControlError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::HostUnreachable { .. } | Self::Status { .. })
    }
}

/// Talks to `http://<host>:<port>/_/…` on one host.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base: Url,
    http: Client,
}

impl ControlClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, ControlError> {
        Self::with_base_url(&format!("http://{host}:{port}/"), timeout)
    }

    pub fn with_base_url(address: &str, timeout: Duration) -> Result<Self, ControlError> {
        let base = Url::parse(address).map_err(|source| ControlError::InvalidUrl {
            address: address.to_string(),
            source,
        })?;
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(ControlError::Client)?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Asks the host to run the action registered under `token`.
    pub fn perform(&self, token: &str) -> Result<(), ControlError> {
        self.get(&[token])?;
        Ok(())
    }

    /// Reads `section/key` from the host store.
    pub fn kv_get(&self, section: &str, key: &str) -> Result<String, ControlError> {
        let body = self.get(&["GET", EXT_STATE, section, key])?;
        parse_ext_state(&body, section, key)
    }

    pub fn kv_set(
        &self,
        section: &str,
        key: &str,
        value: &str,
        persist: bool,
    ) -> Result<(), ControlError> {
        let command = if persist { EXT_STATE_PERSIST } else { EXT_STATE };
        self.get(&["SET", command, section, key, value])?;
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ControlError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ControlError::InvalidUrl {
                address: self.base.to_string(),
                source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
            })?
            .clear()
            .push(ACTION_PREFIX)
            .extend(segments);
        Ok(url)
    }

    fn get(&self, segments: &[&str]) -> Result<String, ControlError> {
        let url = self.endpoint(segments)?;
        debug!(url = %url, "control request");
        let response = self
            .http
            .get(url.clone())
            .send()
            .map_err(|source| ControlError::HostUnreachable {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ControlError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .text()
            .map_err(|source| ControlError::HostUnreachable {
                url: url.to_string(),
                source,
            })
    }
}

/// Extracts the value from a `[EXTSTATE\t]section\tkey\tvalue` reply line.
fn parse_ext_state(body: &str, section: &str, key: &str) -> Result<String, ControlError> {
    let undefined = || ControlError::UndefinedKey {
        section: section.to_string(),
        key: key.to_string(),
    };
    let line = body
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(undefined)?;
    let line = line.strip_prefix(EXT_STATE).map_or(line, |rest| {
        rest.strip_prefix('\t').unwrap_or(rest)
    });
    let mut fields = line.splitn(3, '\t');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(_), Some(_), Some(value)) if !value.is_empty() => Ok(value.to_string()),
        (Some(_), Some(_), _) => Err(undefined()),
        _ => Err(ControlError::MalformedReply {
            body: body.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// The blocking client owns a runtime, so it is built and dropped off the async test thread.
    fn client(uri: &str) -> ControlClient {
        ControlClient::with_base_url(uri, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn reply_line_parsing() {
        assert_eq!(
            parse_ext_state("reapy\tserver_port\t2306\n", "reapy", "server_port").unwrap(),
            "2306"
        );
        assert_eq!(
            parse_ext_state("EXTSTATE\treapy\tserver_port\t2306\n", "reapy", "server_port")
                .unwrap(),
            "2306"
        );
        assert!(matches!(
            parse_ext_state("reapy\tserver_port\t\n", "reapy", "server_port"),
            Err(ControlError::UndefinedKey { .. })
        ));
        assert!(matches!(
            parse_ext_state("", "reapy", "server_port"),
            Err(ControlError::UndefinedKey { .. })
        ));
        assert!(matches!(
            parse_ext_state("garbage", "reapy", "server_port"),
            Err(ControlError::MalformedReply { .. })
        ));
    }

    #[test]
    fn values_are_percent_encoded_segments() {
        let client =
            ControlClient::with_base_url("http://localhost:2307/", Duration::from_secs(1)).unwrap();
        let url = client
            .endpoint(&["SET", EXT_STATE, "reapy", "note", "a b/c"])
            .unwrap();
        assert_eq!(url.path(), "/_/SET/EXTSTATE/reapy/note/a%20b%2Fc");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kv_get_reads_the_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_/GET/EXTSTATE/reapy/server_port"))
            .respond_with(ResponseTemplate::new(200).set_body_string("reapy\tserver_port\t2306\n"))
            .mount(&server)
            .await;

        let uri = server.uri();
        let value = tokio::task::spawn_blocking(move || client(&uri).kv_get("reapy", "server_port"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, "2306");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kv_set_and_perform_hit_their_paths() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_/SET/EXTSTATEPERSIST/reapy/activate_reapy_server/_RS123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_/_RS123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        tokio::task::spawn_blocking(move || {
            let client = client(&uri);
            client.kv_set("reapy", "activate_reapy_server", "_RS123", true)?;
            client.perform("_RS123")
        })
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let uri = server.uri();
        let err = tokio::task::spawn_blocking(move || client(&uri).perform("_missing"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ControlError::Status { status: 404, .. }));
        assert!(err.is_unreachable());
    }

    #[test]
    fn closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ControlClient::new("127.0.0.1", port, Duration::from_millis(500)).unwrap();
        let err = client.kv_get("reapy", "server_port").unwrap_err();
        assert!(matches!(err, ControlError::HostUnreachable { .. }));
    }
}
