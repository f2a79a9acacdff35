//! Channel configuration.

use http::{HeaderValue, Method};

use crate::protocol::{ExchangeError, RequestHeader};

/// How strictly request targets are checked for ambiguous paths.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum UriCompliance {
    /// Rejects encoded separators, encoded dot segments, empty segments and path parameters
    #[default]
    Strict,
    /// Only rejects paths that escape the root
    Legacy,
}

impl UriCompliance {
    /// Returns the violation message for `path`, if any.
    pub fn check(self, path: &str) -> Option<&'static str> {
        let mut depth: usize = 0;
        for segment in path.split('/').skip(1) {
            match segment {
                ".." => match depth.checked_sub(1) {
                    Some(d) => depth = d,
                    None => return Some("Path escapes root"),
                },
                "." => {}
                _ => depth += 1,
            }
        }

        if self == UriCompliance::Legacy {
            return None;
        }

        let lower = path.to_ascii_lowercase();
        if lower.contains("%2f") {
            return Some("Ambiguous URI path separator");
        }
        if lower.contains("%2e") {
            return Some("Ambiguous URI path segment");
        }
        if path.contains("//") {
            return Some("Ambiguous URI empty segment");
        }
        if path.contains(';') {
            return Some("Ambiguous URI path parameter");
        }
        None
    }

    /// Validates the request target of `header`.
    ///
    /// Except for CONNECT and OPTIONS, the target must have a path starting with `/`.
    pub fn validate(self, header: &RequestHeader) -> Result<(), ExchangeError> {
        let method = header.method();
        let path = header.uri().path();
        if *method != Method::CONNECT && *method != Method::OPTIONS && !path.starts_with('/') {
            return Err(ExchangeError::bad_request("Bad URI path"));
        }
        match self.check(path) {
            Some(violation) => Err(ExchangeError::bad_request(violation)),
            None => Ok(()),
        }
    }
}

/// Settings shared by every exchange of a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    send_date_header: bool,
    server_header: Option<HeaderValue>,
    uri_compliance: UriCompliance,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { send_date_header: true, server_header: None, uri_compliance: UriCompliance::default() }
    }
}

impl ChannelConfig {
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder { config: ChannelConfig::default() }
    }

    pub fn send_date_header(&self) -> bool {
        self.send_date_header
    }

    pub fn server_header(&self) -> Option<&HeaderValue> {
        self.server_header.as_ref()
    }

    pub fn uri_compliance(&self) -> UriCompliance {
        self.uri_compliance
    }
}

#[derive(Debug)]
pub struct ChannelConfigBuilder {
    config: ChannelConfig,
}

impl ChannelConfigBuilder {
    pub fn send_date_header(mut self, send: bool) -> Self {
        self.config.send_date_header = send;
        self
    }

    pub fn server_header(mut self, value: HeaderValue) -> Self {
        self.config.server_header = Some(value);
        self
    }

    pub fn uri_compliance(mut self, compliance: UriCompliance) -> Self {
        self.config.uri_compliance = compliance;
        self
    }

    pub fn build(self) -> ChannelConfig {
        self.config
    }
}
