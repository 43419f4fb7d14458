//! Session negotiation.
//!
//! Password logins go through the platform's SOAP login service; OAuth2
//! integrations hand us a token-fetch callback and the instance base URL.
//! Either way the outcome is a [`NegotiatedSession`]: a bearer token plus the
//! resolved streaming endpoint.

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use url::Url;

use crate::config::{AuthConfig, TokenFetcher};
use crate::error::{ListenerError, Result};

const LOGIN_URL_PRODUCTION: &str = "https://login.salesforce.com";
const LOGIN_URL_SANDBOX: &str = "https://test.salesforce.com";

/// Streaming endpoint path introduced alongside durable replay; versions
/// below 37 only served replay-capable streams under the `/replay` prefix.
const REPLAY_PATH_CUTOVER: u32 = 37;

/// Outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    pub bearer_token: String,
    pub streaming_endpoint: Url,
}

/// Negotiates sessions for one listener. Stateless; every call performs a
/// full acquisition, memoization lives in [`crate::auth::TokenSource`].
#[derive(Clone)]
pub struct SessionNegotiator {
    http: reqwest::Client,
    auth: AuthConfig,
    api_version: String,
}

impl SessionNegotiator {
    pub fn new(http: reqwest::Client, auth: AuthConfig, api_version: impl Into<String>) -> Self {
        Self {
            http,
            auth,
            api_version: api_version.into(),
        }
    }

    pub async fn negotiate(&self) -> Result<NegotiatedSession> {
        match &self.auth {
            AuthConfig::Password {
                username,
                password,
                sandbox,
                login_url,
            } => {
                let host = match login_url {
                    Some(url) => url.clone(),
                    None => default_login_url(*sandbox)?,
                };
                self.password_login(&host, username, password).await
            }
            AuthConfig::OAuth {
                base_url,
                token_fetcher,
            } => {
                let bearer_token = fetch_external_token(token_fetcher.clone()).await?;
                let streaming_endpoint = streaming_endpoint(base_url, &self.api_version)?;
                debug!(endpoint = %streaming_endpoint, "negotiated session from token callback");
                Ok(NegotiatedSession {
                    bearer_token,
                    streaming_endpoint,
                })
            }
        }
    }

    async fn password_login(
        &self,
        host: &Url,
        username: &str,
        password: &SecretString,
    ) -> Result<NegotiatedSession> {
        let login_endpoint = host
            .join(&format!("/services/Soap/u/{}/", self.api_version))
            .map_err(|e| ListenerError::Configuration(format!("invalid login url: {e}")))?;

        let envelope = login_envelope(username, password.expose_secret());
        let response = self
            .http
            .post(login_endpoint.clone())
            .header("Content-Type", "text/xml;charset=UTF-8")
            .header("SOAPAction", "''")
            .body(envelope)
            .send()
            .await
            .map_err(|e| ListenerError::Authentication(format!("login request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ListenerError::Authentication(format!("login response unreadable: {e}")))?;

        // The login service reports credential problems as a SOAP fault with
        // an HTTP error status; the fault text is the useful part.
        if let Some(fault) = extract_element(&body, "faultstring") {
            return Err(ListenerError::Authentication(fault));
        }

        let session_id = extract_element(&body, "sessionId").ok_or_else(|| {
            if status.is_success() {
                ListenerError::Authentication("login response contained no session id".to_string())
            } else {
                ListenerError::Authentication(format!("login failed with status {status}"))
            }
        })?;

        let server_url = extract_element(&body, "serverUrl").ok_or_else(|| {
            ListenerError::Protocol("login response contained no server url".to_string())
        })?;
        let server_url = Url::parse(&server_url)
            .map_err(|e| ListenerError::Protocol(format!("unparseable server url: {e}")))?;

        let streaming_endpoint = streaming_endpoint(&server_url, &self.api_version)?;
        debug!(endpoint = %streaming_endpoint, "negotiated session via password login");
        Ok(NegotiatedSession {
            bearer_token: session_id,
            streaming_endpoint,
        })
    }
}

fn default_login_url(sandbox: bool) -> Result<Url> {
    let host = if sandbox {
        LOGIN_URL_SANDBOX
    } else {
        LOGIN_URL_PRODUCTION
    };
    Url::parse(host).map_err(|e| ListenerError::Configuration(format!("invalid login host: {e}")))
}

async fn fetch_external_token(fetcher: TokenFetcher) -> Result<String> {
    // The callback is synchronous by contract and may block on I/O of its
    // own; keep it off the async runtime.
    let fetched = tokio::task::spawn_blocking(move || fetcher())
        .await
        .map_err(|e| ListenerError::Authentication(format!("token callback panicked: {e}")))?;
    fetched.map_err(|e| ListenerError::Authentication(format!("token callback failed: {e}")))
}

/// Resolves the streaming endpoint for `api_version` against the host and
/// port of `server_url`.
fn streaming_endpoint(server_url: &Url, api_version: &str) -> Result<Url> {
    let major: u32 = api_version
        .split('.')
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            ListenerError::Configuration(format!("invalid api version: {api_version}"))
        })?;
    let path = if major < REPLAY_PATH_CUTOVER {
        format!("/cometd/replay/{api_version}")
    } else {
        format!("/cometd/{api_version}")
    };
    server_url
        .join(&path)
        .map_err(|e| ListenerError::Protocol(format!("unresolvable streaming endpoint: {e}")))
}

fn login_envelope(username: &str, password: &str) -> String {
    format!(
        "<soapenv:Envelope xmlns:soapenv='http://schemas.xmlsoap.org/soap/envelope/' \
         xmlns:urn='urn:partner.soap.sforce.com'><soapenv:Body><urn:login>\
         <urn:username>{}</urn:username><urn:password>{}</urn:password>\
         </urn:login></soapenv:Body></soapenv:Envelope>",
        xml_escape(username),
        xml_escape(password)
    )
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Pulls the text content of the first element whose local name matches,
/// ignoring any namespace prefix. The login response is the only XML this
/// crate reads, and only three elements of it matter.
fn extract_element(body: &str, local_name: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(open_rel) = body[search_from..].find('<') {
        let open = search_from + open_rel;
        let rest = &body[open + 1..];
        let name_end = rest.find(|c: char| c == '>' || c == '/' || c.is_whitespace())?;
        let name = &rest[..name_end];
        let is_tag = !name.is_empty() && !name.starts_with(['/', '?', '!']);
        let local = name.rsplit(':').next().unwrap_or(name);
        if is_tag && local == local_name {
            let tag_close = rest.find('>')?;
            // Self-closing or empty elements carry no text; keep scanning in
            // case a populated element of the same name follows.
            if !rest[..tag_close].ends_with('/') {
                let content_start = open + 1 + tag_close + 1;
                let content_end = content_start + body[content_start..].find('<')?;
                let text = xml_unescape(body[content_start..content_end].trim());
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
        search_from = open + 1;
    }
    None
}
