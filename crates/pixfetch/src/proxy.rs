//! Proxy settings for the HTTP transport.

use reqwest::Proxy;

use crate::transport::{TransportError, TransportErrorKind};

/// Which requests go through the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    /// Plain `http://` image URLs only
    Http,
    /// `https://` image URLs only
    Https,
    /// Every request, tunnelled over SOCKS5
    Socks5,
    /// Every request
    All,
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// e.g. "http://proxy.example.com:8080"; a SOCKS5 address may omit the scheme
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>, proxy_type: ProxyType) -> Self {
        Self {
            url: url.into(),
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Address handed to reqwest, with the `socks5://` scheme filled in when missing.
    fn address(&self) -> String {
        match self.proxy_type {
            ProxyType::Socks5 if !self.url.contains("://") => format!("socks5://{}", self.url),
            _ => self.url.clone(),
        }
    }

    pub(crate) fn to_reqwest(&self) -> Result<Proxy, TransportError> {
        let address = self.address();
        let proxy = match self.proxy_type {
            ProxyType::Http => Proxy::http(&address),
            ProxyType::Https => Proxy::https(&address),
            ProxyType::Socks5 | ProxyType::All => Proxy::all(&address),
        }
        .map_err(|e| {
            TransportError::new(
                TransportErrorKind::TaskInit,
                format!("invalid {:?} proxy '{}': {e}", self.proxy_type, self.url),
            )
        })?;

        Ok(match &self.auth {
            Some(auth) => proxy.basic_auth(&auth.username, &auth.password),
            None => proxy,
        })
    }
}
