use std::{fmt, net::SocketAddr, path::Path};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AddressError;

/// Basename of the one file a data-plane server is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileName(pub String);

impl FileName {
    pub fn from_path(path: &Path) -> Result<Self, AddressError> {
        let name = path
            .file_name()
            .ok_or_else(|| AddressError::MissingFileName(path.display().to_string()))?;
        let name = name
            .to_str()
            .ok_or_else(|| AddressError::NonUtf8FileName(path.display().to_string()))?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The only request path the data plane answers for this file, encoded
    /// the way a browser sends it (`/my%20data.parquet`).
    pub fn url_path(&self) -> String {
        let Ok(mut url) = Url::parse("http://localhost/") else {
            return format!("/{}", self.0);
        };
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.clear().push(&self.0);
        }
        url.path().to_string()
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base URL (`http://host:port`) of a running data-plane server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress(Url);

impl ServerAddress {
    pub fn new(host: &str, port: u16) -> Result<Self, AddressError> {
        Ok(Self(Url::parse(&format!("http://{host}:{port}"))?))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self, AddressError> {
        Ok(Self(Url::parse(&format!("http://{addr}"))?))
    }

    pub fn port(&self) -> Option<u16> {
        self.0.port_or_known_default()
    }

    /// Full URL of `file` on this server.
    pub fn file_url(&self, file: &FileName) -> Url {
        let mut url = self.0.clone();
        url.set_path(&file.url_path());
        url
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Url always renders a trailing slash for an empty path.
        f.write_str(self.0.as_str().trim_end_matches('/'))
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(Url::parse(&value)?))
    }
}

impl From<ServerAddress> for String {
    fn from(value: ServerAddress) -> Self {
        value.to_string()
    }
}
