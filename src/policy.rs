//! Cross-domain policy file served to legacy socket clients (Flash-based WebSocket shims).
//!
//! Such clients connect to a separate port, send `<policy-file-request/>` followed by a NUL
//! byte, and expect the XML policy followed by a NUL byte before the server hangs up.
use std::{fmt::Write as _, io, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

/// What a client sends to ask for the policy.
pub const POLICY_REQUEST: &[u8] = b"<policy-file-request/>";

const MAX_REQUEST_LEN: usize = 256;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A cross-domain policy document.
#[derive(Debug, Clone)]
pub struct PolicyFile {
    site_control: String,
    rules: Vec<AccessRule>,
}

#[derive(Debug, Clone)]
struct AccessRule {
    domain: String,
    ports: String,
    secure: bool,
}

impl Default for PolicyFile {
    fn default() -> Self {
        Self {
            site_control: "master-only".to_owned(),
            rules: Vec::new(),
        }
    }
}

impl PolicyFile {
    /// The policy for a server on `port`, open to `domain` (every domain when `None`).
    pub fn for_server(domain: Option<&str>, port: u16) -> Self {
        Self::default().with_access(domain.unwrap_or("*"), port.to_string())
    }

    /// Value of `permitted-cross-domain-policies`.
    pub fn with_site_control(self, site_control: impl Into<String>) -> Self {
        Self {
            site_control: site_control.into(),
            ..self
        }
    }

    /// Allows `domain` to connect to `ports` (for example `"80,443"`, `"8000-8100"` or `"*"`).
    pub fn with_access(mut self, domain: impl Into<String>, ports: impl Into<String>) -> Self {
        self.rules.push(AccessRule {
            domain: domain.into(),
            ports: ports.into(),
            secure: false,
        });
        self
    }

    /// Like [`PolicyFile::with_access`], but only for connections made over TLS.
    pub fn with_secure_access(mut self, domain: impl Into<String>, ports: impl Into<String>) -> Self {
        self.rules.push(AccessRule {
            domain: domain.into(),
            ports: ports.into(),
            secure: true,
        });
        self
    }

    pub fn render(&self) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\n\
             <!DOCTYPE cross-domain-policy SYSTEM \"http://www.adobe.com/xml/dtds/cross-domain-policy.dtd\">\n\
             <cross-domain-policy>\n",
        );
        let _ = writeln!(
            xml,
            "<site-control permitted-cross-domain-policies=\"{}\"/>",
            escape(&self.site_control)
        );
        for rule in &self.rules {
            let _ = writeln!(
                xml,
                "<allow-access-from domain=\"{}\" to-ports=\"{}\" secure=\"{}\"/>",
                escape(&rule.domain),
                escape(&rule.ports),
                rule.secure
            );
        }
        xml.push_str("</cross-domain-policy>");
        xml
    }

    /// The document as sent on the wire, NUL-terminated.
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = self.render().into_bytes();
        bytes.push(0);
        Bytes::from(bytes)
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Accepts policy requests on `listener` until `cancel` fires.
pub(crate) async fn serve(listener: TcpListener, policy: Arc<PolicyFile>, cancel: CancellationToken) {
    let document = policy.to_bytes();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let document = document.clone();
                tokio::spawn(async move {
                    if let Err(err) = answer(stream, document).await {
                        log::debug!("policy request from {peer} failed: {err}");
                    }
                });
            }
            Err(err) => log::warn!("policy listener accept failed: {err}"),
        }
    }

    log::debug!("policy listener stopped");
}

/// Reads one request and answers it.
async fn answer(mut stream: TcpStream, document: Bytes) -> io::Result<()> {
    let mut request = Vec::with_capacity(64);
    let mut buf = [0; 64];

    let read = async {
        while !request.contains(&0) && request.len() < MAX_REQUEST_LEN {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        io::Result::Ok(())
    };
    tokio::time::timeout(READ_TIMEOUT, read)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "policy request timed out"))??;

    if request.starts_with(POLICY_REQUEST) {
        stream.write_all(&document).await?;
    }
    stream.shutdown().await
}
