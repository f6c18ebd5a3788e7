//! SMTP client connection, plain or upgraded through STARTTLS.

use std::{sync::Arc, time::Duration};

use courier_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    auth::{self, Mechanism},
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        };

        let config = if accept_invalid_certs {
            tracing::warn!(
                server = domain,
                "TLS certificate validation is disabled for this connection"
            );
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .with_root_certificates(native_roots()?)
                .with_no_client_auth()
        };

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid domain {domain}: {e}")))?;

        let tls_stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

fn native_roots() -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();

    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let (added, ignored) = root_store.add_parsable_certificates(certs.certs);
    tracing::debug!(added, ignored, "Loaded native root certificates");

    if root_store.is_empty() {
        return Err(ClientError::TlsError(
            "No usable root certificates found".to_string(),
        ));
    }

    Ok(root_store)
}

/// A certificate verifier that accepts every certificate. Only used when
/// certificate checking has been switched off in configuration.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Prepares a message for the DATA phase: bare LF becomes CRLF, lines that
/// start with `.` are dot-stuffed (RFC 5321 section 4.5.2) and the
/// `CRLF.CRLF` terminator is appended.
#[must_use]
pub fn encode_data(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 64 + 5);
    let mut line_start = true;
    let mut previous = 0u8;

    for &byte in body {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        line_start = byte == b'\n';
        previous = byte;
    }

    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Opens a TCP connection to `addr`. `server_domain` is the name used to
    /// check the server certificate if the session is upgraded to TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or does not complete within
    /// `timeout`.
    pub async fn connect(
        addr: &str,
        server_domain: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(format!("connect to {addr}"), timeout))??;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            accept_invalid_certs: false,
        })
    }

    /// Sets whether to accept invalid TLS certificates. Defaults to `false`.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Whether the connection has been upgraded through STARTTLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Reads the server greeting; anything but 220 is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is not 220.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response()
            .await?
            .expect(|response| response.code == 220)
    }

    /// Sends a command line to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{}", command);
        self.send_raw(format!("{command}\r\n").as_bytes()).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        connection.send(data).await?;
        connection.flush().await
    }

    /// Sends a command and reads the reply, whatever its code.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends EHLO; a non-2xx reply is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}"))
            .await?
            .expect(Response::is_success)
    }

    /// Sends HELO; a non-2xx reply is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}"))
            .await?
            .expect(Response::is_success)
    }

    /// Sends `MAIL FROM:<from>` followed by any ESMTP parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn mail_from(&mut self, from: &str, params: &[&str]) -> Result<Response> {
        let mut cmd = format!("MAIL FROM:<{from}>");
        for param in params {
            cmd.push(' ');
            cmd.push_str(param);
        }
        self.command(&cmd).await?.expect(Response::is_success)
    }

    /// Sends `RCPT TO:<to>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>"))
            .await?
            .expect(Response::is_success)
    }

    /// Sends DATA; the server must answer 354.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is not answered with 354.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA")
            .await?
            .expect(|response| response.code == 354)
    }

    /// Writes the message (see [`encode_data`]) and reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails or the message is not accepted.
    pub async fn send_data(&mut self, body: &[u8]) -> Result<Response> {
        outgoing!("<{} bytes of message data>", body.len());
        self.send_raw(&encode_data(body)).await?;
        self.read_response().await?.expect(Response::is_success)
    }

    /// Sends QUIT.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await?.expect(Response::is_success);
        self.connection = None;
        response
    }

    /// Sends STARTTLS and upgrades the connection on a 220 reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses or the TLS handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self
            .command("STARTTLS")
            .await?
            .expect(|response| response.code == 220)?;

        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(
            connection
                .upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                .await?,
        );
        self.buffer_pos = 0;

        Ok(response)
    }

    /// Authenticates with `mechanism`; the server must finish with 235.
    ///
    /// # Errors
    ///
    /// Returns an error if a step is refused or the exchange breaks off.
    pub async fn auth(
        &mut self,
        mechanism: Mechanism,
        username: &str,
        password: &str,
    ) -> Result<Response> {
        outgoing!("AUTH {} <credentials for {}>", mechanism.name(), username);
        let last = match mechanism {
            Mechanism::Plain => {
                let initial = auth::plain_initial_response(username, password);
                self.send_raw(format!("AUTH PLAIN {initial}\r\n").as_bytes())
                    .await?;
                self.read_response().await?
            }
            Mechanism::Login => {
                self.command("AUTH LOGIN")
                    .await?
                    .expect(|response| response.code == 334)?;
                self.send_raw(format!("{}\r\n", auth::encode(username)).as_bytes())
                    .await?;
                self.read_response()
                    .await?
                    .expect(|response| response.code == 334)?;
                self.send_raw(format!("{}\r\n", auth::encode(password)).as_bytes())
                    .await?;
                self.read_response().await?
            }
        };

        last.expect(|response| response.code == 235)
    }

    /// Reads one complete reply from the server.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
