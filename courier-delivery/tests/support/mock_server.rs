//! Scriptable SMTP server for session and failover tests.
//!
//! Every reply can be overridden through [`MockSmtpServerBuilder`]. The
//! server records each command it receives, can drop its first few
//! connections to stand in for unreachable exchangers and can offer
//! STARTTLS with a self-signed certificate.

use std::{
    collections::HashMap,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    },
};

type Commands = RwLock<Vec<SmtpCommand>>;

/// A command as seen by the mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    StartTls,
    /// The AUTH line; LOGIN continuation lines are appended after a space.
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content between DATA and the terminating dot, as received.
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo_code: u16,
    capabilities: Vec<String>,
    helo: Reply,
    starttls: Reply,
    auth: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    rcpt_overrides: HashMap<String, Reply>,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    dropped_connections: usize,
    tls: Option<Arc<ServerConfig>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.test ESMTP"),
            ehlo_code: 250,
            capabilities: vec!["mock.test".to_string(), "8BITMIME".to_string()],
            helo: Reply::new(250, "mock.test"),
            starttls: Reply::new(502, "Command not implemented"),
            auth: Reply::new(235, "Authentication successful"),
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            rcpt_overrides: HashMap::new(),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "OK: queued"),
            quit: Reply::new(221, "Bye"),
            dropped_connections: 0,
            tls: None,
        }
    }
}

impl Script {
    /// Before the upgrade a TLS-capable server only offers STARTTLS.
    fn ehlo_bytes(&self, secure: bool) -> Vec<u8> {
        if !(200..300).contains(&self.ehlo_code) {
            return Reply::new(self.ehlo_code, "EHLO not supported").to_bytes();
        }

        let capabilities = if self.tls.is_some() && !secure {
            let name = self.capabilities.first().map_or("mock.test", String::as_str);
            vec![name.to_string(), "STARTTLS".to_string()]
        } else {
            self.capabilities.clone()
        };

        let mut out = String::new();
        let last = capabilities.len().saturating_sub(1);
        for (i, capability) in capabilities.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let _ = write!(out, "{}{separator}{capability}\r\n", self.ehlo_code);
        }
        out.into_bytes()
    }
}

/// A running mock server. Stops accepting when dropped.
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Commands>,
    connections: Arc<AtomicUsize>,
    acceptor: JoinHandle<()>,
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command received, across all connections, in arrival order.
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// The message bodies received.
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content),
                _ => None,
            })
            .collect()
    }

    /// Connections accepted so far, dropped ones included.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn respond(writer: &mut (impl AsyncWrite + Unpin), bytes: &[u8]) -> std::io::Result<()> {
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn serve(
        stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<Commands>,
    ) -> std::io::Result<()> {
        let Some(stream) = Self::converse(stream, &script, &commands, false).await? else {
            return Ok(());
        };
        let Some(config) = script.tls.clone() else {
            return Ok(());
        };

        let stream = TlsAcceptor::from(config).accept(stream).await?;
        Self::converse(stream, &script, &commands, true).await?;
        Ok(())
    }

    /// Runs the command loop. Returns the bare stream when the client asked
    /// for STARTTLS and the server agreed.
    async fn converse<S: AsyncRead + AsyncWrite + Unpin>(
        stream: S,
        script: &Script,
        commands: &Commands,
        secure: bool,
    ) -> std::io::Result<Option<S>> {
        let mut stream = BufReader::new(stream);

        if !secure {
            Self::respond(&mut stream, &script.greeting.to_bytes()).await?;
        }

        loop {
            let mut line = String::new();
            match timeout(Duration::from_secs(10), stream.read_line(&mut line)).await {
                Ok(Ok(0)) | Err(_) => return Ok(None),
                Ok(read) => read?,
            };

            let line = line.trim_end().to_string();
            let (verb, argument) = line
                .split_once(' ')
                .map_or((line.as_str(), ""), |(verb, rest)| (verb, rest));
            let verb = verb.to_ascii_uppercase();

            let (command, reply) = match verb.as_str() {
                "EHLO" => (
                    SmtpCommand::Ehlo(argument.to_string()),
                    script.ehlo_bytes(secure),
                ),
                "HELO" => (
                    SmtpCommand::Helo(argument.to_string()),
                    script.helo.to_bytes(),
                ),
                "STARTTLS" => {
                    commands.write().await.push(SmtpCommand::StartTls);
                    Self::respond(&mut stream, &script.starttls.to_bytes()).await?;
                    if script.tls.is_some() && !secure && script.starttls.code == 220 {
                        return Ok(Some(stream.into_inner()));
                    }
                    continue;
                }
                "AUTH" => {
                    let mut recorded = argument.to_string();
                    if argument.eq_ignore_ascii_case("LOGIN") {
                        for prompt in ["VXNlcm5hbWU6", "UGFzc3dvcmQ6"] {
                            Self::respond(&mut stream, format!("334 {prompt}\r\n").as_bytes())
                                .await?;
                            let mut answer = String::new();
                            stream.read_line(&mut answer).await?;
                            recorded.push(' ');
                            recorded.push_str(answer.trim_end());
                        }
                    }
                    (SmtpCommand::Auth(recorded), script.auth.to_bytes())
                }
                "MAIL" => (
                    SmtpCommand::MailFrom(argument.to_string()),
                    script.mail_from.to_bytes(),
                ),
                "RCPT" => {
                    let address = argument
                        .trim_start_matches("TO:")
                        .trim_start_matches('<')
                        .trim_end_matches('>');
                    let reply = script.rcpt_overrides.get(address).unwrap_or(&script.rcpt_to);
                    (SmtpCommand::RcptTo(argument.to_string()), reply.to_bytes())
                }
                "DATA" => (SmtpCommand::Data, script.data.to_bytes()),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    Self::respond(&mut stream, &script.quit.to_bytes()).await?;
                    return Ok(None);
                }
                _ => (SmtpCommand::Other(line.clone()), b"500 Unknown command\r\n".to_vec()),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            Self::respond(&mut stream, &reply).await?;

            if is_data && script.data.code == 354 {
                let mut content = Vec::new();
                loop {
                    let mut data_line = String::new();
                    if stream.read_line(&mut data_line).await? == 0 {
                        return Ok(None);
                    }
                    if data_line == ".\r\n" {
                        break;
                    }
                    content.extend_from_slice(data_line.as_bytes());
                }
                commands
                    .write()
                    .await
                    .push(SmtpCommand::MessageContent(content));
                Self::respond(&mut stream, &script.data_end.to_bytes()).await?;
            }
        }
    }
}

#[derive(Default)]
pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, message);
        self
    }

    /// Replaces the EHLO capability lines (the first line is the server name).
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    /// Makes EHLO fail with `code`, so clients must fall back to HELO.
    #[must_use]
    pub const fn with_ehlo_rejected(mut self, code: u16) -> Self {
        self.script.ehlo_code = code;
        self
    }

    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.starttls = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.auth = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, message);
        self
    }

    /// Answers RCPT for `address` with `code` instead of the default.
    #[must_use]
    pub fn with_rejected_recipient(
        mut self,
        address: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.script
            .rcpt_overrides
            .insert(address.to_string(), Reply::new(code, message));
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_quit_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.quit = Reply::new(code, message);
        self
    }

    /// Closes the first `count` connections before sending a greeting.
    #[must_use]
    pub const fn with_dropped_connections(mut self, count: usize) -> Self {
        self.script.dropped_connections = count;
        self
    }

    /// Offers STARTTLS with a freshly generated certificate for
    /// `localhost`. Other capabilities, AUTH included, are only advertised
    /// once the connection is encrypted.
    #[must_use]
    pub fn with_starttls(mut self) -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .expect("self-signed certificate");
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![CertificateDer::from(cert.der().to_vec())], key)
            .expect("server certificate");

        self.script.tls = Some(Arc::new(config));
        self.script.starttls = Reply::new(220, "Ready to start TLS");
        self
    }

    /// Binds to an ephemeral port on 127.0.0.1 and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands: Arc<Commands> = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let acceptor = {
            let commands = Arc::clone(&commands);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let seen = connections.fetch_add(1, Ordering::SeqCst);
                    if seen < script.dropped_connections {
                        drop(stream);
                        continue;
                    }

                    let script = Arc::clone(&script);
                    let commands = Arc::clone(&commands);
                    tokio::spawn(async move {
                        if let Err(e) = MockSmtpServer::serve(stream, script, commands).await {
                            eprintln!("mock server connection error: {e}");
                        }
                    });
                }
            })
        };

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
            acceptor,
        })
    }
}
