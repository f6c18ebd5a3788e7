//! Minimal SMTP server for end-to-end engine tests.
//!
//! Accepts every command, except RCPT for recipients registered through
//! [`MockSmtpServerBuilder::with_rejected_recipient`], and records what it
//! receives.

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
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task::JoinHandle,
    time::timeout,
};

type Commands = RwLock<Vec<SmtpCommand>>;

/// A command as seen by the mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
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

#[derive(Debug, Clone, Default)]
struct Script {
    capabilities: Vec<String>,
    rejected: HashMap<String, (u16, String)>,
}

impl Script {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        let last = self.capabilities.len().saturating_sub(1);
        for (i, capability) in self.capabilities.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let _ = write!(out, "250{separator}{capability}\r\n");
        }
        out.into_bytes()
    }

    fn rcpt_bytes(&self, address: &str) -> Vec<u8> {
        self.rejected.get(address).map_or_else(
            || b"250 OK\r\n".to_vec(),
            |(code, message)| format!("{code} {message}\r\n").into_bytes(),
        )
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
        MockSmtpServerBuilder {
            script: Script {
                capabilities: vec!["mock.test".to_string(), "8BITMIME".to_string()],
                rejected: HashMap::new(),
            },
        }
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

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn serve(
        mut stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<Commands>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"220 mock.test ESMTP\r\n").await?;

        loop {
            let mut line = String::new();
            match timeout(Duration::from_secs(10), reader.read_line(&mut line)).await {
                Ok(Ok(0)) | Err(_) => return Ok(()),
                Ok(read) => read?,
            };

            let line = line.trim_end().to_string();
            let (verb, argument) = line
                .split_once(' ')
                .map_or((line.as_str(), ""), |(verb, rest)| (verb, rest));

            let (command, reply) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (SmtpCommand::Ehlo(argument.to_string()), script.ehlo_bytes()),
                "AUTH" => (
                    SmtpCommand::Auth(argument.to_string()),
                    b"235 Authentication successful\r\n".to_vec(),
                ),
                "MAIL" => (
                    SmtpCommand::MailFrom(argument.to_string()),
                    b"250 OK\r\n".to_vec(),
                ),
                "RCPT" => {
                    let address = argument
                        .trim_start_matches("TO:")
                        .trim_start_matches('<')
                        .trim_end_matches('>');
                    (
                        SmtpCommand::RcptTo(argument.to_string()),
                        script.rcpt_bytes(address),
                    )
                }
                "DATA" => (SmtpCommand::Data, b"354 End data with <CR><LF>.<CR><LF>\r\n".to_vec()),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    return writer.write_all(b"221 Bye\r\n").await;
                }
                _ => (SmtpCommand::Other(line.clone()), b"500 Unknown command\r\n".to_vec()),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            writer.write_all(&reply).await?;

            if is_data {
                let mut content = Vec::new();
                loop {
                    let mut data_line = String::new();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Ok(());
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
                writer.write_all(b"250 OK: queued\r\n").await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    /// Replaces the EHLO capability lines (the first line is the server name).
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    /// Answers RCPT for `address` with `code` instead of 250.
    #[must_use]
    pub fn with_rejected_recipient(
        mut self,
        address: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.script
            .rejected
            .insert(address.to_string(), (code, message.into()));
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
                    connections.fetch_add(1, Ordering::SeqCst);
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
