use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use crate::codec::LineBuffer;
use crate::mailbox::{Delivery, Mailbox};
use crate::policy::{CredentialStore, RelayPolicy};
use crate::registry::{Admission, ConnectionRegistry, LiveSession};
use crate::session::{Action, SessionContext, SmtpSession};
use crate::utils::Logger;
use crate::Opt;

pub struct SmtpServer {
    pub opt: Opt,
    logger: Logger,
    creds: CredentialStore,
    policy: RelayPolicy,
    registry: Arc<ConnectionRegistry>,
    mailbox: Mailbox,
    banner: String,
}

impl SmtpServer {
    pub async fn new(opt: Opt) -> Result<Self> {
        let logger = Logger::new(opt.log_file.clone(), opt.raw_display)?;

        let mut pairs = Vec::new();
        for entry in &opt.auth_users {
            match entry.split_once(':') {
                Some((user, secret)) if !user.is_empty() => {
                    pairs.push((user.to_string(), secret.to_string()));
                }
                _ => bail!("Invalid --auth-user value, expected user:secret"),
            }
        }
        let creds = CredentialStore::new(pairs);
        let policy = RelayPolicy::new(opt.domains.iter().cloned());

        let mailbox = Mailbox::open(opt.mailbox.clone(), opt.max_message_size).await?;

        let banner = match &opt.banner_file {
            Some(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read banner file: {:?}", path))?;
                match text.lines().next().map(str::trim) {
                    Some(line) if !line.is_empty() => line.to_string(),
                    _ => format!("{} SMTP Lab Ready", opt.helo),
                }
            }
            None => format!("{} SMTP Lab Ready", opt.helo),
        };

        let registry = Arc::new(ConnectionRegistry::new(
            opt.max_connections,
            opt.max_per_source,
        ));

        Ok(Self {
            opt,
            logger,
            creds,
            policy,
            registry,
            mailbox,
            banner,
        })
    }

    /// Binds every configured port and runs until the process is stopped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.spawn_sweeper();

        let mut handles = Vec::new();
        for port in self.opt.ports.clone() {
            let addr = format!("{}:{}", self.opt.address, port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind to {}", addr))?;
            self.logger.log_server(&format!("Listening on {}", addr)).await;

            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.serve(listener).await;
            }));
        }

        for handle in handles {
            handle.await?;
        }
        Ok(())
    }

    /// Periodic idle-eviction pass. Session tasks observe the flag, send the
    /// timeout notice and release themselves.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let timeout = Duration::from_secs(this.opt.session_timeout);
            let mut ticker = time::interval(Duration::from_secs(this.opt.sweep_interval));
            loop {
                ticker.tick().await;
                let evicted = this.registry.sweep(timeout).await;
                if evicted > 0 {
                    this.logger
                        .log_server(&format!("Evicted {} idle session(s)", evicted))
                        .await;
                }
            }
        });
    }

    /// Accept loop for one listener. Individual session failures never stop
    /// it.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => match self.registry.admit(peer).await {
                    Admission::Granted(entry) => {
                        self.logger.log(&peer, "New connection").await;
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_client(stream, &entry).await {
                                this.logger.log(&peer, &format!("Session error: {}", e)).await;
                            }
                            this.registry.release(&entry).await;
                            this.logger.log(&peer, "Connection closed").await;
                        });
                    }
                    Admission::ServerFull => {
                        self.logger
                            .log(&peer, "Refused: connection ceiling reached")
                            .await;
                        refuse(stream, b"421 Too many connections\r\n").await;
                    }
                    Admission::SourceFull => {
                        self.logger
                            .log(&peer, "Refused: per-source ceiling reached")
                            .await;
                        refuse(stream, b"421 Too many connections from this IP\r\n").await;
                    }
                },
                Err(e) => {
                    self.logger.log_server(&format!("Accept error: {}", e)).await;
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, live: &Arc<LiveSession>) -> Result<()> {
        let peer = live.peer;
        let (mut reader, mut writer) = stream.into_split();

        writer
            .write_all(format!("220 {}\r\n", self.banner).as_bytes())
            .await?;
        live.touch();

        let mut session = SmtpSession::new(peer);
        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 1024];
        let ctx = SessionContext {
            creds: &self.creds,
            policy: &self.policy,
            hostname: &self.opt.helo,
            size_limit: self.opt.max_message_size,
        };

        'conn: loop {
            tokio::select! {
                _ = live.wait_evicted() => {
                    self.logger.log(&peer, "Idle timeout, forcing close").await;
                    let _ = writer.write_all(b"421 Session timeout\r\n").await;
                    break 'conn;
                }
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break 'conn,
                        Ok(n) => n,
                        Err(e) => {
                            self.logger.log(&peer, &format!("Read error: {}", e)).await;
                            break 'conn;
                        }
                    };
                    live.touch();
                    lines.extend(&buf[..n]);

                    while let Some(line) = lines.next_line() {
                        if !line.is_empty() {
                            self.logger.log(&peer, &format!(">> {}", line)).await;
                        }
                        match session.apply_line(&line, &ctx) {
                            Action::Silent => {}
                            Action::Reply(reply) => {
                                self.logger.log(&peer, &format!("<< {}", reply.trim_end())).await;
                                writer.write_all(reply.as_bytes()).await?;
                            }
                            Action::Quit(reply) => {
                                self.logger.log(&peer, &format!("<< {}", reply.trim_end())).await;
                                let _ = writer.write_all(reply.as_bytes()).await;
                                break 'conn;
                            }
                            Action::Deliver(delivery) => {
                                let reply = self.commit(session.peer, &delivery).await;
                                self.logger.log(&peer, &format!("<< {}", reply.trim_end())).await;
                                writer.write_all(reply.as_bytes()).await?;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Persist an accepted transaction. Storage failures are answered with a
    /// transient rejection; the session keeps running either way.
    async fn commit(&self, peer: SocketAddr, delivery: &Delivery) -> &'static str {
        match self.mailbox.deliver(peer, &self.opt.helo, delivery).await {
            Ok(path) => {
                self.logger
                    .log(
                        &peer,
                        &format!(
                            "Message from {} for {} saved to {:?}",
                            delivery.from,
                            delivery.recipients.join(", "),
                            path
                        ),
                    )
                    .await;
                if self.opt.verbose {
                    self.logger
                        .log(&peer, &format!("Message body:\n{}", delivery.body.join("\n")))
                        .await;
                }
                "250 Message accepted for delivery\r\n"
            }
            Err(e) => {
                self.logger
                    .log(&peer, &format!("Failed to store message: {}", e))
                    .await;
                "552 Mailbox full or message too large\r\n"
            }
        }
    }
}

async fn refuse(mut stream: TcpStream, reply: &[u8]) {
    let _ = stream.write_all(reply).await;
    let _ = stream.shutdown().await;
}
