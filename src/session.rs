use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::codec::{self, BodyLine};
use crate::mailbox::Delivery;
use crate::policy::{CredentialStore, RelayPolicy};

/// Read-only inputs the dispatcher needs besides the session itself.
pub struct SessionContext<'a> {
    pub creds: &'a CredentialStore,
    pub policy: &'a RelayPolicy,
    pub hostname: &'a str,
    pub size_limit: usize,
}

/// Protocol state of one connection. The variants carry what the stage needs,
/// so a half-finished AUTH exchange or body transfer cannot be misread as
/// command mode.
#[derive(Debug, PartialEq)]
pub enum SessionState {
    Command,
    AuthContinuation(AuthStage),
    BodyCollection,
}

#[derive(Debug, PartialEq)]
pub enum AuthStage {
    Plain,
    LoginUsername,
    LoginPassword { username: String },
}

/// What the connection loop should do with the line just processed.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Write the reply and keep reading.
    Reply(String),
    /// Write the farewell and reclaim the connection.
    Quit(String),
    /// Terminator received: hand the finalized transaction to the store.
    Deliver(Delivery),
    /// Line absorbed (body content, blank command line).
    Silent,
}

enum AuthVerdict {
    Accepted { username: String },
    Rejected,
}

pub struct SmtpSession {
    pub peer: SocketAddr,
    pub state: SessionState,
    pub authenticated_user: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub body: Vec<String>,
}

impl SmtpSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: SessionState::Command,
            authenticated_user: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }

    /// Drops the transaction triple and leaves any sub-protocol state.
    /// Authentication survives.
    pub fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.body.clear();
        self.state = SessionState::Command;
    }

    /// Advances the state machine by one decoded line.
    pub fn apply_line(&mut self, line: &str, ctx: &SessionContext) -> Action {
        match std::mem::replace(&mut self.state, SessionState::Command) {
            SessionState::Command => self.command(line, ctx),
            SessionState::AuthContinuation(stage) => self.auth_continue(stage, line, ctx),
            SessionState::BodyCollection => self.body_line(line),
        }
    }

    fn command(&mut self, line: &str, ctx: &SessionContext) -> Action {
        let line = line.trim();
        if line.is_empty() {
            return Action::Silent;
        }

        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "HELO" => {
                let name = if args.is_empty() { "client" } else { args };
                Action::Reply(format!("250 Hello {}\r\n", name))
            }
            "EHLO" => {
                let name = if args.is_empty() { "client" } else { args };
                Action::Reply(format!(
                    "250-{} Hello {}\r\n250-AUTH PLAIN LOGIN\r\n250-SIZE {}\r\n250 HELP\r\n",
                    ctx.hostname, name, ctx.size_limit
                ))
            }
            "AUTH" => self.auth(args, ctx),
            "MAIL" => self.mail(args),
            "RCPT" => self.rcpt(args, ctx),
            "DATA" => self.data(),
            "VRFY" => {
                if ctx.creds.contains(args) {
                    Action::Reply(format!("250 {}@{}\r\n", args, ctx.hostname))
                } else {
                    Action::Reply("550 User unknown\r\n".to_string())
                }
            }
            "RSET" => {
                self.reset_transaction();
                Action::Reply("250 OK\r\n".to_string())
            }
            "QUIT" => Action::Quit("221 Bye\r\n".to_string()),
            "HELP" => Action::Reply(
                "214 Commands: HELO EHLO MAIL RCPT DATA AUTH VRFY RSET QUIT\r\n".to_string(),
            ),
            _ => Action::Reply("502 Command not implemented\r\n".to_string()),
        }
    }

    fn mail(&mut self, args: &str) -> Action {
        match args.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("FROM:") => {
                let sender = strip_brackets(args[5..].trim());
                // A second MAIL FROM overwrites the sender and keeps any
                // recipients already collected.
                self.mail_from = Some(sender.to_string());
                Action::Reply("250 OK\r\n".to_string())
            }
            _ => Action::Reply("501 Syntax error in MAIL command\r\n".to_string()),
        }
    }

    fn rcpt(&mut self, args: &str, ctx: &SessionContext) -> Action {
        let recipient = match args.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("TO:") => {
                strip_brackets(args[3..].trim())
            }
            _ => return Action::Reply("501 Syntax error in RCPT command\r\n".to_string()),
        };

        if self.mail_from.is_none() {
            return Action::Reply("503 Need MAIL FROM first\r\n".to_string());
        }

        // Recipient-domain gating, deliberately blind to the sender: an
        // authenticated session may relay anywhere, an anonymous one only to
        // the allow-listed domains.
        let domain = recipient.split('@').nth(1).unwrap_or("");
        if !ctx.policy.allows(domain) && !self.is_authenticated() {
            if domain.is_empty() {
                return Action::Reply("554 Relay access denied\r\n".to_string());
            }
            return Action::Reply(format!("550 Relay not permitted for {}\r\n", domain));
        }

        self.rcpt_to.push(recipient.to_string());
        Action::Reply("250 OK\r\n".to_string())
    }

    fn data(&mut self) -> Action {
        if self.mail_from.is_none() {
            Action::Reply("503 Need MAIL FROM first\r\n".to_string())
        } else if self.rcpt_to.is_empty() {
            Action::Reply("503 Need RCPT TO first\r\n".to_string())
        } else {
            self.body.clear();
            self.state = SessionState::BodyCollection;
            Action::Reply("354 End data with <CR><LF>.<CR><LF>\r\n".to_string())
        }
    }

    fn body_line(&mut self, line: &str) -> Action {
        match codec::unstuff(line) {
            BodyLine::Terminator => {
                let delivery = Delivery {
                    from: self.mail_from.take().unwrap_or_default(),
                    recipients: std::mem::take(&mut self.rcpt_to),
                    body: std::mem::take(&mut self.body),
                };
                Action::Deliver(delivery)
            }
            BodyLine::Text(text) => {
                self.body.push(text);
                self.state = SessionState::BodyCollection;
                Action::Silent
            }
        }
    }

    fn auth(&mut self, args: &str, ctx: &SessionContext) -> Action {
        let (mechanism, initial) = match args.split_once(' ') {
            Some((mechanism, rest)) => (mechanism.to_ascii_uppercase(), Some(rest.trim())),
            None => (args.to_ascii_uppercase(), None),
        };

        match mechanism.as_str() {
            "LOGIN" => match initial {
                Some(encoded) => match decode_field(encoded) {
                    Some(username) => {
                        self.state =
                            SessionState::AuthContinuation(AuthStage::LoginPassword { username });
                        Action::Reply("334 UGFzc3dvcmQ6\r\n".to_string())
                    }
                    None => Action::Reply("535 Authentication failed\r\n".to_string()),
                },
                None => {
                    self.state = SessionState::AuthContinuation(AuthStage::LoginUsername);
                    Action::Reply("334 VXNlcm5hbWU6\r\n".to_string())
                }
            },
            "PLAIN" => match initial {
                Some(encoded) => {
                    let verdict = decode_plain(encoded, ctx.creds);
                    self.finish_auth(verdict)
                }
                None => {
                    self.state = SessionState::AuthContinuation(AuthStage::Plain);
                    Action::Reply("334 \r\n".to_string())
                }
            },
            _ => Action::Reply("504 Authentication method not supported\r\n".to_string()),
        }
    }

    fn auth_continue(&mut self, stage: AuthStage, line: &str, ctx: &SessionContext) -> Action {
        match stage {
            AuthStage::LoginUsername => match decode_field(line) {
                Some(username) => {
                    self.state =
                        SessionState::AuthContinuation(AuthStage::LoginPassword { username });
                    Action::Reply("334 UGFzc3dvcmQ6\r\n".to_string())
                }
                None => Action::Reply("535 Authentication failed\r\n".to_string()),
            },
            AuthStage::LoginPassword { username } => {
                let verdict = match decode_field(line) {
                    Some(secret) if ctx.creds.verify(&username, &secret) => {
                        AuthVerdict::Accepted { username }
                    }
                    _ => AuthVerdict::Rejected,
                };
                self.finish_auth(verdict)
            }
            AuthStage::Plain => {
                let verdict = decode_plain(line, ctx.creds);
                self.finish_auth(verdict)
            }
        }
    }

    fn finish_auth(&mut self, verdict: AuthVerdict) -> Action {
        match verdict {
            AuthVerdict::Accepted { username } => {
                self.authenticated_user = Some(username);
                Action::Reply("235 Authentication successful\r\n".to_string())
            }
            AuthVerdict::Rejected => Action::Reply("535 Authentication failed\r\n".to_string()),
        }
    }
}

fn strip_brackets(addr: &str) -> &str {
    addr.trim_matches(|c| c == '<' || c == '>')
}

/// `authzid NUL authcid NUL password`, base64-encoded.
fn decode_plain(encoded: &str, creds: &CredentialStore) -> AuthVerdict {
    let decoded = match decode_field(encoded) {
        Some(decoded) => decoded,
        None => return AuthVerdict::Rejected,
    };
    let mut fields = decoded.split('\0');
    let (username, secret) = match (fields.next(), fields.next(), fields.next()) {
        (Some(_authzid), Some(username), Some(secret)) => (username, secret),
        _ => return AuthVerdict::Rejected,
    };
    if creds.verify(username, secret) {
        AuthVerdict::Accepted {
            username: username.to_string(),
        }
    } else {
        AuthVerdict::Rejected
    }
}

fn decode_field(encoded: &str) -> Option<String> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SmtpSession {
        SmtpSession::new("203.0.113.9:45000".parse().unwrap())
    }

    fn creds() -> CredentialStore {
        CredentialStore::new([("ops".to_string(), "relay_ops_2025".to_string())])
    }

    fn policy() -> RelayPolicy {
        RelayPolicy::new(["lab.local".to_string()])
    }

    fn reply(action: Action) -> String {
        match action {
            Action::Reply(text) | Action::Quit(text) => text,
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    macro_rules! ctx {
        ($creds:expr, $policy:expr) => {
            SessionContext {
                creds: &$creds,
                policy: &$policy,
                hostname: "lab.local",
                size_limit: 1_048_576,
            }
        };
    }

    #[test]
    fn test_helo_defaults_client_name() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        assert_eq!(reply(s.apply_line("HELO", &ctx)), "250 Hello client\r\n");
        assert_eq!(
            reply(s.apply_line("helo box.example", &ctx)),
            "250 Hello box.example\r\n"
        );
    }

    #[test]
    fn test_ehlo_capability_block_is_well_formed() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        let text = reply(s.apply_line("EHLO attacker.com", &ctx));
        let lines: Vec<&str> = text.trim_end().split("\r\n").collect();
        assert_eq!(lines[0], "250-lab.local Hello attacker.com");
        assert!(lines.contains(&"250-AUTH PLAIN LOGIN"));
        assert!(lines.contains(&"250-SIZE 1048576"));
        assert_eq!(*lines.last().unwrap(), "250 HELP");
        // Every line but the last is a continuation.
        for line in &lines[..lines.len() - 1] {
            assert!(line.starts_with("250-"));
        }
    }

    #[test]
    fn test_rcpt_requires_sender() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        let text = reply(s.apply_line("RCPT TO:<a@lab.local>", &ctx));
        assert!(text.starts_with("503"));
        assert!(s.rcpt_to.is_empty());

        // The same holds right after RSET wipes the sender.
        s.apply_line("MAIL FROM:<a@lab.local>", &ctx);
        s.apply_line("RSET", &ctx);
        let text = reply(s.apply_line("RCPT TO:<a@lab.local>", &ctx));
        assert!(text.starts_with("503"));
        assert!(s.rcpt_to.is_empty());
    }

    #[test]
    fn test_rset_is_idempotent() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.apply_line("MAIL FROM:<a@lab.local>", &ctx);
        s.apply_line("RCPT TO:<b@lab.local>", &ctx);

        for _ in 0..2 {
            assert_eq!(reply(s.apply_line("RSET", &ctx)), "250 OK\r\n");
            assert_eq!(s.mail_from, None);
            assert!(s.rcpt_to.is_empty());
            assert!(s.body.is_empty());
            assert_eq!(s.state, SessionState::Command);
        }
    }

    #[test]
    fn test_relay_denied_for_foreign_domain_without_auth() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.apply_line("MAIL FROM:<a@foreign.com>", &ctx);
        let text = reply(s.apply_line("RCPT TO:<b@foreign.com>", &ctx));
        assert_eq!(text, "550 Relay not permitted for foreign.com\r\n");
        assert!(s.rcpt_to.is_empty());
    }

    #[test]
    fn test_relay_allowed_for_listed_domain() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.apply_line("MAIL FROM:<a@foreign.com>", &ctx);
        assert_eq!(reply(s.apply_line("RCPT TO:<b@lab.local>", &ctx)), "250 OK\r\n");
        assert_eq!(s.rcpt_to, vec!["b@lab.local".to_string()]);
    }

    #[test]
    fn test_relay_allowed_anywhere_once_authenticated() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.authenticated_user = Some("ops".to_string());
        s.apply_line("MAIL FROM:<a@foreign.com>", &ctx);
        assert_eq!(reply(s.apply_line("RCPT TO:<b@foreign.com>", &ctx)), "250 OK\r\n");
    }

    #[test]
    fn test_relay_denied_for_recipient_without_domain() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.apply_line("MAIL FROM:<a@lab.local>", &ctx);
        assert_eq!(
            reply(s.apply_line("RCPT TO:<postmaster>", &ctx)),
            "554 Relay access denied\r\n"
        );
    }

    #[test]
    fn test_mail_requires_from_prefix() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        let text = reply(s.apply_line("MAIL TO:<a@lab.local>", &ctx));
        assert!(text.starts_with("501"));
        assert_eq!(s.mail_from, None);

        assert_eq!(reply(s.apply_line("MAIL FROM: <a@lab.local>", &ctx)), "250 OK\r\n");
        assert_eq!(s.mail_from, Some("a@lab.local".to_string()));
    }

    #[test]
    fn test_second_mail_overwrites_sender_and_keeps_recipients() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.apply_line("MAIL FROM:<a@lab.local>", &ctx);
        s.apply_line("RCPT TO:<b@lab.local>", &ctx);
        s.apply_line("MAIL FROM:<c@lab.local>", &ctx);
        assert_eq!(s.mail_from, Some("c@lab.local".to_string()));
        assert_eq!(s.rcpt_to, vec!["b@lab.local".to_string()]);
    }

    #[test]
    fn test_data_sequencing() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        assert_eq!(reply(s.apply_line("DATA", &ctx)), "503 Need MAIL FROM first\r\n");
        s.apply_line("MAIL FROM:<a@lab.local>", &ctx);
        assert_eq!(reply(s.apply_line("DATA", &ctx)), "503 Need RCPT TO first\r\n");
        s.apply_line("RCPT TO:<b@lab.local>", &ctx);
        let text = reply(s.apply_line("DATA", &ctx));
        assert!(text.starts_with("354"));
        assert_eq!(s.state, SessionState::BodyCollection);
    }

    #[test]
    fn test_body_unstuffing_and_commit() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.apply_line("MAIL FROM:<a@lab.local>", &ctx);
        s.apply_line("RCPT TO:<b@lab.local>", &ctx);
        s.apply_line("DATA", &ctx);

        assert_eq!(s.apply_line("..hello", &ctx), Action::Silent);
        assert_eq!(s.apply_line("", &ctx), Action::Silent);
        assert_eq!(s.apply_line("world", &ctx), Action::Silent);

        let delivery = match s.apply_line(".", &ctx) {
            Action::Deliver(delivery) => delivery,
            other => panic!("expected delivery, got {:?}", other),
        };
        assert_eq!(delivery.from, "a@lab.local");
        assert_eq!(delivery.recipients, vec!["b@lab.local".to_string()]);
        assert_eq!(
            delivery.body,
            vec![".hello".to_string(), String::new(), "world".to_string()]
        );

        // The transaction is gone and the session is back in command mode.
        assert_eq!(s.state, SessionState::Command);
        assert_eq!(s.mail_from, None);
        assert!(s.rcpt_to.is_empty());
        assert!(s.body.is_empty());
    }

    #[test]
    fn test_auth_login_round_trip() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        assert_eq!(reply(s.apply_line("AUTH LOGIN", &ctx)), "334 VXNlcm5hbWU6\r\n");
        let user = BASE64.encode("ops");
        assert_eq!(reply(s.apply_line(&user, &ctx)), "334 UGFzc3dvcmQ6\r\n");
        let pass = BASE64.encode("relay_ops_2025");
        assert_eq!(reply(s.apply_line(&pass, &ctx)), "235 Authentication successful\r\n");
        assert_eq!(s.authenticated_user, Some("ops".to_string()));
    }

    #[test]
    fn test_auth_login_with_initial_username() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        let line = format!("AUTH LOGIN {}", BASE64.encode("ops"));
        assert_eq!(reply(s.apply_line(&line, &ctx)), "334 UGFzc3dvcmQ6\r\n");
        let pass = BASE64.encode("relay_ops_2025");
        assert_eq!(reply(s.apply_line(&pass, &ctx)), "235 Authentication successful\r\n");
    }

    #[test]
    fn test_auth_login_wrong_secret() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        s.apply_line("AUTH LOGIN", &ctx);
        s.apply_line(&BASE64.encode("ops"), &ctx);
        // One character off.
        let text = reply(s.apply_line(&BASE64.encode("relay_ops_2024"), &ctx));
        assert_eq!(text, "535 Authentication failed\r\n");
        assert!(!s.is_authenticated());
        assert_eq!(s.state, SessionState::Command);
    }

    #[test]
    fn test_auth_plain_inline_and_challenge() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let payload = BASE64.encode("\0ops\0relay_ops_2025");

        let mut s = session();
        let line = format!("AUTH PLAIN {}", payload);
        assert_eq!(reply(s.apply_line(&line, &ctx)), "235 Authentication successful\r\n");
        assert_eq!(s.authenticated_user, Some("ops".to_string()));

        let mut s = session();
        assert_eq!(reply(s.apply_line("AUTH PLAIN", &ctx)), "334 \r\n");
        assert_eq!(reply(s.apply_line(&payload, &ctx)), "235 Authentication successful\r\n");
    }

    #[test]
    fn test_auth_plain_rejects_malformed_payloads() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();

        // Missing NUL separators.
        let line = format!("AUTH PLAIN {}", BASE64.encode("ops relay_ops_2025"));
        assert_eq!(reply(s.apply_line(&line, &ctx)), "535 Authentication failed\r\n");

        // Not base64 at all.
        assert_eq!(
            reply(s.apply_line("AUTH PLAIN !!not-base64!!", &ctx)),
            "535 Authentication failed\r\n"
        );
        assert!(!s.is_authenticated());
    }

    #[test]
    fn test_auth_unsupported_mechanism_consumes_no_continuation() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        let text = reply(s.apply_line("AUTH CRAM-MD5", &ctx));
        assert!(text.starts_with("504"));
        // The next line is an ordinary command again.
        assert!(reply(s.apply_line("HELP", &ctx)).starts_with("214"));
    }

    #[test]
    fn test_vrfy_enumerates_known_users() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        assert_eq!(reply(s.apply_line("VRFY ops", &ctx)), "250 ops@lab.local\r\n");
        assert_eq!(reply(s.apply_line("VRFY root", &ctx)), "550 User unknown\r\n");
    }

    #[test]
    fn test_unrecognized_command_and_quit() {
        let (creds, policy) = (creds(), policy());
        let ctx = ctx!(creds, policy);
        let mut s = session();
        assert!(reply(s.apply_line("NOOP", &ctx)).starts_with("502"));
        assert!(reply(s.apply_line("XEXPN all", &ctx)).starts_with("502"));
        assert_eq!(s.apply_line("", &ctx), Action::Silent);
        match s.apply_line("QUIT", &ctx) {
            Action::Quit(text) => assert_eq!(text, "221 Bye\r\n"),
            other => panic!("expected quit, got {:?}", other),
        }
    }
}
