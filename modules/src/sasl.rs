//! SASL authentication relay
//!
//! Local clients speak `AUTHENTICATE`; the actual mechanism runs on a
//! services agent elsewhere on the network. This module bridges the two:
//! client messages become `SASL` server commands addressed to the configured
//! agent, agent answers come back as numerics, and `SVSLOGIN` finally binds
//! the account name.

use ferrumd_core::{
    async_trait, Client, Error, Message, MessageType, Module, ModuleResult, NumericReply, Prefix,
    RemoteSender, Result, SaslConfig,
};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

const MODULE_NAME: &str = "sasl";
const MODULE_VERSION: &str = "1.0.0";

/// Longest `AUTHENTICATE` chunk a client may send
pub const AUTHENTICATE_MAX: usize = 400;

/// One client's authentication attempt
#[derive(Debug)]
struct SaslSession {
    client_id: Uuid,
    cookie: u16,
    /// Outgoing queue of the client connection
    sender: mpsc::UnboundedSender<Message>,
    nick: Option<String>,
    /// First agent to answer owns the session; others are ignored
    agent: Option<String>,
    /// Account granted by SVSLOGIN, applied at registration
    account: Option<String>,
    in_progress: bool,
}

/// SASL relay plugin
pub struct SaslModule {
    me_name: String,
    config: SaslConfig,
    links: Arc<dyn RemoteSender>,
    /// Sessions keyed by PUID cookie
    sessions: DashMap<u16, SaslSession>,
    /// Client id to cookie, for client-side lookups
    by_client: DashMap<Uuid, u16>,
}

impl SaslModule {
    pub fn new(me_name: &str, config: SaslConfig, links: Arc<dyn RemoteSender>) -> Self {
        Self {
            me_name: me_name.to_string(),
            config,
            links,
            sessions: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    /// PUID: a pre-registration client identifier valid network-wide
    fn encode_puid(&self, cookie: u16) -> String {
        format!("{}!0.{}", self.me_name, cookie)
    }

    /// Accept only PUIDs naming this server
    fn decode_puid(&self, puid: &str) -> Option<u16> {
        let (server, rest) = puid.split_once('!')?;
        if !server.eq_ignore_ascii_case(&self.me_name) {
            return None;
        }
        rest.strip_prefix("0.")?.parse().ok()
    }

    fn fresh_cookie(&self) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let cookie = rng.gen_range(1..=u16::MAX);
            if !self.sessions.contains_key(&cookie) {
                return cookie;
            }
        }
    }

    /// The account granted during SASL, consumed by the host when the
    /// client finishes registration
    pub fn take_account(&self, client_id: Uuid) -> Option<String> {
        let cookie = self.by_client.remove(&client_id)?.1;
        let (_, session) = self.sessions.remove(&cookie)?;
        session.account
    }

    async fn relay(&self, dist: &str, puid: &str, kind: &str, data: &[&str]) -> Result<()> {
        let mut params = vec![dist.to_string(), puid.to_string(), kind.to_string()];
        params.extend(data.iter().map(|d| d.to_string()));
        let message = Message::with_prefix(
            Prefix::Server(self.me_name.clone()),
            MessageType::Sasl,
            params,
        );
        // The dist parameter routes; intermediate servers pass it along
        self.links.broadcast(None, message).await
    }

    async fn abort_session(&self, cookie: u16, notify_client: bool) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(&cookie) else {
            return Ok(());
        };
        self.by_client.remove(&session.client_id);
        if session.in_progress {
            let target = session.agent.clone().unwrap_or_else(|| self.config.server.clone());
            self.relay(&target, &self.encode_puid(cookie), "D", &["A"])
                .await?;
            if notify_client {
                send_numeric(&session, NumericReply::ErrSaslAborted, &["SASL authentication aborted"]);
            }
        }
        Ok(())
    }

    async fn handle_authenticate(&self, client: &Client, data: &str) -> Result<ModuleResult> {
        if !self.config.enabled || self.config.server.is_empty() {
            client.send_numeric(NumericReply::ErrSaslFail, &["SASL authentication failed"])?;
            return Ok(ModuleResult::Handled);
        }
        if data.starts_with(':') || data.contains(' ') {
            client.send_numeric(
                NumericReply::ErrCannotDoCommand,
                &["AUTHENTICATE", "Invalid parameter"],
            )?;
            return Ok(ModuleResult::Handled);
        }
        if data.len() > AUTHENTICATE_MAX {
            client.send_numeric(NumericReply::ErrSaslTooLong, &["SASL message too long"])?;
            return Ok(ModuleResult::Handled);
        }

        if data == "*" {
            if let Some(cookie) = self.by_client.get(&client.id).map(|c| *c) {
                self.abort_session(cookie, true).await?;
            } else {
                client.send_numeric(
                    NumericReply::ErrSaslAborted,
                    &["SASL authentication aborted"],
                )?;
            }
            return Ok(ModuleResult::Handled);
        }

        match self.by_client.get(&client.id).map(|c| *c) {
            None => {
                // First chunk opens the session with the configured agent
                let cookie = self.fresh_cookie();
                self.sessions.insert(
                    cookie,
                    SaslSession {
                        client_id: client.id,
                        cookie,
                        sender: client.sender.clone(),
                        nick: client.nickname().map(|n| n.to_string()),
                        agent: None,
                        account: None,
                        in_progress: true,
                    },
                );
                self.by_client.insert(client.id, cookie);
                let puid = self.encode_puid(cookie);
                self.relay(
                    &self.config.server,
                    &puid,
                    "H",
                    &[&client.remote_addr, &client.remote_addr],
                )
                .await?;
                self.relay(&self.config.server, &puid, "S", &[data]).await?;
            }
            Some(cookie) => {
                let target = self
                    .sessions
                    .get(&cookie)
                    .and_then(|s| s.agent.clone())
                    .unwrap_or_else(|| self.config.server.clone());
                self.relay(&target, &self.encode_puid(cookie), "C", &[data])
                    .await?;
            }
        }
        Ok(ModuleResult::Handled)
    }

    async fn handle_sasl_from_server(
        &self,
        from_sid: &str,
        message: &Message,
    ) -> Result<ModuleResult> {
        if message.params.len() < 3 {
            return Ok(ModuleResult::NotHandled);
        }
        let dist = &message.params[0];
        if !dist.eq_ignore_ascii_case(&self.me_name) {
            // Not ours: pass along, away from where it came
            self.links.broadcast(Some(from_sid), message.clone()).await?;
            return Ok(ModuleResult::Handled);
        }

        let puid = &message.params[1];
        let Some(cookie) = self.decode_puid(puid) else {
            debug!("SASL message for unparsable puid {}", puid);
            return Ok(ModuleResult::Handled);
        };
        let agent = match &message.prefix {
            Some(Prefix::Server(name)) => name.clone(),
            Some(Prefix::User { nick, .. }) => nick.clone(),
            None => from_sid.to_string(),
        };

        let Some(mut session) = self.sessions.get_mut(&cookie) else {
            debug!("SASL message for unknown session {}", cookie);
            return Ok(ModuleResult::Handled);
        };
        match &session.agent {
            Some(pinned) if !pinned.eq_ignore_ascii_case(&agent) => {
                // A second agent answering the same client is ignored
                return Ok(ModuleResult::Handled);
            }
            None => session.agent = Some(agent),
            _ => {}
        }

        let kind = message.params[2].as_str();
        let data = message.params.get(3).map(String::as_str).unwrap_or("");
        match kind {
            "C" => {
                let _ = session.sender.send(Message::new(
                    MessageType::Authenticate,
                    vec![data.to_string()],
                ));
            }
            "D" => match data {
                "S" => {
                    session.in_progress = false;
                    send_numeric(
                        &session,
                        NumericReply::RplSaslSuccess,
                        &["SASL authentication successful"],
                    );
                }
                "F" => {
                    session.in_progress = false;
                    send_numeric(&session, NumericReply::ErrSaslFail, &["SASL authentication failed"]);
                }
                _ => {}
            },
            "M" => {
                send_numeric(
                    &session,
                    NumericReply::RplSaslMechs,
                    &[data, "are available SASL mechanisms"],
                );
            }
            _ => {
                debug!("Unknown SASL subcommand {} for {}", kind, puid);
            }
        }
        Ok(ModuleResult::Handled)
    }

    async fn handle_svslogin(&self, from_sid: &str, message: &Message) -> Result<ModuleResult> {
        if message.params.len() < 3 {
            return Ok(ModuleResult::NotHandled);
        }
        let dist = &message.params[0];
        let puid = &message.params[1];
        let account = &message.params[2];

        if !dist.eq_ignore_ascii_case(&self.me_name) {
            self.links.broadcast(Some(from_sid), message.clone()).await?;
            return Ok(ModuleResult::Handled);
        }

        let Some(cookie) = self.decode_puid(puid) else {
            return Ok(ModuleResult::Handled);
        };
        let Some(mut session) = self.sessions.get_mut(&cookie) else {
            return Ok(ModuleResult::Handled);
        };
        session.account = Some(account.clone());
        let target = session.nick.clone().unwrap_or_else(|| "*".to_string());
        let _ = session.sender.send(NumericReply::RplLoggedIn.reply(
            &target,
            vec![
                format!("{}!*@*", target),
                account.clone(),
                format!("You are now logged in as {}", account),
            ],
        ));
        Ok(ModuleResult::Handled)
    }
}

fn send_numeric(session: &SaslSession, numeric: NumericReply, params: &[&str]) {
    let target = session.nick.clone().unwrap_or_else(|| "*".to_string());
    let _ = session.sender.send(numeric.reply(
        &target,
        params.iter().map(|p| p.to_string()).collect(),
    ));
}

#[async_trait]
impl Module for SaslModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn version(&self) -> &str {
        MODULE_VERSION
    }

    fn description(&self) -> &str {
        "SASL authentication relayed to a network services agent"
    }

    async fn init(&mut self) -> Result<()> {
        if self.config.enabled && self.config.server.is_empty() {
            return Err(Error::Module(
                "sasl is enabled but no agent server is configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.sessions.clear();
        self.by_client.clear();
        Ok(())
    }

    async fn handle_message(&mut self, client: &Client, message: &Message) -> Result<ModuleResult> {
        if message.command != MessageType::Authenticate {
            return Ok(ModuleResult::NotHandled);
        }
        if client.is_registered() || !client.has_capability("sasl") {
            return Ok(ModuleResult::NotHandled);
        }
        let Some(data) = message.params.first() else {
            client.send_numeric(
                NumericReply::ErrNeedMoreParams,
                &["AUTHENTICATE", "Not enough parameters"],
            )?;
            return Ok(ModuleResult::Handled);
        };
        self.handle_authenticate(client, data).await
    }

    async fn handle_server_message(
        &mut self,
        from_sid: &str,
        message: &Message,
    ) -> Result<ModuleResult> {
        match message.command {
            MessageType::Sasl => self.handle_sasl_from_server(from_sid, message).await,
            MessageType::SvsLogin => self.handle_svslogin(from_sid, message).await,
            _ => Ok(ModuleResult::NotHandled),
        }
    }

    async fn handle_user_registration(&mut self, client: &Client) -> Result<()> {
        // Registration ends any unfinished attempt
        if let Some(cookie) = self.by_client.get(&client.id).map(|c| *c) {
            let still_running = self
                .sessions
                .get(&cookie)
                .map(|s| s.in_progress)
                .unwrap_or(false);
            if still_running {
                self.abort_session(cookie, true).await?;
            }
        }
        Ok(())
    }

    async fn handle_user_disconnection(&mut self, client: &Client) -> Result<()> {
        if let Some(cookie) = self.by_client.get(&client.id).map(|c| *c) {
            self.abort_session(cookie, false).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrumd_core::ClientState;
    use tokio::sync::mpsc::unbounded_channel;

    struct NullSender;

    #[async_trait]
    impl RemoteSender for NullSender {
        async fn send_to_server(&self, _sid: &str, _message: Message) -> Result<()> {
            Ok(())
        }
        async fn broadcast(&self, _except: Option<&str>, _message: Message) -> Result<()> {
            Ok(())
        }
        async fn is_linked(&self, _sid: &str) -> bool {
            true
        }
    }

    fn module() -> SaslModule {
        SaslModule::new(
            "irc.example.org",
            SaslConfig {
                enabled: true,
                server: "services.example.org".to_string(),
            },
            Arc::new(NullSender),
        )
    }

    fn client() -> (Client, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let mut client = Client::new(Uuid::new_v4(), "203.0.113.5".to_string(), tx);
        client.state = ClientState::Connected;
        client.capabilities.insert("sasl".to_string());
        (client, rx)
    }

    #[test]
    fn test_puid_round_trip() {
        let m = module();
        let puid = m.encode_puid(31337);
        assert_eq!(puid, "irc.example.org!0.31337");
        assert_eq!(m.decode_puid(&puid), Some(31337));
        assert_eq!(m.decode_puid("other.example.org!0.31337"), None);
        assert_eq!(m.decode_puid("irc.example.org!1.31337"), None);
        assert_eq!(m.decode_puid("garbage"), None);
    }

    #[tokio::test]
    async fn test_authenticate_rejects_bad_data() {
        let mut m = module();
        let (client, mut rx) = client();

        let msg = Message::new(
            MessageType::Authenticate,
            vec![":colon-first".to_string()],
        );
        m.handle_message(&client, &msg).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.command, MessageType::Custom("972".to_string()));

        let long = "a".repeat(AUTHENTICATE_MAX + 1);
        let msg = Message::new(MessageType::Authenticate, vec![long]);
        m.handle_message(&client, &msg).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.command, MessageType::Custom("905".to_string()));
    }

    #[tokio::test]
    async fn test_authenticate_opens_session() {
        let mut m = module();
        let (client, _rx) = client();
        let msg = Message::new(MessageType::Authenticate, vec!["PLAIN".to_string()]);
        assert!(matches!(
            m.handle_message(&client, &msg).await.unwrap(),
            ModuleResult::Handled
        ));
        assert_eq!(m.sessions.len(), 1);
        assert!(m.by_client.contains_key(&client.id));
    }

    #[tokio::test]
    async fn test_server_success_sends_903() {
        let mut m = module();
        let (client, mut rx) = client();
        let open = Message::new(MessageType::Authenticate, vec!["PLAIN".to_string()]);
        m.handle_message(&client, &open).await.unwrap();
        let cookie = *m.by_client.get(&client.id).unwrap();

        let done = Message::with_prefix(
            Prefix::Server("services.example.org".to_string()),
            MessageType::Sasl,
            vec![
                "irc.example.org".to_string(),
                m.encode_puid(cookie),
                "D".to_string(),
                "S".to_string(),
            ],
        );
        m.handle_server_message("042", &done).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.command, MessageType::Custom("903".to_string()));
    }

    #[tokio::test]
    async fn test_second_agent_ignored() {
        let mut m = module();
        let (client, mut rx) = client();
        let open = Message::new(MessageType::Authenticate, vec!["PLAIN".to_string()]);
        m.handle_message(&client, &open).await.unwrap();
        let cookie = *m.by_client.get(&client.id).unwrap();
        let puid = m.encode_puid(cookie);

        let first = Message::with_prefix(
            Prefix::Server("services.example.org".to_string()),
            MessageType::Sasl,
            vec![
                "irc.example.org".to_string(),
                puid.clone(),
                "C".to_string(),
                "+".to_string(),
            ],
        );
        m.handle_server_message("042", &first).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().command,
            MessageType::Authenticate
        );

        let impostor = Message::with_prefix(
            Prefix::Server("rogue.example.org".to_string()),
            MessageType::Sasl,
            vec![
                "irc.example.org".to_string(),
                puid,
                "D".to_string(),
                "S".to_string(),
            ],
        );
        m.handle_server_message("043", &impostor).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_svslogin_grants_account() {
        let mut m = module();
        let (client, mut rx) = client();
        let open = Message::new(MessageType::Authenticate, vec!["PLAIN".to_string()]);
        m.handle_message(&client, &open).await.unwrap();
        let cookie = *m.by_client.get(&client.id).unwrap();

        let login = Message::with_prefix(
            Prefix::Server("services.example.org".to_string()),
            MessageType::SvsLogin,
            vec![
                "irc.example.org".to_string(),
                m.encode_puid(cookie),
                "alice".to_string(),
            ],
        );
        m.handle_server_message("042", &login).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().command,
            MessageType::Custom("900".to_string())
        );
        assert_eq!(m.take_account(client.id), Some("alice".to_string()));
    }
}
