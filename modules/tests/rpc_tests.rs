//! End-to-end tests for the JSON-RPC module: local calls, relayed calls,
//! and the failure paths around timeouts and netsplits.

use chrono::{Duration, Utc};
use ferrumd_core::{
    async_trait, ConfigCredentialVerifier, Database, Message, MessageType, Module, ModuleResult,
    Prefix, RemoteSender, Result, RpcConfig, User,
};
use ferrumd_modules::rpc::transport::ResponseSink;
use ferrumd_modules::rpc::RpcModule;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct CapturingSink {
    delivered: Mutex<Vec<Vec<u8>>>,
    closed: Mutex<bool>,
}

impl CapturingSink {
    fn envelopes(&self) -> Vec<Value> {
        self.delivered
            .lock()
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).expect("delivered bytes are JSON"))
            .collect()
    }
}

impl ResponseSink for CapturingSink {
    fn deliver(&self, bytes: &[u8]) {
        self.delivered.lock().push(bytes.to_vec());
    }
    fn close(&self) {
        *self.closed.lock() = true;
    }
}

struct RecordingSender {
    sent: Mutex<Vec<(String, Message)>>,
    linked: Vec<String>,
}

impl RecordingSender {
    fn new(linked: &[&str]) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            linked: linked.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn sent_to(&self, sid: &str) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(dest, _)| dest == sid)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Reassemble the chunks of relay frames sent toward one server
    fn relay_payload(&self, sid: &str) -> String {
        self.sent_to(sid)
            .iter()
            .filter(|m| m.command == MessageType::Rrpc)
            .map(|m| m.params[5].clone())
            .collect()
    }
}

#[async_trait]
impl RemoteSender for RecordingSender {
    async fn send_to_server(&self, sid: &str, message: Message) -> Result<()> {
        self.sent.lock().push((sid.to_string(), message));
        Ok(())
    }
    async fn broadcast(&self, _except: Option<&str>, _message: Message) -> Result<()> {
        Ok(())
    }
    async fn is_linked(&self, sid: &str) -> bool {
        self.linked.iter().any(|l| l == sid)
    }
}

fn test_user(nick: &str) -> User {
    User {
        id: Uuid::new_v4(),
        nick: nick.to_string(),
        username: nick.to_string(),
        realname: format!("{} realname", nick),
        host: "host.example.org".to_string(),
        server: "irc.example.org".to_string(),
        account: None,
        registered_at: Utc::now(),
        registered: true,
    }
}

async fn setup(linked: &[&str]) -> (RpcModule, Arc<RecordingSender>, Arc<Database>) {
    let sender = Arc::new(RecordingSender::new(linked));
    let database = Arc::new(Database::new());
    let mut module = RpcModule::new(
        "001",
        "irc.example.org",
        &RpcConfig {
            enabled: true,
            users: vec![],
        },
        sender.clone(),
        database.clone(),
        Arc::new(ConfigCredentialVerifier),
    );
    module.init().await.unwrap();
    (module, sender, database)
}

#[tokio::test]
async fn rpc_info_lists_registered_methods() {
    let (module, _, _) = setup(&[]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());

    let request = json!({"jsonrpc": "2.0", "id": 1, "method": "rpc.info"});
    module
        .deliver(&session, format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1);
    let reply = &envelopes[0];
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["method"], "rpc.info");
    let methods = reply["result"]["methods"].as_object().unwrap();
    assert!(methods.contains_key("rpc.info"));
    assert!(methods.contains_key("user.list"));
    assert!(methods.contains_key("user.get"));
    assert_eq!(methods["user.get"]["module"], "rpc");
}

#[tokio::test]
async fn validation_failures_each_yield_one_error() {
    let (module, _, _) = setup(&[]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());

    let cases: Vec<(Value, i64)> = vec![
        // Wrong protocol version
        (json!({"jsonrpc": "1.0", "id": 1, "method": "rpc.info"}), -32600),
        // Version missing entirely
        (json!({"id": 1, "method": "rpc.info"}), -32600),
        // Missing id
        (json!({"jsonrpc": "2.0", "method": "rpc.info"}), -32600),
        // Float id
        (json!({"jsonrpc": "2.0", "id": 1.5, "method": "rpc.info"}), -32600),
        // Array id
        (json!({"jsonrpc": "2.0", "id": [1], "method": "rpc.info"}), -32600),
        // Missing method
        (json!({"jsonrpc": "2.0", "id": 1}), -32600),
        // Unknown method
        (json!({"jsonrpc": "2.0", "id": 1, "method": "no.such"}), -32601),
    ];

    for (request, expected_code) in cases {
        let before = sink.envelopes().len();
        module
            .deliver(&session, format!("{}\n", request).as_bytes())
            .await
            .unwrap();
        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), before + 1, "one reply for {}", request);
        assert_eq!(
            envelopes.last().unwrap()["error"]["code"], expected_code,
            "for {}",
            request
        );
    }
}

#[tokio::test]
async fn omitted_params_reach_the_handler_as_empty_object() {
    use ferrumd_modules::rpc::engine::{RpcCaller, RpcEngine};
    use ferrumd_modules::rpc::registry::{RpcHandler, RpcHandlerInfo};

    struct EchoParamsHandler;

    #[async_trait]
    impl RpcHandler for EchoParamsHandler {
        async fn call(
            &self,
            engine: &RpcEngine,
            caller: &RpcCaller,
            request: &Value,
            params: &Value,
        ) -> Result<()> {
            engine
                .response(caller, request, json!({ "params": params.clone() }))
                .await;
            Ok(())
        }
    }

    let (module, _, _) = setup(&[]).await;
    module
        .engine()
        .registry()
        .register(RpcHandlerInfo {
            method: "test.echo".to_string(),
            module: "test".to_string(),
            version: "1.0.0".to_string(),
            handler: Arc::new(EchoParamsHandler),
        })
        .unwrap();

    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());
    let request = json!({"jsonrpc": "2.0", "id": 1, "method": "test.echo"});
    module
        .deliver(&session, format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let seen = &sink.envelopes()[0]["result"]["params"];
    assert!(seen.is_object());
    assert!(seen.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn unparsable_input_gets_parse_error_and_close() {
    let (module, _, _) = setup(&[]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());

    module.deliver(&session, b"{not json\n").await.unwrap();

    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["error"]["code"], -32700);
    assert!(envelopes[0].get("id").is_none());
    assert!(*sink.closed.lock());
}

#[tokio::test]
async fn partial_reads_assemble_into_documents() {
    let (module, _, _) = setup(&[]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());

    module
        .deliver(&session, br#"{"jsonrpc":"2.0","id":"a","me"#)
        .await
        .unwrap();
    assert!(sink.envelopes().is_empty());

    // Rest of the first document plus a complete second one in a single read
    module
        .deliver(
            &session,
            b"thod\":\"rpc.info\"}\n{\"jsonrpc\":\"2.0\",\"id\":\"b\",\"method\":\"rpc.info\"}\n",
        )
        .await
        .unwrap();

    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0]["id"], "a");
    assert_eq!(envelopes[1]["id"], "b");
}

#[tokio::test]
async fn user_handlers_cover_found_missing_and_bad_params() {
    let (module, _, database) = setup(&[]).await;
    database.add_user(test_user("alice")).unwrap();
    database.add_user(test_user("bob")).unwrap();

    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());

    let list = json!({"jsonrpc": "2.0", "id": 1, "method": "user.list"});
    module
        .deliver(&session, format!("{}\n", list).as_bytes())
        .await
        .unwrap();
    assert_eq!(sink.envelopes()[0]["result"]["list"].as_array().unwrap().len(), 2);

    let get = json!({"jsonrpc": "2.0", "id": 2, "method": "user.get", "params": {"nick": "Alice"}});
    module
        .deliver(&session, format!("{}\n", get).as_bytes())
        .await
        .unwrap();
    let reply = &sink.envelopes()[1];
    assert_eq!(reply["result"]["client"]["name"], "alice");
    assert_eq!(reply["result"]["client"]["hostname"], "host.example.org");

    let missing = json!({"jsonrpc": "2.0", "id": 3, "method": "user.get", "params": {"nick": "carol"}});
    module
        .deliver(&session, format!("{}\n", missing).as_bytes())
        .await
        .unwrap();
    assert_eq!(sink.envelopes()[2]["error"]["code"], -1003);

    let no_nick = json!({"jsonrpc": "2.0", "id": 4, "method": "user.get"});
    module
        .deliver(&session, format!("{}\n", no_nick).as_bytes())
        .await
        .unwrap();
    assert_eq!(sink.envelopes()[3]["error"]["code"], -32602);
}

#[tokio::test]
async fn remote_request_fragments_and_registers() {
    let (module, sender, _) = setup(&["042"]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());
    let engine = module.engine();

    let filler = "x".repeat(1000);
    let request = json!({"jsonrpc": "2.0", "id": "big", "method": "rpc.info", "params": {"filler": filler}});
    engine.send_request_to_remote(&session, "042", &request).await;

    let frames = sender.sent_to("042");
    assert!(frames.len() >= 3);
    assert_eq!(frames[0].params[0], "REQ");
    assert_eq!(frames[0].params[1], session.uid);
    assert_eq!(frames[0].params[2], "042");
    assert_eq!(frames[0].params[3], "big");
    assert_eq!(frames[0].params[4], "S");
    assert_eq!(frames.last().unwrap().params[4], "F");
    assert!(frames.iter().all(|f| f.params[5].len() <= 450));

    let reassembled: Value = serde_json::from_str(&sender.relay_payload("042")).unwrap();
    assert_eq!(reassembled, request);
    assert_eq!(engine.outstanding().len(), 1);

    // Same id again while in flight: refused locally, nothing more sent
    let frames_before = sender.sent_to("042").len();
    engine.send_request_to_remote(&session, "042", &request).await;
    assert_eq!(sender.sent_to("042").len(), frames_before);
    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["error"]["code"], -32600);
}

#[tokio::test]
async fn remote_request_to_unlinked_server_fails_fast() {
    let (module, sender, _) = setup(&[]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());

    let request = json!({"jsonrpc": "2.0", "id": 1, "method": "rpc.info"});
    module
        .engine()
        .send_request_to_remote(&session, "042", &request)
        .await;

    assert!(sender.sent.lock().is_empty());
    assert_eq!(sink.envelopes()[0]["error"]["code"], -1002);
    assert!(module.engine().outstanding().is_empty());
}

#[tokio::test]
async fn relayed_request_is_answered_over_the_relay() {
    let (mut module, sender, _) = setup(&["042"]).await;

    let request = json!({"jsonrpc": "2.0", "id": 55, "method": "rpc.info"});
    let frame = Message::with_prefix(
        Prefix::Server("hub.example.org".to_string()),
        MessageType::Rrpc,
        vec![
            "REQ".to_string(),
            "042ABCDEF".to_string(),
            "001".to_string(),
            "55".to_string(),
            "SF".to_string(),
            request.to_string(),
        ],
    );
    let result = module.handle_server_message("042", &frame).await.unwrap();
    assert!(matches!(result, ModuleResult::Handled));

    let frames = sender.sent_to("042");
    assert!(!frames.is_empty());
    assert_eq!(frames[0].params[0], "RES");
    assert_eq!(frames[0].params[1], "001");
    assert_eq!(frames[0].params[2], "042ABCDEF");
    assert_eq!(frames[0].params[3], "55");

    let reply: Value = serde_json::from_str(&sender.relay_payload("042")).unwrap();
    assert_eq!(reply["id"], 55);
    assert!(reply["result"]["methods"].is_object());
}

#[tokio::test]
async fn relayed_response_settles_the_waiting_session() {
    let (module, _, _) = setup(&["042"]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());
    let engine = module.engine();

    let request = json!({"jsonrpc": "2.0", "id": "7", "method": "rpc.info"});
    engine.send_request_to_remote(&session, "042", &request).await;
    assert_eq!(engine.outstanding().len(), 1);

    let envelope = json!({"jsonrpc": "2.0", "id": "7", "result": {"ok": true}});
    let frame = Message::new(
        MessageType::Rrpc,
        vec![
            "RES".to_string(),
            "042".to_string(),
            session.uid.clone(),
            "7".to_string(),
            "SF".to_string(),
            envelope.to_string(),
        ],
    );
    engine.handle_rrpc("042", &frame).await.unwrap();

    assert!(engine.outstanding().is_empty());
    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["result"]["ok"], true);

    // A straggler response for the same id is dropped
    engine.handle_rrpc("042", &frame).await.unwrap();
    assert_eq!(sink.envelopes().len(), 1);
}

#[tokio::test]
async fn duplicate_start_discards_and_reports() {
    let (module, sender, _) = setup(&["042"]).await;
    let engine = module.engine();

    let start = Message::new(
        MessageType::Rrpc,
        vec![
            "REQ".to_string(),
            "042ABCDEF".to_string(),
            "001".to_string(),
            "9".to_string(),
            "S".to_string(),
            "{\"par".to_string(),
        ],
    );
    engine.handle_rrpc("042", &start).await.unwrap();
    assert_eq!(engine.relay().len(), 1);

    engine.handle_rrpc("042", &start).await.unwrap();
    assert_eq!(engine.relay().len(), 0);
    let numerics = sender.sent_to("042");
    assert_eq!(numerics.len(), 1);
    assert_eq!(numerics[0].command, MessageType::Custom("972".to_string()));
    assert!(numerics[0].params.contains(&"Duplicate request found".to_string()));
}

#[tokio::test]
async fn continuation_without_start_reports_not_found() {
    let (module, sender, _) = setup(&["042"]).await;

    for phase in ["C", "F"] {
        let frame = Message::new(
            MessageType::Rrpc,
            vec![
                "REQ".to_string(),
                "042ABCDEF".to_string(),
                "001".to_string(),
                "9".to_string(),
                phase.to_string(),
                "data".to_string(),
            ],
        );
        module.engine().handle_rrpc("042", &frame).await.unwrap();
    }
    let numerics = sender.sent_to("042");
    assert_eq!(numerics.len(), 2);
    for numeric in numerics {
        assert_eq!(numeric.command, MessageType::Custom("972".to_string()));
        assert!(numeric.params.contains(&"Request not found".to_string()));
    }
}

#[tokio::test]
async fn frames_for_other_servers_are_forwarded() {
    let (module, sender, _) = setup(&["042", "043"]).await;

    let frame = Message::with_prefix(
        Prefix::Server("a.example.org".to_string()),
        MessageType::Rrpc,
        vec![
            "REQ".to_string(),
            "042ABCDEF".to_string(),
            "043".to_string(),
            "1".to_string(),
            "SF".to_string(),
            "{}".to_string(),
        ],
    );
    module.engine().handle_rrpc("042", &frame).await.unwrap();

    let forwarded = sender.sent_to("043");
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].params, frame.params);
    // No local relay state for pass-through traffic
    assert!(module.engine().relay().is_empty());
}

#[tokio::test]
async fn frames_for_unknown_servers_get_402() {
    let (module, sender, _) = setup(&["042"]).await;

    let frame = Message::new(
        MessageType::Rrpc,
        vec![
            "REQ".to_string(),
            "042ABCDEF".to_string(),
            "099".to_string(),
            "1".to_string(),
            "SF".to_string(),
            "{}".to_string(),
        ],
    );
    module.engine().handle_rrpc("042", &frame).await.unwrap();

    let numerics = sender.sent_to("042");
    assert_eq!(numerics.len(), 1);
    assert_eq!(numerics[0].command, MessageType::Custom("402".to_string()));

    // A destination whose third byte splits a multibyte character must not
    // panic routing; it cannot name a linked server, so it also draws 402
    let hostile = Message::new(
        MessageType::Rrpc,
        vec![
            "REQ".to_string(),
            "042ABCDEF".to_string(),
            "ab\u{20AC}CDEF".to_string(),
            "2".to_string(),
            "SF".to_string(),
            "{}".to_string(),
        ],
    );
    module.engine().handle_rrpc("042", &hostile).await.unwrap();
    let numerics = sender.sent_to("042");
    assert_eq!(numerics.len(), 2);
    assert_eq!(numerics[1].command, MessageType::Custom("402".to_string()));
}

#[tokio::test]
async fn unparsable_relayed_request_gets_parse_error_back() {
    let (module, sender, _) = setup(&["042"]).await;

    let frame = Message::new(
        MessageType::Rrpc,
        vec![
            "REQ".to_string(),
            "042ABCDEF".to_string(),
            "001".to_string(),
            "3".to_string(),
            "SF".to_string(),
            "{broken".to_string(),
        ],
    );
    module.engine().handle_rrpc("042", &frame).await.unwrap();

    let reply: Value = serde_json::from_str(&sender.relay_payload("042")).unwrap();
    assert_eq!(reply["error"]["code"], -32700);
}

#[tokio::test]
async fn timeout_fires_exactly_once() {
    let (module, _, _) = setup(&["042"]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());
    let engine = module.engine();

    let request = json!({"jsonrpc": "2.0", "id": "slow", "method": "rpc.info"});
    engine.send_request_to_remote(&session, "042", &request).await;

    // Young entries survive a sweep
    engine.sweep_timeouts(Utc::now());
    assert!(sink.envelopes().is_empty());

    let late = Utc::now() + Duration::seconds(16);
    engine.sweep_timeouts(late);
    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["error"]["code"], -1001);
    assert_eq!(envelopes[0]["id"], "slow");

    engine.sweep_timeouts(late + Duration::seconds(5));
    assert_eq!(sink.envelopes().len(), 1);
}

#[tokio::test]
async fn netsplit_cancels_requests_and_transfers() {
    let (mut module, _, _) = setup(&["042"]).await;
    let sink = Arc::new(CapturingSink::default());
    let session = module.open_unix_session("local", sink.clone());

    let request = json!({"jsonrpc": "2.0", "id": "r1", "method": "rpc.info"});
    module
        .engine()
        .send_request_to_remote(&session, "042", &request)
        .await;

    // A half-received transfer from the same server
    let start = Message::new(
        MessageType::Rrpc,
        vec![
            "REQ".to_string(),
            "042ABCDEF".to_string(),
            "001".to_string(),
            "2".to_string(),
            "S".to_string(),
            "{\"pa".to_string(),
        ],
    );
    module.engine().handle_rrpc("042", &start).await.unwrap();
    assert_eq!(module.engine().relay().len(), 1);

    module.handle_server_disconnect("042").await.unwrap();

    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["error"]["code"], -1000);
    assert_eq!(envelopes[0]["id"], "r1");
    assert!(module.engine().outstanding().is_empty());
    assert!(module.engine().relay().is_empty());

    // Later sweeps must not report the cancelled request again
    module
        .engine()
        .sweep_timeouts(Utc::now() + Duration::seconds(30));
    assert_eq!(sink.envelopes().len(), 1);
}
