//! Integration tests for the API socket
//!
//! A server is bound to a temporary socket and driven through [`ApiClient`].
//! The test process itself is the caller; it is allowed by mapping the
//! account name "tester" to the current uid. "someone-else" exists but is
//! a different account.

use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hop_api::{
    AllowList, ApiClient, ApiServer, ApiService, AuthorizationGuard, CallerIdentity,
    ConnectionLevel, EngineHandle, EngineSlot, Error, IdentityResolver, Intent, MemoryProfileStore,
    Profile, StateListener, TunnelPermission,
};

const VALID: &str = r#"
[common]
key = "secret"

[client]
server = ["vpn1.example.com", "vpn2.example.com"]
port_range = [4096, 4196]
"#;

struct TesterResolver;

impl IdentityResolver for TesterResolver {
    fn resolve(&self, name: &str) -> Option<CallerIdentity> {
        let me = CallerIdentity::current();
        match name {
            "tester" => Some(me),
            "someone-else" => Some(CallerIdentity::new(me.uid.wrapping_add(1))),
            _ => None,
        }
    }
}

#[derive(Default)]
struct MockEngine {
    starts: AtomicUsize,
    protected: AtomicUsize,
}

#[async_trait::async_trait]
impl EngineHandle for MockEngine {
    async fn start(&self, _profile: &Profile) -> hop_api::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn stop(&self) {}
    async fn pause(&self) {}
    async fn resume(&self) {}
    fn protect(&self, _fd: BorrowedFd<'_>) -> hop_api::Result<bool> {
        self.protected.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

struct Granted;

impl TunnelPermission for Granted {
    fn needs_grant(&self) -> bool {
        false
    }
}

struct Harness {
    socket: PathBuf,
    service: Arc<ApiService>,
    engine: Arc<MockEngine>,
    _bound: Arc<dyn EngineHandle>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
        let _ = std::fs::remove_file(&self.socket);
    }
}

async fn start_server(allowed: &[&str]) -> Harness {
    let socket = std::env::temp_dir().join(format!("hop-api-test-{}.sock", uuid::Uuid::new_v4()));

    let allow_list = Arc::new(AllowList::in_memory(allowed.iter().copied()));
    let guard = AuthorizationGuard::new(allow_list, Arc::new(TesterResolver));

    let engine = Arc::new(MockEngine::default());
    let bound: Arc<dyn EngineHandle> = engine.clone();
    let slot = Arc::new(EngineSlot::new());
    slot.bind(&bound);

    let service = Arc::new(
        ApiService::new(
            guard,
            Arc::new(MemoryProfileStore::new()),
            slot,
            Duration::from_secs(1),
        )
        .with_permission(Arc::new(Granted)),
    );

    let api = ApiServer::bind(&socket, service.clone()).unwrap();
    let server = tokio::spawn(async move {
        let _ = api.run().await;
    });

    Harness {
        socket,
        service,
        engine,
        _bound: bound,
        server,
    }
}

#[tokio::test]
async fn test_profile_round_trip_over_socket() {
    let harness = start_server(&["tester"]).await;
    let mut client = ApiClient::connect(&harness.socket).await.unwrap();

    assert!(client.list_profiles().await.unwrap().is_empty());

    let added = client
        .add_profile_detailed("office", false, VALID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(added.name, "office");
    assert_eq!(added.creator.as_deref(), Some("tester"));
    assert!(!added.user_editable);

    assert!(!client.add_profile("broken", "[client").await.unwrap());
    assert_eq!(client.list_profiles().await.unwrap(), vec![added.clone()]);

    assert_eq!(client.start_profile(added.uuid).await.unwrap(), None);
    assert_eq!(harness.engine.starts.load(Ordering::SeqCst), 1);

    client.remove_profile(added.uuid).await.unwrap();
    client.remove_profile(added.uuid).await.unwrap();
    assert!(client.list_profiles().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unlisted_caller_is_rejected() {
    let harness = start_server(&["someone-else"]).await;
    let mut client = ApiClient::connect(&harness.socket).await.unwrap();
    let uuid = uuid::Uuid::new_v4();
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let before = harness.service.hub().snapshot();

    assert!(matches!(client.list_profiles().await, Err(Error::Unauthorized)));
    assert!(matches!(
        client.add_profile("office", VALID).await,
        Err(Error::Unauthorized)
    ));
    assert!(matches!(
        client.add_profile_detailed("office", true, VALID).await,
        Err(Error::Unauthorized)
    ));
    assert!(matches!(client.remove_profile(uuid).await, Err(Error::Unauthorized)));
    assert!(matches!(client.start_profile(uuid).await, Err(Error::Unauthorized)));
    assert!(matches!(
        client.start_inline_config("once", VALID).await,
        Err(Error::Unauthorized)
    ));
    assert!(matches!(
        client.protect_socket(socket.as_fd()).await,
        Err(Error::Unauthorized)
    ));
    assert!(matches!(
        client.check_tunnel_permission().await,
        Err(Error::Unauthorized)
    ));
    assert!(matches!(client.register_observer().await, Err(Error::Unauthorized)));
    assert!(matches!(client.unregister_observer().await, Err(Error::Unauthorized)));
    assert!(matches!(client.status().await, Err(Error::Unauthorized)));
    assert!(matches!(client.stop().await, Err(Error::Unauthorized)));
    assert!(matches!(client.pause().await, Err(Error::Unauthorized)));
    assert!(matches!(client.resume().await, Err(Error::Unauthorized)));

    // The bootstrap check works without authorization
    assert_eq!(
        client.check_pre_approved("tester").await.unwrap(),
        Some(Intent::ConfirmApi)
    );
    assert_eq!(client.check_pre_approved("someone-else").await.unwrap(), None);

    assert_eq!(harness.service.hub().observer_count(), 0);
    assert_eq!(harness.service.hub().snapshot(), before);
    assert_eq!(harness.engine.starts.load(Ordering::SeqCst), 0);
    assert_eq!(harness.engine.protected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unlisted_protect_socket_without_descriptor_is_unauthorized() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let harness = start_server(&["someone-else"]).await;
    let stream = tokio::net::UnixStream::connect(&harness.socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"{\"type\":\"protect_socket\"}\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["kind"], "unauthorized");
    assert_eq!(harness.engine.protected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_protect_socket_without_descriptor_is_protocol_error() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let harness = start_server(&["tester"]).await;
    let stream = tokio::net::UnixStream::connect(&harness.socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"{\"type\":\"protect_socket\"}\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(reply["kind"], "protocol");
    assert_eq!(harness.engine.protected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_validation_errors_carry_reason() {
    let harness = start_server(&["tester"]).await;
    let mut client = ApiClient::connect(&harness.socket).await.unwrap();

    let result = client
        .start_inline_config("once", "[client]\nserver = \"h\"\n")
        .await;
    match result {
        Err(Error::Validation(reason)) => assert!(reason.contains("key")),
        other => panic!("unexpected {:?}", other),
    }

    assert!(matches!(
        client.start_inline_config("once", "not toml [").await,
        Err(Error::Import(_))
    ));
    assert_eq!(harness.engine.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_observer_receives_snapshot_and_transitions() {
    let harness = start_server(&["tester"]).await;
    let mut client = ApiClient::connect(&harness.socket).await.unwrap();

    client.register_observer().await.unwrap();
    let initial = client.next_update().await.unwrap();
    assert_eq!(initial.state, "NOPROCESS");
    assert_eq!(initial.level, "LEVEL_NOTCONNECTED");
    assert_eq!(harness.service.hub().observer_count(), 1);

    harness
        .service
        .on_state("CONNECTED", "Tunnel is up", ConnectionLevel::Connected);

    let update = tokio::time::timeout(Duration::from_secs(5), client.next_update())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.state, "CONNECTED");
    assert_eq!(update.level, "LEVEL_CONNECTED");

    let (status, active) = client.status().await.unwrap();
    assert_eq!(status, update);
    assert!(active);

    client.unregister_observer().await.unwrap();
    assert_eq!(harness.service.hub().observer_count(), 0);
}

#[tokio::test]
async fn test_disconnected_observer_is_dropped() {
    let harness = start_server(&["tester"]).await;
    {
        let mut client = ApiClient::connect(&harness.socket).await.unwrap();
        client.register_observer().await.unwrap();
        assert_eq!(harness.service.hub().observer_count(), 1);
    }

    for _ in 0..200 {
        if harness.service.hub().observer_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("observer of closed connection still registered");
}

#[tokio::test]
async fn test_protect_socket_passes_descriptor() {
    let harness = start_server(&["tester"]).await;
    let mut client = ApiClient::connect(&harness.socket).await.unwrap();

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    assert!(client.protect_socket(socket.as_fd()).await.unwrap());
    assert_eq!(harness.engine.protected.load(Ordering::SeqCst), 1);

    // The connection stays usable afterwards
    assert_eq!(client.check_tunnel_permission().await.unwrap(), None);
}

#[tokio::test]
async fn test_malformed_request_keeps_connection() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let harness = start_server(&["tester"]).await;
    let stream = tokio::net::UnixStream::connect(&harness.socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"{\"type\":\"launch_missiles\"}\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["kind"], "protocol");

    writer.write_all(b"{\"type\":\"list_profiles\"}\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(reply["type"], "profiles");
}
