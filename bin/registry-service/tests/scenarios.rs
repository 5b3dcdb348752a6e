//! End-to-end scenarios wired against an in-memory transport: join, dedup,
//! timeout eviction, graceful shutdown, locate round trip, and party
//! dispatch with rollback.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use registry_bus::InMemoryTransport;
use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::channels;
use registry_catalog::SlotCatalog;
use registry_core::FamilyId;
use registry_core::Heartbeat;
use registry_core::NodeIdentifier;
use registry_core::NodeKind;
use registry_core::ShutdownHint;
use registry_core::SlotId;
use registry_heartbeat::HeartbeatConfig;
use registry_heartbeat::HeartbeatMonitor;
use registry_identity::IdentifierAllocator;
use registry_membership::BackendRegistry;
use registry_membership::ProxyRegistry;
use registry_registration::RegistrationHandler;
use registry_registration::RegistrationRequest;
use registry_routing::LocateService;
use registry_routing::PartyReservationSnapshot;
use registry_routing::PartyRoutingService;

struct Harness {
    bus: Arc<MessageBus>,
    allocator: Arc<IdentifierAllocator>,
    proxies: Arc<ProxyRegistry>,
    backends: Arc<BackendRegistry>,
    heartbeat: Arc<HeartbeatMonitor>,
    catalog: Arc<SlotCatalog>,
    registration: Arc<RegistrationHandler>,
}

impl Harness {
    async fn new(heartbeat_config: HeartbeatConfig) -> Self {
        let bus = Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())));
        let allocator = Arc::new(IdentifierAllocator::new());
        let proxies = Arc::new(ProxyRegistry::new(bus.clone()));
        let backends = Arc::new(BackendRegistry::new(bus.clone()));
        let heartbeat = HeartbeatMonitor::new(heartbeat_config, proxies.clone(), backends.clone());
        let catalog = Arc::new(SlotCatalog::new());
        let registration = RegistrationHandler::new(bus.clone(), allocator.clone(), proxies.clone(), backends.clone(), heartbeat.clone(), catalog.clone());
        registration.start().await.unwrap();
        Self { bus, allocator, proxies, backends, heartbeat, catalog, registration }
    }
}

fn backend_request(temp_id: &str) -> RegistrationRequest {
    RegistrationRequest {
        temp_id: temp_id.into(),
        server_type: "lobby".into(),
        role: "lobby".into(),
        address: "10.0.0.1".into(),
        port: 25001,
        max_capacity: 100,
        version: "1.0".into(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_basic_join() {
    let harness = Harness::new(HeartbeatConfig::default()).await;

    let added_count = Arc::new(AtomicUsize::new(0));
    let added_count_clone = added_count.clone();
    harness
        .bus
        .subscribe(channels::SERVER_ADDED, move |_envelope| {
            let added_count = added_count_clone.clone();
            async move {
                added_count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    let response = harness.registration.handle_registration(backend_request("temp-b-1")).await;
    assert!(response.success);
    assert!(response.assigned_id.is_some());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(added_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_duplicate_suppression() {
    let harness = Harness::new(HeartbeatConfig::default()).await;

    let added_count = Arc::new(AtomicUsize::new(0));
    let added_count_clone = added_count.clone();
    harness
        .bus
        .subscribe(channels::SERVER_ADDED, move |_envelope| {
            let added_count = added_count_clone.clone();
            async move {
                added_count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    let first = harness.registration.handle_registration(backend_request("temp-b-1")).await;
    let second = harness.registration.handle_registration(backend_request("temp-b-1")).await;
    assert_eq!(first.assigned_id, second.assigned_id);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(added_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_timeout_eviction() {
    let harness = Harness::new(HeartbeatConfig { check_interval: Duration::from_secs(1), timeout: Duration::from_secs(2) }).await;

    let removed = Arc::new(AtomicUsize::new(0));
    let removed_clone = removed.clone();
    harness
        .bus
        .subscribe(channels::SERVER_REMOVED, move |_envelope| {
            let removed = removed_clone.clone();
            async move {
                removed.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    let response = harness.registration.handle_registration(backend_request("temp-b-2")).await;
    let id = response.assigned_id.unwrap();
    harness.heartbeat.start();

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
    }

    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert!(harness.backends.get(id).await.is_none());
    assert!(harness.allocator.allocate_backend().await.unwrap().instance() != id.instance());
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_graceful_shutdown() {
    let harness = Harness::new(HeartbeatConfig::default()).await;

    let response = harness.registration.handle_registration(RegistrationRequest {
        temp_id: "temp-p-1".into(),
        server_type: "proxy".into(),
        role: "proxy".into(),
        address: "10.0.0.2".into(),
        port: 25500,
        max_capacity: 1000,
        version: "1.0".into(),
    })
    .await;
    let id = response.assigned_id.unwrap();

    let removed = Arc::new(AtomicUsize::new(0));
    let removed_clone = removed.clone();
    harness
        .bus
        .subscribe(channels::PROXY_REMOVED, move |_envelope| {
            let removed = removed_clone.clone();
            async move {
                removed.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    let heartbeat = Heartbeat { node_id: id, player_count: 0, tps: 20.0, status: Some(ShutdownHint::Shutdown) };
    harness
        .bus
        .broadcast(channels::SERVER_HEARTBEAT, MessageEnvelope::new("Heartbeat", serde_json::to_value(&heartbeat).unwrap()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert!(harness.proxies.get(id).await.is_none());

    let reissued = harness.allocator.allocate_proxy().await.unwrap();
    assert_eq!(reissued.instance(), id.instance());
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_locate_round_trip() {
    let bus = Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())));
    let locate = LocateService::new(bus.clone());
    locate.start().await.unwrap();

    let bus_responder = bus.clone();
    bus.subscribe(channels::PLAYER_LOCATE_REQUEST, move |envelope: MessageEnvelope| {
        let bus_responder = bus_responder.clone();
        async move {
            let correlation_id = envelope.correlation_id.clone().unwrap();
            let response = MessageEnvelope::new(
                "LocateResponse",
                serde_json::json!({"found": true, "serverId": "lobby-1", "slotSuffix": null, "familyId": "lobby", "proxyId": null}),
            )
            .with_correlation_id(correlation_id);
            let _ = bus_responder.broadcast(channels::PLAYER_LOCATE_RESPONSE, response).await;
        }
    })
    .await
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), locate.locate("Alice")).await.unwrap();
    assert!(result.found);
    assert_eq!(result.server_id.as_deref(), Some("lobby-1"));
    assert_eq!(result.family_id, Some(FamilyId::new("lobby")));
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_party_dispatch_rollback() {
    let bus = Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())));
    let rollback_count = Arc::new(AtomicUsize::new(0));
    let rollback_count_clone = rollback_count.clone();
    bus.subscribe("registry:party:rollback", move |_envelope| {
        let rollback_count = rollback_count_clone.clone();
        async move {
            rollback_count.fetch_add(1, Ordering::SeqCst);
        }
    })
    .await
    .unwrap();

    let service = PartyRoutingService::new(bus);
    let server_id = NodeIdentifier::new(NodeKind::Backend, uuid::Uuid::now_v7(), 0, registry_core::identifier::now_millis()).unwrap();
    service
        .create(PartyReservationSnapshot {
            reservation_id: "party-7".into(),
            family_id: FamilyId::new("skywars"),
            variant_id: None,
            slot_id: SlotId::new("skywars-7"),
            slot_suffix: None,
            server_id,
            party_size: 3,
            team_index: None,
        })
        .await;

    service.record_claim("party-7", "p1", true, None).await.unwrap();
    service.record_claim("party-7", "p2", true, None).await.unwrap();
    let progress = service.record_claim("party-7", "p3", false, Some("connection refused".into())).await.unwrap();

    assert!(progress.complete);
    assert!(!progress.success);
    assert_eq!(progress.failures, 1);
    assert_eq!(progress.missing, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rollback_count.load(Ordering::SeqCst), 1);

    let allocation = service.get("party-7").await.unwrap();
    assert!(allocation.released);
}
