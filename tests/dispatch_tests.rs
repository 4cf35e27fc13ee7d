use shardmaster::dispatch::{DispatcherHolder, MemoryNodeService, NodeServer, TcpConnector};
use shardmaster::{
    MasterConfig, MetaError, PartitionMeta, PartitionStatus, ReplicaDispatcher, ZoneRpcClient,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

fn partition(id: u64) -> PartitionMeta {
    PartitionMeta {
        id,
        db_id: 1,
        space_id: 2,
        start_slot: 0,
        end_slot: 1024,
        replicas: Vec::new(),
        status: PartitionStatus::Creating,
    }
}

fn client(config: &MasterConfig) -> ZoneRpcClient {
    ZoneRpcClient::new(
        config,
        Arc::new(TcpConnector::new(config.rpc.connect_timeout)),
    )
    .unwrap()
}

async fn node(cluster_id: &str) -> (Arc<MemoryNodeService>, NodeServer) {
    let service = Arc::new(MemoryNodeService::for_cluster(cluster_id));
    let server = NodeServer::bind("127.0.0.1:0", service.clone()).await.unwrap();
    (service, server)
}

#[tokio::test]
async fn test_add_replica_to_unreachable_node_fails_within_timeout() {
    let config = MasterConfig::new("c1");
    let rpc = client(&config);

    let started = Instant::now();
    let err = rpc.add_replica("127.0.0.1:1", 1, 2).await.unwrap_err();
    assert!(matches!(err, MetaError::RpcInvocationFailed(_)));
    assert!(started.elapsed() < config.rpc.request_timeout + Duration::from_millis(500));
}

#[tokio::test]
async fn test_silent_node_is_cut_off_by_request_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    // Accept and hold connections without ever answering.
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = MasterConfig::new("c1").request_timeout(Duration::from_millis(200));
    let rpc = client(&config);

    let started = Instant::now();
    let err = rpc.add_replica(&addr, 1, 2).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, MetaError::RpcInvocationFailed(_)));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));

    holder.abort();
}

#[tokio::test]
async fn test_lifecycle_calls_reach_node() {
    let (service, server) = node("c1").await;
    let addr = server.local_addr().to_string();
    let rpc = client(&MasterConfig::new("c1"));

    rpc.create_partition(&addr, &partition(10)).await.unwrap();
    // Creating twice is accepted by the node.
    rpc.create_partition(&addr, &partition(10)).await.unwrap();
    rpc.add_replica(&addr, 10, 77).await.unwrap();
    rpc.add_replica(&addr, 10, 78).await.unwrap();
    rpc.remove_replica(&addr, 10, 77).await.unwrap();

    let hosted = service.hosted(10).await.unwrap();
    assert_eq!(hosted.meta, partition(10));
    assert_eq!(hosted.replicas.into_iter().collect::<Vec<_>>(), vec![78]);

    rpc.delete_partition(&addr, 10).await.unwrap();
    assert!(service.partition_ids().await.is_empty());

    let stats = rpc.pool_stats().unwrap();
    assert_eq!(stats.clients, 1);
    assert_eq!(stats.busy_clients, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_application_rejection_is_rpc_failure() {
    let (_, server) = node("c1").await;
    let addr = server.local_addr().to_string();
    let rpc = client(&MasterConfig::new("c1"));

    // Unknown partition on the node.
    let err = rpc.add_replica(&addr, 404, 1).await.unwrap_err();
    assert!(matches!(err, MetaError::RpcInvocationFailed(_)));

    // Wrong cluster.
    let other = client(&MasterConfig::new("c2"));
    let err = other.create_partition(&addr, &partition(1)).await.unwrap_err();
    assert!(matches!(err, MetaError::RpcInvocationFailed(_)));

    // The connection stays usable after a rejection.
    rpc.create_partition(&addr, &partition(1)).await.unwrap();
}

#[tokio::test]
async fn test_client_unavailable_is_distinct() {
    let rpc = client(&MasterConfig::new("c1"));
    let err = rpc.delete_partition("", 1).await.unwrap_err();
    assert!(matches!(err, MetaError::ClientUnavailable(_)));

    let (_, server) = node("c1").await;
    let addr = server.local_addr().to_string();
    rpc.close().await;
    let err = rpc.delete_partition(&addr, 1).await.unwrap_err();
    assert!(matches!(err, MetaError::ClientUnavailable(_)));
}

/// Listener that accepts connections and never answers.
async fn silent_node() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, holder)
}

#[tokio::test]
async fn test_pool_capacity_counts_clients_with_calls_in_flight() {
    let (silent_addr, holder) = silent_node().await;
    let (_, node) = node("c1").await;
    let node_addr = node.local_addr().to_string();
    let config = MasterConfig::new("c1")
        .max_clients(1)
        .idle_timeout(None)
        .request_timeout(Duration::from_millis(500));
    let rpc = Arc::new(client(&config));

    let pending = {
        let rpc = Arc::clone(&rpc);
        tokio::spawn(async move { rpc.create_partition(&silent_addr, &partition(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rpc.pool_stats().unwrap().busy_clients, 1);

    let err = rpc
        .create_partition(&node_addr, &partition(2))
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::ClientUnavailable(_)));

    // Once the stuck call gives up its client, the slot is reused.
    let stuck = pending.await.unwrap().unwrap_err();
    assert!(matches!(stuck, MetaError::RpcInvocationFailed(_)));
    rpc.create_partition(&node_addr, &partition(2)).await.unwrap();
    assert_eq!(rpc.pool_stats().unwrap().clients, 1);

    holder.abort();
}

#[tokio::test]
async fn test_pool_from_file_config_serves_new_addresses() {
    let config = MasterConfig::from_json_str(
        r#"{"cluster": {"cluster_id": "c1"}, "rpc": {"max_clients": 1}}"#,
    )
    .unwrap();
    let rpc = client(&config);
    let (_, first) = node("c1").await;
    let (_, second) = node("c1").await;

    rpc.create_partition(&first.local_addr().to_string(), &partition(1))
        .await
        .unwrap();
    rpc.create_partition(&second.local_addr().to_string(), &partition(2))
        .await
        .unwrap();
    let stats = rpc.pool_stats().unwrap();
    assert_eq!(stats.clients, 1);
    assert_eq!(stats.busy_clients, 0);
}

#[tokio::test]
async fn test_holder_requires_config_on_first_use() {
    let holder = DispatcherHolder::new(Arc::new(TcpConnector::default()));
    assert!(matches!(holder.get(None), Err(MetaError::Config(_))));
    assert!(!holder.is_initialized());

    let config = MasterConfig::new("c1");
    let first = holder.get(Some(&config)).unwrap();
    let again = holder.get(None).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert!(holder.is_initialized());
}

#[tokio::test]
async fn test_holder_close_resets_and_reinitializes() {
    let holder = DispatcherHolder::new(Arc::new(TcpConnector::default()));
    let config = MasterConfig::new("c1");
    let first = holder.get(Some(&config)).unwrap();

    holder.close().await.unwrap();
    assert!(!holder.is_initialized());
    assert!(matches!(holder.get(None), Err(MetaError::Config(_))));
    // The old instance is torn down.
    assert!(matches!(
        first.delete_partition("127.0.0.1:1", 1).await,
        Err(MetaError::ClientUnavailable(_))
    ));

    let second = holder.get(Some(&config)).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    holder.close().await.unwrap();
    holder.close().await.unwrap();
}

#[test]
fn test_concurrent_first_use_builds_one_client() {
    let holder = Arc::new(DispatcherHolder::new(Arc::new(TcpConnector::default())));
    let config = MasterConfig::new("c1");

    let clients: Vec<_> = (0..8)
        .map(|_| {
            let holder = Arc::clone(&holder);
            let config = config.clone();
            std::thread::spawn(move || holder.get(Some(&config)).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for client in &clients[1..] {
        assert!(Arc::ptr_eq(&clients[0], client));
    }
}

#[tokio::test]
async fn test_holder_rejects_invalid_config() {
    let holder = DispatcherHolder::new(Arc::new(TcpConnector::default()));
    let config = MasterConfig::new("c1").max_clients(0);
    assert!(matches!(holder.get(Some(&config)), Err(MetaError::Config(_))));
    assert!(!holder.is_initialized());
}
