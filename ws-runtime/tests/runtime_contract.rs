use std::collections::BTreeMap;
use std::sync::Arc;

use ws_network::SlotAllocator;
use ws_runtime::{get_runtime, RepositorySpec, Runtime, RuntimeConfig, RuntimeStatus, StubRuntime};

async fn drive_lifecycle(runtime: &dyn Runtime) {
    assert_eq!(runtime.status("contract").await.unwrap(), RuntimeStatus::NotFound);
    runtime.create("contract", "base").await.unwrap();
    runtime.start("contract").await.unwrap();
    assert_eq!(runtime.status("contract").await.unwrap(), RuntimeStatus::Running);
    assert!(!runtime.get_ip("contract").await.unwrap().is_empty());
    runtime.stop("contract").await.unwrap();
    assert_eq!(runtime.status("contract").await.unwrap(), RuntimeStatus::Stopped);
    runtime.remove("contract").await.unwrap();
    assert_eq!(runtime.status("contract").await.unwrap(), RuntimeStatus::NotFound);
}

#[tokio::test]
async fn test_factory_stub_satisfies_contract() {
    let config = RuntimeConfig {
        backend: "stub".into(),
        ..Default::default()
    };
    let runtime = get_runtime(&config, Arc::new(SlotAllocator::in_memory())).unwrap();
    drive_lifecycle(runtime.as_ref()).await;
}

#[tokio::test]
async fn test_capabilities_reachable_through_trait_object() {
    let stub = Arc::new(
        StubRuntime::new()
            .with_guest_capabilities()
            .with_address("10.1.2.3:8080"),
    );
    let runtime: Arc<dyn Runtime> = stub.clone();
    runtime.create("demo", "base").await.unwrap();

    let mut env = BTreeMap::new();
    env.insert("auth".to_string(), "none".to_string());
    runtime
        .configurer()
        .expect("stub configures when enabled")
        .configure("demo", &env)
        .await
        .unwrap();

    let addr = runtime.get_ip("demo").await.unwrap();
    let repo = RepositorySpec {
        url: "https://example.com/repo.git".into(),
        branch: None,
        directory: None,
    };
    runtime
        .cloner()
        .expect("stub clones when enabled")
        .clone_repository("demo", &addr, &repo, Some("token"))
        .await
        .unwrap();

    assert_eq!(stub.calls(), vec!["create", "configure", "clone"]);
    assert_eq!(stub.configured_env("demo"), Some(env));
    assert_eq!(stub.cloned(), vec![("demo".to_string(), repo)]);
}

#[tokio::test]
async fn test_port_addr_defaults_to_guest_host() {
    let runtime: Arc<dyn Runtime> = Arc::new(StubRuntime::new().with_address("10.1.2.3:8080"));
    runtime.create("demo", "base").await.unwrap();
    assert_eq!(runtime.port_addr("demo", 3000).await.unwrap(), "10.1.2.3:3000");
    assert!(runtime.port_addr("missing", 3000).await.is_err());
}
