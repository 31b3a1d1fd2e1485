use relayflow_core::config::types::FlowConfig;
use relayflow_core::engine::RelayFlow;
use tracing::Level;

// Own test binary: the global subscriber installed here is the engine's.
#[tokio::test]
async fn engine_installs_configured_log_level() {
    std::env::remove_var("RUST_LOG");
    assert!(!tracing::enabled!(Level::DEBUG));

    let config = FlowConfig {
        log_level: "debug".to_string(),
        ..FlowConfig::default()
    };
    RelayFlow::new()
        .config(config)
        .run_with_shutdown(async {})
        .await
        .unwrap();

    assert!(tracing::enabled!(Level::DEBUG));
}
