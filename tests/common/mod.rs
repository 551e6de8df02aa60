//! Shared helpers for the end-to-end tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use mywant::config::AppConfig;
use mywant::engine::EngineHandle;
use mywant::registry::agents::{AgentSpec, AgentType, ExecTarget};
use mywant::registry::want_types::WantTypeDefinition;
use mywant::want::{Want, WantId, WantMetadata, WantSpec, WantStatus};

/// Engine config tuned for fast test turnaround
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.tick_ms = 10;
    config.engine.monitor_interval_secs = 1;
    config.engine.shutdown_grace_secs = 2;
    config
}

/// A minimal want type with no schema
pub fn plain_type(type_name: &str) -> WantTypeDefinition {
    WantTypeDefinition {
        type_name: type_name.to_string(),
        title: String::new(),
        category: "test".into(),
        pattern: String::new(),
        parameters: Vec::new(),
        think_capabilities: Vec::new(),
        default_state: BTreeMap::new(),
        recipe: None,
        monitor_capabilities: Vec::new(),
    }
}

/// A local Do-agent declaration
pub fn do_spec(name: &str, capabilities: &[&str]) -> AgentSpec {
    AgentSpec {
        name: name.to_string(),
        agent_type: AgentType::Do,
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        exec: ExecTarget::Local,
        description: String::new(),
    }
}

/// A local Monitor-agent declaration
pub fn monitor_spec(name: &str, capabilities: &[&str]) -> AgentSpec {
    AgentSpec {
        name: name.to_string(),
        agent_type: AgentType::Monitor,
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        exec: ExecTarget::Local,
        description: String::new(),
    }
}

/// Build a want with labels, requires, and using selectors
pub fn want(
    name: &str,
    want_type: &str,
    labels: &[(&str, &str)],
    requires: &[&str],
    using: &[&[(&str, &str)]],
) -> Want {
    Want::new(
        WantMetadata {
            id: None,
            name: name.to_string(),
            want_type: want_type.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        },
        WantSpec {
            requires: requires.iter().map(|c| c.to_string()).collect(),
            using: using
                .iter()
                .map(|selector| {
                    selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .collect(),
            ..Default::default()
        },
    )
}

/// Poll until the want reaches `expect`, panicking after five seconds
pub async fn wait_for_status(handle: &EngineHandle, id: WantId, expect: WantStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = handle.status(id).await.unwrap();
        if status == Some(expect) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {:?}, last saw {:?}",
            expect,
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until `check` passes against the want's results
pub async fn wait_for_state(
    handle: &EngineHandle,
    id: WantId,
    check: impl Fn(&BTreeMap<String, serde_json::Value>) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(results) = handle.results(id).await.unwrap() {
            if check(&results) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for state condition"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
