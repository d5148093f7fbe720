#![allow(dead_code)]

use chat_server::config::{AppState, ChatServerConfig};
use chat_server::directory::AccountTables;
use chat_server::models::{Decision, Identity, Participant, Role};
use chat_server::store::TenantStore;
use std::path::Path;
use std::sync::Arc;

pub const SECRET: &str = "test-secret";
pub const TENANT: &str = "iron_gym";

pub fn member(id: &str) -> Participant {
    Participant::new(id, Role::Member)
}

pub fn staff(id: &str) -> Participant {
    Participant::new(id, Role::Staff)
}

pub fn config(dir: &Path) -> ChatServerConfig {
    let mut config = ChatServerConfig::with_base_dir(dir);
    config.jwt_secret = SECRET.to_string();
    config
}

pub fn state_with(config: ChatServerConfig) -> AppState {
    AppState::new(config, Arc::new(AccountTables))
}

pub fn state(dir: &Path) -> AppState {
    state_with(config(dir))
}

pub fn token(state: &AppState, who: &Participant, tenant: &str) -> String {
    let identity = Identity {
        id: who.id.clone(),
        role: who.role,
        tenant: tenant.to_string(),
    };
    state
        .auth
        .issue(&identity, chrono::Duration::hours(1))
        .unwrap()
}

pub async fn store(state: &AppState) -> Arc<TenantStore> {
    state.tenants.resolve(TENANT).await.unwrap()
}

/// Create and accept a request from `a` to `b`
pub async fn befriend(state: &AppState, a: &Participant, b: &Participant) {
    let store = store(state).await;
    let request = state
        .relationships
        .create(&store, a, b, None)
        .await
        .unwrap();
    state
        .relationships
        .decide(&store, &request.id, b, Decision::Accept)
        .await
        .unwrap();
}

/// Give `who` an account row so sends addressed to it resolve
pub async fn register(state: &AppState, who: &Participant) {
    let store = store(state).await;
    AccountTables::register(&store, who, &who.id, &format!("{}@gym.test", who.id))
        .await
        .unwrap();
}
