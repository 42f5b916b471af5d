//! Shared scaffolding for integration tests: an isolated Fabric with an
//! in-memory database, plus helpers to attach observable client handles.

use latticed::config::Config;
use latticed::db::Database;
use latticed::state::{ClientHandle, Fabric};
use lattice_proto::ident::Nickname;
use lattice_proto::Message;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn fabric() -> Arc<Fabric> {
    let config: Config = toml::from_str(
        r#"
        [server]
        name = "irc.lattice.test"
        sid = "0LT"

        [[listeners]]
        address = "127.0.0.1"
        port = 6667

        [security]
        cloak_secret = "integration-test-secret-0123456789"
        "#,
    )
    .unwrap();
    let db = Database::in_memory().await.unwrap();
    Fabric::new(Arc::new(config), db)
}

/// Register a local user with an observable outbound queue. Returns the
/// UID and the receiver that sees everything delivered to this "client".
pub async fn connect_user(
    fabric: &Arc<Fabric>,
    nick: &str,
) -> (String, mpsc::Receiver<Arc<Message>>) {
    connect_user_with_caps(fabric, nick, &[]).await
}

pub async fn connect_user_with_caps(
    fabric: &Arc<Fabric>,
    nick: &str,
    caps: &[&str],
) -> (String, mpsc::Receiver<Arc<Message>>) {
    let uid = fabric.uid_gen.allocate();
    let (tx, rx) = mpsc::channel(256);
    let cap_set: HashSet<String> = caps.iter().map(|c| c.to_string()).collect();
    fabric.senders.insert(
        uid.clone(),
        ClientHandle {
            tx,
            caps: Arc::new(parking_lot::RwLock::new(cap_set.clone())),
            secure: false,
        },
    );

    let nickname = Nickname::parse(nick).unwrap();
    fabric.claim_nick(&uid, &nickname).unwrap();
    let user = fabric.build_local_user(
        &uid,
        nick,
        "u",
        "Test User",
        "host.example",
        "192.0.2.77",
        None,
        false,
        None,
        cap_set,
    );
    fabric.attach_user(user);
    (uid, rx)
}

/// Drain everything currently queued for a client.
pub fn drain(rx: &mut mpsc::Receiver<Arc<Message>>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push((*msg).clone());
    }
    out
}
