//! Registration and command-path scenarios driven through the dispatcher,
//! with no sockets: CAP/SASL/NICK/USER sequencing, join + fan-out, ban
//! numerics, and flood control.

mod common;

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use common::{connect_user, drain, fabric};
use lattice_proto::{Message, Response};
use latticed::handlers::{Context, Registry};
use latticed::state::{Fabric, Session};
use std::net::SocketAddr;
use std::sync::Arc;

struct Client {
    uid: String,
    session: Session,
    addr: SocketAddr,
    /// Keeps the outbound queue alive so broker deliveries don't vanish.
    _rx: tokio::sync::mpsc::Receiver<Arc<Message>>,
}

impl Client {
    fn new(fabric: &Arc<Fabric>) -> Self {
        let uid = fabric.uid_gen.allocate();
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        fabric.senders.insert(
            uid.clone(),
            latticed::state::ClientHandle {
                tx,
                caps: Arc::new(parking_lot::RwLock::new(Default::default())),
                secure: false,
            },
        );
        Self {
            uid,
            session: Session::new(false, None),
            addr: "192.0.2.10:50000".parse().unwrap(),
            _rx: rx,
        }
    }

    /// Dispatch one raw line; returns the replies queued for this client.
    async fn send(&mut self, fabric: &Arc<Fabric>, registry: &Registry, line: &str) -> Vec<Message> {
        let msg: Message = line.parse().expect("test line parses");
        let mut ctx = Context::new(
            &self.uid,
            fabric,
            &mut self.session,
            self.addr,
            None,
            registry,
        );
        let _ = registry.dispatch(&mut ctx, &msg).await;
        std::mem::take(&mut ctx.replies)
    }
}

fn numerics(replies: &[Message]) -> Vec<String> {
    replies.iter().map(|m| m.command.clone()).collect()
}

fn has_numeric(replies: &[Message], response: Response) -> bool {
    replies.iter().any(|m| m.command == response.as_command())
}

#[tokio::test]
async fn registration_happy_path_with_sasl() {
    let fabric = fabric().await;
    let registry = Registry::new();

    // Provision the account the client will bind.
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(b"pw", &salt)
        .unwrap()
        .to_string();
    fabric.db.create_account("alice", Some(&hash)).await.unwrap();

    let mut client = Client::new(&fabric);

    let replies = client.send(&fabric, &registry, "CAP LS 302").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command, "CAP");
    assert_eq!(replies[0].params[1], "LS");
    assert!(replies[0].params[2].contains("sasl=PLAIN,EXTERNAL"));
    assert!(replies[0].params[2].contains("labeled-response"));

    let replies = client
        .send(&fabric, &registry, "CAP REQ :sasl server-time")
        .await;
    assert_eq!(replies[0].params[1], "ACK");
    assert!(client.session.caps.contains("sasl"));
    assert!(client.session.caps.contains("server-time"));

    assert!(client.send(&fabric, &registry, "NICK alice").await.is_empty());
    assert!(client
        .send(&fabric, &registry, "USER a 0 * :Alice")
        .await
        .is_empty(), "registration blocked while CAP is open");

    let replies = client.send(&fabric, &registry, "AUTHENTICATE PLAIN").await;
    assert_eq!(replies[0].command, "AUTHENTICATE");
    assert_eq!(replies[0].params[0], "+");

    let payload = B64.encode(b"\0alice\0pw");
    let replies = client
        .send(&fabric, &registry, &format!("AUTHENTICATE {}", payload))
        .await;
    assert!(has_numeric(&replies, Response::RPL_LOGGEDIN), "{:?}", numerics(&replies));
    assert!(has_numeric(&replies, Response::RPL_SASLSUCCESS));

    let replies = client.send(&fabric, &registry, "CAP END").await;
    for expected in [
        Response::RPL_WELCOME,
        Response::RPL_YOURHOST,
        Response::RPL_CREATED,
        Response::RPL_MYINFO,
        Response::RPL_ISUPPORT,
        Response::RPL_LUSERCLIENT,
        Response::RPL_LUSEROP,
        Response::RPL_LUSERUNKNOWN,
        Response::RPL_LUSERCHANNELS,
        Response::RPL_LUSERME,
        Response::RPL_MOTDSTART,
        Response::RPL_ENDOFMOTD,
        Response::RPL_UMODEIS,
    ] {
        assert!(
            has_numeric(&replies, expected),
            "missing {:?} in {:?}",
            expected,
            numerics(&replies)
        );
    }

    assert!(client.session.registered);
    let user_arc = fabric.user_by_uid(&client.uid).unwrap();
    let user = user_arc.read().await;
    assert_eq!(user.nick, "alice");
    assert_eq!(user.account.as_deref(), Some("alice"));
}

#[tokio::test]
async fn sasl_wrong_password_fails() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(b"pw", &salt)
        .unwrap()
        .to_string();
    fabric.db.create_account("alice", Some(&hash)).await.unwrap();

    let mut client = Client::new(&fabric);
    client.send(&fabric, &registry, "CAP LS 302").await;
    client.send(&fabric, &registry, "AUTHENTICATE PLAIN").await;
    let payload = B64.encode(b"\0alice\0wrong");
    let replies = client
        .send(&fabric, &registry, &format!("AUTHENTICATE {}", payload))
        .await;
    assert!(has_numeric(&replies, Response::ERR_SASLFAIL));
}

#[tokio::test]
async fn sasl_external_requires_tls() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let mut client = Client::new(&fabric);
    let replies = client.send(&fabric, &registry, "AUTHENTICATE EXTERNAL").await;
    assert!(has_numeric(&replies, Response::ERR_SASLFAIL));
    assert!(has_numeric(&replies, Response::RPL_SASLMECHS));
}

#[tokio::test]
async fn commands_gated_before_registration() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let mut client = Client::new(&fabric);
    let replies = client.send(&fabric, &registry, "JOIN #lobby").await;
    assert!(has_numeric(&replies, Response::ERR_NOTREGISTERED));
}

#[tokio::test]
async fn nick_in_use_and_erroneous() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let (_alice, _rx) = connect_user(&fabric, "alice").await;

    let mut client = Client::new(&fabric);
    let replies = client.send(&fabric, &registry, "NICK alice").await;
    assert!(has_numeric(&replies, Response::ERR_NICKNAMEINUSE));

    let replies = client.send(&fabric, &registry, "NICK 9bad").await;
    assert!(has_numeric(&replies, Response::ERR_ERRONEUSNICKNAME));

    let long = "a".repeat(31);
    let replies = client
        .send(&fabric, &registry, &format!("NICK {}", long))
        .await;
    assert!(has_numeric(&replies, Response::ERR_ERRONEUSNICKNAME));
}

async fn register(fabric: &Arc<Fabric>, registry: &Registry, nick: &str) -> Client {
    let mut client = Client::new(fabric);
    client
        .send(fabric, registry, &format!("NICK {}", nick))
        .await;
    let replies = client
        .send(fabric, registry, &format!("USER {} 0 * :User", nick))
        .await;
    assert!(has_numeric(&replies, Response::RPL_WELCOME));
    client
}

#[tokio::test]
async fn join_and_privmsg_fanout() {
    let fabric = fabric().await;
    let registry = Registry::new();

    // bob is already in #lobby with an observable queue.
    let (bob, mut bob_rx) = connect_user(&fabric, "bob").await;
    let name = lattice_proto::ident::ChannelName::parse("#lobby").unwrap();
    fabric.join_channel(&bob, &name, None).await.unwrap();

    let mut alice = register(&fabric, &registry, "alice").await;
    let replies = alice.send(&fabric, &registry, "JOIN #lobby").await;

    // alice sees her JOIN, 331 (no topic), names, and the end marker.
    assert_eq!(replies[0].command, "JOIN");
    assert!(has_numeric(&replies, Response::RPL_NOTOPIC));
    assert!(has_numeric(&replies, Response::RPL_NAMREPLY));
    assert!(has_numeric(&replies, Response::RPL_ENDOFNAMES));

    // bob sees alice join.
    let bob_msgs = drain(&mut bob_rx);
    assert!(bob_msgs.iter().any(|m| m.command == "JOIN"));

    // Repeat JOIN by a member is silent.
    let replies = alice.send(&fabric, &registry, "JOIN #lobby").await;
    assert!(replies.is_empty());
    drain(&mut bob_rx);

    // PRIVMSG reaches bob once, alice not at all (no echo-message).
    let replies = alice.send(&fabric, &registry, "PRIVMSG #lobby :hi").await;
    assert!(replies.is_empty());
    let bob_msgs = drain(&mut bob_rx);
    assert_eq!(bob_msgs.len(), 1);
    assert_eq!(bob_msgs[0].command, "PRIVMSG");
    assert_eq!(bob_msgs[0].params, vec!["#lobby", "hi"]);
    match &bob_msgs[0].source {
        Some(lattice_proto::Source::User { nick, .. }) => assert_eq!(nick, "alice"),
        other => panic!("unexpected source {:?}", other),
    }
}

#[tokio::test]
async fn part_when_not_member_is_442() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let (bob, _rx) = connect_user(&fabric, "bob").await;
    let name = lattice_proto::ident::ChannelName::parse("#lobby").unwrap();
    fabric.join_channel(&bob, &name, None).await.unwrap();

    let mut alice = register(&fabric, &registry, "alice").await;
    let replies = alice.send(&fabric, &registry, "PART #lobby").await;
    assert!(has_numeric(&replies, Response::ERR_NOTONCHANNEL));
}

#[tokio::test]
async fn banned_join_answers_474() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let (bob, _rx) = connect_user(&fabric, "bob").await;
    let name = lattice_proto::ident::ChannelName::parse("#lobby").unwrap();
    let outcome = fabric.join_channel(&bob, &name, None).await.unwrap();
    outcome.channel.write().await.bans.push(latticed::state::ListEntry {
        mask: "alice!*@*".to_string(),
        set_by: "bob".to_string(),
        set_at: 0,
    });

    let mut alice = register(&fabric, &registry, "alice").await;
    let replies = alice.send(&fabric, &registry, "JOIN #lobby").await;
    assert!(has_numeric(&replies, Response::ERR_BANNEDFROMCHAN));
    let banned = replies
        .iter()
        .find(|m| m.command == Response::ERR_BANNEDFROMCHAN.as_command())
        .unwrap();
    assert_eq!(banned.params[1], "#lobby");
    assert_eq!(banned.params[2], "Cannot join channel (+b)");
}

#[tokio::test]
async fn mode_changes_apply_in_order_with_472() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let mut alice = register(&fabric, &registry, "alice").await;
    alice.send(&fabric, &registry, "JOIN #lobby").await;

    let replies = alice
        .send(&fabric, &registry, "MODE #lobby +ixk sekrit")
        .await;
    assert!(
        has_numeric(&replies, Response::ERR_UNKNOWNMODE),
        "unknown mode answered in order: {:?}",
        numerics(&replies)
    );
    let mode_line = replies.iter().find(|m| m.command == "MODE").unwrap();
    assert_eq!(mode_line.params[1], "+ik");
    assert_eq!(mode_line.params[2], "sekrit");

    let chan = fabric.channel("#lobby").unwrap();
    let chan = chan.read().await;
    assert!(chan.modes.has('i'));
    assert_eq!(chan.key.as_deref(), Some("sekrit"));
}

#[tokio::test]
async fn command_flood_drops_then_disconnects() {
    let fabric = fabric().await;
    let registry = Registry::new();
    let mut alice = register(&fabric, &registry, "alice").await;
    alice.send(&fabric, &registry, "JOIN #lobby").await;

    // Default bucket: burst 10 at 4/s, flood threshold 16. Pour 60
    // commands in; the tail must be dropped and the flood ERROR queued.
    let mut flooded = false;
    for i in 0..60 {
        let replies = alice
            .send(&fabric, &registry, &format!("PRIVMSG #lobby :{}", i))
            .await;
        if replies.iter().any(|m| m.command == "ERROR") {
            flooded = true;
            break;
        }
    }
    assert!(flooded, "sustained flood reaches the Excess Flood ERROR");
}
