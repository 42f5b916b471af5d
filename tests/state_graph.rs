//! Graph and fan-out invariants: exactly-once channel delivery,
//! echo-message, ban enforcement, channel destruction, account fan-out.

mod common;

use common::{connect_user, connect_user_with_caps, drain, fabric};
use lattice_proto::ident::ChannelName;
use lattice_proto::Message;

#[tokio::test]
async fn channel_publish_delivers_exactly_once_per_member() {
    let fabric = fabric().await;
    let (alice, mut alice_rx) = connect_user(&fabric, "alice").await;
    let (bob, mut bob_rx) = connect_user(&fabric, "bob").await;
    let (carol, mut carol_rx) = connect_user(&fabric, "carol").await;

    let name = ChannelName::parse("#lobby").unwrap();
    for uid in [&alice, &bob, &carol] {
        fabric.join_channel(uid, &name, None).await.unwrap();
    }

    // Sender excluded: no echo-message negotiated.
    fabric
        .send_to_channel("#lobby", Message::privmsg("#lobby", "hi"), Some(&alice))
        .await;

    assert_eq!(drain(&mut alice_rx).len(), 0, "sender gets no copy");
    let bob_msgs = drain(&mut bob_rx);
    assert_eq!(bob_msgs.len(), 1, "each member exactly one copy");
    assert_eq!(bob_msgs[0].params, vec!["#lobby", "hi"]);
    assert_eq!(drain(&mut carol_rx).len(), 1);
}

#[tokio::test]
async fn echo_message_returns_copy_to_sender() {
    let fabric = fabric().await;
    let (alice, mut alice_rx) =
        connect_user_with_caps(&fabric, "alice", &["echo-message"]).await;
    let (bob, mut bob_rx) = connect_user(&fabric, "bob").await;

    let name = ChannelName::parse("#lobby").unwrap();
    fabric.join_channel(&alice, &name, None).await.unwrap();
    fabric.join_channel(&bob, &name, None).await.unwrap();

    // echo-message negotiated: no exclusion.
    fabric
        .send_to_channel("#lobby", Message::privmsg("#lobby", "hi"), None)
        .await;
    assert_eq!(drain(&mut alice_rx).len(), 1);
    assert_eq!(drain(&mut bob_rx).len(), 1);
}

#[tokio::test]
async fn server_time_stamped_for_capable_clients() {
    let fabric = fabric().await;
    let (alice, mut alice_rx) =
        connect_user_with_caps(&fabric, "alice", &["server-time"]).await;
    let (bob, mut bob_rx) = connect_user(&fabric, "bob").await;
    let name = ChannelName::parse("#lobby").unwrap();
    fabric.join_channel(&alice, &name, None).await.unwrap();
    fabric.join_channel(&bob, &name, None).await.unwrap();

    fabric
        .send_to_channel("#lobby", Message::privmsg("#lobby", "hi"), None)
        .await;

    let alice_msgs = drain(&mut alice_rx);
    assert!(alice_msgs[0].tag("time").is_some(), "stamped for server-time");
    let bob_msgs = drain(&mut bob_rx);
    assert!(bob_msgs[0].tag("time").is_none(), "unstamped otherwise");
}

#[tokio::test]
async fn disconnect_quits_into_shared_channels_only() {
    let fabric = fabric().await;
    let (alice, _alice_rx) = connect_user(&fabric, "alice").await;
    let (bob, mut bob_rx) = connect_user(&fabric, "bob").await;
    let (dave, mut dave_rx) = connect_user(&fabric, "dave").await;

    let lobby = ChannelName::parse("#lobby").unwrap();
    fabric.join_channel(&alice, &lobby, None).await.unwrap();
    fabric.join_channel(&bob, &lobby, None).await.unwrap();
    // dave shares nothing with alice.
    let other = ChannelName::parse("#other").unwrap();
    fabric.join_channel(&dave, &other, None).await.unwrap();
    drain(&mut bob_rx);
    drain(&mut dave_rx);

    fabric.disconnect_user(&alice, "Leaving").await;

    let bob_msgs = drain(&mut bob_rx);
    assert!(
        bob_msgs.iter().any(|m| m.command == "QUIT"),
        "channel peer sees the QUIT"
    );
    assert!(
        drain(&mut dave_rx).is_empty(),
        "unrelated user sees nothing"
    );
    assert!(fabric.uid_by_nick("alice").is_none());
    // Nickname becomes reusable immediately.
    let (alice2, _rx) = connect_user(&fabric, "alice").await;
    assert_eq!(fabric.uid_by_nick("alice"), Some(alice2));
}

#[tokio::test]
async fn send_to_account_reaches_every_session() {
    let fabric = fabric().await;
    let (a1, mut rx1) = connect_user(&fabric, "alice").await;
    let (a2, mut rx2) = connect_user(&fabric, "alice2").await;
    let (_b, mut rx3) = connect_user(&fabric, "bob").await;

    for uid in [&a1, &a2] {
        let user_arc = fabric.user_by_uid(uid).unwrap();
        user_arc.write().await.account = Some("alice".to_string());
    }

    fabric
        .send_to_account("alice", Message::notice("alice", "memo"))
        .await;
    assert_eq!(drain(&mut rx1).len(), 1);
    assert_eq!(drain(&mut rx2).len(), 1);
    assert!(drain(&mut rx3).is_empty());
}

#[tokio::test]
async fn sendq_overflow_disconnects() {
    let fabric = fabric().await;
    let (alice, rx) = connect_user(&fabric, "alice").await;
    // Stop draining: fill the bounded queue past capacity.
    drop(rx);
    // Channel closed: deliveries are dropped silently, user survives until
    // an overflow (full queue) is observed. Simulate the full case with a
    // tiny queue through a fresh handle.
    let (tx, _rx_keep) = tokio::sync::mpsc::channel(1);
    fabric.senders.insert(
        alice.clone(),
        latticed::state::ClientHandle {
            tx,
            caps: std::sync::Arc::new(parking_lot::RwLock::new(Default::default())),
            secure: false,
        },
    );
    fabric.send_to_uid(&alice, Message::notice("alice", "1"));
    fabric.send_to_uid(&alice, Message::notice("alice", "2"));
    // The overflow spawns the disconnect; give it a tick.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(fabric.user_by_uid(&alice).is_none(), "Sendq policy removed the user");
}
