//! Burst reconciliation and netsplit cascade, driven directly through the
//! sync layer with no sockets.

mod common;

use common::{connect_user, drain, fabric};
use lattice_proto::ident::{ChannelName, ServerId};
use lattice_proto::message::Source;
use lattice_proto::{MemberRank, Message};
use latticed::sync::burst;
use latticed::sync::split::{handle_netsplit, SPLIT_QUIT};
use latticed::sync::LinkedServer;

fn sid(s: &str) -> ServerId {
    ServerId::parse(s).unwrap()
}

fn uid_line(nick: &str, ts: i64, uid: &str) -> Message {
    let ts = ts.to_string();
    Message::cmd(
        "UID",
        [
            nick,
            "1",
            ts.as_str(),
            "+i",
            "u",
            "remote.example",
            "198.51.100.9",
            uid,
            "*",
            "Remote User",
        ],
    )
    .with_source(Source::Name("9ZZ".to_string()))
}

#[tokio::test]
async fn remote_uid_accepted_and_visible() {
    let fabric = fabric().await;
    let replies = burst::apply_uid(&fabric, &uid_line("eve", 50, "9ZZAAAAAA")).await;
    assert!(replies.is_empty());
    assert_eq!(fabric.uid_by_nick("eve"), Some("9ZZAAAAAA".to_string()));
}

#[tokio::test]
async fn nick_collision_lower_ts_wins() {
    let fabric = fabric().await;
    // Local dave with nick_ts = 100.
    let (local_dave, _rx) = connect_user(&fabric, "dave").await;
    {
        let user_arc = fabric.user_by_uid(&local_dave).unwrap();
        user_arc.write().await.nick_ts = 100;
    }

    // Remote dave bursts with the lower (older) TS: remote survives.
    let replies = burst::apply_uid(&fabric, &uid_line("dave", 90, "9ZZAAAAAB")).await;
    assert!(replies.is_empty(), "no KILL back; the incoming user won");
    assert_eq!(fabric.uid_by_nick("dave"), Some("9ZZAAAAAB".to_string()));
    assert!(fabric.user_by_uid(&local_dave).is_none(), "local loser killed");
}

#[tokio::test]
async fn nick_collision_higher_ts_killed() {
    let fabric = fabric().await;
    let (local_dave, _rx) = connect_user(&fabric, "dave").await;
    {
        let user_arc = fabric.user_by_uid(&local_dave).unwrap();
        user_arc.write().await.nick_ts = 100;
    }

    let replies = burst::apply_uid(&fabric, &uid_line("dave", 200, "9ZZAAAAAC")).await;
    assert_eq!(replies.len(), 1, "KILL goes back to the peer");
    assert_eq!(replies[0].command, "KILL");
    assert_eq!(replies[0].params[0], "9ZZAAAAAC");
    assert_eq!(fabric.uid_by_nick("dave"), Some(local_dave));
}

#[tokio::test]
async fn nick_collision_tie_kills_both() {
    let fabric = fabric().await;
    let (local_dave, _rx) = connect_user(&fabric, "dave").await;
    {
        let user_arc = fabric.user_by_uid(&local_dave).unwrap();
        user_arc.write().await.nick_ts = 100;
    }

    let replies = burst::apply_uid(&fabric, &uid_line("dave", 100, "9ZZAAAAAD")).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command, "KILL");
    assert!(fabric.uid_by_nick("dave").is_none(), "neither survives");
}

#[tokio::test]
async fn sjoin_lower_ts_wins_modes_and_prefixes() {
    let fabric = fabric().await;
    let (alice, _rx) = connect_user(&fabric, "alice").await;
    let name = ChannelName::parse("#lobby").unwrap();
    let outcome = fabric.join_channel(&alice, &name, None).await.unwrap();
    {
        let mut chan = outcome.channel.write().await;
        chan.created_at = 200;
        chan.key = Some("localkey".to_string());
    }

    // Remote member must exist first.
    burst::apply_uid(&fabric, &uid_line("eve", 50, "9ZZAAAAAA")).await;

    // Remote SJOIN with the lower TS: its modes win, our key and the local
    // op prefix are discarded, the remote op keeps hers.
    let sjoin = Message::cmd("SJOIN", ["100", "#lobby", "+m", "@9ZZAAAAAA"])
        .with_source(Source::Name("9ZZ".to_string()));
    burst::apply_sjoin(&fabric, &sjoin).await;

    let chan_arc = fabric.channel("#lobby").unwrap();
    let chan = chan_arc.read().await;
    assert_eq!(chan.created_at, 100, "channel TS lowered to the winner's");
    assert!(chan.modes.has('m'), "winner's modes adopted");
    assert!(chan.key.is_none(), "loser's key discarded");
    assert_eq!(
        chan.rank_of(&alice),
        MemberRank::None,
        "losing side's prefixes wiped"
    );
    assert_eq!(
        chan.rank_of("9ZZAAAAAA"),
        MemberRank::Op,
        "winning side keeps prefixes"
    );
    assert_eq!(chan.members.len(), 2, "members merged");
}

#[tokio::test]
async fn sjoin_higher_ts_merges_unprefixed() {
    let fabric = fabric().await;
    let (alice, _rx) = connect_user(&fabric, "alice").await;
    let name = ChannelName::parse("#lobby").unwrap();
    let outcome = fabric.join_channel(&alice, &name, None).await.unwrap();
    outcome.channel.write().await.created_at = 100;

    burst::apply_uid(&fabric, &uid_line("eve", 50, "9ZZAAAAAA")).await;
    let sjoin = Message::cmd("SJOIN", ["200", "#lobby", "+i", "@9ZZAAAAAA"])
        .with_source(Source::Name("9ZZ".to_string()));
    burst::apply_sjoin(&fabric, &sjoin).await;

    let chan_arc = fabric.channel("#lobby").unwrap();
    let chan = chan_arc.read().await;
    assert_eq!(chan.created_at, 100, "our TS stands");
    assert!(!chan.modes.has('i'), "loser's modes ignored");
    assert_eq!(chan.rank_of(&alice), MemberRank::Op, "our prefixes intact");
    assert_eq!(
        chan.rank_of("9ZZAAAAAA"),
        MemberRank::None,
        "losing members merge unprefixed"
    );
}

#[tokio::test]
async fn netsplit_cascades_through_learned_servers() {
    let fabric = fabric().await;

    // Topology: us — A(9AA) — B(9BB). carol on A, eve on B.
    fabric.sync.topology.insert(LinkedServer {
        sid: sid("9AA"),
        name: "a.lattice.test".to_string(),
        description: String::new(),
        hopcount: 1,
        learned_from: None,
    });
    fabric.sync.topology.insert(LinkedServer {
        sid: sid("9BB"),
        name: "b.lattice.test".to_string(),
        description: String::new(),
        hopcount: 2,
        learned_from: Some(sid("9AA")),
    });

    let carol = Message::cmd(
        "UID",
        ["carol", "1", "50", "+i", "u", "h", "198.51.100.1", "9AAAAAAAA", "*", "Carol"],
    )
    .with_source(Source::Name("9AA".to_string()));
    let eve = Message::cmd(
        "UID",
        ["eve", "2", "60", "+i", "u", "h", "198.51.100.2", "9BBAAAAAA", "*", "Eve"],
    )
    .with_source(Source::Name("9AA".to_string()));
    burst::apply_uid(&fabric, &carol).await;
    burst::apply_uid(&fabric, &eve).await;

    // Local bob shares a channel with both remote users.
    let (bob, mut bob_rx) = connect_user(&fabric, "bob").await;
    let name = ChannelName::parse("#lobby").unwrap();
    fabric.join_channel(&bob, &name, None).await.unwrap();
    let sjoin = Message::cmd(
        "SJOIN",
        ["100", "#lobby", "+", "9AAAAAAAA 9BBAAAAAA"],
    )
    .with_source(Source::Name("9AA".to_string()));
    burst::apply_sjoin(&fabric, &sjoin).await;
    drain(&mut bob_rx);

    // Link to A drops: A and B (learned through A) go, with their users.
    handle_netsplit(&fabric, &sid("9AA")).await;

    assert!(fabric.uid_by_nick("carol").is_none());
    assert!(fabric.uid_by_nick("eve").is_none());
    assert!(!fabric.sync.topology.contains(&sid("9AA")));
    assert!(!fabric.sync.topology.contains(&sid("9BB")));

    let quits: Vec<Message> = drain(&mut bob_rx)
        .into_iter()
        .filter(|m| m.command == "QUIT")
        .collect();
    assert_eq!(quits.len(), 2, "one QUIT per lost user");
    for quit in quits {
        assert_eq!(quit.params[0], SPLIT_QUIT);
    }

    let chan_arc = fabric.channel("#lobby").unwrap();
    assert_eq!(chan_arc.read().await.members.len(), 1, "memberships cleaned");
}

#[tokio::test]
async fn burst_describes_local_state() {
    let fabric = fabric().await;
    let (alice, _rx) = connect_user(&fabric, "alice").await;
    let name = ChannelName::parse("#lobby").unwrap();
    fabric.join_channel(&alice, &name, None).await.unwrap();

    let lines = burst::generate_burst(&fabric).await;
    let uid_lines: Vec<&Message> = lines.iter().filter(|m| m.command == "UID").collect();
    assert_eq!(uid_lines.len(), 1);
    assert_eq!(uid_lines[0].params[0], "alice");
    assert_eq!(uid_lines[0].params[7], alice);

    let sjoin_lines: Vec<&Message> = lines.iter().filter(|m| m.command == "SJOIN").collect();
    assert_eq!(sjoin_lines.len(), 1);
    assert_eq!(sjoin_lines[0].params[1], "#lobby");
    assert!(
        sjoin_lines[0].params[3].contains(&format!("@{}", alice)),
        "creator bursts with op prefix"
    );
}
