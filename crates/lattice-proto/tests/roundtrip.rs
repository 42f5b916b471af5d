//! Property tests: the serializer and parser are inverses on the
//! serializer's output range.

use lattice_proto::{Message, Source, Tag};
use proptest::prelude::*;

fn tag_strategy() -> impl Strategy<Value = Tag> {
    (
        "[a-z][a-z0-9/-]{0,10}",
        proptest::option::of("[ -~]{1,12}"),
    )
        .prop_map(|(key, value)| Tag {
            key,
            value: value.filter(|v| !v.is_empty()),
        })
}

fn word_strategy() -> impl Strategy<Value = String> {
    // A middle parameter: no spaces, no leading ':', printable.
    "[!-9;-~][!-~]{0,15}".prop_map(|s| s)
}

fn trailing_strategy() -> impl Strategy<Value = String> {
    // The trailing parameter may contain spaces and colons.
    "[ -~]{0,40}".prop_map(|s| s)
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        proptest::collection::vec(tag_strategy(), 0..4),
        proptest::option::of("[a-z][a-z0-9.-]{0,15}"),
        "[A-Z]{3,10}",
        proptest::collection::vec(word_strategy(), 0..4),
        proptest::option::of(trailing_strategy()),
    )
        .prop_map(|(tags, source, command, mut params, trailing)| {
            if let Some(t) = trailing {
                params.push(t);
            }
            Message {
                tags,
                source: source.map(Source::Name),
                command,
                params,
            }
        })
}

proptest! {
    #[test]
    fn serialize_then_parse_is_identity(msg in message_strategy()) {
        let wire = msg.to_wire();
        let reparsed: Message = wire.parse().expect("serializer output must parse");
        prop_assert_eq!(reparsed, msg);
    }
}
