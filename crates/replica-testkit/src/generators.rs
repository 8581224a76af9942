//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use replica_core::{BoxKeyPair, Keypair, Message, MAX_PAYLOAD_LEN};
use replica_sync::ContentId;

/// Generate a random identity keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random authenticator key pair.
pub fn box_keypair() -> impl Strategy<Value = BoxKeyPair> {
    any::<[u8; 32]>().prop_map(BoxKeyPair::from_secret_bytes)
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len.min(MAX_PAYLOAD_LEN))
}

/// Generate a message of any type with up to `max_len` payload bytes.
pub fn message(max_len: usize) -> impl Strategy<Value = Message> {
    (any::<u8>(), payload(max_len)).prop_filter_map("payload fits", |(msg_type, payload)| {
        Message::new(msg_type, Bytes::from(payload)).ok()
    })
}

/// Generate a valid sync chunk size.
pub fn chunk_size() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), 2usize..4096, Just(MAX_PAYLOAD_LEN)]
}

/// Generate a plain path segment.
pub fn segment() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,12}"
}

/// Generate a content id that is also a valid repository name.
pub fn content_id() -> impl Strategy<Value = ContentId> {
    prop_oneof![
        any::<u64>().prop_map(ContentId::from),
        segment().prop_map(ContentId::from),
    ]
}

/// Generate a relative path that stays inside its root.
pub fn contained_path() -> impl Strategy<Value = String> {
    prop::collection::vec(segment(), 1..5).prop_map(|parts| parts.join("/"))
}

/// Generate an arbitrary mix of segments, `.`, `..` and slashes.
pub fn any_path() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            3 => segment(),
            1 => Just(".".to_string()),
            2 => Just("..".to_string()),
            1 => Just(String::new()),
        ],
        0..8,
    )
    .prop_map(|parts| parts.join("/"))
}

/// Generate a set of distinct files for a repository.
pub fn files(max_files: usize, max_len: usize) -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::btree_map(segment(), payload(max_len), 1..=max_files.max(1))
        .prop_map(|files| files.into_iter().collect())
}
