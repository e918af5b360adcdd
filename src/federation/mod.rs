//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - Actor key material
//! - Actor resolution and public key caching
//! - Activity construction (outbox)
//! - Activity dispatch (inbox)
//! - Activity delivery
//! - WebFinger

pub mod activity;
mod delivery;
mod dispatcher;
pub mod factory;
mod key_cache;
mod keys;
mod resolver;
mod signature;
mod webfinger;

pub use activity::{InboundActivity, OutboundActivity, OutboundKind, OutboundObject};
pub use delivery::{DeliveryEngine, DeliveryResult};
pub use dispatcher::{ActivityDispatcher, InboxRequest};
pub use key_cache::{CacheStats, PublicKeyCache};
pub use keys::{
    ACTOR_KEY_BITS, KEY_ENCRYPTION_KEY_BYTES, KeyPair, decrypt_private_key, encrypt_private_key,
    generate_keypair,
};
pub use resolver::{ACTIVITY_STREAMS_ACCEPT, ActorResolver, RemoteActor};
pub use signature::{
    SignatureHeaders, VerifiedSignature, generate_digest, key_id_matches_actor,
    parse_signature_header, sign_request, verify_request,
};
pub use webfinger::{
    WebFingerResponse, generate_webfinger_response, host_matches, parse_acct_resource,
};
