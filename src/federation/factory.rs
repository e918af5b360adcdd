//! Outbound activity construction
//!
//! Activity IRIs are `<actor>/<kind>/<ULID>`; note IRIs are
//! `<actor>/notes/<ULID>`.

use chrono::Utc;

use super::activity::{
    ACTIVITY_STREAMS_CONTEXT, NoteObject, OutboundActivity, OutboundKind, OutboundObject,
    TombstoneObject,
};
use crate::data::{Attachment, EntityId, Note, PUBLIC_COLLECTION, Visibility};

/// Fresh activity IRI for `actor_iri`
pub fn activity_iri(actor_iri: &str, kind: OutboundKind) -> String {
    format!("{}/{}/{}", actor_iri, kind.path_segment(), EntityId::new().0)
}

/// Note IRI for a note id
pub fn note_iri(actor_iri: &str, id: &EntityId) -> String {
    format!("{}/notes/{}", actor_iri, id.0)
}

/// Audience for a new note.
///
/// A reply with a known parent author is addressed to that author alone,
/// whatever the visibility.
pub fn note_audience(
    visibility: Visibility,
    followers_iri: &str,
    reply_to_author: Option<&str>,
) -> (Vec<String>, Vec<String>) {
    let to = match (reply_to_author, visibility) {
        (Some(author), _) => vec![author.to_string()],
        (None, Visibility::Public) => vec![PUBLIC_COLLECTION.to_string()],
        (None, Visibility::Followers) => vec![followers_iri.to_string()],
    };
    let cc = match visibility {
        Visibility::Public => vec![followers_iri.to_string()],
        Visibility::Followers => Vec::new(),
    };
    (to, cc)
}

/// Input for [`create_note`]
#[derive(Debug, Clone)]
pub struct NoteDraft<'a> {
    pub actor_iri: &'a str,
    pub followers_iri: &'a str,
    pub content: &'a str,
    pub visibility: Visibility,
    pub in_reply_to: Option<&'a str>,
    pub reply_to_author: Option<&'a str>,
    pub attachments: Vec<Attachment>,
}

/// Build a local Note and the Create activity announcing it.
///
/// The Create copies the Note's `to`/`cc`.
pub fn create_note(id: EntityId, draft: NoteDraft<'_>) -> (Note, OutboundActivity) {
    let (to, cc) = note_audience(draft.visibility, draft.followers_iri, draft.reply_to_author);
    let published = Utc::now();

    let note = Note {
        iri: note_iri(draft.actor_iri, &id),
        id: id.0,
        author_iri: draft.actor_iri.to_string(),
        content: draft.content.to_string(),
        published,
        in_reply_to: draft.in_reply_to.map(str::to_string),
        to: to.clone(),
        cc: cc.clone(),
        attachments: draft.attachments,
        reply_count: 0,
        is_local: true,
    };

    let create = OutboundActivity {
        context: ACTIVITY_STREAMS_CONTEXT.to_string(),
        id: activity_iri(draft.actor_iri, OutboundKind::Create),
        kind: OutboundKind::Create,
        actor: draft.actor_iri.to_string(),
        published,
        to,
        cc,
        object: OutboundObject::Note(NoteObject::from(&note)),
    };

    (note, create)
}

fn envelope(
    id: String,
    kind: OutboundKind,
    actor_iri: &str,
    to: Vec<String>,
    cc: Vec<String>,
    object: OutboundObject,
) -> OutboundActivity {
    OutboundActivity {
        context: ACTIVITY_STREAMS_CONTEXT.to_string(),
        id,
        kind,
        actor: actor_iri.to_string(),
        published: Utc::now(),
        to,
        cc,
        object,
    }
}

/// Follow `target_iri`, with a known activity IRI.
pub fn follow(id: String, actor_iri: &str, target_iri: &str) -> OutboundActivity {
    envelope(
        id,
        OutboundKind::Follow,
        actor_iri,
        vec![target_iri.to_string()],
        Vec::new(),
        OutboundObject::Iri(target_iri.to_string()),
    )
}

/// Like `note_iri`, addressed to its author.
pub fn like(id: String, actor_iri: &str, note_iri: &str, author_iri: &str) -> OutboundActivity {
    envelope(
        id,
        OutboundKind::Like,
        actor_iri,
        vec![author_iri.to_string()],
        Vec::new(),
        OutboundObject::Iri(note_iri.to_string()),
    )
}

/// Undo a previously sent activity; inherits its audience.
pub fn undo(actor_iri: &str, inner: OutboundActivity) -> OutboundActivity {
    let to = inner.to.clone();
    let cc = inner.cc.clone();
    envelope(
        activity_iri(actor_iri, OutboundKind::Undo),
        OutboundKind::Undo,
        actor_iri,
        to,
        cc,
        OutboundObject::Activity(Box::new(inner)),
    )
}

/// Delete a Note, replacing it with a Tombstone.
pub fn delete(actor_iri: &str, note: &Note) -> OutboundActivity {
    envelope(
        activity_iri(actor_iri, OutboundKind::Delete),
        OutboundKind::Delete,
        actor_iri,
        note.to.clone(),
        note.cc.clone(),
        OutboundObject::Tombstone(TombstoneObject {
            id: note.iri.clone(),
            kind: "Tombstone".to_string(),
            former_type: "Note".to_string(),
        }),
    )
}

/// Accept an inbound activity on behalf of `actor_iri`.
pub fn accept(actor_iri: &str, object: serde_json::Value) -> OutboundActivity {
    let to = object
        .get("actor")
        .and_then(super::activity::first_iri)
        .into_iter()
        .collect();
    envelope(
        activity_iri(actor_iri, OutboundKind::Accept),
        OutboundKind::Accept,
        actor_iri,
        to,
        Vec::new(),
        OutboundObject::Raw(object),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "https://local.example/users/alice";
    const FOLLOWERS: &str = "https://local.example/users/alice/followers";
    const BOB: &str = "https://remote.example/users/bob";

    fn draft(visibility: Visibility, reply_to_author: Option<&'static str>) -> NoteDraft<'static> {
        NoteDraft {
            actor_iri: ALICE,
            followers_iri: FOLLOWERS,
            content: "<p>hello</p>",
            visibility,
            in_reply_to: reply_to_author.map(|_| "https://remote.example/notes/1"),
            reply_to_author,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn public_note_goes_to_public_and_cc_followers() {
        let (note, create) = create_note(EntityId::new(), draft(Visibility::Public, None));
        assert_eq!(note.to, vec![PUBLIC_COLLECTION.to_string()]);
        assert_eq!(note.cc, vec![FOLLOWERS.to_string()]);
        assert_eq!(create.to, note.to);
        assert_eq!(create.cc, note.cc);
    }

    #[test]
    fn followers_note_goes_to_followers_only() {
        let (note, _) = create_note(EntityId::new(), draft(Visibility::Followers, None));
        assert_eq!(note.to, vec![FOLLOWERS.to_string()]);
        assert!(note.cc.is_empty());
    }

    #[test]
    fn followers_reply_is_addressed_to_parent_author() {
        let (note, create) =
            create_note(EntityId::new(), draft(Visibility::Followers, Some(BOB)));
        assert_eq!(note.to, vec![BOB.to_string()]);
        assert!(note.cc.is_empty());
        assert_eq!(create.to, vec![BOB.to_string()]);
        assert_eq!(
            note.in_reply_to.as_deref(),
            Some("https://remote.example/notes/1")
        );
    }

    #[test]
    fn public_reply_keeps_followers_in_cc() {
        let (note, _) = create_note(EntityId::new(), draft(Visibility::Public, Some(BOB)));
        assert_eq!(note.to, vec![BOB.to_string()]);
        assert_eq!(note.cc, vec![FOLLOWERS.to_string()]);
    }

    #[test]
    fn identifiers_follow_actor_layout() {
        let id = EntityId::new();
        let (note, create) = create_note(id.clone(), draft(Visibility::Public, None));
        assert_eq!(note.iri, format!("{}/notes/{}", ALICE, id.0));
        assert!(create.id.starts_with(&format!("{}/create/", ALICE)));
        assert!(note.is_local);
    }

    #[test]
    fn undo_embeds_the_original_activity() {
        let follow_id = activity_iri(ALICE, OutboundKind::Follow);
        let undo = undo(ALICE, follow(follow_id.clone(), ALICE, BOB));
        let value = serde_json::to_value(&undo).unwrap();
        assert_eq!(value["type"], "Undo");
        assert_eq!(value["object"]["type"], "Follow");
        assert_eq!(value["object"]["id"], follow_id);
        assert_eq!(value["object"]["object"], BOB);
    }

    #[test]
    fn accept_echoes_the_activity_and_addresses_its_actor() {
        let inbound = serde_json::json!({
            "type": "Follow",
            "id": "https://remote.example/follows/1",
            "actor": BOB,
            "object": ALICE
        });
        let accept = accept(ALICE, inbound.clone());
        let value = serde_json::to_value(&accept).unwrap();
        assert_eq!(value["type"], "Accept");
        assert_eq!(value["actor"], ALICE);
        assert_eq!(value["object"], inbound);
        assert_eq!(accept.to, vec![BOB.to_string()]);
    }
}
