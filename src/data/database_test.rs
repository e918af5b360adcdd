//! Database tests

use super::*;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn test_actor(username: &str) -> Actor {
    let iri = format!("https://local.example/users/{}", username);
    Actor {
        id: EntityId::new().0,
        iri: iri.clone(),
        username: username.to_string(),
        display_name: Some(username.to_uppercase()),
        summary: None,
        avatar_url: None,
        inbox_iri: format!("{}/inbox", iri),
        outbox_iri: format!("{}/outbox", iri),
        followers_iri: format!("{}/followers", iri),
        following_iri: format!("{}/following", iri),
        public_key_pem: "test_public_key".to_string(),
        encrypted_private_key: "test_private_key".to_string(),
        muted_iris: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn test_note(author_iri: &str, content: &str) -> Note {
    let id = EntityId::new().0;
    Note {
        iri: format!("{}/notes/{}", author_iri, id),
        id,
        author_iri: author_iri.to_string(),
        content: content.to_string(),
        published: Utc::now(),
        in_reply_to: None,
        to: vec![PUBLIC_COLLECTION.to_string()],
        cc: vec![format!("{}/followers", author_iri)],
        attachments: Vec::new(),
        reply_count: 0,
        is_local: true,
    }
}

fn author_of(note: &Note) -> NoteAuthor {
    NoteAuthor {
        note_iri: note.iri.clone(),
        display_name: Some("Author".to_string()),
        avatar_url: None,
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_actor_insert_and_lookup() {
    let (db, _temp_dir) = create_test_db().await;
    let actor = test_actor("alice");

    assert!(db.insert_actor(&actor).await.unwrap());

    let by_iri = db.get_actor_by_iri(&actor.iri).await.unwrap().unwrap();
    assert_eq!(by_iri.username, "alice");
    let by_id = db.get_actor_by_user_id(&actor.id).await.unwrap().unwrap();
    assert_eq!(by_id.iri, actor.iri);
    let by_name = db.get_actor_by_username("ALICE").await.unwrap();
    assert!(by_name.is_some(), "usernames are case-insensitive");
}

#[tokio::test]
async fn test_actor_username_is_unique() {
    let (db, _temp_dir) = create_test_db().await;

    assert!(db.insert_actor(&test_actor("alice")).await.unwrap());
    assert!(!db.insert_actor(&test_actor("alice")).await.unwrap());
}

#[tokio::test]
async fn test_actor_profile_and_mutes() {
    let (db, _temp_dir) = create_test_db().await;
    let actor = test_actor("alice");
    db.insert_actor(&actor).await.unwrap();

    db.update_actor_profile(&actor.iri, None, Some("hello"), None)
        .await
        .unwrap();
    let muted = vec!["https://remote.example/users/spam".to_string()];
    db.set_muted_iris(&actor.iri, &muted).await.unwrap();

    let stored = db.get_actor_by_iri(&actor.iri).await.unwrap().unwrap();
    assert_eq!(stored.display_name, Some("ALICE".to_string()));
    assert_eq!(stored.summary, Some("hello".to_string()));
    assert!(stored.has_muted("https://remote.example/users/spam"));
}

#[tokio::test]
async fn test_follow_edges_are_unique_per_pair_and_activity() {
    let (db, _temp_dir) = create_test_db().await;
    let edge = FollowEdge {
        activity_iri: "https://remote.example/follows/1".to_string(),
        follower_iri: "https://remote.example/users/bob".to_string(),
        followee_iri: "https://local.example/users/alice".to_string(),
        created_at: Utc::now(),
    };

    assert!(db.create_follow(&edge).await.unwrap());
    // Same activity id
    assert!(!db.create_follow(&edge).await.unwrap());
    // Same pair, new activity id
    let again = FollowEdge {
        activity_iri: "https://remote.example/follows/2".to_string(),
        ..edge.clone()
    };
    assert!(!db.create_follow(&again).await.unwrap());

    assert_eq!(db.count_followers(&edge.followee_iri).await.unwrap(), 1);
    assert_eq!(db.count_following(&edge.follower_iri).await.unwrap(), 1);
    assert_eq!(
        db.get_follower_iris(&edge.followee_iri).await.unwrap(),
        vec![edge.follower_iri.clone()]
    );
    assert!(db
        .find_follow(&edge.follower_iri, &edge.followee_iri)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_delete_follow_requires_matching_triple() {
    let (db, _temp_dir) = create_test_db().await;
    let edge = FollowEdge {
        activity_iri: "https://remote.example/follows/1".to_string(),
        follower_iri: "https://remote.example/users/bob".to_string(),
        followee_iri: "https://local.example/users/alice".to_string(),
        created_at: Utc::now(),
    };
    db.create_follow(&edge).await.unwrap();

    let wrong_follower = db
        .delete_follow(
            &edge.activity_iri,
            "https://remote.example/users/mallory",
            &edge.followee_iri,
        )
        .await
        .unwrap();
    assert!(!wrong_follower);

    assert!(db
        .delete_follow(&edge.activity_iri, &edge.follower_iri, &edge.followee_iri)
        .await
        .unwrap());
    assert!(db
        .find_follow_by_activity(&edge.activity_iri)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_like_dedup_by_actor_and_note() {
    let (db, _temp_dir) = create_test_db().await;
    let note_iri = "https://local.example/users/alice/notes/1";
    let first = LikeEdge {
        activity_iri: "https://remote.example/likes/1".to_string(),
        actor_iri: "https://remote.example/users/bob".to_string(),
        note_iri: note_iri.to_string(),
        created_at: Utc::now(),
    };
    let second = LikeEdge {
        activity_iri: "https://remote.example/likes/2".to_string(),
        ..first.clone()
    };

    assert!(db.create_like(&first).await.unwrap());
    assert!(!db.create_like(&second).await.unwrap());
    assert!(db.is_liked(&first.actor_iri, note_iri).await.unwrap());
    assert_eq!(
        db.find_likes_by_activity(&first.activity_iri)
            .await
            .unwrap()
            .len(),
        1
    );

    assert!(db.delete_like(&first.activity_iri).await.unwrap());
    assert!(!db.is_liked(&first.actor_iri, note_iri).await.unwrap());
}

#[tokio::test]
async fn test_note_crud_with_author_and_index() {
    let (db, _temp_dir) = create_test_db().await;
    let note = test_note(
        "https://local.example/users/alice",
        "<p>Hello <b>federated</b> world</p>",
    );

    assert!(db.create_note(&note, &author_of(&note)).await.unwrap());
    assert!(!db.create_note(&note, &author_of(&note)).await.unwrap());

    let stored = db.get_note_by_iri(&note.iri).await.unwrap().unwrap();
    assert_eq!(stored.content, note.content);
    assert_eq!(stored.to, note.to);
    assert_eq!(stored.cc, note.cc);
    assert!(stored.is_local);

    let author = db.get_note_author(&note.iri).await.unwrap().unwrap();
    assert_eq!(author.display_name, Some("Author".to_string()));

    let hits = db.search_notes("federated world", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(db.search_notes("<b>", 10).await.unwrap().is_empty());

    assert!(db.delete_note(&note.iri).await.unwrap());
    assert!(db.get_note_by_iri(&note.iri).await.unwrap().is_none());
    assert!(db.get_note_author(&note.iri).await.unwrap().is_none());
    assert!(db.search_notes("federated", 10).await.unwrap().is_empty());
    assert!(!db.delete_note(&note.iri).await.unwrap());
}

#[tokio::test]
async fn test_note_attachments_preserve_order() {
    let (db, _temp_dir) = create_test_db().await;
    let mut note = test_note("https://local.example/users/alice", "pictures");
    note.attachments = vec![
        Attachment {
            media_type: "image/png".to_string(),
            url: "https://media.example/1.png".to_string(),
            width: Some(640),
            height: Some(480),
            name: Some("first".to_string()),
        },
        Attachment {
            media_type: "video/mp4".to_string(),
            url: "https://media.example/2.mp4".to_string(),
            width: None,
            height: None,
            name: None,
        },
    ];
    db.create_note(&note, &author_of(&note)).await.unwrap();

    let stored = db.get_note_by_iri(&note.iri).await.unwrap().unwrap();
    assert_eq!(stored.attachments, note.attachments);
}

#[tokio::test]
async fn test_reply_count_increment() {
    let (db, _temp_dir) = create_test_db().await;
    let parent = test_note("https://local.example/users/alice", "parent");
    db.create_note(&parent, &author_of(&parent)).await.unwrap();

    assert!(db.increment_reply_count(&parent.iri).await.unwrap());
    assert!(db.increment_reply_count(&parent.iri).await.unwrap());
    assert!(!db
        .increment_reply_count("https://local.example/notes/missing")
        .await
        .unwrap());

    let stored = db.get_note_by_iri(&parent.iri).await.unwrap().unwrap();
    assert_eq!(stored.reply_count, 2);
}

#[tokio::test]
async fn test_delete_actor_cascades_notes_and_edges() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = test_actor("alice");
    db.insert_actor(&alice).await.unwrap();

    let note = test_note(&alice.iri, "goodbye");
    db.create_note(&note, &author_of(&note)).await.unwrap();
    db.create_follow(&FollowEdge {
        activity_iri: "https://remote.example/follows/1".to_string(),
        follower_iri: "https://remote.example/users/bob".to_string(),
        followee_iri: alice.iri.clone(),
        created_at: Utc::now(),
    })
    .await
    .unwrap();
    db.create_like(&LikeEdge {
        activity_iri: "https://remote.example/likes/1".to_string(),
        actor_iri: "https://remote.example/users/bob".to_string(),
        note_iri: note.iri.clone(),
        created_at: Utc::now(),
    })
    .await
    .unwrap();

    let removed = db.delete_actor_cascade(&alice.iri).await.unwrap();
    assert_eq!(removed, Some(1));
    assert!(db.get_actor_by_iri(&alice.iri).await.unwrap().is_none());
    assert!(db.get_note_by_iri(&note.iri).await.unwrap().is_none());
    assert_eq!(db.count_followers(&alice.iri).await.unwrap(), 0);
    assert!(db
        .find_likes_by_activity("https://remote.example/likes/1")
        .await
        .unwrap()
        .is_empty());

    assert_eq!(db.delete_actor_cascade(&alice.iri).await.unwrap(), None);
}

#[tokio::test]
async fn test_delivery_queue_lifecycle() {
    let (db, _temp_dir) = create_test_db().await;
    let job = DeliveryJob::new(
        "https://remote.example/inbox".to_string(),
        "https://local.example/users/alice".to_string(),
        "{}".to_string(),
    );
    db.enqueue_delivery(&job).await.unwrap();
    assert_eq!(db.pending_deliveries(10).await.unwrap().len(), 1);

    let retry_at = Utc::now() + Duration::seconds(1);
    db.record_delivery_failure(&job.id, 1, retry_at, "HTTP 500")
        .await
        .unwrap();
    let stored = db.get_delivery(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_error, Some("HTTP 500".to_string()));

    db.abandon_delivery(&job.id, 3, "HTTP 500").await.unwrap();
    let stored = db.get_delivery(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Abandoned.as_str());
    assert!(db.pending_deliveries(10).await.unwrap().is_empty());

    let done = DeliveryJob::new(
        "https://remote.example/inbox".to_string(),
        "https://local.example/users/alice".to_string(),
        "{}".to_string(),
    );
    db.enqueue_delivery(&done).await.unwrap();
    db.complete_delivery(&done.id).await.unwrap();
    assert!(db.get_delivery(&done.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_prune_abandoned_deliveries_by_age() {
    let (db, _temp_dir) = create_test_db().await;
    let job = |inbox: &str| {
        DeliveryJob::new(
            inbox.to_string(),
            "https://local.example/users/alice".to_string(),
            "{}".to_string(),
        )
    };

    let mut old = job("https://remote.example/old/inbox");
    old.created_at = Utc::now() - Duration::days(30);
    let recent = job("https://remote.example/recent/inbox");
    let mut pending = job("https://remote.example/pending/inbox");
    pending.created_at = Utc::now() - Duration::days(30);
    for queued in [&old, &recent, &pending] {
        db.enqueue_delivery(queued).await.unwrap();
    }
    db.abandon_delivery(&old.id, 3, "HTTP 500").await.unwrap();
    db.abandon_delivery(&recent.id, 3, "HTTP 500").await.unwrap();
    assert_eq!(db.count_abandoned_deliveries().await.unwrap(), 2);

    let pruned = db
        .prune_abandoned_deliveries(Utc::now() - Duration::days(7))
        .await
        .unwrap();

    assert_eq!(pruned, 1);
    assert!(db.get_delivery(&old.id).await.unwrap().is_none());
    assert!(db.get_delivery(&recent.id).await.unwrap().is_some());
    // Pending jobs are never pruned, whatever their age.
    assert!(db.get_delivery(&pending.id).await.unwrap().is_some());
    assert_eq!(db.count_abandoned_deliveries().await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_likes_store_one_edge() {
    let (db, _temp_dir) = create_test_db().await;
    let db = Arc::new(db);
    let note_iri = "https://local.example/users/alice/notes/1";

    let mut handles = Vec::new();
    for i in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.create_like(&LikeEdge {
                activity_iri: format!("https://remote.example/likes/{}", i),
                actor_iri: "https://remote.example/users/bob".to_string(),
                note_iri: note_iri.to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
}
