mod common;

use asupersync::runtime::RuntimeBuilder;
use cayenne::prelude::*;
use cayenne::{IdentityErrorKind, OperationKind};
use common::*;

#[test]
fn child_changes_reach_the_node_through_the_parent() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    let mut parent = runtime.new_context();
    let mut child = parent.child_context();
    assert_eq!(child.parent_id(), Some(parent.id()));

    rt.block_on(async {
        let artist = unwrap_outcome(child.select_objects(&cx, "Artist", Qualifier::All).await)
            .remove(0);
        child.write_property(&artist, "name", text("Claude Monet")).unwrap();
        let painting = child.new_object("Painting").unwrap();
        child.write_property(&painting, "title", text("Haystacks")).unwrap();
        child.set_to_one(&painting, "artist", Some(&artist)).unwrap();

        child.commit_changes_to_parent(&mut parent).unwrap();

        assert!(!child.has_changes());
        assert_eq!(child.state(&artist), PersistenceState::Committed);
        assert_eq!(child.state(&painting), PersistenceState::Committed);

        assert_eq!(parent.state(&artist), PersistenceState::Modified);
        assert_eq!(parent.state(&painting), PersistenceState::New);
        assert_eq!(parent.node(&artist).unwrap().value("name"), Some(&text("Claude Monet")));
        assert_eq!(parent.node(&painting).unwrap().value("title"), Some(&text("Haystacks")));
        assert_eq!(node.rows("artist")[0].get("name"), Some(&text("Monet")));
        assert_eq!(node.row_count("painting"), 0);

        let report = unwrap_outcome(parent.commit_changes(&cx).await);
        assert_eq!(
            shape(&report.operations),
            vec![op(OperationKind::Insert, "painting"), op(OperationKind::Update, "artist")]
        );
        assert_eq!(node.rows("artist")[0].get("name"), Some(&text("Claude Monet")));
        assert_eq!(node.rows("painting")[0].get("artist_id"), Some(&Value::BigInt(1)));

        let paintings = unwrap_outcome(parent.read_to_many(&cx, &artist, "paintings").await);
        assert_eq!(paintings, vec![painting_id(1)]);
    });
}

#[test]
fn committing_through_the_parent_hands_back_permanent_ids() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let mut parent = runtime.new_context();
    let mut child = parent.child_context();

    rt.block_on(async {
        let artist = child.new_object("Artist").unwrap();
        child.write_property(&artist, "name", text("Degas")).unwrap();

        let report = unwrap_outcome(child.commit_changes_through_parent(&cx, &mut parent).await);
        assert_eq!(report.inserted, 1);
        assert!(!parent.has_changes());
        assert_eq!(parent.node(&artist).unwrap().id(), &artist_id(1));

        let local = child.node(&artist).unwrap();
        assert_eq!(local.id(), &artist_id(1));
        assert_eq!(local.state(), PersistenceState::Committed);
        assert_eq!(local.value("id"), Some(&Value::BigInt(1)));
        assert_eq!(child.node(&artist_id(1)).unwrap().value("name"), Some(&text("Degas")));
        assert_eq!(runtime.data_node().row_count("artist"), 1);
    });
}

#[test]
fn deletes_in_the_child_are_replayed_on_the_parent() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Sisley"))]);
    let mut parent = runtime.new_context();
    let mut child = parent.child_context();

    rt.block_on(async {
        let artist = unwrap_outcome(child.select_objects(&cx, "Artist", Qualifier::All).await)
            .remove(0);
        unwrap_outcome(child.delete_object(&cx, &artist).await);
        child.commit_changes_to_parent(&mut parent).unwrap();

        assert_eq!(child.state(&artist), PersistenceState::Transient);
        assert_eq!(parent.state(&artist), PersistenceState::Deleted);

        let report = unwrap_outcome(parent.commit_changes(&cx).await);
        assert_eq!(shape(&report.operations), vec![op(OperationKind::Delete, "artist")]);
        assert_eq!(node.row_count("artist"), 0);
    });
}

#[test]
fn objects_created_and_deleted_in_the_child_leave_no_trace() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let mut parent = runtime.new_context();
    let mut child = parent.child_context();

    rt.block_on(async {
        let gallery = child.new_object("Gallery").unwrap();
        child.write_property(&gallery, "name", text("Orangerie")).unwrap();
        unwrap_outcome(child.delete_object(&cx, &gallery).await);

        child.commit_changes_to_parent(&mut parent).unwrap();
        assert_eq!(parent.state(&gallery), PersistenceState::Transient);
        assert!(!parent.has_changes());
        assert!(parent.objects_in_state(PersistenceState::New).is_empty());
    });
}

#[test]
fn new_parent_objects_can_be_edited_in_the_child() {
    let runtime = gallery_runtime();
    let mut parent = runtime.new_context();
    let artist = parent.new_object("Artist").unwrap();
    parent.write_property(&artist, "name", text("Manet")).unwrap();

    let mut child = parent.child_context();
    let local = child.local_object_from_parent(&parent, &artist).unwrap();
    assert_eq!(local, artist);
    assert_eq!(child.state(&artist), PersistenceState::Committed);
    assert_eq!(child.node(&artist).unwrap().value("name"), Some(&text("Manet")));

    child.write_property(&artist, "name", text("Edouard Manet")).unwrap();
    child.commit_changes_to_parent(&mut parent).unwrap();

    assert_eq!(parent.state(&artist), PersistenceState::New);
    assert_eq!(parent.node(&artist).unwrap().value("name"), Some(&text("Edouard Manet")));
}

#[test]
fn only_the_parent_accepts_child_changes() {
    let runtime = gallery_runtime();
    let parent = runtime.new_context();
    let mut stranger = runtime.new_context();
    let mut child = parent.child_context();
    let artist = child.new_object("Artist").unwrap();

    let err = child.commit_changes_to_parent(&mut stranger).unwrap_err();
    assert_eq!(err.identity_kind(), Some(IdentityErrorKind::ForeignContext));
    assert_eq!(child.state(&artist), PersistenceState::New);
    assert!(child.has_changes());
    assert!(!stranger.has_changes());
}

#[test]
fn child_changes_cannot_touch_objects_deleted_in_the_parent() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    seed(runtime.data_node(), "artist", &[("name", text("Morisot"))]);
    let mut parent = runtime.new_context();
    let mut child = parent.child_context();

    rt.block_on(async {
        let artist = unwrap_outcome(parent.select_objects(&cx, "Artist", Qualifier::All).await)
            .remove(0);
        unwrap_outcome(child.select_objects(&cx, "Artist", Qualifier::All).await);
        unwrap_outcome(parent.delete_object(&cx, &artist).await);
        child.write_property(&artist, "name", text("Berthe Morisot")).unwrap();

        let err = child.commit_changes_to_parent(&mut parent).unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::InvalidState));
        assert_eq!(child.state(&artist), PersistenceState::Modified);
        assert_eq!(parent.state(&artist), PersistenceState::Deleted);
    });
}
