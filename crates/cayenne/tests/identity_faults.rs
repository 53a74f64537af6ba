mod common;

use asupersync::runtime::RuntimeBuilder;
use cayenne::prelude::*;
use cayenne::{FaultErrorKind, IdentityErrorKind};
use common::*;

#[test]
fn fetched_rows_map_to_one_object_each() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    seed(runtime.data_node(), "artist", &[("name", text("Monet"))]);
    seed(runtime.data_node(), "artist", &[("name", text("Renoir"))]);
    let mut context = runtime.new_context();

    rt.block_on(async {
        let first = unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        let second = unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        assert_eq!(first, vec![artist_id(1), artist_id(2)]);
        assert_eq!(first, second);
        assert_eq!(context.object_store().len(), 2);

        let by_name = unwrap_outcome(
            context
                .select_objects(
                    &cx,
                    "Artist",
                    Qualifier::Match([("name".to_string(), text("Renoir"))].into()),
                )
                .await,
        );
        assert_eq!(by_name, vec![artist_id(2)]);
        assert_eq!(context.state(&artist_id(2)), PersistenceState::Committed);
    });
}

#[test]
fn guarded_columns_cannot_be_written() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    seed(runtime.data_node(), "artist", &[("name", text("Monet"))]);
    let mut context = runtime.new_context();

    rt.block_on(async {
        let artist = unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await)
            .remove(0);
        let err = context
            .write_property(&artist, "id", Value::BigInt(5))
            .unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::InvalidState));

        let painting = context.new_object("Painting").unwrap();
        let err = context
            .write_property(&painting, "artist_id", Value::BigInt(1))
            .unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::InvalidState));

        let err = context
            .write_property(&painting, "price", Value::Int(10))
            .unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::UnknownProperty));

        assert_eq!(context.state(&artist), PersistenceState::Committed);
    });
}

#[test]
fn registering_transient_objects() {
    let runtime = gallery_runtime();
    let mut context = runtime.new_context();

    let id = context
        .register_new_object(DataObject::new("Artist").with_value("name", "Cassatt"))
        .unwrap();
    assert!(id.is_temporary());
    assert_eq!(context.state(&id), PersistenceState::New);
    assert_eq!(
        context.node(&id).unwrap().value("name"),
        Some(&Value::Text("Cassatt".into()))
    );

    let err = context
        .register_new_object(DataObject::new("Artist").with_value("nickname", "Mary"))
        .unwrap_err();
    assert_eq!(err.identity_kind(), Some(IdentityErrorKind::UnknownProperty));
    assert_eq!(context.object_store().len(), 1);

    let err = context.new_object("Sculpture").unwrap_err();
    assert_eq!(err.identity_kind(), Some(IdentityErrorKind::UnknownEntity));
}

#[test]
fn objects_of_another_context_must_be_localized() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    seed(runtime.data_node(), "artist", &[("name", text("Monet"))]);
    let mut reader = runtime.new_context();
    let mut writer = runtime.new_context();

    rt.block_on(async {
        let artist = unwrap_outcome(reader.select_objects(&cx, "Artist", Qualifier::All).await)
            .remove(0);

        let painting = writer.new_object("Painting").unwrap();
        let err = writer.set_to_one(&painting, "artist", Some(&artist)).unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::ForeignContext));

        let local = writer.local_object(&artist).unwrap();
        assert_eq!(writer.state(&local), PersistenceState::Hollow);
        writer.set_to_one(&painting, "artist", Some(&local)).unwrap();
        unwrap_outcome(writer.commit_changes(&cx).await);
        assert_eq!(
            runtime.data_node().rows("painting")[0].get("artist_id"),
            Some(&Value::BigInt(1))
        );

        let temporary = writer.new_object("Artist").unwrap();
        let err = reader.local_object(&temporary).unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::TemporaryId));
    });
}

#[test]
fn relationship_faults_resolve_once() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    seed(node, "painting", &[("title", text("Haystacks")), ("artist_id", Value::BigInt(1))]);
    seed(node, "painting", &[("title", text("Poplars")), ("artist_id", Value::BigInt(1))]);
    seed(node, "painting", &[("title", text("Unattributed"))]);
    let mut context = runtime.new_context();

    rt.block_on(async {
        let paintings = unwrap_outcome(context.select_objects(&cx, "Painting", Qualifier::All).await);
        assert_eq!(paintings.len(), 3);
        assert!(context.node(&paintings[0]).unwrap().is_fault("artist"));
        assert_eq!(node.stats().selects, 1);

        let artist = unwrap_outcome(context.read_to_one(&cx, &paintings[0], "artist").await);
        assert_eq!(artist, Some(artist_id(1)));
        assert_eq!(node.stats().selects, 2);

        // Registered target and NULL key: no query.
        let same = unwrap_outcome(context.read_to_one(&cx, &paintings[1], "artist").await);
        assert_eq!(same, Some(artist_id(1)));
        let none = unwrap_outcome(context.read_to_one(&cx, &paintings[2], "artist").await);
        assert_eq!(none, None);
        assert_eq!(node.stats().selects, 2);

        let members = unwrap_outcome(context.read_to_many(&cx, &artist_id(1), "paintings").await);
        assert_eq!(members, vec![painting_id(1), painting_id(2)]);
        assert_eq!(node.stats().selects, 3);
        let again = unwrap_outcome(context.read_to_many(&cx, &artist_id(1), "paintings").await);
        assert_eq!(again, members);
        assert_eq!(node.stats().selects, 3);
    });
}

#[test]
fn hollow_objects_load_from_the_cache_or_the_node() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    seed(node, "artist", &[("name", text("Sisley"))]);
    let mut first = runtime.new_context();
    let mut second = runtime.new_context();

    rt.block_on(async {
        unwrap_outcome(
            first
                .select_objects(&cx, "Artist", Qualifier::Match([("id".to_string(), Value::BigInt(1))].into()))
                .await,
        );
        assert_eq!(node.stats().selects, 1);

        // Cached by the first context.
        second.local_object(&artist_id(1)).unwrap();
        let name = unwrap_outcome(second.read_property(&cx, &artist_id(1), "name").await);
        assert_eq!(name, text("Monet"));
        assert_eq!(second.state(&artist_id(1)), PersistenceState::Committed);
        assert_eq!(node.stats().selects, 1);

        // Never fetched: one query.
        second.local_object(&artist_id(2)).unwrap();
        let object = unwrap_outcome(second.object(&cx, &artist_id(2)).await);
        assert_eq!(object.value("name"), Some(&text("Sisley")));
        assert_eq!(node.stats().selects, 2);

        second.local_object(&artist_id(99)).unwrap();
        let err = expect_err(second.read_property(&cx, &artist_id(99), "name").await);
        assert_eq!(err.fault_kind(), Some(FaultErrorKind::ObjectNotFound));
    });
}

#[test]
fn rollback_restores_committed_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    seed(runtime.data_node(), "artist", &[("name", text("Monet"))]);
    let mut context = runtime.new_context();

    rt.block_on(async {
        let artist = unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await)
            .remove(0);
        context.write_property(&artist, "name", text("Manet")).unwrap();
        let fresh = context.new_object("Artist").unwrap();
        assert_eq!(context.state(&artist), PersistenceState::Modified);
        assert!(!context.current_diff().is_empty());

        context.rollback_changes();

        assert_eq!(context.state(&artist), PersistenceState::Committed);
        assert_eq!(context.state(&fresh), PersistenceState::Transient);
        assert_eq!(
            context.node(&artist).unwrap().value("name"),
            Some(&text("Monet"))
        );
        assert!(!context.has_changes());
        let report = unwrap_outcome(context.commit_changes(&cx).await);
        assert!(report.is_empty());
    });
}

#[test]
fn invalidated_objects_are_fetched_again() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    let mut context = runtime.new_context();

    rt.block_on(async {
        let artist = unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await)
            .remove(0);
        assert!(runtime.snapshot_cache().contains(&artist));

        node.update_rows(
            "artist",
            &[("id".to_string(), Value::BigInt(1))].into(),
            &[("name".to_string(), text("Claude Monet"))].into(),
        )
        .unwrap();
        context.invalidate_objects(std::slice::from_ref(&artist));
        assert_eq!(context.state(&artist), PersistenceState::Hollow);
        assert!(!runtime.snapshot_cache().contains(&artist));

        let name = unwrap_outcome(context.read_property(&cx, &artist, "name").await);
        assert_eq!(name, text("Claude Monet"));
        assert_eq!(node.stats().selects, 2);
    });
}

#[test]
fn unregistered_objects_leave_the_graph() {
    let runtime = gallery_runtime();
    let mut context = runtime.new_context();
    let artist = context.new_object("Artist").unwrap();
    context.write_property(&artist, "name", text("Renoir")).unwrap();
    assert!(context.has_changes());

    let evicted = context.unregister_objects(std::slice::from_ref(&artist));
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].state(), PersistenceState::Transient);
    assert_eq!(evicted[0].context(), None);
    assert_eq!(evicted[0].value("name"), Some(&text("Renoir")));
    assert_eq!(context.state(&artist), PersistenceState::Transient);
    assert!(!context.has_changes());
    assert!(context.unregister_objects(&[artist]).is_empty());
}
