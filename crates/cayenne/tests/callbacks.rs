mod common;

use asupersync::runtime::RuntimeBuilder;
use cayenne::prelude::*;
use cayenne::{ChangeKind, CommitLog, LifecycleEvent};
use common::*;
use std::sync::{Arc, Mutex};

type Events = Arc<Mutex<Vec<(LifecycleEvent, ObjectId)>>>;

fn record(context: &mut ObjectContext<MemoryNode>, events: &Events, event: LifecycleEvent) {
    let events = Arc::clone(events);
    context.on_lifecycle(event, "Artist", move |object| {
        events.lock().unwrap().push((event, object.id().clone()));
        Ok(())
    });
}

#[test]
fn commit_listener_sees_every_changed_object() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    seed(node, "artist", &[("name", text("Degas"))]);
    let mut context = runtime.new_context();

    let logs: Arc<Mutex<Vec<CommitLog>>> = Arc::default();
    let sink = Arc::clone(&logs);
    context.on_post_commit(move |log| {
        sink.lock().unwrap().push(log.clone());
        Ok(())
    });

    rt.block_on(async {
        unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        context.write_property(&artist_id(1), "name", text("Claude Monet")).unwrap();
        unwrap_outcome(context.delete_object(&cx, &artist_id(2)).await);
        let manet = context.new_object("Artist").unwrap();
        context.write_property(&manet, "name", text("Manet")).unwrap();

        unwrap_outcome(context.commit_changes(&cx).await);

        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        let log = &logs[0];
        assert_eq!(log.context, context.id());
        assert!(!log.diff.is_empty());
        assert_eq!(log.changes.len(), 3);

        let updated = log.change(&artist_id(1)).unwrap();
        assert_eq!(updated.kind, ChangeKind::Update);
        assert_eq!(updated.attributes.len(), 1);
        assert_eq!(updated.attributes["name"].old, text("Monet"));
        assert_eq!(updated.attributes["name"].new, text("Claude Monet"));

        let deleted = log.change(&artist_id(2)).unwrap();
        assert_eq!(deleted.kind, ChangeKind::Delete);
        assert_eq!(deleted.attributes["name"].old, text("Degas"));
        assert_eq!(deleted.attributes["name"].new, Value::Null);
        assert_eq!(deleted.attributes["id"].old, Value::BigInt(2));

        let inserted = log.change(&manet).unwrap();
        assert_eq!(inserted.kind, ChangeKind::Insert);
        assert!(inserted.pre_commit_id.is_temporary());
        assert_eq!(inserted.post_commit_id, artist_id(3));
        assert_eq!(inserted.attributes["name"].old, Value::Null);
        assert_eq!(inserted.attributes["name"].new, text("Manet"));
        assert_eq!(inserted.attributes["id"].new, Value::BigInt(3));
        assert_eq!(log.changes_of_kind(ChangeKind::Insert).count(), 1);
    });
}

#[test]
fn commit_listener_reports_relationship_changes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    seed(node, "artist", &[("name", text("Renoir"))]);
    seed(node, "painting", &[("title", text("Haystacks")), ("artist_id", Value::BigInt(1))]);
    let mut context = runtime.new_context();

    let logs: Arc<Mutex<Vec<CommitLog>>> = Arc::default();
    let sink = Arc::clone(&logs);
    context.on_post_commit(move |log| {
        sink.lock().unwrap().push(log.clone());
        Ok(())
    });

    rt.block_on(async {
        unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        unwrap_outcome(context.select_objects(&cx, "Painting", Qualifier::All).await);
        unwrap_outcome(context.read_to_many(&cx, &artist_id(1), "paintings").await);
        unwrap_outcome(context.read_to_many(&cx, &artist_id(2), "paintings").await);
        context
            .set_to_one(&painting_id(1), "artist", Some(&artist_id(2)))
            .unwrap();

        unwrap_outcome(context.commit_changes(&cx).await);

        let logs = logs.lock().unwrap();
        let log = &logs[0];
        let painting = log.change(&painting_id(1)).unwrap();
        assert_eq!(painting.kind, ChangeKind::Update);
        assert_eq!(painting.to_one["artist"].old, Some(artist_id(1)));
        assert_eq!(painting.to_one["artist"].new, Some(artist_id(2)));

        let before = log.change(&artist_id(1)).unwrap();
        assert_eq!(before.to_many["paintings"].removed, vec![painting_id(1)]);
        let after = log.change(&artist_id(2)).unwrap();
        assert_eq!(after.to_many["paintings"].added, vec![painting_id(1)]);
    });
}

#[test]
fn failing_commit_listener_does_not_fail_the_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let mut context = runtime.new_context();
    context.on_post_commit(|_| Err(Error::Custom("listener down".into())));

    rt.block_on(async {
        let artist = context.new_object("Artist").unwrap();
        context.write_property(&artist, "name", text("Cassatt")).unwrap();
        let report = unwrap_outcome(context.commit_changes(&cx).await);
        assert_eq!(report.inserted, 1);
        assert_eq!(context.state(&artist), PersistenceState::Committed);
    });
}

#[test]
fn post_callbacks_follow_loads_and_commits() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    seed(node, "artist", &[("name", text("Degas"))]);
    let mut context = runtime.new_context();
    let events: Events = Arc::default();
    for event in [
        LifecycleEvent::PostLoad,
        LifecycleEvent::PostPersist,
        LifecycleEvent::PostUpdate,
        LifecycleEvent::PostRemove,
    ] {
        record(&mut context, &events, event);
    }

    rt.block_on(async {
        unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        assert_eq!(
            events.lock().unwrap().drain(..).collect::<Vec<_>>(),
            vec![
                (LifecycleEvent::PostLoad, artist_id(1)),
                (LifecycleEvent::PostLoad, artist_id(2)),
            ]
        );

        context.write_property(&artist_id(1), "name", text("Claude Monet")).unwrap();
        unwrap_outcome(context.delete_object(&cx, &artist_id(2)).await);
        let manet = context.new_object("Artist").unwrap();
        context.write_property(&manet, "name", text("Manet")).unwrap();
        unwrap_outcome(context.commit_changes(&cx).await);

        assert_eq!(
            events.lock().unwrap().drain(..).collect::<Vec<_>>(),
            vec![
                (LifecycleEvent::PostPersist, artist_id(3)),
                (LifecycleEvent::PostUpdate, artist_id(1)),
                (LifecycleEvent::PostRemove, artist_id(2)),
            ]
        );
    });
}

#[test]
fn rollback_fires_post_load_for_restored_objects() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    seed(runtime.data_node(), "artist", &[("name", text("Monet"))]);
    let mut context = runtime.new_context();

    rt.block_on(async {
        unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        let events: Events = Arc::default();
        record(&mut context, &events, LifecycleEvent::PostLoad);

        context.write_property(&artist_id(1), "name", text("Claude Monet")).unwrap();
        context.rollback_changes();

        assert_eq!(
            *events.lock().unwrap(),
            vec![(LifecycleEvent::PostLoad, artist_id(1))]
        );
        assert_eq!(context.node(&artist_id(1)).unwrap().value("name"), Some(&text("Monet")));
    });
}

#[test]
fn pre_persist_can_reject_a_new_object() {
    let runtime = gallery_runtime();
    let mut context = runtime.new_context();
    context.on_lifecycle(LifecycleEvent::PrePersist, "Gallery", |_| {
        Err(Error::Custom("galleries are read only".into()))
    });

    let err = context.new_object("Gallery").unwrap_err();
    assert!(matches!(err, Error::Custom(ref m) if m == "galleries are read only"));
    assert!(context.objects_in_state(PersistenceState::New).is_empty());
    assert!(context.change_log().is_empty());

    let artist = context.new_object("Artist").unwrap();
    assert_eq!(context.state(&artist), PersistenceState::New);
}

#[test]
fn pre_update_can_veto_a_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    let mut context = runtime.new_context();
    context.on_lifecycle(LifecycleEvent::PreUpdate, "Artist", |object| {
        match object.value("name") {
            Some(Value::Text(name)) if name.trim().is_empty() => {
                Err(Error::Custom("artist name is blank".into()))
            }
            _ => Ok(()),
        }
    });

    rt.block_on(async {
        unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        context.write_property(&artist_id(1), "name", text("  ")).unwrap();

        let err = expect_err(context.commit_changes(&cx).await);
        assert!(matches!(err, Error::Custom(ref m) if m == "artist name is blank"));
        assert_eq!(context.state(&artist_id(1)), PersistenceState::Modified);
        assert_eq!(node.rows("artist")[0].get("name"), Some(&text("Monet")));

        context.write_property(&artist_id(1), "name", text("Claude Monet")).unwrap();
        let report = unwrap_outcome(context.commit_changes(&cx).await);
        assert_eq!(report.updated, 1);
    });
}

#[test]
fn pre_remove_veto_leaves_the_graph_untouched() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    let node = runtime.data_node();
    seed(node, "artist", &[("name", text("Monet"))]);
    seed(node, "painting", &[("title", text("Haystacks")), ("artist_id", Value::BigInt(1))]);
    let mut context = runtime.new_context();
    context.on_lifecycle(LifecycleEvent::PreRemove, "Artist", |_| {
        Err(Error::Custom("artists are archived, not deleted".into()))
    });

    rt.block_on(async {
        unwrap_outcome(context.select_objects(&cx, "Artist", Qualifier::All).await);
        let err = expect_err(context.delete_object(&cx, &artist_id(1)).await);
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(context.state(&artist_id(1)), PersistenceState::Committed);
        assert_eq!(context.state(&painting_id(1)), PersistenceState::Committed);
        assert!(!context.has_changes());
    });
}
