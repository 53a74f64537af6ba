mod common;

use asupersync::runtime::RuntimeBuilder;
use cayenne::prelude::*;
use cayenne::{COMMIT_SORTER_PROPERTY, MAX_ID_QUALIFIER_SIZE_PROPERTY, SNAPSHOT_CACHE_SIZE_PROPERTY};
use common::*;
use std::collections::HashMap;

#[test]
fn runtime_built_from_properties() {
    let properties: HashMap<String, String> = [
        (SNAPSHOT_CACHE_SIZE_PROPERTY, "50"),
        (MAX_ID_QUALIFIER_SIZE_PROPERTY, "2"),
        (COMMIT_SORTER_PROPERTY, "object-graph"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = RuntimeConfig::from_properties(&properties).unwrap();
    let runtime = memory_runtime(gallery_mapping(), config);

    assert_eq!(runtime.config().sorter, SorterKind::ObjectGraph);
    assert_eq!(runtime.snapshot_cache().capacity(), 50);
    let context = runtime.new_context();
    assert_eq!(context.config().max_id_qualifier_size, 2);
    assert_eq!(context.config().sorter.name(), "object-graph");
    assert_eq!(runtime.snapshot_cache().subscriber_count(), 1);
}

#[test]
fn shared_context_is_one_graph_for_every_holder() {
    let runtime = gallery_runtime();
    let shared = runtime.shared_context();
    let other = shared.clone();

    let artist = shared.with(|context| {
        let artist = context.new_object("Artist").unwrap();
        context.write_property(&artist, "name", text("Pissarro")).unwrap();
        artist
    });
    assert!(other.with(|context| context.has_changes()));
    assert_eq!(other.lock().state(&artist), PersistenceState::New);
    assert_eq!(shared.snapshot_objects().len(), 1);

    other.with(|context| context.rollback_changes());
    assert_eq!(
        shared.with(|context| context.state(&artist)),
        PersistenceState::Transient
    );
    assert!(shared.snapshot_objects().is_empty());
}

#[test]
fn graph_serializes_detached_objects() {
    let runtime = gallery_runtime();
    let mut context = runtime.new_context();
    let artist = context.new_object("Artist").unwrap();
    context.write_property(&artist, "name", text("Bazille")).unwrap();
    let painting = context.new_object("Painting").unwrap();
    context.set_to_one(&painting, "artist", Some(&artist)).unwrap();

    let bytes = context.serialize_graph().unwrap();
    let graph: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let objects = graph.as_array().expect("a list of objects");
    assert_eq!(objects.len(), 2);
    assert!(String::from_utf8_lossy(&bytes).contains("Bazille"));

    let shared = runtime.shared_context();
    let empty: serde_json::Value = serde_json::from_slice(&shared.serialize_graph().unwrap()).unwrap();
    assert_eq!(empty, serde_json::json!([]));
}

#[test]
fn shutdown_detaches_contexts() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let runtime = gallery_runtime();
    seed(runtime.data_node(), "artist", &[("name", text("Monet"))]);
    let mut writer = runtime.new_context();
    let mut reader = runtime.new_context();

    rt.block_on(async {
        unwrap_outcome(writer.select_objects(&cx, "Artist", Qualifier::All).await);
        unwrap_outcome(reader.select_objects(&cx, "Artist", Qualifier::All).await);
        assert_eq!(runtime.snapshot_cache().len(), 1);

        runtime.shutdown();
        assert!(!runtime.snapshot_cache().is_running());
        assert!(runtime.snapshot_cache().is_empty());
        assert_eq!(runtime.snapshot_cache().subscriber_count(), 0);

        writer.write_property(&artist_id(1), "name", text("Manet")).unwrap();
        unwrap_outcome(writer.commit_changes(&cx).await);
        assert_eq!(
            runtime.data_node().rows("artist")[0].get("name"),
            Some(&text("Manet"))
        );

        reader.sync_snapshot_events();
        assert_eq!(
            reader.node(&artist_id(1)).unwrap().value("name"),
            Some(&text("Monet"))
        );
        assert!(runtime.snapshot_cache().is_empty());
    });
}

#[test]
fn serialized_graph_is_consistent_under_concurrent_writes() {
    const ROUNDS: usize = 200;

    let runtime = gallery_runtime();
    let shared = runtime.shared_context();
    let artist = shared.with(|context| context.new_object("Artist").unwrap());

    let writer = {
        let shared = shared.clone();
        let artist = artist.clone();
        std::thread::spawn(move || {
            for round in 0..ROUNDS {
                shared.with(|context| {
                    let title = text(&format!("Round {round}"));
                    let painting = context.new_object("Painting").unwrap();
                    context.write_property(&painting, "title", title.clone()).unwrap();
                    context.write_property(&artist, "name", title).unwrap();
                });
            }
        })
    };

    let mut seen = 0;
    loop {
        let bytes = shared.serialize_graph().unwrap();
        let objects: Vec<DataObject> = serde_json::from_slice(&bytes).unwrap();

        let mut titles: Vec<Value> = Vec::new();
        let mut name = None;
        for object in &objects {
            assert_eq!(object.state(), PersistenceState::New);
            assert_eq!(object.context(), None);
            assert!(object.id().is_temporary());
            match object.id().entity() {
                "Artist" => {
                    assert_eq!(object.id(), &artist);
                    name = object.value("name").cloned();
                }
                "Painting" => titles.push(object.value("title").cloned().unwrap()),
                other => panic!("unexpected entity {other}"),
            }
        }

        let paintings = titles.len();
        assert!(paintings >= seen, "graph shrank from {seen} to {paintings}");
        seen = paintings;
        let mut expected: Vec<Value> = (0..paintings)
            .map(|round| text(&format!("Round {round}")))
            .collect();
        titles.sort_by_key(|title| match title {
            Value::Text(t) => t["Round ".len()..].parse::<usize>().unwrap(),
            other => panic!("title is not text: {other:?}"),
        });
        assert_eq!(titles, expected);
        assert_eq!(name, expected.pop());

        if paintings == ROUNDS {
            break;
        }
    }

    writer.join().expect("writer thread");
    assert_eq!(shared.snapshot_objects().len(), ROUNDS + 1);
}
