//! Integration tests for collections inside a started database.

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use threaddb_core::{CoreError, FindOptions, OpType, OpenOptions, Query, SortKey};
use threaddb_testkit::prelude::*;

#[test]
fn updates_are_routed_by_pattern() {
    init_tracing();
    let db = TestDatabase::memory();
    let first = db.new_collection("Collection1", person_schema()).unwrap();
    let second = db.new_collection("Collection2", person_schema()).unwrap();

    let all_first = Arc::new(Mutex::new(Vec::new()));
    let deletes = Arc::new(Mutex::new(Vec::new()));
    let saves = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&all_first);
    db.on("Collection1.**", move |_, update| {
        sink.lock().push((update.id.clone(), update.op_type));
    });
    let sink = Arc::clone(&deletes);
    db.on("**.Delete", move |_, update| {
        sink.lock().push(update.id.clone());
    });

    let i1 = first.insert([person("Ada", 36)]).unwrap().remove(0);
    let sink = Arc::clone(&saves);
    db.on(&format!("Collection1.{i1}.Save"), move |path, _| {
        sink.lock().push(path.to_owned());
    });

    let mut doc = first.new_instance(first.find_by_id(&i1).unwrap()).unwrap();
    doc.set("age", 37);
    doc.save().unwrap();
    let i2 = second.insert([person("Grace", 45)]).unwrap().remove(0);
    first.delete([&i1]).unwrap();

    assert_eq!(
        *all_first.lock(),
        vec![
            (i1.clone(), OpType::Create),
            (i1.clone(), OpType::Save),
            (i1.clone(), OpType::Delete),
        ]
    );
    assert_eq!(*deletes.lock(), vec![i1.clone()]);
    assert_eq!(*saves.lock(), vec![format!("Collection1.{i1}.Save")]);
    assert!(second.has(&i2).unwrap());
}

#[test]
fn complex_filter_query() {
    with_temp_db(|db| {
        let people = scenarios::populated_people(db);
        let query = Query::parse(&json!({
            "$and": [
                {"age": {"$gt": 5}},
                {"age": {"$lt": 56}},
                {"$or": [{"name": {"$regex": "^Mi"}}, {"name": "Clyde"}]},
                {"name": {"$ne": "Micheal"}}
            ]
        }))
        .unwrap();

        let mut names: Vec<String> = people
            .find(&query, &FindOptions::new())
            .unwrap()
            .map(|entry| entry.unwrap().value["name"].as_str().unwrap().to_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Clyde", "Michelangelo", "Mike"]);
        assert_eq!(people.count(&query).unwrap(), 3);
    });
}

#[test]
fn sorted_paged_find() {
    with_temp_db(|db| {
        let people = scenarios::populated_people(db);
        let options = FindOptions::new()
            .sort(SortKey::desc("age"))
            .sort(SortKey::asc("name"))
            .offset(1)
            .limit(3);
        let names: Vec<String> = people
            .find(&Query::all(), &options)
            .unwrap()
            .map(|entry| entry.unwrap().value["name"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["Clyde", "Michelangelo", "Micheal"]);
    });
}

#[test]
fn has_follows_save_and_delete() {
    with_temp_db(|db| {
        let people = db.new_collection("people", person_schema()).unwrap();
        let ids = people
            .save([json!({"_id": "p1", "name": "Ada", "age": 36})])
            .unwrap();
        assert_eq!(ids, vec!["p1".to_string()]);
        assert!(people.has("p1").unwrap());

        people.delete(["p1"]).unwrap();
        assert!(!people.has("p1").unwrap());
        people.delete(["missing"]).unwrap();
        assert!(!people.has("missing").unwrap());
    });
}

#[test]
fn insert_of_existing_key_changes_nothing() {
    with_temp_db(|db| {
        let people = db.new_collection("people", person_schema()).unwrap();
        people
            .insert([json!({"_id": "p1", "name": "Ada", "age": 36})])
            .unwrap();

        let err = people
            .insert([
                json!({"_id": "p2", "name": "Grace", "age": 45}),
                json!({"_id": "p1", "name": "Imposter", "age": 1}),
            ])
            .unwrap_err();
        assert!(matches!(err, CoreError::ExistingKey { ref id, .. } if id == "p1"));
        assert!(!people.has("p2").unwrap());
        assert_eq!(people.find_by_id("p1").unwrap()["name"], "Ada");
    });
}

#[test]
fn invalid_instances_are_rejected() {
    with_temp_db(|db| {
        let people = db.new_collection("people", person_schema()).unwrap();
        let err = people.insert([json!({"name": "Ada", "age": -1})]).unwrap_err();
        match err {
            CoreError::Validation { failures, .. } => {
                assert!(failures.iter().any(|f| f.path == "/age" && f.keyword == "minimum"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(people.count(&Query::all()).unwrap(), 0);
    });
}

#[test]
fn write_transaction_excludes_readers() {
    let db = TestDatabase::memory();
    let people = db.new_collection("people", person_schema()).unwrap();
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let writer = {
        let people = people.clone();
        std::thread::spawn(move || {
            people
                .write_transaction(
                    |people| {
                        people.insert([person("Ada", 36)])?;
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    },
                    None,
                )
                .unwrap();
        })
    };
    locked_rx.recv().unwrap();

    let err = people
        .read_transaction(|r| r.count(&Query::all()), Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout { .. }));

    release_tx.send(()).unwrap();
    writer.join().unwrap();
    let count = people
        .read_transaction(|r| r.count(&Query::all()), Some(Duration::from_millis(500)))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn schemas_survive_reopen() {
    let db = TestDatabase::file();
    let people = db.new_collection("people", person_schema()).unwrap();
    let ids = people.insert([person("Ada", 36)]).unwrap();
    let schema = people.schema().clone();
    let thread = db.thread_id();
    db.close().unwrap();

    let reopened = db.reopen();
    reopened.start(db.identity.clone(), OpenOptions::new()).unwrap();
    assert_eq!(reopened.thread_id(), thread);
    let people = reopened.get_collection("people").unwrap();
    assert_eq!(people.schema(), &schema);
    assert_eq!(people.find_by_id(&ids[0]).unwrap()["name"], "Ada");
    reopened.close().unwrap();
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn insert_then_find_by_id_roundtrips(people in people_strategy(6)) {
        let db = TestDatabase::memory();
        let collection = db.new_collection("people", person_schema()).unwrap();
        let ids = collection.insert(people.clone()).unwrap();
        prop_assert_eq!(ids.len(), people.len());

        for (id, mut expected) in ids.iter().zip(people) {
            expected["_id"] = json!(id);
            prop_assert_eq!(collection.find_by_id(id).unwrap(), expected);
        }
    }
}
