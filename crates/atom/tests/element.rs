//! End-to-end tests against a live nucleus. Start one locally (a stock
//! Redis on `redis://127.0.0.1:6379`, or point `ATOM_NUCLEUS_URL` at it)
//! and run `cargo test -- --ignored`.

use atom::config::NucleusConfig;
use atom::{codes, CancellationToken, Datum, Element, ReadFrom, Response, SendOptions};
use atom::{Serialization, StreamHandler, WriteOptions};
use serial_test::serial;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

async fn connect(name: &str) -> Element {
    Element::connect(name, &NucleusConfig::default())
        .await
        .expect("nucleus should be reachable")
}

/// Spawn a responder's dispatch loop; the returned token stops it.
fn serve(element: &Element) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let loop_element = element.clone();
    let loop_shutdown = shutdown.clone();
    tokio::spawn(async move { loop_element.command_loop(loop_shutdown).await });
    shutdown
}

fn add_one_handler(
    data: Datum,
    _extras: atom::Extras,
) -> impl std::future::Future<Output = anyhow::Result<Response>> + Send {
    async move {
        let text = String::from_utf8(data.as_bytes().unwrap_or_default().to_vec())?;
        let n: i64 = text.trim().parse()?;
        Ok(Response::ok((n + 1).to_string()))
    }
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn unsupported_commands_get_code_six() {
    init_tracing();
    let caller = connect("e2e-unsupported-caller").await;
    let responder = connect("e2e-unsupported-responder").await;
    let shutdown = serve(&responder);

    let response = caller
        .command_send(
            "e2e-unsupported-responder",
            "add_1",
            "0",
            &SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.err_code, codes::COMMAND_UNSUPPORTED);
    assert!(response.data.is_empty());

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn registered_commands_round_trip() {
    init_tracing();
    let caller = connect("e2e-add-caller").await;
    let responder = connect("e2e-add-responder").await;
    responder
        .command_add("add_1", add_one_handler, 1000, Serialization::None)
        .unwrap();
    let shutdown = serve(&responder);

    let response = caller
        .command_send("e2e-add-responder", "add_1", "0", &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response.err_code, codes::NO_ERROR);
    assert_eq!(response.data.as_bytes(), Some(&b"1"[..]));

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn silent_responders_time_out_with_no_ack() {
    init_tracing();
    let caller = connect("e2e-noack-caller").await;
    // Registered command, but nobody runs the dispatch loop.
    let responder = connect("e2e-noack-responder").await;
    responder
        .command_add("add_1", add_one_handler, 1000, Serialization::None)
        .unwrap();

    let start = Instant::now();
    let response = caller
        .command_send("e2e-noack-responder", "add_1", "0", &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response.err_code, codes::COMMAND_NO_ACK);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "returned in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned in {elapsed:?}");

    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn stuck_handlers_time_out_with_no_response() {
    init_tracing();
    let caller = connect("e2e-noresp-caller").await;
    let responder = connect("e2e-noresp-responder").await;
    responder
        .command_add(
            "loop",
            |_data, _extras| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Response::default())
            },
            10,
            Serialization::None,
        )
        .unwrap();
    let shutdown = serve(&responder);

    let response = caller
        .command_send("e2e-noresp-responder", "loop", "", &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response.err_code, codes::COMMAND_NO_RESPONSE);

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn handler_errors_become_callback_failures_and_user_codes_offset() {
    init_tracing();
    let caller = connect("e2e-err-caller").await;
    let responder = connect("e2e-err-responder").await;
    responder
        .command_add(
            "explode",
            |_data, _extras| async move { anyhow::bail!("boom") },
            1000,
            Serialization::None,
        )
        .unwrap();
    responder
        .command_add(
            "user_error",
            |_data, _extras| async move { Ok(Response::error(7, "handler says no")) },
            1000,
            Serialization::None,
        )
        .unwrap();
    let shutdown = serve(&responder);

    let response = caller
        .command_send("e2e-err-responder", "explode", "", &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response.err_code, codes::CALLBACK_FAILED);
    assert!(response.err_str.contains("boom"));

    let response = caller
        .command_send("e2e-err-responder", "user_error", "", &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response.err_code, codes::USER_ERRORS_BEGIN + 7);

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn reserved_commands_report_version_and_command_list() {
    init_tracing();
    let caller = connect("e2e-reserved-caller").await;
    let responder = connect("e2e-reserved-responder").await;
    responder
        .command_add("add_1", add_one_handler, 1000, Serialization::None)
        .unwrap();
    // Reserved names cannot be re-registered through command_add.
    assert!(responder
        .command_add("version", add_one_handler, 1000, Serialization::None)
        .is_err());
    let shutdown = serve(&responder);

    let version = caller
        .get_element_version("e2e-reserved-responder")
        .await
        .unwrap();
    assert!(version.is_ok());
    let info = version.data.as_value().unwrap();
    assert_eq!(info["language"], "Rust");
    assert_eq!(info["version"], 2.0);

    let options = SendOptions {
        deserialization: Serialization::Msgpack,
        ..Default::default()
    };
    let listing = caller
        .command_send(
            "e2e-reserved-responder",
            "command_list",
            Datum::empty(),
            &options,
        )
        .await
        .unwrap();
    let names: Vec<String> = listing.data.decode(Serialization::Msgpack).unwrap();
    assert_eq!(names, vec!["add_1".to_string()]);

    caller
        .wait_for_elements_healthy(
            &["e2e-reserved-responder"],
            Duration::from_millis(100),
            true,
        )
        .await
        .unwrap();

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn streams_tail_newest_first() {
    init_tracing();
    let producer = connect("e2e-producer").await;

    // A crashed earlier run may have left entries behind.
    producer
        .nucleus()
        .stream_delete(&atom::config::stream_key("e2e-producer", "test_stream"))
        .await
        .unwrap();

    let mut last_id = None;
    for i in 0..10 {
        let mut fields = BTreeMap::new();
        fields.insert("data".to_string(), Datum::from(i.to_string()));
        let id = producer
            .entry_write("test_stream", &fields, &WriteOptions::default())
            .await
            .unwrap();
        if let Some(last_id) = last_id {
            assert!(id > last_id, "stream ids must increase");
        }
        last_id = Some(id);
    }

    let entries = producer
        .entry_read_n("e2e-producer", "test_stream", 5, Serialization::None)
        .await
        .unwrap();
    let values: Vec<Vec<u8>> = entries
        .iter()
        .filter_map(|entry| Some(entry.field("data")?.as_bytes()?.to_vec()))
        .collect();
    let expected: Vec<Vec<u8>> = ["9", "8", "7", "6", "5"]
        .iter()
        .map(|value| value.as_bytes().to_vec())
        .collect();
    assert_eq!(values, expected);
    for pair in entries.windows(2) {
        assert!(pair[0].id > pair[1].id, "read_n is newest first");
    }

    // read_since returns exactly the suffix after a given id.
    let all = producer
        .entry_read_since(
            "e2e-producer",
            "test_stream",
            ReadFrom::Begin,
            None,
            None,
            Serialization::None,
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 10);
    let suffix = producer
        .entry_read_since(
            "e2e-producer",
            "test_stream",
            ReadFrom::Id(all[6].id),
            None,
            None,
            Serialization::None,
        )
        .await
        .unwrap();
    assert_eq!(
        suffix.iter().map(|entry| entry.id).collect::<Vec<_>>(),
        all[7..].iter().map(|entry| entry.id).collect::<Vec<_>>(),
    );

    producer.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn read_loop_dispatches_entries_to_handlers() {
    init_tracing();
    let consumer = connect("e2e-loop-consumer").await;
    let producer = connect("e2e-loop-producer").await;

    let writer = producer.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        for i in 0..3 {
            let mut fields = BTreeMap::new();
            fields.insert("n".to_string(), Datum::from(i.to_string()));
            writer
                .entry_write("ticks", &fields, &WriteOptions::default())
                .await
                .unwrap();
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = StreamHandler::new("e2e-loop-producer", "ticks", move |entry| {
        let n = entry
            .field("n")
            .and_then(|datum| datum.as_bytes())
            .map(|bytes| bytes.to_vec());
        sink.lock().unwrap().push(n);
    });

    consumer
        .entry_read_loop(
            vec![handler],
            None,
            Duration::from_secs(1),
            Serialization::None,
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], Some(b"0".to_vec()));
    assert_eq!(seen[2], Some(b"2".to_vec()));

    producer.close().await.unwrap();
    consumer.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn serialized_commands_round_trip_through_the_codec() {
    init_tracing();
    let caller = connect("e2e-ser-caller").await;
    let responder = connect("e2e-ser-responder").await;
    responder
        .command_add(
            "sum",
            |data, _extras| async move {
                let numbers: Vec<i64> = data.decode(Serialization::Msgpack)?;
                let sum: i64 = numbers.iter().sum();
                Response::serialized(&sum, Serialization::Msgpack).map_err(Into::into)
            },
            1000,
            Serialization::Msgpack,
        )
        .unwrap();
    let shutdown = serve(&responder);

    let options = SendOptions {
        serialization: Serialization::Msgpack,
        deserialization: Serialization::Msgpack,
        ..Default::default()
    };
    let response = caller
        .command_send(
            "e2e-ser-responder",
            "sum",
            serde_json::json!([1, 2, 3, 4]),
            &options,
        )
        .await
        .unwrap();
    assert!(response.is_ok(), "err: {}", response.err_str);
    let sum: i64 = response.data.decode(Serialization::Msgpack).unwrap();
    assert_eq!(sum, 10);

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn extras_ride_both_directions() {
    init_tracing();
    let caller = connect("e2e-extras-caller").await;
    let responder = connect("e2e-extras-responder").await;
    responder
        .command_add(
            "echo_tag",
            |_data, extras| async move {
                let tag = extras.get("tag").cloned().unwrap_or_default();
                Response::ok("").with_extra("tag_was", tag).map_err(Into::into)
            },
            1000,
            Serialization::None,
        )
        .unwrap();
    let shutdown = serve(&responder);

    let mut extras = BTreeMap::new();
    extras.insert("tag".to_string(), bytes::Bytes::from_static(b"alpha"));
    let options = SendOptions {
        extras,
        ..Default::default()
    };
    let response = caller
        .command_send("e2e-extras-responder", "echo_tag", "", &options)
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(
        response.extras.get("tag_was"),
        Some(&bytes::Bytes::from_static(b"alpha"))
    );

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn concurrent_senders_share_one_response_inbox() {
    init_tracing();
    let caller = connect("e2e-concurrent-caller").await;
    let responder = connect("e2e-concurrent-responder").await;
    responder
        .command_add("add_1", add_one_handler, 1000, Serialization::None)
        .unwrap();
    responder
        .command_add(
            "slow_add_1",
            |data, extras| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                add_one_handler(data, extras).await
            },
            1000,
            Serialization::None,
        )
        .unwrap();
    let shutdown = serve(&responder);

    // Interleaved responses on the shared inbox must match back to their
    // own callers by (element, cmd_id).
    let slow_caller = caller.clone();
    let slow = tokio::spawn(async move {
        slow_caller
            .command_send(
                "e2e-concurrent-responder",
                "slow_add_1",
                "10",
                &SendOptions::default(),
            )
            .await
    });
    let fast = caller
        .command_send("e2e-concurrent-responder", "add_1", "1", &SendOptions::default())
        .await
        .unwrap();
    let slow = slow.await.unwrap().unwrap();

    assert_eq!(fast.data.as_bytes(), Some(&b"2"[..]));
    assert_eq!(slow.data.as_bytes(), Some(&b"11"[..]));

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn replaced_healthchecks_answer_for_the_element() {
    init_tracing();
    let caller = connect("e2e-health-caller").await;
    let responder = connect("e2e-health-responder").await;
    responder.healthcheck_set(|| async { Ok(Response::ok("ready")) });
    let shutdown = serve(&responder);

    let response = caller
        .command_send(
            "e2e-health-responder",
            "healthcheck",
            "ignored",
            &SendOptions::default(),
        )
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(response.data.as_bytes(), Some(&b"ready"[..]));

    shutdown.cancel();
    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn discovery_lists_elements_streams_and_commands() {
    init_tracing();
    let observer = connect("e2e-disco-observer").await;
    let worker = connect("e2e-disco-worker").await;
    worker
        .command_add("grind", add_one_handler, 1000, Serialization::None)
        .unwrap();
    let mut fields = BTreeMap::new();
    fields.insert("state".to_string(), Datum::from("idle"));
    worker
        .entry_write("status", &fields, &WriteOptions::default())
        .await
        .unwrap();
    let shutdown = serve(&worker);

    let elements = observer.get_all_elements().await.unwrap();
    assert!(elements.contains(&"e2e-disco-worker".to_string()));

    let streams = observer
        .get_all_streams(Some("e2e-disco-worker"))
        .await
        .unwrap();
    assert_eq!(streams, vec!["stream:e2e-disco-worker:status".to_string()]);

    let commands = observer
        .get_all_commands(Some("e2e-disco-worker"))
        .await
        .unwrap();
    assert_eq!(commands, vec!["e2e-disco-worker:grind".to_string()]);

    shutdown.cancel();
    worker.close().await.unwrap();
    observer.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn references_expire_and_fetch() {
    init_tracing();
    let element = connect("e2e-references").await;

    let key = element
        .reference_create("big artifact", Serialization::None, 10_000)
        .await
        .unwrap();
    let ttl = element.reference_get_ttl(&key).await.unwrap();
    assert!(ttl > 0 && ttl <= 10_000, "fresh ttl was {ttl}");

    element.reference_update_ttl(&key, 0).await.unwrap();
    assert_eq!(element.reference_get_ttl(&key).await.unwrap(), -1);

    let value = element
        .reference_get(&key, Serialization::None)
        .await
        .unwrap();
    assert_eq!(value, Some(Datum::from("big artifact")));

    element.reference_delete(&[key.clone()]).await.unwrap();
    assert!(element.reference_delete(&[key]).await.is_err());

    element.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running nucleus"]
#[serial]
async fn references_from_streams_never_leave_the_nucleus() {
    init_tracing();
    let element = connect("e2e-stream-refs").await;

    let mut fields = BTreeMap::new();
    fields.insert("left".to_string(), Datum::from("l-bytes"));
    fields.insert("right".to_string(), Datum::from("r-bytes"));
    element
        .entry_write("frames", &fields, &WriteOptions::default())
        .await
        .unwrap();

    let references = element
        .reference_create_from_stream("e2e-stream-refs", "frames", None, 10_000)
        .await
        .unwrap();
    assert!(references.contains_key("left") && references.contains_key("right"));

    let keys: Vec<String> = references.values().cloned().collect();
    let values = element
        .reference_get_list(&keys, Serialization::None)
        .await
        .unwrap();
    assert_eq!(
        values[&references["left"]],
        Some(Datum::from("l-bytes"))
    );

    element.reference_delete(&keys).await.unwrap();
    element.close().await.unwrap();
}
