use {
    crate::common::{headers, wait_until, Event, Scripted, Test, TestResult},
    isthmus_lib::{
        config::LocalHostConfig,
        filter::FilterStatus,
        host::{LifeSpan, StateType, StreamSharing},
        session::Completion,
        status::Status,
    },
    serde_derive::Serialize,
    serde_json::{json, Map, Value},
    std::{
        sync::{Arc, Mutex},
        time::Duration,
    },
};

fn seed(deferred: &[&str]) -> LocalHostConfig {
    let mut seed = LocalHostConfig::default();
    seed.deferred = deferred.iter().map(|key| key.to_string()).collect();
    seed
}

/// A plugin that looks up filter state `key` in the background during the request headers
/// phase, and keeps whatever the lookup produced.
fn deferred_lookup(key: &'static str) -> (Scripted, Arc<Mutex<Vec<Option<String>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let plugin = Scripted::new({
        let seen = seen.clone();
        move |request, event| {
            if let Event::DecodeHeaders(_) = event {
                let lookup = request.clone();
                let seen = seen.clone();
                request.spawn(async move {
                    let value = lookup.get_filter_state(key).await?;
                    seen.lock().unwrap().push(value);
                    Ok(FilterStatus::Continue)
                });
                return Ok(FilterStatus::Running);
            }
            Ok(FilterStatus::Continue)
        }
    });
    (plugin, seen)
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_filter_state_resumes_with_its_value() -> TestResult {
    let mut seed = seed(&["slow-key"]);
    seed.filter_state
        .insert("slow-key".to_owned(), "ok".to_owned());
    let (plugin, seen) = deferred_lookup("slow-key");
    let test = Test::with_seed(seed, plugin);
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Running);
    wait_until("the lookup to park", || test.host.parked() == 1).await;
    assert!(seen.lock().unwrap().is_empty());
    assert!(test.host.continued(req).is_empty());

    assert_eq!(test.host.complete_deferred("slow-key"), 1);
    wait_until("the request to continue", || {
        !test.host.continued(req).is_empty()
    })
    .await;

    assert_eq!(*seen.lock().unwrap(), [Some("ok".to_owned())]);
    assert_eq!(test.host.continued(req), [FilterStatus::Continue]);
    assert!(test.host.replies(req).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn the_request_lock_is_released_while_suspended() -> TestResult {
    let mut seed = seed(&["slow-key"]);
    seed.filter_state
        .insert("slow-key".to_owned(), "ok".to_owned());
    let (plugin, seen) = deferred_lookup("slow-key");
    let test = Test::with_seed(seed, plugin);
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Running);
    wait_until("the lookup to park", || test.host.parked() == 1).await;
    let request = test.bridge.request(req).expect("request is known");

    // Fifty unrelated calls on the same request, all while the lookup is suspended.
    let unrelated = tokio::spawn({
        let request = request.clone();
        async move {
            for i in 0..50 {
                request.set_filter_state(
                    &format!("unrelated-{i}"),
                    "1",
                    StateType::Mutable,
                    LifeSpan::FilterChain,
                    StreamSharing::None,
                )?;
                tokio::task::yield_now().await;
            }
            Ok::<_, isthmus_lib::Error>(())
        }
    });
    unrelated.await??;
    assert_eq!(request.pending_calls(), 1);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(
        test.host.filter_state(req, "unrelated-49").as_deref(),
        Some("1")
    );

    assert_eq!(test.host.complete_deferred("slow-key"), 1);
    wait_until("the request to continue", || {
        !test.host.continued(req).is_empty()
    })
    .await;

    assert_eq!(*seen.lock().unwrap(), [Some("ok".to_owned())]);
    assert_eq!(request.pending_calls(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_lookups_stop_being_pending() -> TestResult {
    let waited = Arc::new(Mutex::new(None));
    let test = Test::with_seed(
        seed(&["slow-key"]),
        Scripted::new({
            let waited = waited.clone();
            move |request, event| {
                if let Event::DecodeHeaders(_) = event {
                    let lookup = request.clone();
                    let waited = waited.clone();
                    request.spawn(async move {
                        let res = tokio::time::timeout(
                            Duration::from_millis(20),
                            lookup.get_filter_state("slow-key"),
                        )
                        .await;
                        *waited.lock().unwrap() = Some((res.is_err(), lookup.pending_calls()));
                        Ok(FilterStatus::Continue)
                    });
                    return Ok(FilterStatus::Running);
                }
                Ok(FilterStatus::Continue)
            }
        }),
    );
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Running);
    wait_until("the request to continue", || {
        !test.host.continued(req).is_empty()
    })
    .await;

    // The lookup timed out and no longer counts as suspended.
    assert_eq!(*waited.lock().unwrap(), Some((true, 0)));
    let request = test.bridge.request(req).expect("request is known");
    assert_eq!(request.pending_calls(), 0);

    // The host still holds the ticket, but completing it resumes nothing.
    assert_eq!(test.host.parked(), 1);
    assert_eq!(test.host.complete_deferred("slow-key"), 0);
    assert!(test.host.replies(req).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_completions_are_ignored() -> TestResult {
    let mut seed = seed(&["slow-key"]);
    seed.filter_state
        .insert("slow-key".to_owned(), "first".to_owned());
    let (plugin, seen) = deferred_lookup("slow-key");
    let test = Test::with_seed(seed, plugin);
    let req = test.request(headers(&[("host", "example.com")]));

    test.decode_headers(req);
    wait_until("the lookup to park", || test.host.parked() == 1).await;

    assert_eq!(test.host.complete_deferred("slow-key"), 1);
    assert_eq!(
        test.host
            .complete_deferred_with("slow-key", Completion::ok("second")),
        0
    );
    wait_until("the request to continue", || {
        !test.host.continued(req).is_empty()
    })
    .await;

    assert_eq!(*seen.lock().unwrap(), [Some("first".to_owned())]);
    assert_eq!(test.host.continued(req).len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_lookups_can_complete_as_not_found() -> TestResult {
    let (plugin, seen) = deferred_lookup("absent-key");
    let test = Test::with_seed(seed(&["absent-key"]), plugin);
    let req = test.request(headers(&[("host", "example.com")]));

    test.decode_headers(req);
    wait_until("the lookup to park", || test.host.parked() == 1).await;
    assert_eq!(
        test.host
            .complete_deferred_with("absent-key", Completion::not_found()),
        1
    );
    wait_until("the request to continue", || {
        !test.host.continued(req).is_empty()
    })
    .await;

    assert_eq!(*seen.lock().unwrap(), [None]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_completions_reply_with_a_fault() -> TestResult {
    let (plugin, seen) = deferred_lookup("slow-key");
    let test = Test::with_seed(seed(&["slow-key"]), plugin);
    let req = test.request(headers(&[("host", "example.com")]));

    test.decode_headers(req);
    wait_until("the lookup to park", || test.host.parked() == 1).await;
    test.host
        .complete_deferred_with("slow-key", Completion::failed(Status::InternalFailure));
    wait_until("the fault reply", || !test.host.replies(req).is_empty()).await;

    assert!(seen.lock().unwrap().is_empty());
    assert!(test.host.replies(req)[0].is_fault());
    assert!(test.host.continued(req).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn several_lookups_can_be_suspended_at_once() -> TestResult {
    let mut seed = seed(&["authz", "request.path"]);
    let mut fields = Map::new();
    fields.insert("allowed".to_owned(), json!(true));
    fields.insert("roles".to_owned(), json!(["admin", "ops"]));
    seed.dynamic_metadata.insert("authz".to_owned(), fields);
    seed.properties
        .insert("request.path".to_owned(), "/index.html".to_owned());

    let seen = Arc::new(Mutex::new(None));
    let test = Test::with_seed(
        seed,
        Scripted::new({
            let seen = seen.clone();
            move |request, event| {
                if let Event::DecodeHeaders(_) = event {
                    let lookup = request.clone();
                    let seen = seen.clone();
                    request.spawn(async move {
                        let (metadata, path) = tokio::join!(
                            lookup.get_dynamic_metadata("authz"),
                            lookup.get_property("request.path"),
                        );
                        *seen.lock().unwrap() = Some((metadata?, path?));
                        Ok(FilterStatus::Continue)
                    });
                    return Ok(FilterStatus::Running);
                }
                Ok(FilterStatus::Continue)
            }
        }),
    );
    let req = test.request(headers(&[("host", "example.com")]));

    test.decode_headers(req);
    wait_until("both lookups to park", || test.host.parked() == 2).await;
    assert_eq!(test.host.complete_all(), 2);
    wait_until("the request to continue", || {
        !test.host.continued(req).is_empty()
    })
    .await;

    let (metadata, path) = seen.lock().unwrap().take().expect("lookups finished");
    assert_eq!(metadata["allowed"], Value::Bool(true));
    assert_eq!(metadata["roles"], json!(["admin", "ops"]));
    assert_eq!(path.as_deref(), Some("/index.html"));
    Ok(())
}

#[derive(Serialize)]
struct Labels {
    tier: &'static str,
    regions: Vec<&'static str>,
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_written_by_the_extension_is_visible_to_the_host() -> TestResult {
    let test = Test::new(Scripted::new(|request, event| {
        if let Event::DecodeHeaders(_) = event {
            request.set_dynamic_metadata("isthmus", "score", &json!(0.75))?;
            let labels = Labels {
                tier: "gold",
                regions: vec!["eu", "us"],
            };
            request.set_dynamic_metadata("isthmus", "labels", &labels)?;
        }
        Ok(FilterStatus::Continue)
    }));
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Continue);

    let metadata = test.host.dynamic_metadata(req, "isthmus");
    assert_eq!(metadata["score"], json!(0.75));
    assert_eq!(metadata["labels"]["tier"], json!("gold"));
    assert_eq!(metadata["labels"]["regions"], json!(["eu", "us"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lookups_that_do_not_defer_return_immediately() -> TestResult {
    let mut seed = LocalHostConfig::default();
    seed.filter_state
        .insert("tenant".to_owned(), "acme".to_owned());
    let (plugin, seen) = deferred_lookup("tenant");
    let test = Test::with_seed(seed, plugin);
    let req = test.request(headers(&[("host", "example.com")]));

    test.decode_headers(req);
    wait_until("the request to continue", || {
        !test.host.continued(req).is_empty()
    })
    .await;

    assert_eq!(test.host.parked(), 0);
    assert_eq!(*seen.lock().unwrap(), [Some("acme".to_owned())]);
    Ok(())
}
