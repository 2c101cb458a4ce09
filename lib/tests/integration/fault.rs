use {
    crate::common::{headers, wait_until, Event, Scripted, Test, TestResult},
    isthmus_lib::{
        config::LocalHostConfig,
        filter::{FilterStatus, Phase},
        host::{DestroyReason, FinalizeReason},
        local::Reply,
        session::Liveness,
        Error, Request, FAULT_MARKER,
    },
    std::sync::{Arc, Mutex},
    tokio::{sync::Notify, task::JoinHandle},
};

const PHASES: [Phase; 6] = [
    Phase::DecodeHeaders,
    Phase::DecodeData,
    Phase::DecodeTrailers,
    Phase::EncodeHeaders,
    Phase::EncodeData,
    Phase::EncodeTrailers,
];

fn single_fault(replies: &[Reply]) -> &str {
    match replies {
        [Reply::Fault(detail)] => {
            assert!(detail.starts_with(FAULT_MARKER), "{detail}");
            detail
        }
        replies => panic!("expected exactly one fault reply, got {replies:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn panics_in_any_phase_become_one_fault_reply() -> TestResult {
    for phase in PHASES {
        let test = Test::new(Scripted::new(move |_, event| {
            if event.phase() == phase {
                panic!("boom in {phase}");
            }
            Ok(FilterStatus::Continue)
        }));
        let req = test.request(headers(&[("host", "example.com")]));

        assert_eq!(test.drive_to(req, phase), FilterStatus::LocalReply, "{phase}");

        let replies = test.host.replies(req);
        let detail = single_fault(&replies);
        assert!(detail.contains(&format!("boom in {phase}")), "{detail}");
        assert!(detail.contains(phase.as_str()), "{detail}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn errors_returned_from_a_phase_become_a_fault_reply() -> TestResult {
    let test = Test::new(Scripted::new(|_, event| match event {
        Event::DecodeHeaders(_) => Err(Error::InvalidArgument),
        _ => Ok(FilterStatus::Continue),
    }));
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::LocalReply);
    let replies = test.host.replies(req);
    assert!(single_fault(&replies).contains("Invalid argument"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn only_the_first_fault_is_replied() -> TestResult {
    let test = Test::new(Scripted::new(|_, event| match event {
        Event::DecodeHeaders(_) => panic!("first"),
        Event::DecodeData(_) => panic!("second"),
        _ => Ok(FilterStatus::Continue),
    }));
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::LocalReply);
    assert_eq!(test.decode_data(req, b"body"), FilterStatus::LocalReply);

    let replies = test.host.replies(req);
    assert!(single_fault(&replies).contains("first"));
    let request = test.bridge.request(req).expect("request is still known");
    assert!(request.fault_replied());
    Ok(())
}

async fn explode() -> Result<FilterStatus, Error> {
    panic!("background boom")
}

#[tokio::test(flavor = "multi_thread")]
async fn background_panics_become_a_fault_reply() -> TestResult {
    let test = Test::new(Scripted::new(|request, event| {
        if let Event::DecodeHeaders(_) = event {
            request.spawn(explode());
            return Ok(FilterStatus::Running);
        }
        Ok(FilterStatus::Continue)
    }));
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Running);
    wait_until("the fault reply", || !test.host.replies(req).is_empty()).await;

    let replies = test.host.replies(req);
    assert!(single_fault(&replies).contains("background boom"));
    assert!(test.host.continued(req).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_outside_the_host_are_replied_on_the_next_entry() -> TestResult {
    let task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
    let phase_returned = Arc::new(Notify::new());
    let test = Test::new(Scripted::new({
        let task = task.clone();
        let phase_returned = phase_returned.clone();
        move |request, event| {
            if let Event::DecodeHeaders(_) = event {
                let late = request.clone();
                let phase_returned = phase_returned.clone();
                let handle = request.spawn(async move {
                    phase_returned.notified().await;
                    // Once control is handed back the host no longer expects calls.
                    late.continue_with(FilterStatus::Continue)?;
                    late.get_header("host")?;
                    Ok(FilterStatus::Continue)
                });
                *task.lock().unwrap() = Some(handle);
                return Ok(FilterStatus::Running);
            }
            Ok(FilterStatus::Continue)
        }
    }));
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Running);
    phase_returned.notify_one();
    let handle = task.lock().unwrap().take().expect("task was spawned");
    handle.await?;

    // Nothing can be sent while the host is not expecting a call.
    assert_eq!(test.host.continued(req), [FilterStatus::Continue]);
    assert!(test.host.replies(req).is_empty());

    assert_eq!(test.decode_data(req, b"body"), FilterStatus::LocalReply);
    let replies = test.host.replies(req);
    let detail = single_fault(&replies);
    assert!(detail.contains("get_header"), "{detail}");
    Ok(())
}

/// Hand control back to the host once the phase has returned, then panic.
async fn continue_then_panic(
    request: Request,
    phase_returned: Arc<Notify>,
) -> Result<FilterStatus, Error> {
    phase_returned.notified().await;
    request.continue_with(FilterStatus::Continue)?;
    panic!("late boom")
}

#[tokio::test(flavor = "multi_thread")]
async fn panics_outside_the_host_are_replied_on_the_next_entry() -> TestResult {
    let task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
    let phase_returned = Arc::new(Notify::new());
    let test = Test::new(Scripted::new({
        let task = task.clone();
        let phase_returned = phase_returned.clone();
        move |request, event| {
            if let Event::DecodeHeaders(_) = event {
                let handle = request.spawn(continue_then_panic(
                    request.clone(),
                    phase_returned.clone(),
                ));
                *task.lock().unwrap() = Some(handle);
                return Ok(FilterStatus::Running);
            }
            Ok(FilterStatus::Continue)
        }
    }));
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Running);
    phase_returned.notify_one();
    let handle = task.lock().unwrap().take().expect("task was spawned");
    handle.await?;

    assert_eq!(test.host.continued(req), [FilterStatus::Continue]);
    assert!(test.host.replies(req).is_empty());
    let request = test.bridge.request(req).expect("request is known");
    assert!(!request.fault_replied());

    assert_eq!(test.decode_data(req, b"body"), FilterStatus::LocalReply);
    let replies = test.host.replies(req);
    let detail = single_fault(&replies);
    assert!(detail.contains("late boom"), "{detail}");
    assert!(request.fault_replied());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn teardown_while_suspended_aborts_without_a_reply() -> TestResult {
    let mut seed = LocalHostConfig::default();
    seed.deferred.insert("slow-key".to_owned());
    let task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
    let reached = Arc::new(Mutex::new(false));
    let plugin = Scripted::new({
        let task = task.clone();
        let reached = reached.clone();
        move |request, event| {
            if let Event::DecodeHeaders(_) = event {
                let lookup = request.clone();
                let reached = reached.clone();
                let handle = request.spawn(async move {
                    lookup.get_filter_state("slow-key").await?;
                    *reached.lock().unwrap() = true;
                    Ok(FilterStatus::Continue)
                });
                *task.lock().unwrap() = Some(handle);
                return Ok(FilterStatus::Running);
            }
            Ok(FilterStatus::Continue)
        }
    });
    let destroyed = plugin.destroyed.clone();
    let test = Test::with_seed(seed, plugin);
    let req = test.request(headers(&[("host", "example.com")]));

    assert_eq!(test.decode_headers(req), FilterStatus::Running);
    wait_until("the lookup to park", || test.host.parked() == 1).await;
    let request = test.bridge.request(req).expect("request is known");
    assert_eq!(request.pending_calls(), 1);

    test.host.destroy(&test.bridge, req, DestroyReason::Terminate);
    let handle = task.lock().unwrap().take().expect("task was spawned");
    handle.await?;

    assert!(!*reached.lock().unwrap());
    assert!(test.host.replies(req).is_empty());
    assert!(test.host.continued(req).is_empty());
    assert_eq!(request.liveness(), Liveness::Destroyed);
    assert_eq!(request.pending_calls(), 0);
    assert_eq!(*destroyed.lock().unwrap(), [DestroyReason::Terminate]);
    assert!(test.bridge.request(req).is_none());

    // The last reference going away releases the request on the host.
    assert_eq!(test.host.finalized(req), None);
    drop(request);
    wait_until("the request to be finalized", || {
        test.host.finalized(req).is_some()
    })
    .await;
    assert_eq!(test.host.finalized(req), Some(FinalizeReason::Normal));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_after_teardown_abort_without_reaching_the_host() -> TestResult {
    let test = Test::new(Scripted::new(|_, _| Ok(FilterStatus::Continue)));
    let req = test.request(headers(&[("host", "example.com")]));

    test.decode_headers(req);
    let request = test.bridge.request(req).expect("request is known");
    test.host.destroy(&test.bridge, req, DestroyReason::Normal);

    let err = request.get_header("host").unwrap_err();
    let abort = err.as_abort().expect("calls after teardown abort");
    assert!(abort.status().is_context_dead());
    assert!(!request.send_fault_reply("too late"));
    assert!(test.host.replies(req).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn entries_for_unknown_configurations_reply_with_a_fault() -> TestResult {
    let test = Test::new(Scripted::new(|_, _| Ok(FilterStatus::Continue)));
    let req = test.request(headers(&[("host", "example.com")]));
    test.bridge.destroy_config(test.config)?;

    assert_eq!(test.decode_headers(req), FilterStatus::LocalReply);
    let replies = test.host.replies(req);
    single_fault(&replies);
    Ok(())
}
