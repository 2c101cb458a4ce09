use {
    crate::common::{headers, Event, Scripted, Test, TestResult},
    isthmus_lib::{
        config::LocalHostConfig,
        filter::FilterStatus,
        logging::{LogLevel, LOG_WRITER},
        LocalHost,
    },
    std::{
        fmt,
        io::{self, Write},
        sync::{Arc, Mutex},
    },
    tracing::{
        field::{Field, Visit},
        span::{Attributes, Id},
        Subscriber,
    },
    tracing_subscriber::{
        layer::{Context, SubscriberExt},
        Layer, Registry,
    },
};

#[derive(Clone, Default)]
struct LogWriter(Arc<Mutex<Vec<Vec<u8>>>>);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().push(buf.to_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn logging_works() -> TestResult {
    let log_writer = LogWriter::default();
    *LOG_WRITER.lock().unwrap() = Box::new(log_writer.clone());

    let host = LocalHost::new(LocalHostConfig::default()).with_log_level(LogLevel::Debug);
    let test = Test::with_host(
        host,
        Scripted::new(|request, event| {
            if let Event::DecodeHeaders(_) = event {
                assert_eq!(request.log_level()?, LogLevel::Debug);
                request.log(LogLevel::Trace, "inigo: not forwarded")?;
                request.log(LogLevel::Info, "inigo: Who are you?")?;
                request.log(LogLevel::Warn, "mib: There is something\nI ought to tell you.")?;
                request.log(LogLevel::Critical, "inigo: Tell me.\n")?;
                request.log(LogLevel::Error, "")?;
            }
            Ok(FilterStatus::Continue)
        }),
        b"",
    );
    let req = test.request(headers(&[("host", "example.com")]));
    assert_eq!(test.decode_headers(req), FilterStatus::Continue);
    test.bridge.log(LogLevel::Debug, "mib: not forwarded either")?;
    test.bridge.log(LogLevel::Error, "mib: No one of consequence.")?;

    let logs: Vec<String> = std::mem::take(&mut *log_writer.0.lock().unwrap())
        .into_iter()
        .map(|line| String::from_utf8(line).unwrap())
        .collect();
    assert_eq!(
        logs,
        [
            "info :: inigo: Who are you?\n",
            "warn :: mib: There is something\\nI ought to tell you.\n",
            "critical :: inigo: Tell me.\n",
            "error :: mib: No one of consequence.\n",
        ]
    );
    Ok(())
}

/// Records the `phase` of every span that carries one, and whether it was opened as a root.
#[derive(Clone, Default)]
struct SpanRoots(Arc<Mutex<Vec<(String, bool)>>>);

struct PhaseField(Option<String>);

impl Visit for PhaseField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "phase" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "phase" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for SpanRoots {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut phase = PhaseField(None);
        attrs.record(&mut phase);
        if let Some(phase) = phase.0 {
            self.0.lock().unwrap().push((phase, attrs.is_root()));
        }
    }
}

#[tokio::test]
async fn background_spans_are_not_nested_in_the_spawning_phase() -> TestResult {
    let roots = SpanRoots::default();
    let test = Test::new(Scripted::new(|request, event| {
        if let Event::DecodeHeaders(_) = event {
            request.spawn(async { Ok::<_, isthmus_lib::Error>(FilterStatus::Continue) });
            return Ok(FilterStatus::Running);
        }
        Ok(FilterStatus::Continue)
    }));
    let req = test.request(headers(&[("host", "example.com")]));

    {
        let _guard = tracing::subscriber::set_default(Registry::default().with(roots.clone()));
        assert_eq!(test.decode_headers(req), FilterStatus::Running);
    }

    let roots = roots.0.lock().unwrap().clone();
    assert!(
        roots.contains(&("decode_headers".to_owned(), true)),
        "{roots:?}"
    );
    assert!(roots.contains(&("background".to_owned(), true)), "{roots:?}");
    Ok(())
}
