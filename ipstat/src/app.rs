use std::{future::Future, io, path::PathBuf, pin::pin, sync::Arc, time::Duration};

use color_eyre::eyre::{eyre, Result, WrapErr};
use directories::ProjectDirs;
use lazy_static::lazy_static;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{self, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::{
    hook::Hook,
    presenter::{
        web::{self, WebState},
        Presenter,
    },
    snapshot,
    table::CounterTable,
};

lazy_static! {
    pub(crate) static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase().to_string();
    pub(crate) static ref DATA_FOLDER: Option<PathBuf> =
        std::env::var(format!("{}_DATA", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
    pub(crate) static ref LOG_ENV: String = format!("{}_LOGLEVEL", PROJECT_NAME.clone());
    pub(crate) static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "ipstat", env!("CARGO_PKG_NAME"))
}

pub(crate) fn get_data_dir() -> PathBuf {
    if let Some(s) = DATA_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

/// Logs go to a file in the data directory and, for the operator, to stderr. Stdout is left
/// to the console presenter.
pub(crate) fn initialize_logging() -> Result<()> {
    let directory = get_data_dir();
    std::fs::create_dir_all(directory.clone())?;
    let log_path = directory.join(LOG_FILE.clone());
    let log_file = std::fs::File::create(log_path)?;
    std::env::set_var(
        "RUST_LOG",
        std::env::var("RUST_LOG")
            .or_else(|_| std::env::var(LOG_ENV.clone()))
            .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME"))),
    );
    let file_subscriber = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_writer(log_file)
        .with_target(false)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::EnvFilter::from_default_env());
    let stderr_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing_subscriber::registry()
        .with(file_subscriber)
        .with(stderr_subscriber)
        .with(ErrorLayer::default())
        .init();
    Ok(())
}

/// Registers SIGINT and SIGTERM handlers immediately; the returned future completes on the
/// first of either.
pub(crate) fn termination_signal() -> io::Result<impl Future<Output = ()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AppState {
    Attached,
    Running,
    Detaching,
    Stopped,
}

/// What triggers a snapshot and where it goes.
pub(crate) enum Driver {
    /// Snapshot every `interval`, unbounded, to `presenter`.
    Timer {
        interval: Duration,
        presenter: Box<dyn Presenter + Send>,
    },
    /// Snapshot once per HTTP request. Connections still open `grace` after the stop
    /// signal are dropped.
    Http {
        listener: TcpListener,
        state: WebState,
        grace: Duration,
    },
}

pub(crate) struct App<H: Hook> {
    hook: H,
    table: Arc<dyn CounterTable>,
    state: AppState,
}

impl<H: Hook> App<H> {
    /// Takes ownership of a hook that is already attached.
    pub(crate) fn new(hook: H, table: Arc<dyn CounterTable>) -> Self {
        Self {
            hook,
            table,
            state: AppState::Attached,
        }
    }

    pub(crate) fn table(&self) -> Arc<dyn CounterTable> {
        self.table.clone()
    }

    /// Runs `driver` until `shutdown` completes or the driver fails, then detaches.
    pub(crate) async fn run(
        mut self,
        driver: Driver,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        self.transition(AppState::Running);
        let token = CancellationToken::new();

        let driven = match driver {
            Driver::Timer {
                interval,
                presenter,
            } => {
                info!("Aggregator started. Press Ctrl+C to stop.");
                let table = self.table.clone();
                run_until(
                    poll(table, interval, presenter, token.clone()),
                    shutdown,
                    &token,
                    interval,
                )
                .await
            }
            Driver::Http {
                listener,
                state,
                grace,
            } => {
                info!("Web view started. Press Ctrl+C to stop.");
                run_until(
                    web::serve(listener, state, token.clone()),
                    shutdown,
                    &token,
                    grace,
                )
                .await
            }
        };

        if let Err(report) = &driven {
            error!("Stopping after failure: {report:#}");
        }
        let stopped = self.stop();
        driven.and(stopped)
    }

    /// Detaches the hook. Used directly when startup fails before [`App::run`].
    pub(crate) fn stop(mut self) -> Result<()> {
        self.transition(AppState::Detaching);
        info!("Detaching eBPF program and cleaning up...");
        let result = self.hook.detach().wrap_err("failed to detach eBPF program");
        self.transition(AppState::Stopped);
        match &result {
            Ok(()) => info!("Cleanup complete."),
            Err(report) => error!("Cleanup incomplete: {report:#}"),
        }
        result
    }

    fn transition(&mut self, next: AppState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Drives `work` to completion, cancelling `token` when `shutdown` fires first. After
/// cancellation `work` gets up to `grace` to finish an in-flight render before it is dropped.
async fn run_until(
    work: impl Future<Output = Result<()>>,
    shutdown: impl Future<Output = ()>,
    token: &CancellationToken,
    grace: Duration,
) -> Result<()> {
    let mut work = pin!(work);
    tokio::select! {
        result = &mut work => return result,
        _ = shutdown => {}
    }
    info!("Received stop signal.");
    token.cancel();
    match tokio::time::timeout(grace, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Still busy {grace:?} after the stop signal, abandoning it");
            Ok(())
        }
    }
}

async fn poll(
    table: Arc<dyn CounterTable>,
    interval: Duration,
    mut presenter: Box<dyn Presenter + Send>,
    token: CancellationToken,
) -> Result<()> {
    if interval.is_zero() {
        return Err(eyre!("polling interval must be positive"));
    }
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => tick(&table, presenter.as_mut()).await,
        }
    }
}

/// One read and render. Failures skip this trigger only.
async fn tick(table: &Arc<dyn CounterTable>, presenter: &mut (dyn Presenter + Send)) {
    let table = table.clone();
    // Map iteration is a series of syscalls.
    let snapshot = match tokio::task::spawn_blocking(move || snapshot::read(&*table, None)).await
    {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(err)) => {
            warn!("Error reading map: {err}");
            return;
        }
        Err(err) => {
            warn!("Snapshot task failed: {err}");
            return;
        }
    };
    if let Err(report) = presenter.present(&snapshot) {
        warn!("Failed to render traffic stats: {report:#}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        net::Ipv4Addr,
        num::NonZeroUsize,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use ipstat_common::encode_key;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::{oneshot, Notify},
    };

    use super::*;
    use crate::{
        hook::HookError,
        presenter::{console::ConsolePresenter, web::Page},
        snapshot::RankedSnapshot,
        table::fake::FakeTable,
    };

    #[derive(Clone, Default)]
    struct Counts {
        detach_calls: Arc<AtomicUsize>,
        detached: Arc<AtomicUsize>,
    }

    struct FakeHook {
        attached: bool,
        fail: bool,
        counts: Counts,
    }

    impl FakeHook {
        fn attached(counts: &Counts) -> Self {
            Self {
                attached: true,
                fail: false,
                counts: counts.clone(),
            }
        }
    }

    impl Hook for FakeHook {
        fn detach(&mut self) -> Result<(), HookError> {
            self.counts.detach_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HookError::HookSetupFailed {
                    context: "failed to detach".into(),
                    detail: "busy".into(),
                });
            }
            if self.attached {
                self.attached = false;
                self.counts.detached.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Write::write(&mut *self.0.lock().unwrap(), buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    struct FailingPresenter(Arc<AtomicUsize>);

    impl Presenter for FailingPresenter {
        fn present(&mut self, _: &RankedSnapshot) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(eyre!("render failed"))
        }
    }

    fn timer(interval_secs: u64, presenter: impl Presenter + Send + 'static) -> Driver {
        Driver::Timer {
            interval: Duration::from_secs(interval_secs),
            presenter: Box::new(presenter),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_table_prints_placeholder_and_detaches_once() {
        let counts = Counts::default();
        let out = SharedBuf::default();
        let app = App::new(FakeHook::attached(&counts), Arc::new(FakeTable::default()));

        let shutdown = tokio::time::sleep(Duration::from_secs(11));
        app.run(timer(5, ConsolePresenter::new(out.clone())), shutdown)
            .await
            .unwrap();

        assert_eq!(out.text().matches("No traffic captured yet.").count(), 2);
        assert_eq!(counts.detach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(counts.detached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_read_still_renders_and_detaches_once() {
        let counts = Counts::default();
        let out = SharedBuf::default();
        let signal = Arc::new(Notify::new());
        let table = {
            let signal = signal.clone();
            FakeTable::new(vec![(encode_key(Ipv4Addr::new(10, 0, 0, 9)), 42)])
                .on_read(move || signal.notify_one())
        };
        let app = App::new(FakeHook::attached(&counts), Arc::new(table));

        let shutdown = {
            let signal = signal.clone();
            async move { signal.notified().await }
        };
        app.run(timer(5, ConsolePresenter::new(out.clone())), shutdown)
            .await
            .unwrap();

        let text = out.text();
        assert_eq!(text.matches("--- Traffic Stats ---").count(), 1);
        assert!(text.contains("10.0.0.9        : 42 bytes"));
        assert_eq!(counts.detached.load(Ordering::SeqCst), 1);
        assert_eq!(counts.detach_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_and_render_failures_do_not_stop_the_loop() {
        let counts = Counts::default();
        let renders = Arc::new(AtomicUsize::new(0));
        let table = FakeTable::new(vec![(1, 1)]).failing_after(0);
        let app = App::new(FakeHook::attached(&counts), Arc::new(table));
        let shutdown = tokio::time::sleep(Duration::from_secs(16));
        app.run(timer(5, FailingPresenter(renders.clone())), shutdown)
            .await
            .unwrap();
        assert_eq!(renders.load(Ordering::SeqCst), 0);

        let table = FakeTable::new(vec![(1, 1)]);
        let app = App::new(FakeHook::attached(&counts), Arc::new(table));
        let shutdown = tokio::time::sleep(Duration::from_secs(16));
        app.run(timer(5, FailingPresenter(renders.clone())), shutdown)
            .await
            .unwrap();
        assert_eq!(renders.load(Ordering::SeqCst), 3);
        assert_eq!(counts.detached.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_detach_is_reported() {
        let counts = Counts::default();
        let hook = FakeHook {
            attached: true,
            fail: true,
            counts: counts.clone(),
        };
        let app = App::new(hook, Arc::new(FakeTable::default()));
        let result = app
            .run(timer(5, ConsolePresenter::new(io::sink())), async {})
            .await;
        assert!(result.is_err());
        assert_eq!(counts.detach_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_before_run_detaches() {
        let counts = Counts::default();
        let app = App::new(FakeHook::attached(&counts), Arc::new(FakeTable::default()));
        app.stop().unwrap();
        assert_eq!(counts.detached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn web_driver_serves_until_shutdown_then_detaches() {
        let counts = Counts::default();
        let table = FakeTable::new(vec![(encode_key(Ipv4Addr::new(172, 16, 0, 1)), 2048)]);
        let app = App::new(FakeHook::attached(&counts), Arc::new(table));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = WebState::new(
            app.table(),
            NonZeroUsize::new(30).unwrap(),
            Page::new("eth0", Duration::from_secs(5)),
        );
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(async move {
            let driver = Driver::Http {
                listener,
                state,
                grace: Duration::from_secs(5),
            };
            app.run(driver, async {
                let _ = stop_rx.await;
            })
            .await
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.contains("<td>172.16.0.1</td>"));
        assert!(response.contains("2.0 KiB"));
        assert_eq!(counts.detached.load(Ordering::SeqCst), 0);

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(counts.detached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_detach() {
        let counts = Counts::default();
        let app = App::new(FakeHook::attached(&counts), Arc::new(FakeTable::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = WebState::new(
            app.table(),
            NonZeroUsize::new(30).unwrap(),
            Page::new("eth0", Duration::from_secs(5)),
        );
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(async move {
            let driver = Driver::Http {
                listener,
                state,
                grace: Duration::from_millis(200),
            };
            app.run(driver, async {
                let _ = stop_rx.await;
            })
            .await
        });

        // Half a request, then silence.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: local").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("run should give up on the stalled connection")
            .unwrap()
            .unwrap();
        assert_eq!(counts.detached.load(Ordering::SeqCst), 1);
        drop(stream);
    }

    #[tokio::test]
    async fn signal_before_awaiting_is_not_lost() {
        // Handlers are registered before attach; a signal that lands while attach is
        // still running must end the run once it starts.
        let shutdown = termination_signal().unwrap();
        let counts = Counts::default();
        let app = App::new(FakeHook::attached(&counts), Arc::new(FakeTable::default()));
        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);

        tokio::time::timeout(
            Duration::from_secs(5),
            app.run(timer(5, ConsolePresenter::new(io::sink())), shutdown),
        )
        .await
        .expect("pending SIGTERM should stop the run")
        .unwrap();
        assert_eq!(counts.detached.load(Ordering::SeqCst), 1);
    }
}
