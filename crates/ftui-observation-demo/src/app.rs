#![forbid(unsafe_code)]

//! The counter model, its view, and the update loop driving both.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use ftui_observation::{
    ChangeEvent, ObservationRegistrar, RegistrarConfig, RegistrarStats, batch, observable,
    untracked,
};

use crate::cli::Opts;

/// How long the view waits for a background update before checking whether
/// the writer is done.
const WAKE_TIMEOUT: Duration = Duration::from_millis(200);

/// Pause between background updates so renders interleave with writes.
const BACKGROUND_STEP: Duration = Duration::from_millis(5);

observable! {
    /// Counter state shown by [`CounterView`].
    pub struct CounterModel {
        pub count: i64 = 0,
        pub title: String = String::from("Counter"),
        /// Bumped on every update; only shown through an untracked read.
        pub ticks: u64 = 0,
    }
}

impl CounterModel {
    /// Apply update number `step`.
    ///
    /// Every third update also renames the counter; both writes are batched
    /// into a single notification.
    pub fn apply_update(&self, step: u32) {
        let value = i64::from(step) * 7 % 50;
        if step % 3 == 0 {
            batch(|| {
                self.count.set(value);
                self.title.set(format!("Counter (round {})", step / 3));
            });
        } else {
            self.count.set(value);
        }
        self.ticks.update(|t| *t += 1);
    }

    /// Computed property: never stored, subscribes through `count`.
    pub fn parity(&self) -> &'static str {
        if self.count.get() % 2 == 0 { "even" } else { "odd" }
    }
}

// ─── View ────────────────────────────────────────────────────────────────────

/// Renders the model and re-tracks on every render.
pub struct CounterView {
    registrar: ObservationRegistrar,
    wake: Sender<()>,
    rendered: Vec<String>,
}

impl CounterView {
    pub fn new(registrar: &ObservationRegistrar, wake: Sender<()>) -> Self {
        Self {
            registrar: registrar.clone(),
            wake,
            rendered: Vec::new(),
        }
    }

    /// Render `model`, subscribing to whatever the render reads.
    pub fn render(&mut self, model: &CounterModel) -> &str {
        let wake = self.wake.clone();
        let result = self.registrar.track(
            || {
                let header = model.title.get();
                // The badge is a nested view with its own observer.
                let badge = self
                    .registrar
                    .track(|| model.parity(), |_: &ChangeEvent| {})
                    .map_or("?", |(badge, _)| badge);
                let ticks = untracked(|| model.ticks.get());
                format!("{header}: {} [{badge}] (ticks {ticks})", model.count.get())
            },
            move |event: &ChangeEvent| {
                tracing::debug!(
                    message = "demo.view.invalidated",
                    observer = event.observer().raw(),
                    paths = event.paths().len()
                );
                // The receiver is gone once the app has shut down.
                let _ = wake.send(());
            },
        );
        let frame = match result {
            Ok((frame, _observation)) => frame,
            Err(err) => {
                tracing::warn!(message = "demo.view.untracked", error = %err);
                String::from("<render failed>")
            }
        };
        self.rendered.push(frame);
        self.rendered.last().map_or("", String::as_str)
    }

    /// Every frame rendered so far.
    pub fn frames(&self) -> &[String] {
        &self.rendered
    }
}

// ─── Run ─────────────────────────────────────────────────────────────────────

/// Outcome of a demo run.
#[derive(Debug, Clone)]
pub struct Report {
    pub frames: Vec<String>,
    pub final_count: i64,
    pub stats: RegistrarStats,
}

/// Run the demo, passing each rendered frame to `emit`.
pub fn run(opts: &Opts, mut emit: impl FnMut(&str)) -> Report {
    let registrar = ObservationRegistrar::with_config(
        RegistrarConfig::from_env()
            .with_nested(opts.nested)
            .with_label("counter"),
    );
    let model = Arc::new(CounterModel::new(&registrar));
    let (wake_tx, wake_rx) = mpsc::channel();
    let mut view = CounterView::new(&registrar, wake_tx);

    tracing::info!(
        message = "demo.start",
        updates = opts.updates,
        background = opts.background,
        nested = opts.nested.as_str()
    );
    emit(view.render(&model));

    if opts.background {
        run_background(opts.updates, &model, &mut view, &wake_rx, &mut emit);
    } else {
        for step in 1..=opts.updates {
            model.apply_update(step);
            while wake_rx.try_recv().is_ok() {
                emit(view.render(&model));
            }
        }
    }

    let report = Report {
        frames: view.frames().to_vec(),
        final_count: model.count.get(),
        stats: registrar.stats(),
    };
    tracing::info!(
        message = "demo.finish",
        frames = report.frames.len(),
        mutations = report.stats.mutations,
        discharged = report.stats.discharged,
        notifications = ftui_observation::notifications_total()
    );
    report
}

fn run_background(
    updates: u32,
    model: &Arc<CounterModel>,
    view: &mut CounterView,
    wake: &Receiver<()>,
    emit: &mut impl FnMut(&str),
) {
    let writer = {
        let model = Arc::clone(model);
        thread::spawn(move || {
            for step in 1..=updates {
                model.apply_update(step);
                thread::sleep(BACKGROUND_STEP);
            }
        })
    };

    loop {
        match wake.recv_timeout(WAKE_TIMEOUT) {
            Ok(()) => emit(view.render(model)),
            Err(RecvTimeoutError::Timeout) if writer.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if writer.join().is_err() {
        tracing::error!(message = "demo.writer.panicked");
    }
    // Updates that landed after the last render.
    while wake.try_recv().is_ok() {
        emit(view.render(model));
    }
}
