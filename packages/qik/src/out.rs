//! The output sink.
//!
//! Workers never print directly: they enqueue events, and a single drain
//! task renders them. Per-runnable output ordering is preserved (each
//! worker's lines arrive in order); interleaving between runnables is
//! unspecified, which is why the per-runnable log file exists.
//!
//! Rendering adapts to the environment: in an interactive terminal with
//! quiet verbosity a progress bar tracks completion; otherwise events render
//! as plain lines with the runnable slug as a colored prefix.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::runnable::Slug;

/// How a runnable finished, as far as rendering cares.
#[derive(Clone, Debug)]
pub enum Outcome {
    Success { cached: bool },
    Failure { exit_code: i32, cached: bool },
    Skipped,
    UpstreamFailed,
}

enum Event {
    Started { slug: Slug, cached: bool },
    Line { slug: Slug, line: Vec<u8> },
    Finished { slug: Slug, outcome: Outcome },
    Note { text: String },
}

/// Handle used by workers to enqueue output events.
#[derive(Clone)]
pub struct Sink {
    tx: flume::Sender<Event>,
}

/// The sink plus its drain task; owned by the coordinator.
pub struct SinkDriver {
    sink: Sink,
    drain: JoinHandle<()>,
}

impl SinkDriver {
    /// Start the drain task. `total` sizes the progress bar; pass 0 to
    /// disable it.
    pub fn start(verbosity: u8, total: u64) -> Self {
        let (tx, rx) = flume::bounded::<Event>(256);

        let progress = if verbosity == 0 && total > 0 && console::Term::stderr().is_term() {
            let bar = ProgressBar::new(total);
            let style = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("=> ");
            bar.set_style(style);
            Some(bar)
        } else {
            None
        };

        let stream_lines = verbosity >= 1;
        let drain = tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                render(event, progress.as_ref(), stream_lines);
            }
            if let Some(bar) = progress {
                bar.finish_and_clear();
            }
        });

        Self {
            sink: Sink { tx },
            drain,
        }
    }

    pub fn sink(&self) -> Sink {
        self.sink.clone()
    }

    /// Drop the sender side and wait for the drain task to flush.
    pub async fn close(self) {
        let Self { sink, drain } = self;
        drop(sink);
        if let Err(err) = drain.await {
            warn!(?err, "output drain task failed");
        }
    }
}

impl Sink {
    pub fn started(&self, slug: &Slug, cached: bool) {
        self.send(Event::Started {
            slug: slug.clone(),
            cached,
        });
    }

    pub fn line(&self, slug: &Slug, line: &[u8]) {
        self.send(Event::Line {
            slug: slug.clone(),
            line: line.to_vec(),
        });
    }

    pub fn finished(&self, slug: &Slug, outcome: Outcome) {
        self.send(Event::Finished {
            slug: slug.clone(),
            outcome,
        });
    }

    pub fn note(&self, text: impl Into<String>) {
        self.send(Event::Note { text: text.into() });
    }

    fn send(&self, event: Event) {
        // A full queue blocks the worker rather than dropping output.
        if self.tx.send(event).is_err() {
            warn!("output sink closed early");
        }
    }
}

fn render(event: Event, progress: Option<&ProgressBar>, stream_lines: bool) {
    let emit = |text: String| match progress {
        Some(bar) => bar.suspend(|| println!("{text}")),
        None => println!("{text}"),
    };

    match event {
        Event::Started { slug, cached } => {
            if let Some(bar) = progress {
                bar.set_message(slug.to_string());
            }
            if stream_lines {
                let label = if cached { "replaying" } else { "running" };
                emit(format!("{} {label}", slug.to_string().cyan()));
            }
        }
        Event::Line { slug, line } => {
            if stream_lines {
                emit(format!(
                    "{} {}",
                    slug.to_string().cyan(),
                    String::from_utf8_lossy(&line).trim_end()
                ));
            }
        }
        Event::Finished { slug, outcome } => {
            if let Some(bar) = progress {
                bar.inc(1);
            }
            let text = match outcome {
                Outcome::Success { cached: true } => {
                    format!("{} {} (cached)", "ok".green(), slug)
                }
                Outcome::Success { cached: false } => format!("{} {}", "ok".green(), slug),
                Outcome::Failure { exit_code, cached } => {
                    let suffix = if cached { " (cached)" } else { "" };
                    format!("{} {slug} exit {exit_code}{suffix}", "failed".red())
                }
                Outcome::Skipped => format!("{} {slug}", "skipped".yellow()),
                Outcome::UpstreamFailed => {
                    format!("{} {slug} (upstream failed)", "blocked".red())
                }
            };
            emit(text);
        }
        Event::Note { text } => emit(text),
    }
}
