//! Human checkpoints and the cancellable backoff pause.
//!
//! Every point where automation cannot decide on its own goes through
//! [`Checkpoint`]. Prompts block until the operator answers; there is no
//! timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use colored::Colorize;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Operator answer at an escalation checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Treat the unresolved state as acceptable and continue.
    Proceed,
    /// End the session with a non-zero exit.
    Abort,
    /// Check again.
    Recheck,
}

impl Decision {
    const ALL: [Decision; 3] = [Decision::Recheck, Decision::Proceed, Decision::Abort];

    fn label(self) -> &'static str {
        match self {
            Decision::Recheck => "Check again",
            Decision::Proceed => "Proceed",
            Decision::Abort => "Abort",
        }
    }
}

/// Human decision channel.
pub trait Checkpoint: Send + Sync {
    /// Present an unresolved state and wait for proceed / abort / recheck.
    fn decide(&self, message: &str) -> Result<Decision>;

    /// Ask a yes/no question.
    fn confirm(&self, message: &str) -> Result<bool>;
}

/// Interactive checkpoint on the controlling terminal.
pub struct TerminalCheckpoint;

impl Checkpoint for TerminalCheckpoint {
    fn decide(&self, message: &str) -> Result<Decision> {
        println!();
        println!("{} {}", "⚠".yellow(), message.yellow().bold());

        let items: Vec<&str> = Decision::ALL.iter().map(|d| d.label()).collect();
        let idx = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Should we proceed, abort, or check again?")
            .items(&items)
            .default(0)
            .interact()?;

        let decision = Decision::ALL[idx];
        debug!("Checkpoint decision: {:?}", decision);
        Ok(decision)
    }

    fn confirm(&self, message: &str) -> Result<bool> {
        let answer = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(message)
            .default(false)
            .interact()?;
        Ok(answer)
    }
}

/// Backoff wait between retry attempts.
#[async_trait]
pub trait Pause: Send + Sync {
    async fn pause(&self, duration: Duration);
}

/// Ctrl-C routing for the process.
///
/// While a pause is active Ctrl-C only ends the pause early. Outside a pause
/// it terminates the process like the default handler would.
pub struct SkipSignal {
    waiting: AtomicBool,
    notify: Notify,
}

impl SkipSignal {
    fn new() -> Self {
        Self {
            waiting: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Install the Ctrl-C listener. Must be called inside the tokio runtime.
    pub fn install() -> Arc<Self> {
        let signal = Arc::new(Self::new());

        let listener = Arc::clone(&signal);
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("Ctrl-C listener unavailable; pauses cannot be skipped");
                    return;
                }
                if !listener.skip() {
                    eprintln!();
                    warn!("Interrupted");
                    std::process::exit(130);
                }
            }
        });

        signal
    }

    /// End the active pause. Returns false when no pause is running.
    ///
    /// Only pauses already waiting are woken; nothing carries over to the
    /// next pause.
    fn skip(&self) -> bool {
        if !self.waiting.load(Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }
}

/// Sleep with a progress bar that Ctrl-C cuts short.
pub struct InterruptiblePause {
    signal: Arc<SkipSignal>,
}

impl InterruptiblePause {
    pub fn new(signal: Arc<SkipSignal>) -> Self {
        Self { signal }
    }
}

#[async_trait]
impl Pause for InterruptiblePause {
    async fn pause(&self, duration: Duration) {
        println!(
            "Sleeping for {} seconds... Press Ctrl-C to skip the wait and continue",
            duration.as_secs()
        );

        let pb = create_progress_bar(duration.as_secs());

        // Registered before `waiting` is raised so no skip is lost.
        let skipped = self.signal.notify.notified();
        tokio::pin!(skipped);
        skipped.as_mut().enable();
        self.signal.waiting.store(true, Ordering::SeqCst);

        let ticker = async {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                pb.inc(1);
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = &mut skipped => {
                debug!("Pause skipped by operator");
            }
            _ = ticker => {}
        }

        self.signal.waiting.store(false, Ordering::SeqCst);
        pb.finish_and_clear();
    }
}

fn create_progress_bar(total_secs: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_secs);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}s")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(250));
    pb
}
