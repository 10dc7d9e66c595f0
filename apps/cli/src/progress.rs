//! Progress bar for a running transfer

use crate::output::format_bytes;
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use s3pipe_types::{Direction, ObjectRef, TransferEvent, TransferState};

/// Renders [`TransferEvent`]s as a single progress bar on stderr
pub struct TransferProgress {
    bar: ProgressBar,
    direction: Direction,
    done: u64,
}

impl TransferProgress {
    pub fn new(direction: Direction, object: &ObjectRef) -> Self {
        // Hidden when stderr is not a terminal, e.g. under cron or in a pipe
        let bar = if console::Term::stderr().is_term() {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr())
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        bar.set_message(object.to_string());

        Self {
            bar,
            direction,
            done: 0,
        }
    }

    /// Update the bar from an event
    pub fn handle_event(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::SizeKnown { total } => self.bar.set_length(*total),

            // Uploads stream from a source of unknown size; the bar tracks
            // what has been read so far
            TransferEvent::PartDispatched { offset, len, .. }
                if self.direction == Direction::Upload =>
            {
                self.bar.set_length(offset + len);
            }

            TransferEvent::PartConfirmed { len, .. } => {
                self.done += len;
                self.bar.set_position(self.done);
            }

            TransferEvent::PartRetrying {
                sequence,
                attempt,
                error,
            } => {
                self.bar.println(format!(
                    "{} Part {} attempt {} failed: {}",
                    style("↻").yellow(),
                    sequence,
                    attempt,
                    error
                ));
            }

            TransferEvent::Degraded { reason } => {
                self.bar
                    .println(format!("{} {}", style("!").yellow().bold(), reason));
            }

            TransferEvent::StateChanged { state, error } => match state {
                TransferState::Committed => {
                    self.bar.finish_with_message(format!(
                        "{} {} complete",
                        style("✓").green().bold(),
                        format_bytes(self.done)
                    ));
                }
                TransferState::Aborted => {
                    self.bar.abandon_with_message(format!(
                        "{} Failed: {}",
                        style("✗").red().bold(),
                        error.as_deref().unwrap_or("Unknown error")
                    ));
                }
                TransferState::Finalizing => {
                    self.bar.set_message("finalizing");
                }
                _ => {}
            },

            _ => {}
        }
    }

    /// Leave the bar in its final state
    pub fn finish(&self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}
