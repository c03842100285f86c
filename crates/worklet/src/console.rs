//! Best-effort forwarding of the worker's log output to the manager.
//!
//! Every tracing event becomes a console-output message while the channel is
//! active. Forwarding never blocks and never fails the worker: with the
//! channel down the statement is dropped and counted.

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::message::ConsoleOutput;
use crate::client::WorkerClient;

/// Stream selector carried in the console header.
pub const CONSOLE_STREAM_OUT: u32 = 1;
pub const CONSOLE_STREAM_ERROR: u32 = 2;

/// Tracing layer shipping log statements over the worker channel.
pub struct ConsoleForwardLayer {
    client: WorkerClient,
}

impl ConsoleForwardLayer {
    pub(crate) fn new(client: WorkerClient) -> Self {
        Self { client }
    }

    fn level_rank(level: &Level) -> u32 {
        match *level {
            Level::TRACE => 0,
            Level::DEBUG => 1,
            Level::INFO => 2,
            Level::WARN => 3,
            Level::ERROR => 4,
        }
    }

    fn stream_for(level: &Level) -> u32 {
        match *level {
            Level::ERROR | Level::WARN => CONSOLE_STREAM_ERROR,
            _ => CONSOLE_STREAM_OUT,
        }
    }
}

impl<S> Layer<S> for ConsoleForwardLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Never forward this crate's own wire-path events: encoding a console
        // message logs, which would otherwise forward another console message.
        if metadata.target().starts_with("worklet::bridge") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let output = ConsoleOutput {
            stream: Self::stream_for(metadata.level()),
            level: Self::level_rank(metadata.level()),
            indent: 0,
            text: visitor.message,
        };
        self.client.forward_console(&output);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_and_errors_map_to_the_error_stream() {
        assert_eq!(ConsoleForwardLayer::stream_for(&Level::ERROR), CONSOLE_STREAM_ERROR);
        assert_eq!(ConsoleForwardLayer::stream_for(&Level::WARN), CONSOLE_STREAM_ERROR);
        assert_eq!(ConsoleForwardLayer::stream_for(&Level::INFO), CONSOLE_STREAM_OUT);
        assert_eq!(ConsoleForwardLayer::stream_for(&Level::TRACE), CONSOLE_STREAM_OUT);
    }

    #[test]
    fn level_ranks_are_ordered() {
        assert!(
            ConsoleForwardLayer::level_rank(&Level::ERROR)
                > ConsoleForwardLayer::level_rank(&Level::TRACE)
        );
        assert_eq!(ConsoleForwardLayer::level_rank(&Level::INFO), 2);
    }
}
