//! Configuration surface for [`EventStream`](crate::EventStream): a
//! `clap::Parser` struct settable by flag or environment variable.

use std::time::Duration;

use clap::Parser;

const DEFAULT_GAP_REPLAY_DELAY_MS: u64 = 250;
const DEFAULT_MAX_CLOCK_SKEW_MS: u64 = 2_000;
const DEFAULT_CONSUMER_TIMEOUT_MS: u64 = 60_000;

fn default_partitions() -> usize {
    num_cpus::get()
}

/// Runtime configuration for an [`EventStream`](crate::EventStream).
///
/// Every field is settable by flag or by environment variable (`#[clap(env)]`).
#[derive(Clone, Debug, Parser)]
pub struct EventStreamConfig {
    /// Bounded hand-off depth between the replay producer and awaiter; caps
    /// how many transactions may be in flight during cold replay at once.
    #[clap(long, env)]
    pub replay_buffer: usize,

    /// Delay, in milliseconds, between a gap being detected live and the
    /// scheduled range replay that fills it. Zero triggers the replay on
    /// the next executor tick.
    #[clap(long, env, default_value_t = DEFAULT_GAP_REPLAY_DELAY_MS)]
    pub gap_replay_delay_ms: u64,

    /// Symmetric clock skew bias applied when picking a replay start point,
    /// in milliseconds. Guards against journal entries timestamped slightly
    /// behind real time on other nodes.
    #[clap(long, env, default_value_t = DEFAULT_MAX_CLOCK_SKEW_MS)]
    pub max_clock_skew_ms: u64,

    /// Overall wall-clock budget for cold replay to finish, in
    /// milliseconds. Unset (the default) means unbounded.
    #[clap(long, env)]
    pub max_replay_consumption_wait_ms: Option<u64>,

    /// Per-transaction timeout applied while awaiting a replay consumption
    /// handle, in milliseconds. A consumer that never acknowledges a
    /// transaction within this window is treated as hung.
    #[clap(long, env, default_value_t = DEFAULT_CONSUMER_TIMEOUT_MS)]
    pub consumer_timeout_ms: u64,

    /// Worker count for the hash-partitioned serial executor (C4) that the
    /// `EventStream` builds and owns. Two transactions for the same stream
    /// always land on the same worker regardless of this value.
    #[clap(long, env, default_value_t = default_partitions())]
    pub partitions: usize,

    /// Sequencer buffer bound per stream; `None` (the default) means
    /// unlimited, matching the source's `0 = unlimited` sentinel but
    /// expressed as an `Option` rather than a magic integer.
    #[clap(skip)]
    pub buffer_limit: Option<usize>,
}

impl EventStreamConfig {
    pub fn new(replay_buffer: usize) -> Self {
        EventStreamConfig {
            replay_buffer,
            gap_replay_delay_ms: DEFAULT_GAP_REPLAY_DELAY_MS,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
            max_replay_consumption_wait_ms: None,
            consumer_timeout_ms: DEFAULT_CONSUMER_TIMEOUT_MS,
            partitions: default_partitions(),
            buffer_limit: None,
        }
    }

    pub fn gap_replay_delay(&self) -> Duration {
        Duration::from_millis(self.gap_replay_delay_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }

    pub fn max_replay_consumption_wait(&self) -> Option<Duration> {
        self.max_replay_consumption_wait_ms.map(Duration::from_millis)
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_timeout_ms)
    }

    pub fn gap_replay_delay_ms(mut self, ms: u64) -> Self {
        self.gap_replay_delay_ms = ms;
        self
    }

    pub fn max_clock_skew_ms(mut self, ms: u64) -> Self {
        self.max_clock_skew_ms = ms;
        self
    }

    pub fn max_replay_consumption_wait_ms(mut self, ms: Option<u64>) -> Self {
        self.max_replay_consumption_wait_ms = ms;
        self
    }

    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn buffer_limit(mut self, limit: Option<usize>) -> Self {
        self.buffer_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EventStreamConfig::new(128);
        assert_eq!(config.gap_replay_delay(), Duration::from_millis(250));
        assert_eq!(config.max_clock_skew(), Duration::from_millis(2_000));
        assert_eq!(config.consumer_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_replay_consumption_wait(), None);
    }
}
