use std::time::Duration;

use crate::config::Config;
use crate::lifecycle::LifecycleState;
use crate::stats::{Aggregator, SortMode, SortOrder};

const IDLE_POLL: Duration = Duration::from_millis(200);

/// Minimal stand-in for a full terminal UI: periodically renders the
/// current leaderboard as a plain-text table. Talks to the aggregator only
/// through its public snapshot API and owns no locks of its own.
pub struct Reporter {
    refresh_interval: Duration,
    sort_mode: SortMode,
    sort_order: SortOrder,
}

impl Reporter {
    pub fn new(config: &Config) -> Self {
        Reporter {
            refresh_interval: Duration::from_secs(config.refresh_interval.max(1)),
            sort_mode: config.sort_mode,
            sort_order: config.sort_order,
        }
    }

    /// Renders one leaderboard snapshot to stdout.
    pub fn render_once(&self, aggregator: &Aggregator) {
        let leaders = aggregator.get_leaders(self.sort_mode, self.sort_order);
        println!(
            "{:<32} {:>10} {:>10} {:>12} {:>14}",
            "key", "count", "size", "req/s", "bytes/s"
        );
        for stat in leaders {
            let now = crate::clock::now();
            println!(
                "{:<32} {:>10} {:>10} {:>12.2} {:>14.2}",
                String::from_utf8_lossy(&stat.key),
                stat.count,
                stat.size,
                stat.request_rate(now),
                stat.bandwidth(now),
            );
        }
        log::info!(
            "reporter: rendered {} entries ({} reaped total)",
            aggregator.stat_count(),
            aggregator.reaped_count()
        );
    }

    /// Runs until `state` leaves `Running`, sleeping in short chunks so
    /// shutdown is noticed promptly regardless of `refresh_interval`.
    pub fn run(&self, aggregator: &Aggregator, state: &LifecycleState) {
        let mut since_last_render = Duration::ZERO;
        while state.is_running() {
            if since_last_render >= self.refresh_interval {
                self.render_once(aggregator);
                since_last_render = Duration::ZERO;
            } else {
                std::thread::sleep(IDLE_POLL);
                since_last_render += IDLE_POLL;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Event, EventQueue};
    use std::sync::Arc;

    #[test]
    fn render_once_does_not_panic_on_empty_collection() {
        let queue = Arc::new(EventQueue::new(4));
        let agg = Aggregator::new(queue, 0.0);
        let config = Config {
            interface: "eth0".to_string(),
            port: 11211,
            discard_threshold: 0.0,
            refresh_interval: 1,
            sort_mode: SortMode::Calls,
            sort_order: SortOrder::Desc,
        };
        let reporter = Reporter::new(&config);
        reporter.render_once(&agg);
    }

    #[test]
    fn render_once_prints_known_entries() {
        let queue = Arc::new(EventQueue::new(4));
        let mut agg = Aggregator::new(queue.clone(), 0.0);
        agg.start();
        queue.produce(Event::new(b"foo".to_vec(), 10));
        std::thread::sleep(Duration::from_millis(100));

        let config = Config {
            interface: "eth0".to_string(),
            port: 11211,
            discard_threshold: 0.0,
            refresh_interval: 1,
            sort_mode: SortMode::Calls,
            sort_order: SortOrder::Desc,
        };
        let reporter = Reporter::new(&config);
        reporter.render_once(&agg);
        assert_eq!(agg.stat_count(), 1);
        agg.shutdown();
    }
}
