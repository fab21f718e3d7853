use serde::Deserialize;
use std::time::Duration;

/// Broker options
///
/// Options can be set with the builder methods or read from a JSON document,
/// in which case missing fields take their default value. Values that must be
/// positive are raised to 1 when read, whichever way they were set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Opts {
    /// Number of partitions. Defaults to 1
    pub(crate) partitions: u16,
    /// Period of the expiry sweep of buffered messages. Defaults to 1 second
    pub(crate) sweep_interval_ms: u64,
    /// Minimum time a message id is kept to reject duplicates. Defaults to 1 hour
    pub(crate) id_retention_ms: u64,
    /// Capacity of the command channel of each partition. Defaults to 100
    pub(crate) channel_capacity: usize,
    /// Time to live of messages published without one. Defaults to 1 hour
    pub(crate) default_ttl_ms: u64,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            partitions: 1,
            sweep_interval_ms: 1000,
            id_retention_ms: 3_600_000,
            channel_capacity: 100,
            default_ttl_ms: 3_600_000,
        }
    }
}

impl Opts {
    pub fn partitions(self, partitions: u16) -> Self {
        let mut opts = self;
        opts.partitions = partitions.max(1);
        opts
    }

    pub fn sweep_interval_ms(self, sweep_interval_ms: u64) -> Self {
        let mut opts = self;
        opts.sweep_interval_ms = sweep_interval_ms.max(1);
        opts
    }

    pub fn id_retention_ms(self, id_retention_ms: u64) -> Self {
        let mut opts = self;
        opts.id_retention_ms = id_retention_ms;
        opts
    }

    pub fn channel_capacity(self, channel_capacity: usize) -> Self {
        let mut opts = self;
        opts.channel_capacity = channel_capacity.max(1);
        opts
    }

    pub fn default_ttl_ms(self, default_ttl_ms: u64) -> Self {
        let mut opts = self;
        opts.default_ttl_ms = default_ttl_ms;
        opts
    }

    pub fn get_partitions(&self) -> u16 {
        self.partitions.max(1)
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub(crate) fn get_channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn it_reads_options_with_defaults() {
        let opts: Opts = serde_json::from_value(json!({
            "partitions": 3,
            "default_ttl_ms": 0
        }))
        .unwrap();
        assert_eq!(
            opts,
            Opts::default().partitions(3).default_ttl_ms(0)
        );
        assert_eq!(opts.sweep_interval_ms, 1000);
    }

    #[test]
    fn it_keeps_at_least_one_partition() {
        assert_eq!(Opts::default().partitions(0).get_partitions(), 1);
    }

    #[test]
    fn it_raises_zero_values_read_from_json() {
        let opts: Opts = serde_json::from_value(json!({
            "partitions": 0,
            "sweep_interval_ms": 0,
            "channel_capacity": 0
        }))
        .unwrap();
        assert_eq!(opts.get_partitions(), 1);
        assert_eq!(opts.sweep_interval(), Duration::from_millis(1));
        assert_eq!(opts.get_channel_capacity(), 1);
    }
}
