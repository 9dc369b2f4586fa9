//! Randomized delays required by [rfc6762].
//!
//! [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762

use rand::Rng;
use std::time::Duration;

/// Source of the protocol's randomized delays.
#[derive(Clone, Copy, Debug, Default)]
pub struct MdnsRandom;

impl MdnsRandom {
    /// The first query of a continuous question is delayed by 20-120 ms,
    /// [rfc6762] section 5.2.
    ///
    /// [rfc6762]: https://datatracker.ietf.org/doc/html/rfc6762
    pub fn initial_query_delay(&self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(20..=120))
    }

    /// TTL refresh queries are spread by up to 2% of the TTL, except at the
    /// expiration point, [rfc6762] section 5.2.
    pub fn record_ttl_variation(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..=0.02)
    }

    /// The first probe query is delayed by 0-250 ms, [rfc6762] section 8.1.
    pub fn initial_probe_delay(&self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(0..=250))
    }

    /// Shared-record responses are delayed by 20-120 ms, [rfc6762] section
    /// 6.
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(20..=120))
    }
}
