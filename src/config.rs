//! Link configuration and the timing budgets derived from it.
//!
//! Only the no-token, reply-delay, reply-timeout and maintenance budgets are
//! configured directly. Everything else follows from the bit rate, the frame
//! overhead and the number of nodes on the segment.

use std::time::Duration;

use snafu::{ensure, Snafu};

/// Configuration rejected by [`LinkConfig::timing`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("Invalid configuration: {}", reason))]
    InvalidConfig { reason: &'static str },
}

/// Highest address a master may use, the known-master map has 128 bits.
pub const MAX_MASTER_LIMIT: u8 = 127;

// Frame overhead in octets: preamble, header and data CRC.
const FRAME_OVERHEAD: u64 = 10;
// Bit times of line idle ahead of each frame.
pub(crate) const FRAME_GAP_BITS: u32 = 40;
const T_PROPAGATION_NS: u64 = 5333;
const T_CPU_LATENCY_NS: u64 = 200_000;
const T_CPU_LATENCY_PER_OCTET_NS: u64 = 1_000;
const T_ROUNDTRIP_SLACK_NS: u64 = 500_000;

/// Link configuration. `Default` is tuned for a 500 kbit/s segment.
///
/// ```
/// use mstp_link::LinkConfig;
/// use std::time::Duration;
///
/// let config = LinkConfig::default()
///     .with_baud_rate(38_400)
///     .with_no_token(Duration::from_millis(500))
///     .with_reply_delay(Duration::from_millis(250))
///     .with_reply_timeout(Duration::from_millis(255));
/// let timing = config.timing().unwrap();
/// assert!(timing.slot > Duration::from_millis(0));
/// ```
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub baud_rate: u32,
    /// Highest master address polled for.
    pub max_master: u8,
    /// Stations on the segment, scales propagation and wait budgets.
    pub max_nodes: u32,
    /// Longest frame in octets used for the maximum round trip.
    pub max_frame_octets: u32,
    /// Bit times the line is held idle ahead of each transmission.
    pub idle_bits: u32,
    pub half_duplex: bool,
    pub t_no_token: Duration,
    pub t_reply_delay: Duration,
    pub t_reply_timeout: Duration,
    pub t_maintenance: Duration,
    /// Overrides the derived application send wait.
    pub t_send_wait: Option<Duration>,
    /// Overrides the derived application receive wait.
    pub t_recv_wait: Option<Duration>,
    pub max_info_frames: u32,
    pub n_poll: u32,
    pub n_retry_token: u32,
    pub n_min_octets: u32,
    /// Consecutive header errors before an advisory event.
    pub header_error_limit: u32,
    /// Capacity of each event subscription queue.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 500_000,
            max_master: MAX_MASTER_LIMIT,
            max_nodes: 32,
            max_frame_octets: 511,
            idle_bits: FRAME_GAP_BITS,
            half_duplex: true,
            t_no_token: Duration::from_millis(25),
            t_reply_delay: Duration::from_millis(12),
            t_reply_timeout: Duration::from_millis(15),
            t_maintenance: Duration::from_millis(5000),
            t_send_wait: None,
            t_recv_wait: None,
            max_info_frames: 1,
            n_poll: 1024,
            n_retry_token: 2,
            n_min_octets: 4,
            header_error_limit: 32,
            event_capacity: 32,
        }
    }
}

impl LinkConfig {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_max_master(mut self, max_master: u8) -> Self {
        self.max_master = max_master;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: u32) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_max_frame_octets(mut self, octets: u32) -> Self {
        self.max_frame_octets = octets;
        self
    }

    pub fn with_idle_bits(mut self, bits: u32) -> Self {
        self.idle_bits = bits;
        self
    }

    pub fn with_half_duplex(mut self, half_duplex: bool) -> Self {
        self.half_duplex = half_duplex;
        self
    }

    pub fn with_no_token(mut self, t: Duration) -> Self {
        self.t_no_token = t;
        self
    }

    pub fn with_reply_delay(mut self, t: Duration) -> Self {
        self.t_reply_delay = t;
        self
    }

    pub fn with_reply_timeout(mut self, t: Duration) -> Self {
        self.t_reply_timeout = t;
        self
    }

    pub fn with_maintenance(mut self, t: Duration) -> Self {
        self.t_maintenance = t;
        self
    }

    pub fn with_send_wait(mut self, t: Duration) -> Self {
        self.t_send_wait = Some(t);
        self
    }

    pub fn with_recv_wait(mut self, t: Duration) -> Self {
        self.t_recv_wait = Some(t);
        self
    }

    pub fn with_max_info_frames(mut self, frames: u32) -> Self {
        self.max_info_frames = frames;
        self
    }

    pub fn with_poll_interval(mut self, tokens: u32) -> Self {
        self.n_poll = tokens;
        self
    }

    pub fn with_token_retries(mut self, retries: u32) -> Self {
        self.n_retry_token = retries;
        self
    }

    /// Validate the configuration and compute the timing budgets.
    /// # Errors
    /// Returns [`ConfigError::InvalidConfig`] for out of range settings.
    pub fn timing(&self) -> Result<Timing, ConfigError> {
        ensure!(
            self.baud_rate > 0,
            InvalidConfigSnafu {
                reason: "baud rate must be non-zero"
            }
        );
        ensure!(
            self.max_master <= MAX_MASTER_LIMIT,
            InvalidConfigSnafu {
                reason: "max master must be at most 127"
            }
        );
        ensure!(
            self.max_nodes > 0 && self.max_info_frames > 0 && self.n_poll > 1,
            InvalidConfigSnafu {
                reason: "node count, info frames and poll interval must be positive"
            }
        );
        ensure!(
            self.t_reply_delay < self.t_reply_timeout,
            InvalidConfigSnafu {
                reason: "reply delay must be shorter than the reply timeout"
            }
        );
        ensure!(
            self.event_capacity > 0,
            InvalidConfigSnafu {
                reason: "event capacity must be positive"
            }
        );
        Ok(Timing::new(self))
    }
}

/// Timing budgets of a link, see [`LinkConfig::timing`].
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub bit: Duration,
    pub roundtrip_min: Duration,
    pub roundtrip_max: Duration,
    pub slot: Duration,
    pub usage_timeout: Duration,
    pub pfm_timeout: Duration,
    pub min_octet_timeout: Duration,
    pub no_token: Duration,
    pub reply_delay: Duration,
    pub reply_timeout: Duration,
    pub maintenance: Duration,
    pub send_wait: Duration,
    pub recv_wait: Duration,
}

impl Timing {
    fn new(config: &LinkConfig) -> Self {
        let baud = u64::from(config.baud_rate);
        let nodes = u64::from(config.max_nodes);
        let bit_ns = 1_000_000_000 / baud;
        let hub_delay_ns = 2 * bit_ns;

        // Worst case frame round trip in whole milliseconds, rounded.
        let roundtrip = |octets: u64| {
            let frame_ns = (u64::from(FRAME_GAP_BITS) + octets * 10) * 1_000_000_000 / baud;
            let cpu_ns = T_CPU_LATENCY_NS + T_CPU_LATENCY_PER_OCTET_NS * octets;
            let delay_ns = frame_ns + cpu_ns + nodes * (T_PROPAGATION_NS + hub_delay_ns);
            Duration::from_millis((delay_ns + T_ROUNDTRIP_SLACK_NS) / 1_000_000)
        };

        let roundtrip_min = roundtrip(FRAME_OVERHEAD);
        let roundtrip_max = roundtrip(u64::from(config.max_frame_octets));
        let usage_timeout = roundtrip_min + roundtrip_max;
        let wait = usage_timeout * config.max_nodes;

        Self {
            bit: Duration::from_nanos(bit_ns),
            roundtrip_min,
            roundtrip_max,
            slot: roundtrip_min * 2,
            usage_timeout,
            pfm_timeout: roundtrip_min * 2,
            min_octet_timeout: roundtrip(4),
            no_token: config.t_no_token,
            reply_delay: config.t_reply_delay,
            reply_timeout: config.t_reply_timeout,
            maintenance: config.t_maintenance,
            send_wait: config.t_send_wait.unwrap_or(wait),
            recv_wait: config.t_recv_wait.unwrap_or(wait),
        }
    }

    /// Silence after which master `address` regenerates a lost token.
    pub fn no_token_slot(&self, address: u8) -> Duration {
        self.no_token + self.slot * u32::from(address)
    }
}
