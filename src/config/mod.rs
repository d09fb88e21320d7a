use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rendezvous_punch_core::store::DEFAULT_TTL;

use crate::error::{Error, Result};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const SETTLE_DELAY: Duration = Duration::from_millis(100);
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timing and retry policy of one peer.
///
/// Every wait the state machine performs is bounded by a field here; there
/// is no unbounded loop anywhere in a connection attempt.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Local bind address, port `0` for an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Host to publish alongside the port. When unset the peer derives the
    /// host from our identity.
    pub advertise_host: Option<IpAddr>,
    /// Lease of our rendezvous record.
    pub registration_ttl: Duration,
    /// Delay between two lookups of an absent peer record.
    pub poll_interval: Duration,
    pub max_poll_attempts: usize,
    /// Pause after punching so the NAT mapping exists before replies arrive.
    pub settle_delay: Duration,
    /// How long one punch round waits for a handshake reply.
    pub response_timeout: Duration,
    pub max_punch_attempts: usize,
    pub max_send_failures: usize,
    /// Copies of the closing `Ack` to send.
    pub ack_redundancy: usize,
    /// Re-read the peer record before accepting a completed handshake.
    pub verify_on_accept: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            advertise_host: None,
            registration_ttl: DEFAULT_TTL,
            poll_interval: POLL_INTERVAL,
            max_poll_attempts: 120,
            settle_delay: SETTLE_DELAY,
            response_timeout: RESPONSE_TIMEOUT,
            max_punch_attempts: 10,
            max_send_failures: 5,
            ack_redundancy: 3,
            verify_on_accept: true,
        }
    }
}

impl PeerConfig {
    pub fn set_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }
    pub fn set_advertise_host(mut self, advertise_host: IpAddr) -> Self {
        self.advertise_host.replace(advertise_host);
        self
    }
    pub fn set_registration_ttl(mut self, registration_ttl: Duration) -> Self {
        self.registration_ttl = registration_ttl;
        self
    }
    pub fn set_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
    pub fn set_max_poll_attempts(mut self, max_poll_attempts: usize) -> Self {
        self.max_poll_attempts = max_poll_attempts;
        self
    }
    pub fn set_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }
    pub fn set_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }
    pub fn set_max_punch_attempts(mut self, max_punch_attempts: usize) -> Self {
        self.max_punch_attempts = max_punch_attempts;
        self
    }
    pub fn set_max_send_failures(mut self, max_send_failures: usize) -> Self {
        self.max_send_failures = max_send_failures;
        self
    }
    pub fn set_ack_redundancy(mut self, ack_redundancy: usize) -> Self {
        self.ack_redundancy = ack_redundancy;
        self
    }
    pub fn set_verify_on_accept(mut self, verify_on_accept: bool) -> Self {
        self.verify_on_accept = verify_on_accept;
        self
    }

    /// Longest time an attempt can spend between registering and giving up.
    pub fn attempt_budget(&self) -> Duration {
        let polling = self.poll_interval * self.max_poll_attempts as u32;
        let punching =
            (self.settle_delay + self.response_timeout) * self.max_punch_attempts as u32;
        polling + punching
    }

    /// Our record must outlive the whole attempt, otherwise it expires while
    /// the peer is still looking for it.
    pub fn validate(&self) -> Result<()> {
        if self.max_poll_attempts == 0 {
            return Err(Error::InvalidConfig("max_poll_attempts is 0".into()));
        }
        if self.max_punch_attempts == 0 {
            return Err(Error::InvalidConfig("max_punch_attempts is 0".into()));
        }
        if self.max_send_failures == 0 {
            return Err(Error::InvalidConfig("max_send_failures is 0".into()));
        }
        if self.response_timeout.is_zero() {
            return Err(Error::InvalidConfig("response_timeout is 0".into()));
        }
        let budget = self.attempt_budget();
        if self.registration_ttl <= budget {
            return Err(Error::InvalidConfig(format!(
                "registration ttl {:?} does not exceed the attempt budget {:?}",
                self.registration_ttl, budget
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::PeerConfig;
    use crate::error::Error;

    #[test]
    fn default_config_is_valid() {
        let config = PeerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.attempt_budget(), Duration::from_secs(71));
    }

    #[test]
    fn ttl_shorter_than_budget_is_rejected() {
        let config = PeerConfig::default().set_registration_ttl(Duration::from_secs(30));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let config = PeerConfig::default().set_max_punch_attempts(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
