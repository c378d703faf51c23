//! Token bookkeeping for PUSH_DATA and PULL_DATA.
//!
//! Every request goes out with a fresh token. The matching acknowledgement
//! retires it exactly once; anything else is unmatched and only logged.
//! Requests that stay unacknowledged past the timeout expire.

use super::packet::{MessageKind, Token};
use log::{debug, warn};
use std::time::Duration;

/// Outstanding requests kept before the oldest is expired early.
pub const MAX_OUTSTANDING: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outstanding {
    token: Token,
    kind: MessageKind,
    sent_us: u64,
}

/// A request that was never acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTimeout {
    pub token: Token,
    pub kind: MessageKind,
    pub age_us: u64,
}

/// Result of feeding an acknowledgement to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMatch {
    /// Retired the request of this kind, sent `rtt_us` ago.
    Acknowledged { request: MessageKind, rtt_us: u64 },
    /// No outstanding request has this token and kind.
    Unmatched,
}

#[derive(Debug)]
pub struct AckTracker {
    outstanding: Vec<Outstanding>,
    timeout: Duration,
}

impl AckTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            outstanding: Vec::with_capacity(MAX_OUTSTANDING),
            timeout,
        }
    }

    /// Remember a request. Returns the request evicted to make room, if any.
    pub fn register(&mut self, kind: MessageKind, token: Token, now_us: u64) -> Option<TokenTimeout> {
        let evicted = if self.outstanding.len() >= MAX_OUTSTANDING {
            let oldest = self.outstanding.remove(0);
            warn!(
                "Too many unacknowledged requests, giving up on {} {}",
                oldest.kind, oldest.token
            );
            Some(TokenTimeout {
                token: oldest.token,
                kind: oldest.kind,
                age_us: now_us.saturating_sub(oldest.sent_us),
            })
        } else {
            None
        };
        self.outstanding.push(Outstanding {
            token,
            kind,
            sent_us: now_us,
        });
        evicted
    }

    /// Match an acknowledgement against the outstanding requests.
    pub fn acknowledge(&mut self, ack: MessageKind, token: Token, now_us: u64) -> AckMatch {
        let position = self
            .outstanding
            .iter()
            .position(|o| o.token == token && o.kind.ack() == Some(ack));
        match position {
            Some(i) => {
                let request = self.outstanding.remove(i);
                let rtt_us = now_us.saturating_sub(request.sent_us);
                debug!("{} {} acknowledged after {} us", request.kind, token, rtt_us);
                AckMatch::Acknowledged {
                    request: request.kind,
                    rtt_us,
                }
            }
            None => {
                debug!("Unmatched {} with token {}", ack, token);
                AckMatch::Unmatched
            }
        }
    }

    /// Remove and return the requests older than the timeout.
    pub fn expire(&mut self, now_us: u64) -> Vec<TokenTimeout> {
        let timeout_us = self.timeout.as_micros() as u64;
        let mut expired = Vec::new();
        self.outstanding.retain(|o| {
            let age_us = now_us.saturating_sub(o.sent_us);
            if age_us >= timeout_us {
                expired.push(TokenTimeout {
                    token: o.token,
                    kind: o.kind,
                    age_us,
                });
                false
            } else {
                true
            }
        });
        for timeout in &expired {
            warn!(
                "No acknowledgement for {} {} after {} ms",
                timeout.kind,
                timeout.token,
                timeout.age_us / 1_000
            );
        }
        expired
    }

    pub fn is_pending(&self, token: Token) -> bool {
        self.outstanding.iter().any(|o| o.token == token)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lora_1ch_gateway_macros::esp32_test;

    fn tracker() -> AckTracker {
        AckTracker::new(Duration::from_secs(5))
    }

    #[esp32_test]
    fn test_pull_ack_with_other_token_leaves_request_pending() {
        let mut acks = tracker();
        acks.register(MessageKind::PullData, Token(0x1234), 0);

        assert_eq!(
            acks.acknowledge(MessageKind::PullAck, Token(0x5678), 100),
            AckMatch::Unmatched
        );
        assert!(acks.is_pending(Token(0x1234)));

        assert_eq!(
            acks.acknowledge(MessageKind::PullAck, Token(0x1234), 200),
            AckMatch::Acknowledged {
                request: MessageKind::PullData,
                rtt_us: 200
            }
        );
        assert!(acks.is_empty());
    }

    #[esp32_test]
    fn test_ack_retires_exactly_once() {
        let mut acks = tracker();
        acks.register(MessageKind::PushData, Token(7), 0);
        assert!(matches!(
            acks.acknowledge(MessageKind::PushAck, Token(7), 10),
            AckMatch::Acknowledged { .. }
        ));
        assert_eq!(
            acks.acknowledge(MessageKind::PushAck, Token(7), 20),
            AckMatch::Unmatched
        );
    }

    #[esp32_test]
    fn test_ack_kind_must_match_request() {
        let mut acks = tracker();
        acks.register(MessageKind::PushData, Token(9), 0);
        assert_eq!(
            acks.acknowledge(MessageKind::PullAck, Token(9), 10),
            AckMatch::Unmatched
        );
        assert!(acks.is_pending(Token(9)));
    }

    #[esp32_test]
    fn test_expire_reports_token_timeouts() {
        let mut acks = tracker();
        acks.register(MessageKind::PushData, Token(1), 0);
        acks.register(MessageKind::PullData, Token(2), 3_000_000);

        assert!(acks.expire(4_999_999).is_empty());
        let expired = acks.expire(5_000_000);
        assert_eq!(
            expired,
            vec![TokenTimeout {
                token: Token(1),
                kind: MessageKind::PushData,
                age_us: 5_000_000
            }]
        );
        assert!(acks.is_pending(Token(2)));
    }

    #[esp32_test]
    fn test_register_evicts_oldest_when_full() {
        let mut acks = tracker();
        for n in 0..MAX_OUTSTANDING as u16 {
            assert!(acks.register(MessageKind::PullData, Token(n), n as u64).is_none());
        }
        let evicted = acks.register(MessageKind::PullData, Token(999), 100).unwrap();
        assert_eq!(evicted.token, Token(0));
        assert_eq!(acks.len(), MAX_OUTSTANDING);
    }
}
