//! Exclusive-ownership claim state machine.
//!
//! One token is valid at a time; the watchdog task drops a claim whose
//! holder stops sending keep-alives. All state lives behind a single mutex
//! shared by the RPC task and the watchdog task.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Watchdog poll granularity.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    BadToken,
    NotClaimed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadToken => write!(f, "bad token"),
            Error::NotClaimed => write!(f, "protocol error: device is not claimed"),
        }
    }
}

struct ClaimState {
    token: Option<String>,
    owner: Option<String>,
    last_keepalive: Instant,
}

pub struct Claim {
    state: Mutex<ClaimState>,
    timeout: Duration,
}

fn generate_token() -> Option<String> {
    let mut bytes = [0u8; 16];
    File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .ok()?;
    Some(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

impl Claim {
    pub fn new(timeout: Duration) -> Claim {
        Claim {
            state: Mutex::new(ClaimState {
                token: None,
                owner: None,
                last_keepalive: Instant::now(),
            }),
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<ClaimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the device for `caller`. Returns the new token, or the empty
    /// string when the device is already claimed or no token could be made.
    pub fn claim(&self, caller: &str) -> String {
        let mut state = self.lock();
        if state.token.is_some() {
            warn!(
                "claim attempt by `{}` while claimed by `{}`",
                caller,
                state.owner.as_deref().unwrap_or("?")
            );
            return String::new();
        }
        let token = match generate_token() {
            Some(token) => token,
            None => {
                warn!("cannot generate claim token");
                return String::new();
            }
        };
        state.token = Some(token.clone());
        state.owner = Some(caller.to_string());
        state.last_keepalive = Instant::now();
        info!("device claimed by `{}`", caller);
        token
    }

    /// Keep-alive. Refreshes the watchdog deadline.
    pub fn reclaim(&self, token: &str) -> Result<bool, Error> {
        let mut state = self.lock();
        if state.token.as_deref() != Some(token) {
            return Err(Error::BadToken);
        }
        state.last_keepalive = Instant::now();
        Ok(true)
    }

    /// Releases the claim. The caller is responsible for running teardown
    /// after this returns.
    pub fn unclaim(&self, token: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.token.as_deref() != Some(token) {
            return Err(Error::BadToken);
        }
        info!(
            "device unclaimed by `{}`",
            state.owner.as_deref().unwrap_or("?")
        );
        state.token = None;
        state.owner = None;
        Ok(())
    }

    /// Validates the token carried by a protected RPC.
    pub fn check_token(&self, token: &str) -> Result<(), Error> {
        let state = self.lock();
        match &state.token {
            None => Err(Error::NotClaimed),
            Some(current) if current == token => Ok(()),
            Some(_) => Err(Error::BadToken),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.lock().token.is_some()
    }

    pub fn owner(&self) -> Option<String> {
        self.lock().owner.clone()
    }

    /// Watchdog tick: drops the claim if the keep-alive deadline passed.
    /// Returns the previous owner when a claim was dropped; the caller runs
    /// teardown afterwards.
    pub fn expire_if_stale(&self) -> Option<String> {
        let mut state = self.lock();
        if state.token.is_none() || state.last_keepalive.elapsed() <= self.timeout {
            return None;
        }
        let owner = state.owner.take().unwrap_or_default();
        state.token = None;
        warn!(
            "claim by `{}` expired after {:?} without keep-alive",
            owner, self.timeout
        );
        Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn claim_lifecycle() {
        let claim = Claim::new(Duration::from_millis(200));
        let token = claim.claim("A");
        assert!(!token.is_empty());
        assert_eq!(claim.reclaim("wrong"), Err(Error::BadToken));
        assert_eq!(claim.reclaim(&token), Ok(true));
        assert_eq!(claim.owner().as_deref(), Some("A"));

        // No keep-alive for longer than the watchdog period.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(claim.expire_if_stale(), Some("A".to_string()));
        assert_eq!(claim.reclaim(&token), Err(Error::BadToken));
        assert!(!claim.is_claimed());
    }

    #[test]
    fn only_one_token_is_live() {
        let claim = Claim::new(DEFAULT_TIMEOUT);
        let token = claim.claim("A");
        assert!(!token.is_empty());
        assert_eq!(claim.claim("B"), "");
        assert_eq!(claim.check_token(&token), Ok(()));
        claim.unclaim(&token).unwrap();
        let token2 = claim.claim("B");
        assert!(!token2.is_empty());
        assert_ne!(token, token2);
        assert_eq!(claim.check_token(&token), Err(Error::BadToken));
    }

    #[test]
    fn keepalive_defers_expiry() {
        let claim = Claim::new(Duration::from_millis(200));
        let token = claim.claim("A");
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(100));
            assert_eq!(claim.reclaim(&token), Ok(true));
            assert_eq!(claim.expire_if_stale(), None);
        }
    }

    #[test]
    fn unclaimed_check_reports_protocol_error() {
        let claim = Claim::new(DEFAULT_TIMEOUT);
        assert_eq!(claim.check_token("anything"), Err(Error::NotClaimed));
    }
}
