//! Mock account API for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{AccountApi, AccountSnapshot, DriverError};
use crate::store::AccountCredential;

/// In-flight counter released on drop, so cancelled calls are counted out too.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock implementation of the AccountApi trait.
///
/// Provides controllable behavior for testing:
/// - Per-account point balances, failures and expired sessions
/// - Calls that never return, or panic
/// - Call log and peak concurrency for assertions
///
/// # Example
///
/// ```rust,ignore
/// let api = MockAccountApi::new()
///     .with_points(1, 1200.0, Some("Gold"))
///     .expire_session(5);
///
/// // ... run a checkpoint batch ...
///
/// assert_eq!(api.call_count(), 5);
/// assert!(api.peak_concurrency() <= 2);
/// ```
#[derive(Debug)]
pub struct MockAccountApi {
    snapshots: HashMap<u64, AccountSnapshot>,
    failures: HashMap<u64, DriverError>,
    hangs: HashSet<u64>,
    panics: HashSet<u64>,
    default_points: f64,
    delay: Duration,
    calls: Arc<Mutex<Vec<u64>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for MockAccountApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAccountApi {
    /// Every account succeeds with 100 points unless configured otherwise.
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
            failures: HashMap::new(),
            hangs: HashSet::new(),
            panics: HashSet::new(),
            default_points: 100.0,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_points(mut self, account_id: u64, points: f64, tier: Option<&str>) -> Self {
        self.snapshots.insert(
            account_id,
            AccountSnapshot {
                points,
                tier: tier.map(str::to_string),
            },
        );
        self
    }

    pub fn expire_session(self, account_id: u64) -> Self {
        self.fail_account(
            account_id,
            DriverError::SessionExpired("account API returned HTTP 401".to_string()),
        )
    }

    pub fn fail_account(mut self, account_id: u64, error: DriverError) -> Self {
        self.failures.insert(account_id, error);
        self
    }

    /// The call for this account never completes.
    pub fn hang_account(mut self, account_id: u64) -> Self {
        self.hangs.insert(account_id);
        self
    }

    /// The call for this account panics.
    pub fn panic_account(mut self, account_id: u64) -> Self {
        self.panics.insert(account_id);
        self
    }

    /// Every call takes at least this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Account ids in call order.
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of calls in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountApi for MockAccountApi {
    async fn fetch_account(
        &self,
        credential: &AccountCredential,
    ) -> Result<AccountSnapshot, DriverError> {
        let account_id = credential.account_id;
        self.calls.lock().unwrap().push(account_id);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if self.panics.contains(&account_id) {
            panic!("mock account API panicked for account {}", account_id);
        }
        if self.hangs.contains(&account_id) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(error) = self.failures.get(&account_id) {
            return Err(error.clone());
        }
        Ok(self
            .snapshots
            .get(&account_id)
            .cloned()
            .unwrap_or(AccountSnapshot {
                points: self.default_points,
                tier: None,
            }))
    }
}
