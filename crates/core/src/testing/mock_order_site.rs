//! Mock order site and session for testing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{
    CartSummary, DriverError, OrderConfirmation, OrderLine, OrderSession, OrderSite,
    PaymentInstruction,
};
use crate::store::{AccountCredential, Address};
use crate::workflow::{StepName, StepOutcome};

/// Scripted behavior copied into every session.
#[derive(Debug, Clone)]
struct SessionScript {
    failures: HashMap<StepName, VecDeque<StepOutcome<()>>>,
    hangs: HashSet<StepName>,
    cart_total: f64,
    step_delay: Duration,
}

impl Default for SessionScript {
    fn default() -> Self {
        Self {
            failures: HashMap::new(),
            hangs: HashSet::new(),
            cart_total: 499.0,
            step_delay: Duration::ZERO,
        }
    }
}

/// Session bookkeeping shared between a site and its sessions.
#[derive(Debug, Default)]
struct SiteStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    per_account: Mutex<HashMap<u64, usize>>,
    overlap: AtomicBool,
    orders: AtomicUsize,
}

impl SiteStats {
    fn session_opened(&self, account_id: u64) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let mut per_account = self.per_account.lock().unwrap();
        let count = per_account.entry(account_id).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn session_dropped(&self, account_id: u64) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let mut per_account = self.per_account.lock().unwrap();
        if let Some(count) = per_account.get_mut(&account_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Mock implementation of the OrderSite trait.
///
/// Every session follows the same script: steps succeed unless a failure
/// sequence was queued for them, and the cart total is fixed.
///
/// # Example
///
/// ```rust,ignore
/// let site = MockOrderSite::new().fail_step(
///     StepName::CartPopulate,
///     vec![StepOutcome::Retryable("bag not loaded".into()); 2],
/// );
///
/// // ... run an order batch ...
///
/// assert_eq!(site.sessions_opened(), 3);
/// assert!(!site.account_overlap_detected());
/// ```
#[derive(Debug, Default)]
pub struct MockOrderSite {
    script: SessionScript,
    expired_accounts: HashSet<u64>,
    open_error: Option<DriverError>,
    stats: Arc<SiteStats>,
}

impl MockOrderSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cart_total(mut self, total: f64) -> Self {
        self.script.cart_total = total;
        self
    }

    /// Queue outcomes returned by `step` before it succeeds, in every session.
    pub fn fail_step(mut self, step: StepName, outcomes: Vec<StepOutcome<()>>) -> Self {
        self.script.failures.insert(step, outcomes.into());
        self
    }

    /// `step` never completes.
    pub fn hang_step(mut self, step: StepName) -> Self {
        self.script.hangs.insert(step);
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.script.step_delay = delay;
        self
    }

    /// Authentication reports an expired session for this account.
    pub fn expire_account(mut self, account_id: u64) -> Self {
        self.expired_accounts.insert(account_id);
        self
    }

    /// Opening any session fails with this error.
    pub fn fail_open(mut self, error: DriverError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn sessions_opened(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    /// Highest number of sessions open at once.
    pub fn peak_sessions(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// True if one account ever had two sessions open at the same time.
    pub fn account_overlap_detected(&self) -> bool {
        self.stats.overlap.load(Ordering::SeqCst)
    }

    pub fn orders_placed(&self) -> usize {
        self.stats.orders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderSite for MockOrderSite {
    async fn open_session(
        &self,
        credential: &AccountCredential,
    ) -> Result<Box<dyn OrderSession>, DriverError> {
        if let Some(error) = &self.open_error {
            return Err(error.clone());
        }

        let mut script = self.script.clone();
        if self.expired_accounts.contains(&credential.account_id) {
            script.failures.insert(
                StepName::Init,
                VecDeque::from(vec![StepOutcome::SessionExpired(
                    "redirected to login".to_string(),
                )]),
            );
        }

        self.stats.session_opened(credential.account_id);
        Ok(Box::new(MockOrderSession {
            account_id: credential.account_id,
            script,
            attempts: HashMap::new(),
            stats: Some(Arc::clone(&self.stats)),
            closed: false,
        }))
    }
}

/// Scripted order session.
///
/// Usable on its own for workflow tests, or handed out by [`MockOrderSite`].
#[derive(Debug)]
pub struct MockOrderSession {
    account_id: u64,
    script: SessionScript,
    attempts: HashMap<StepName, u32>,
    stats: Option<Arc<SiteStats>>,
    closed: bool,
}

impl Default for MockOrderSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOrderSession {
    pub fn new() -> Self {
        Self {
            account_id: 1,
            script: SessionScript::default(),
            attempts: HashMap::new(),
            stats: None,
            closed: false,
        }
    }

    pub fn with_cart_total(mut self, total: f64) -> Self {
        self.script.cart_total = total;
        self
    }

    pub fn fail_step(mut self, step: StepName, outcomes: Vec<StepOutcome<()>>) -> Self {
        self.script.failures.insert(step, outcomes.into());
        self
    }

    pub fn hang_step(mut self, step: StepName) -> Self {
        self.script.hangs.insert(step);
        self
    }

    /// Attempts made so far for `step`.
    pub fn attempts(&self, step: StepName) -> u32 {
        self.attempts.get(&step).copied().unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn next(&mut self, step: StepName) -> StepOutcome<()> {
        *self.attempts.entry(step).or_insert(0) += 1;

        if self.script.hangs.contains(&step) {
            std::future::pending::<()>().await;
        }
        if !self.script.step_delay.is_zero() {
            tokio::time::sleep(self.script.step_delay).await;
        }

        self.script
            .failures
            .get_mut(&step)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(StepOutcome::Success(()))
    }
}

impl Drop for MockOrderSession {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            stats.session_dropped(self.account_id);
        }
    }
}

#[async_trait]
impl OrderSession for MockOrderSession {
    async fn authenticate(&mut self) -> StepOutcome<()> {
        self.next(StepName::Init).await
    }

    async fn select_address(&mut self, _address: &Address) -> StepOutcome<()> {
        self.next(StepName::AddressSelect).await
    }

    async fn populate_cart(&mut self, lines: &[OrderLine]) -> StepOutcome<CartSummary> {
        let total = self.script.cart_total;
        let item_count = lines.iter().map(|l| l.quantity).sum();
        self.next(StepName::CartPopulate)
            .await
            .map(|_| CartSummary { total, item_count })
    }

    async fn checkout(&mut self, _payment: &PaymentInstruction) -> StepOutcome<OrderConfirmation> {
        let total = self.script.cart_total;
        let outcome = self.next(StepName::Checkout).await;
        let sequence = match &self.stats {
            Some(stats) if matches!(outcome, StepOutcome::Success(_)) => {
                stats.orders.fetch_add(1, Ordering::SeqCst) + 1
            }
            _ => 1,
        };
        let account_id = self.account_id;
        outcome.map(|_| OrderConfirmation {
            order_number: format!("ORD-{}-{}", account_id, sequence),
            total,
        })
    }

    async fn capture_diagnostics(&mut self, step: &str) -> Option<String> {
        Some(format!("diagnostics/{}.png", step))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(stats) = &self.stats {
                stats.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}
