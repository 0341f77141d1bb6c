//! Engine limits and per-batch configuration.

use serde::{Deserialize, Serialize};

use super::{AccountRange, BatchError, BatchMode};
use crate::driver::{OrderLine, OrderPlan, PaymentInstruction};
use crate::store::AccountStore;

/// Engine-wide limits, the `[engine]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Largest number of tasks (accounts x repetitions) one batch may create.
    #[serde(default = "default_max_tasks")]
    pub max_tasks_per_batch: usize,

    /// Concurrency used when a start request does not set one.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Upper bound accepted for a batch's concurrency limit.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Wall-clock budget for one task, after which it is recorded as failed.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Capacity of the worker to dispatcher event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Attempts for a task or batch state write before the path is degraded.
    #[serde(default = "default_persistence_retries")]
    pub persistence_retries: u32,

    #[serde(default = "default_persistence_retry_delay")]
    pub persistence_retry_delay_ms: u64,
}

fn default_max_tasks() -> usize {
    2000
}

fn default_concurrency() -> usize {
    3
}

fn default_max_concurrency() -> usize {
    10
}

fn default_task_timeout() -> u64 {
    900 // 15 minutes
}

fn default_event_buffer() -> usize {
    1024
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_persistence_retries() -> u32 {
    3
}

fn default_persistence_retry_delay() -> u64 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_batch: default_max_tasks(),
            default_concurrency: default_concurrency(),
            max_concurrency: default_max_concurrency(),
            task_timeout_secs: default_task_timeout(),
            event_buffer: default_event_buffer(),
            subscriber_buffer: default_subscriber_buffer(),
            persistence_retries: default_persistence_retries(),
            persistence_retry_delay_ms: default_persistence_retry_delay(),
        }
    }
}

/// Configuration submitted with a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Concurrent tasks. Falls back to `engine.default_concurrency`.
    #[serde(default)]
    pub concurrency_limit: Option<usize>,

    #[serde(default = "default_repetitions")]
    pub repetition_count: u32,

    pub task: TaskConfig,
}

fn default_repetitions() -> u32 {
    1
}

impl BatchConfig {
    pub fn new(task: TaskConfig) -> Self {
        Self {
            concurrency_limit: None,
            repetition_count: default_repetitions(),
            task,
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_repetitions(mut self, count: u32) -> Self {
        self.repetition_count = count;
        self
    }

    pub fn mode(&self) -> BatchMode {
        self.task.mode()
    }
}

/// Mode-specific task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TaskConfig {
    Order(OrderTaskConfig),
    Checkpoint(CheckpointTaskConfig),
}

impl TaskConfig {
    pub fn mode(&self) -> BatchMode {
        match self {
            TaskConfig::Order(_) => BatchMode::Order,
            TaskConfig::Checkpoint(_) => BatchMode::Checkpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CashOnDelivery,
    Upi,
    Card,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTaskConfig {
    pub items: Vec<OrderItem>,
    pub address_id: String,
    pub payment_method: PaymentMethod,
    /// Required when paying by card.
    #[serde(default)]
    pub card_id: Option<String>,
    /// Cart totals above this fail the cart step without retry.
    #[serde(default)]
    pub max_cart_value: Option<f64>,
    /// Appended to the recipient name on the delivery address.
    #[serde(default)]
    pub name_suffix: Option<String>,
}

impl OrderTaskConfig {
    fn validate(&self) -> Result<(), BatchError> {
        if self.items.is_empty() {
            return Err(BatchError::Validation(
                "order batch needs at least one item".to_string(),
            ));
        }
        if let Some(item) = self.items.iter().find(|i| i.quantity == 0) {
            return Err(BatchError::Validation(format!(
                "quantity for product {} must be at least 1",
                item.product_id
            )));
        }
        if self.address_id.trim().is_empty() {
            return Err(BatchError::Validation("address_id is required".to_string()));
        }
        if self.payment_method == PaymentMethod::Card && self.card_id.is_none() {
            return Err(BatchError::Validation(
                "card_id is required for card payment".to_string(),
            ));
        }
        if let Some(max) = self.max_cart_value {
            if max.is_nan() || max <= 0.0 {
                return Err(BatchError::Validation(
                    "max_cart_value must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Look up every referenced record and build the plan each task follows.
    pub fn resolve(&self, accounts: &dyn AccountStore) -> Result<OrderPlan, BatchError> {
        self.validate()?;

        let mut lines = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let product = accounts.load_product(&item.product_id)?.ok_or_else(|| {
                BatchError::Validation(format!("unknown product: {}", item.product_id))
            })?;
            lines.push(OrderLine {
                product,
                quantity: item.quantity,
            });
        }

        let mut address = accounts.load_address(&self.address_id)?.ok_or_else(|| {
            BatchError::Validation(format!("unknown address: {}", self.address_id))
        })?;
        if let Some(suffix) = self.name_suffix.as_deref().filter(|s| !s.trim().is_empty()) {
            address.full_name = format!("{} {}", address.full_name, suffix.trim());
        }

        let payment = match self.payment_method {
            PaymentMethod::CashOnDelivery => PaymentInstruction::CashOnDelivery,
            PaymentMethod::Upi => PaymentInstruction::Upi,
            PaymentMethod::Card => {
                let card_id = self.card_id.as_deref().unwrap_or_default();
                let card = accounts.load_card(card_id)?.ok_or_else(|| {
                    BatchError::Validation(format!("unknown card: {}", card_id))
                })?;
                PaymentInstruction::Card(card)
            }
        };

        Ok(OrderPlan {
            lines,
            address,
            payment,
            max_cart_value: self.max_cart_value,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTaskConfig {
    /// Overrides `checkpoint.inter_account_delay_ms` for this batch.
    #[serde(default)]
    pub inter_account_delay_ms: Option<u64>,
}

/// Range and config after validation, with the effective concurrency.
#[derive(Debug, Clone)]
pub struct ValidatedBatch {
    pub range: AccountRange,
    pub concurrency_limit: usize,
    pub repetition_count: u32,
    pub total_tasks: usize,
}

/// Check a start request against the engine limits.
///
/// Runs before any task exists; every failure is a `BatchError::Validation`.
pub fn validate_batch(
    range: AccountRange,
    config: &BatchConfig,
    engine: &EngineConfig,
) -> Result<ValidatedBatch, BatchError> {
    if range.start == 0 {
        return Err(BatchError::Validation(
            "account range must start at 1 or above".to_string(),
        ));
    }
    if range.start > range.end {
        return Err(BatchError::Validation(format!(
            "account range start {} is after end {}",
            range.start, range.end
        )));
    }
    if config.repetition_count == 0 {
        return Err(BatchError::Validation(
            "repetition_count must be at least 1".to_string(),
        ));
    }

    let concurrency_limit = config
        .concurrency_limit
        .unwrap_or(engine.default_concurrency);
    if concurrency_limit == 0 {
        return Err(BatchError::Validation(
            "concurrency_limit must be at least 1".to_string(),
        ));
    }
    if concurrency_limit > engine.max_concurrency {
        return Err(BatchError::Validation(format!(
            "concurrency_limit {} exceeds maximum {}",
            concurrency_limit, engine.max_concurrency
        )));
    }

    let total = range
        .len()
        .checked_mul(config.repetition_count as u64)
        .filter(|total| *total <= engine.max_tasks_per_batch as u64)
        .ok_or_else(|| {
            BatchError::Validation(format!(
                "batch of {} accounts x {} repetitions exceeds the limit of {} tasks",
                range.len(),
                config.repetition_count,
                engine.max_tasks_per_batch
            ))
        })?;

    Ok(ValidatedBatch {
        range,
        concurrency_limit,
        repetition_count: config.repetition_count,
        total_tasks: total as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Address, Product, SqliteAccountStore};

    fn checkpoint() -> BatchConfig {
        BatchConfig::new(TaskConfig::Checkpoint(CheckpointTaskConfig::default()))
    }

    fn order_config() -> OrderTaskConfig {
        OrderTaskConfig {
            items: vec![OrderItem {
                product_id: "p1".to_string(),
                quantity: 2,
            }],
            address_id: "home".to_string(),
            payment_method: PaymentMethod::CashOnDelivery,
            card_id: None,
            max_cart_value: Some(1500.0),
            name_suffix: Some("B2".to_string()),
        }
    }

    fn seeded_store() -> SqliteAccountStore {
        let store = SqliteAccountStore::in_memory().unwrap();
        store
            .upsert_product(&Product {
                id: "p1".to_string(),
                name: "Serum".to_string(),
                url: "https://shop.test/p/1".to_string(),
                price: Some(650.0),
            })
            .unwrap();
        store
            .upsert_address(&Address {
                id: "home".to_string(),
                full_name: "Asha Rao".to_string(),
                phone: "9000000000".to_string(),
                line1: "12 Park Road".to_string(),
                line2: None,
                city: "Mumbai".to_string(),
                state: "MH".to_string(),
                postal_code: "400001".to_string(),
            })
            .unwrap();
        store
    }

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_tasks_per_batch, 2000);
        assert_eq!(config.default_concurrency, 3);
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.task_timeout_secs, 900);
    }

    #[test]
    fn test_deserialize_minimal_engine() {
        let config: EngineConfig = toml::from_str("max_concurrency = 4").unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.event_buffer, 1024);
    }

    #[test]
    fn test_deserialize_batch_config_tagged_by_mode() {
        let json = serde_json::json!({
            "concurrency_limit": 2,
            "task": {"mode": "checkpoint", "inter_account_delay_ms": 0}
        });
        let config: BatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.repetition_count, 1);
        assert_eq!(config.mode(), BatchMode::Checkpoint);

        let bad = serde_json::json!({"task": {"mode": "scrape"}});
        assert!(serde_json::from_value::<BatchConfig>(bad).is_err());
    }

    #[test]
    fn test_validate_uses_default_concurrency() {
        let validated =
            validate_batch(AccountRange::new(1, 5), &checkpoint(), &EngineConfig::default())
                .unwrap();
        assert_eq!(validated.concurrency_limit, 3);
        assert_eq!(validated.total_tasks, 5);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let engine = EngineConfig::default();
        assert!(validate_batch(AccountRange::new(0, 5), &checkpoint(), &engine).is_err());
        assert!(validate_batch(AccountRange::new(6, 5), &checkpoint(), &engine).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let engine = EngineConfig::default();
        let range = AccountRange::new(1, 2);

        let zero = checkpoint().with_concurrency(0);
        assert!(matches!(
            validate_batch(range, &zero, &engine),
            Err(BatchError::Validation(_))
        ));

        let too_many = checkpoint().with_concurrency(11);
        assert!(validate_batch(range, &too_many, &engine).is_err());

        let no_reps = checkpoint().with_repetitions(0);
        assert!(validate_batch(range, &no_reps, &engine).is_err());
    }

    #[test]
    fn test_validate_enforces_task_ceiling() {
        let engine = EngineConfig {
            max_tasks_per_batch: 10,
            ..Default::default()
        };
        let ok = validate_batch(AccountRange::new(1, 5), &checkpoint().with_repetitions(2), &engine);
        assert_eq!(ok.unwrap().total_tasks, 10);

        let over = validate_batch(AccountRange::new(1, 6), &checkpoint().with_repetitions(2), &engine);
        assert!(matches!(over, Err(BatchError::Validation(_))));

        let huge = validate_batch(AccountRange::new(1, u64::MAX), &checkpoint(), &engine);
        assert!(huge.is_err());
    }

    #[test]
    fn test_resolve_order_plan() {
        let store = seeded_store();
        let plan = order_config().resolve(&store).unwrap();

        assert_eq!(plan.lines.len(), 1);
        assert_eq!(plan.lines[0].quantity, 2);
        assert_eq!(plan.address.full_name, "Asha Rao B2");
        assert_eq!(plan.payment, PaymentInstruction::CashOnDelivery);
        assert_eq!(plan.max_cart_value, Some(1500.0));
    }

    #[test]
    fn test_resolve_rejects_unknown_records() {
        let store = seeded_store();

        let mut config = order_config();
        config.items[0].product_id = "nope".to_string();
        assert!(matches!(
            config.resolve(&store),
            Err(BatchError::Validation(msg)) if msg.contains("nope")
        ));

        let mut config = order_config();
        config.address_id = "work".to_string();
        assert!(config.resolve(&store).is_err());

        let mut config = order_config();
        config.payment_method = PaymentMethod::Card;
        config.card_id = Some("visa".to_string());
        assert!(config.resolve(&store).is_err());
    }

    #[test]
    fn test_resolve_rejects_invalid_order_shape() {
        let store = seeded_store();

        let mut config = order_config();
        config.items.clear();
        assert!(config.resolve(&store).is_err());

        let mut config = order_config();
        config.items[0].quantity = 0;
        assert!(config.resolve(&store).is_err());

        let mut config = order_config();
        config.payment_method = PaymentMethod::Card;
        assert!(config.resolve(&store).is_err());

        let mut config = order_config();
        config.max_cart_value = Some(0.0);
        assert!(config.resolve(&store).is_err());
    }
}
