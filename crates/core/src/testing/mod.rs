//! Testing utilities and mock implementations of the external collaborators.
//!
//! The mocks stand in for the account API and the order site so whole
//! batches can run in tests without network access or a browser.
//!
//! # Example
//!
//! ```rust,ignore
//! use cartpilot_core::testing::{fixtures, MockAccountApi};
//!
//! let accounts = fixtures::account_store(1..=5);
//! let api = MockAccountApi::new().expire_session(5);
//!
//! // Wire both into a BatchController...
//! ```

mod mock_account_api;
mod mock_order_site;

pub use mock_account_api::MockAccountApi;
pub use mock_order_site::{MockOrderSession, MockOrderSite};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::ops::RangeInclusive;

    use crate::batch::{OrderItem, OrderTaskConfig, PaymentMethod};
    use crate::driver::{OrderLine, OrderPlan, PaymentInstruction};
    use crate::store::{AccountCredential, Address, Card, Product, SessionCookie, SqliteAccountStore};

    pub const PRODUCT_ID: &str = "prod-1";
    pub const ADDRESS_ID: &str = "addr-1";
    pub const CARD_ID: &str = "card-1";

    /// Credential with a single session cookie.
    pub fn credential(account_id: u64) -> AccountCredential {
        AccountCredential {
            account_id,
            label: Some(format!("account-{}", account_id)),
            session: vec![SessionCookie {
                name: "session_id".to_string(),
                value: format!("sess-{}", account_id),
                domain: Some("shop.test".to_string()),
                path: Some("/".to_string()),
            }],
            last_known_points: None,
        }
    }

    pub fn product(id: &str, price: f64) -> Product {
        Product {
            id: id.to_string(),
            name: format!("Product {}", id),
            url: format!("https://shop.test/p/{}", id),
            price: Some(price),
        }
    }

    pub fn address(id: &str) -> Address {
        Address {
            id: id.to_string(),
            full_name: "Test Buyer".to_string(),
            phone: "9000000000".to_string(),
            line1: "12 Market Road".to_string(),
            line2: None,
            city: "Pune".to_string(),
            state: "MH".to_string(),
            postal_code: "411001".to_string(),
        }
    }

    pub fn card(id: &str) -> Card {
        Card {
            id: id.to_string(),
            holder_name: "Test Buyer".to_string(),
            number: "4111111111111111".to_string(),
            expiry: "12/30".to_string(),
            cvv: "123".to_string(),
        }
    }

    /// One unit of the fixture product, cash on delivery.
    pub fn order_plan() -> OrderPlan {
        OrderPlan {
            lines: vec![OrderLine {
                product: product(PRODUCT_ID, 499.0),
                quantity: 1,
            }],
            address: address(ADDRESS_ID),
            payment: PaymentInstruction::CashOnDelivery,
            max_cart_value: None,
        }
    }

    /// Order config referring to the records seeded by [`account_store`].
    pub fn order_task_config() -> OrderTaskConfig {
        OrderTaskConfig {
            items: vec![OrderItem {
                product_id: PRODUCT_ID.to_string(),
                quantity: 1,
            }],
            address_id: ADDRESS_ID.to_string(),
            payment_method: PaymentMethod::CashOnDelivery,
            card_id: None,
            max_cart_value: None,
            name_suffix: None,
        }
    }

    /// In-memory account store with credentials for every account in
    /// `accounts`, plus the fixture product, address and card.
    pub fn account_store(accounts: RangeInclusive<u64>) -> SqliteAccountStore {
        let store = SqliteAccountStore::in_memory().unwrap();
        for account_id in accounts {
            store.upsert_credential(&credential(account_id)).unwrap();
        }
        store.upsert_product(&product(PRODUCT_ID, 499.0)).unwrap();
        store.upsert_address(&address(ADDRESS_ID)).unwrap();
        store.upsert_card(&card(CARD_ID)).unwrap();
        store
    }
}
