use std::fmt;

use serde::{Deserialize, Serialize};

/// One cookie of a stored browser session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Stored login state for one account. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCredential {
    pub account_id: u64,
    #[serde(default)]
    pub label: Option<String>,
    pub session: Vec<SessionCookie>,
    #[serde(default)]
    pub last_known_points: Option<f64>,
}

impl AccountCredential {
    pub fn has_session(&self) -> bool {
        self.session.iter().any(|c| !c.value.is_empty())
    }

    /// Render the session as a `Cookie` request header value.
    pub fn cookie_header(&self) -> String {
        self.session
            .iter()
            .filter(|c| !c.value.is_empty())
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Catalog entry that can be added to a cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub price: Option<f64>,
}

/// Delivery address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub full_name: String,
    pub phone: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

/// Saved payment card.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub holder_name: String,
    pub number: String,
    pub expiry: String,
    pub cvv: String,
}

impl Card {
    pub fn last_four(&self) -> &str {
        let len = self.number.len();
        self.number.get(len.saturating_sub(4)..).unwrap_or("")
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("id", &self.id)
            .field("holder_name", &self.holder_name)
            .field("number", &format_args!("****{}", self.last_four()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str) -> SessionCookie {
        SessionCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: None,
            path: None,
        }
    }

    #[test]
    fn test_cookie_header_skips_empty_values() {
        let credential = AccountCredential {
            account_id: 1,
            label: None,
            session: vec![cookie("sid", "abc"), cookie("empty", ""), cookie("csrf", "x1")],
            last_known_points: None,
        };
        assert!(credential.has_session());
        assert_eq!(credential.cookie_header(), "sid=abc; csrf=x1");
    }

    #[test]
    fn test_empty_session_material() {
        let credential = AccountCredential {
            account_id: 1,
            label: None,
            session: vec![cookie("sid", "")],
            last_known_points: None,
        };
        assert!(!credential.has_session());
    }

    #[test]
    fn test_card_debug_is_redacted() {
        let card = Card {
            id: "c1".to_string(),
            holder_name: "A B".to_string(),
            number: "4111111111111111".to_string(),
            expiry: "12/30".to_string(),
            cvv: "123".to_string(),
        };
        let debug = format!("{:?}", card);
        assert!(debug.contains("****1111"));
        assert!(!debug.contains("4111111111111111"));
        assert!(!debug.contains("123\""));
    }
}
