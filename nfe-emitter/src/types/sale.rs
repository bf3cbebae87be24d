//! Sale records as provided by the checkout backend. This crate only reads
//! them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{money::Amount, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaleReference(pub String);

impl fmt::Display for SaleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SaleReference {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SaleRecord {
    pub reference: SaleReference,
    pub status: SaleStatus,
    pub buyer: Buyer,
    pub items: Vec<SaleItem>,
    pub payment: PaymentMethod,
}

/// Payment approval status reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Approved,
    Pending,
    Declined,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Buyer {
    pub name: String,
    /// CPF or CNPJ, with or without punctuation.
    pub tax_id: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SaleItem {
    pub name: String,
    pub price: PriceInput,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    /// Product code (`cProd`). Defaults to the item's position.
    pub code: Option<String>,
    pub ncm: Option<String>,
    pub cfop: Option<String>,
}

/// Unit price as stored by the checkout: usually currency text, sometimes a
/// plain JSON number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceInput {
    Text(String),
    Number(serde_json::Number),
}

impl PriceInput {
    pub fn raw(&self) -> String {
        match self {
            PriceInput::Text(text) => text.clone(),
            PriceInput::Number(number) => number.to_string(),
        }
    }
}

/// Payment means (`tPag`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    CreditCard,
    DebitCard,
    StoreCredit,
    BankSlip,
    Pix,
    Other,
}

impl PaymentMethod {
    pub fn code(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "01",
            PaymentMethod::CreditCard => "03",
            PaymentMethod::DebitCard => "04",
            PaymentMethod::StoreCredit => "05",
            PaymentMethod::BankSlip => "15",
            PaymentMethod::Pix => "17",
            PaymentMethod::Other => "99",
        }
    }

    pub fn is_card(self) -> bool {
        matches!(self, PaymentMethod::CreditCard | PaymentMethod::DebitCard)
    }
}

fn default_quantity() -> u32 {
    1
}

impl SaleRecord {
    /// Only sales whose payment was approved may be invoiced.
    pub fn ensure_approved(&self) -> Result<(), ValidationError> {
        match self.status {
            SaleStatus::Approved => Ok(()),
            other => Err(ValidationError::SaleNotApproved {
                reference: self.reference.to_string(),
                status: format!("{other:?}"),
            }),
        }
    }
}

impl SaleItem {
    pub fn unit_price(&self, position: usize) -> Result<Amount, ValidationError> {
        let parsed = match &self.price {
            PriceInput::Text(text) => Amount::parse_brl(text),
            PriceInput::Number(number) => Amount::from_json_number(number),
        };
        parsed.map_err(|source| ValidationError::InvalidItemPrice {
            item: position,
            name: self.name.clone(),
            raw: self.price.raw(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum SaleSourceError {
    #[error("Sale source is unavailable: {0}")]
    Unavailable(String),
    #[error("Sale record {reference} could not be decoded: {reason}")]
    Malformed { reference: String, reason: String },
}

/// Read access to the sales ledger.
#[async_trait]
pub trait SaleSource: Send + Sync {
    /// Returns `None` when no sale exists with this reference.
    async fn fetch_sale(
        &self,
        reference: &SaleReference,
    ) -> Result<Option<SaleRecord>, SaleSourceError>;
}

/// Sale source backed by a map. Used by the operator CLI to invoice a sale
/// exported to a file, and by tests.
#[derive(Debug, Default)]
pub struct InMemorySaleSource {
    sales: RwLock<HashMap<SaleReference, SaleRecord>>,
}

impl InMemorySaleSource {
    pub fn new(sales: impl IntoIterator<Item = SaleRecord>) -> Self {
        Self {
            sales: RwLock::new(
                sales
                    .into_iter()
                    .map(|sale| (sale.reference.clone(), sale))
                    .collect(),
            ),
        }
    }

    pub async fn insert(&self, sale: SaleRecord) {
        let _ = self.sales.write().await.insert(sale.reference.clone(), sale);
    }
}

#[async_trait]
impl SaleSource for InMemorySaleSource {
    async fn fetch_sale(
        &self,
        reference: &SaleReference,
    ) -> Result<Option<SaleRecord>, SaleSourceError> {
        Ok(self.sales.read().await.get(reference).cloned())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_sale() -> SaleRecord {
        serde_json::from_str(
            r#"{
                "reference": "pedido-0042",
                "status": "approved",
                "buyer": {
                    "name": "Maria Souza",
                    "tax_id": "123.456.789-09",
                    "email": "maria@example.com"
                },
                "items": [
                    { "name": "Dom Casmurro", "price": "R$ 59,90" },
                    { "name": "Vidas Secas", "price": 42.5, "quantity": 2, "ncm": "49011000" }
                ],
                "payment": "credit_card"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn decodes_sale_json() {
        let sale = test_sale();
        assert_eq!(sale.items.len(), 2);
        assert_eq!(sale.items[0].quantity, 1);
        assert_eq!(sale.items[1].quantity, 2);
        assert_eq!(sale.items[0].unit_price(1).unwrap().to_string(), "59.90");
        assert_eq!(sale.items[1].unit_price(2).unwrap().to_string(), "42.50");
        assert_eq!(sale.payment.code(), "03");
    }

    #[test]
    fn unreadable_price_names_the_item() {
        let mut sale = test_sale();
        sale.items[0].price = PriceInput::Text("a combinar".to_string());
        let err = sale.items[0].unit_price(1).unwrap_err();
        match err {
            ValidationError::InvalidItemPrice { item, name, raw, .. } => {
                assert_eq!(item, 1);
                assert_eq!(name, "Dom Casmurro");
                assert_eq!(raw, "a combinar");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn only_approved_sales_pass() {
        let mut sale = test_sale();
        sale.ensure_approved().unwrap();
        sale.status = SaleStatus::Pending;
        assert!(matches!(
            sale.ensure_approved(),
            Err(ValidationError::SaleNotApproved { .. })
        ));
    }

    #[tokio::test]
    async fn in_memory_source_returns_known_sales() {
        let source = InMemorySaleSource::new([test_sale()]);
        let found = source.fetch_sale(&"pedido-0042".into()).await.unwrap();
        assert!(found.is_some());
        let missing = source.fetch_sale(&"pedido-9999".into()).await.unwrap();
        assert!(missing.is_none());
    }
}
