//! Catalog collaborator boundary.
//!
//! The product catalog is owned elsewhere; the core consults it exactly
//! once per order, at placement time, to snapshot names and unit prices.
//! Existing orders are never re-priced.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name and unit price of a product as known at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: i64,
    pub name: String,
    /// Unit price in integer cents. No floats anywhere in money paths.
    pub price_cents: i64,
}

/// Lookup contract consumed from the catalog collaborator.
pub trait Catalog: Send + Sync {
    /// `None` when the product is unknown (deleted, never existed).
    fn product(&self, product_id: i64) -> Option<ProductSnapshot>;
}

/// In-memory catalog for embedding and tests.
#[derive(Default)]
pub struct StaticCatalog {
    products: HashMap<i64, ProductSnapshot>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(mut self, id: i64, name: &str, price_cents: i64) -> Self {
        self.products.insert(
            id,
            ProductSnapshot {
                id,
                name: name.to_string(),
                price_cents,
            },
        );
        self
    }
}

impl Catalog for StaticCatalog {
    fn product(&self, product_id: i64) -> Option<ProductSnapshot> {
        self.products.get(&product_id).cloned()
    }
}
