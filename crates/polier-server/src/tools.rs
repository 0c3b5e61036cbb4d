//! Catalog-backed lookup tools exposed to the completion loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use polier_agent::errors::{AgentError, Result};
use polier_agent::tools::{Tool, ToolRegistry};

use crate::catalog::CatalogStore;

/// Registry with every catalog lookup registered; built once at startup
/// and shared with the completion engine.
pub fn build_registry(catalog: Arc<CatalogStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(InventorySearchTool {
        catalog: Arc::clone(&catalog),
    });
    registry.register(ProductPriceSearchTool {
        catalog: Arc::clone(&catalog),
    });
    registry.register(ListProductNamesTool { catalog });
    registry
}

fn require_query_text(input: &Value) -> Result<String> {
    let query = input
        .get("query_text")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if query.is_empty() {
        return Err(AgentError::InvalidToolInput(
            "query_text must be a non-empty string".to_string(),
        ));
    }
    Ok(query.to_string())
}

fn lookup_failed(name: &str, err: anyhow::Error) -> AgentError {
    AgentError::Tool {
        name: name.to_string(),
        message: err.to_string(),
    }
}

struct InventorySearchTool {
    catalog: Arc<CatalogStore>,
}

#[async_trait]
impl Tool for InventorySearchTool {
    fn name(&self) -> &'static str {
        "inventory_search"
    }

    fn description(&self) -> &'static str {
        "Search jobsite inventory for items matching a query string."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query_text": {
                    "type": "string",
                    "description": "What to search for, e.g. 'gloves' or 'Handschuh'.",
                },
                "site_id": {
                    "type": "string",
                    "description": "Optional site identifier (currently unused).",
                },
            },
            "required": ["query_text"],
        })
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let query = require_query_text(&input)?;
        let items = self
            .catalog
            .inventory_matching(&query)
            .await
            .map_err(|err| lookup_failed(self.name(), err))?;
        serde_json::to_value(items).map_err(|err| lookup_failed(self.name(), err.into()))
    }
}

struct ProductPriceSearchTool {
    catalog: Arc<CatalogStore>,
}

#[async_trait]
impl Tool for ProductPriceSearchTool {
    fn name(&self) -> &'static str {
        "product_price_search"
    }

    fn description(&self) -> &'static str {
        "Search the supplier price catalog for items matching a query string."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query_text": {
                    "type": "string",
                    "description": "What to search for, e.g. 'gloves' or 'Handschuh'.",
                },
            },
            "required": ["query_text"],
        })
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let query = require_query_text(&input)?;
        let products = self
            .catalog
            .products_matching(&query)
            .await
            .map_err(|err| lookup_failed(self.name(), err))?;
        serde_json::to_value(products).map_err(|err| lookup_failed(self.name(), err.into()))
    }
}

struct ListProductNamesTool {
    catalog: Arc<CatalogStore>,
}

#[async_trait]
impl Tool for ListProductNamesTool {
    fn name(&self) -> &'static str {
        "get_all_product_names"
    }

    fn description(&self) -> &'static str {
        "Retrieve all distinct product names (sorted)."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn invoke(&self, _input: Value) -> Result<Value> {
        let names = self
            .catalog
            .product_names()
            .await
            .map_err(|err| lookup_failed(self.name(), err))?;
        serde_json::to_value(names).map_err(|err| lookup_failed(self.name(), err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InventoryItem;

    fn temp_catalog() -> Arc<CatalogStore> {
        let path = std::env::temp_dir().join(format!(
            "polier-tools-test-{}.sqlite3",
            uuid::Uuid::new_v4().simple()
        ));
        Arc::new(CatalogStore::initialize_at(path).expect("catalog should initialize"))
    }

    #[tokio::test]
    async fn registry_exposes_the_three_lookups() {
        let registry = build_registry(temp_catalog());
        let names: Vec<_> = registry
            .schemas()
            .into_iter()
            .map(|schema| schema.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "inventory_search",
                "product_price_search",
                "get_all_product_names"
            ]
        );
    }

    #[tokio::test]
    async fn inventory_search_requires_query_text() {
        let registry = build_registry(temp_catalog());
        let err = registry
            .execute("inventory_search", Some(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_tool_input");
    }

    #[tokio::test]
    async fn inventory_search_returns_matching_rows() {
        let catalog = temp_catalog();
        catalog
            .upsert_inventory_item(InventoryItem {
                artikel_id: "i-1".to_string(),
                artikelname: "Arbeitshandschuhe Gr. 10".to_string(),
                kategorie: Some("PSA".to_string()),
                lieferant: None,
                menge: Some(12.0),
            })
            .await
            .unwrap();

        let registry = build_registry(catalog);
        let result = registry
            .execute("inventory_search", Some(json!({ "query_text": "handschuhe" })))
            .await
            .unwrap();
        let items = result.as_array().expect("array result");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["artikel_id"], "i-1");
    }
}
