//! Order webhook payload, and the line-item property bags carts attach to it.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

pub const BOOKING_TOKEN: &str = "booking_token";
pub const START_DATE: &str = "start_date";
pub const END_DATE: &str = "end_date";
pub const LOCATION: &str = "location";
pub const FULFILLMENT_TYPE: &str = "fulfillment_type";
pub const FULFILLMENT: &str = "fulfillment";
pub const DELIVERY_ADDRESS: &str = "delivery_address";

#[derive(Debug, Clone, Deserialize)]
pub struct OrderPayload {
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub billing_address: Option<Address>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub variant_id: Option<i64>,
    #[serde(default)]
    pub quantity: i64,
    /// Decimal string or number.
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub properties: Option<PropertyBag>,
}

/// Line-item properties arrive either as `[{name, value}]` or as a plain map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PropertyBag {
    Pairs(Vec<PropertyPair>),
    Map(serde_json::Map<String, Value>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyPair {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// Lowercase, whitespace to underscores, leading underscores dropped (hidden
/// cart properties are prefixed with `_`).
pub fn normalize_name(name: &str) -> String {
    let lowered: String = name
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c.to_ascii_lowercase() })
        .collect();
    lowered.trim_start_matches('_').to_string()
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

impl PropertyBag {
    /// Normalized name → value. The first non-empty value for a name wins.
    pub fn normalized(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut put = |name: &str, value: &Value| {
            if let Some(text) = scalar_text(value) {
                out.entry(normalize_name(name)).or_insert(text);
            }
        };
        match self {
            PropertyBag::Pairs(pairs) => pairs.iter().for_each(|p| put(&p.name, &p.value)),
            PropertyBag::Map(map) => map.iter().for_each(|(k, v)| put(k, v)),
        }
        out
    }
}

impl LineItem {
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties
            .as_ref()
            .map(PropertyBag::normalized)
            .unwrap_or_default()
    }

    pub fn booking_token(&self) -> Option<String> {
        self.properties().remove(BOOKING_TOKEN)
    }

    pub fn unit_price(&self) -> Option<f64> {
        match self.price.as_ref()? {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }
}

impl OrderPayload {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Line-item indexes grouped by booking token, in order of first appearance.
    pub fn lines_by_token(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, line) in self.line_items.iter().enumerate() {
            let Some(token) = line.booking_token() else { continue };
            match groups.iter_mut().find(|(t, _)| *t == token) {
                Some((_, lines)) => lines.push(idx),
                None => groups.push((token, vec![idx])),
            }
        }
        groups
    }

    pub fn customer_name(&self) -> Option<String> {
        let from_customer = self.customer.as_ref().and_then(|c| {
            let parts: Vec<&str> = [c.first_name.as_deref(), c.last_name.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        });
        from_customer.or_else(|| {
            self.billing_address
                .as_ref()
                .and_then(|a| a.name.clone())
                .filter(|n| !n.trim().is_empty())
        })
    }

    pub fn customer_email(&self) -> Option<String> {
        [
            self.email.as_ref(),
            self.contact_email.as_ref(),
            self.customer.as_ref().and_then(|c| c.email.as_ref()),
        ]
        .into_iter()
        .flatten()
        .find(|e| !e.trim().is_empty())
        .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(value: Value) -> LineItem {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn normalizes_property_names() {
        assert_eq!(normalize_name("Booking Token"), "booking_token");
        assert_eq!(normalize_name("_booking_token"), "booking_token");
        assert_eq!(normalize_name("  START date "), "start_date");
        assert_eq!(normalize_name("Delivery\tAddress"), "delivery_address");
    }

    #[test]
    fn reads_pair_and_map_bags_alike() {
        let pairs = line(json!({
            "quantity": 1,
            "properties": [
                {"name": "Booking Token", "value": "tok-1"},
                {"name": "Start Date", "value": "2025-06-01"},
                {"name": "Empty", "value": ""},
                {"name": "Nested", "value": {"a": 1}}
            ]
        }));
        let map = line(json!({
            "quantity": 1,
            "properties": {"_booking_token": "tok-1", "start_date": "2025-06-01", "Qty": 3}
        }));

        let a = pairs.properties();
        assert_eq!(a.get("booking_token").map(String::as_str), Some("tok-1"));
        assert_eq!(a.get("start_date").map(String::as_str), Some("2025-06-01"));
        assert!(!a.contains_key("empty"));
        assert!(!a.contains_key("nested"));

        let b = map.properties();
        assert_eq!(b.get("booking_token"), a.get("booking_token"));
        assert_eq!(b.get("qty").map(String::as_str), Some("3"));
    }

    #[test]
    fn missing_or_null_properties_are_empty() {
        assert!(line(json!({"quantity": 1})).properties().is_empty());
        assert!(line(json!({"quantity": 1, "properties": null})).properties().is_empty());
        assert!(line(json!({"quantity": 1, "properties": []})).properties().is_empty());
    }

    #[test]
    fn groups_lines_by_token_in_order() {
        let order: OrderPayload = serde_json::from_value(json!({
            "id": 1,
            "line_items": [
                {"quantity": 1, "properties": [{"name": "booking_token", "value": "b"}]},
                {"quantity": 1, "properties": [{"name": "booking_token", "value": "a"}]},
                {"quantity": 1},
                {"quantity": 2, "properties": {"booking_token": "b"}}
            ]
        }))
        .unwrap();
        assert_eq!(
            order.lines_by_token(),
            vec![("b".to_string(), vec![0, 3]), ("a".to_string(), vec![1])]
        );
    }

    #[test]
    fn prices_parse_from_strings_and_numbers() {
        assert_eq!(line(json!({"quantity": 1, "price": "19.50"})).unit_price(), Some(19.5));
        assert_eq!(line(json!({"quantity": 1, "price": 7})).unit_price(), Some(7.0));
        assert_eq!(line(json!({"quantity": 1, "price": "n/a"})).unit_price(), None);
        assert_eq!(line(json!({"quantity": 1})).unit_price(), None);
    }

    #[test]
    fn customer_fields_fall_back() {
        let order: OrderPayload = serde_json::from_value(json!({
            "id": 1,
            "email": "",
            "customer": {"first_name": "Ana", "last_name": null, "email": "ana@example.com"}
        }))
        .unwrap();
        assert_eq!(order.customer_name().as_deref(), Some("Ana"));
        assert_eq!(order.customer_email().as_deref(), Some("ana@example.com"));

        let billing: OrderPayload = serde_json::from_value(json!({
            "id": 2,
            "billing_address": {"name": "Bo Li"}
        }))
        .unwrap();
        assert_eq!(billing.customer_name().as_deref(), Some("Bo Li"));
        assert_eq!(billing.customer_email(), None);
    }
}
