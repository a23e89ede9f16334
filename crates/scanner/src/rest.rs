//! [`Backend`] over a PostgREST endpoint (`<base>/rest/v1/<table>`).

use std::time::Duration;

use async_trait::async_trait;
use cylinder_core::TenantId;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::{
    Backend, BackendError, BottleRecord, BottleStateUpdate, CustomerRecord, LegacyScanInsert, OrderRecord,
    RentalRecord, ScanDeletion, ScanInsert, ScanTable, UpsertTable, UNDEFINED_COLUMN_CODE,
};

const RETURN_REPRESENTATION: &str = "return=representation";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=minimal";

/// Error body PostgREST returns on failure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PostgrestBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    auth_token: Option<String>,
}

impl PostgrestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            auth_token,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let token = self.auth_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &body))
    }

    async fn rows<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Vec<T>, BackendError> {
        let response = self.send(request).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    fn returning(request: RequestBuilder) -> RequestBuilder {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static(RETURN_REPRESENTATION));
        request.headers(headers)
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(err.to_string())
    }
}

/// Map a non-2xx response to a [`BackendError`].
fn api_error(status: u16, body: &str) -> BackendError {
    let parsed: PostgrestErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.details)
        .or(parsed.hint)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                body.trim().to_string()
            }
        });
    if parsed.code.as_deref() == Some(UNDEFINED_COLUMN_CODE) {
        return BackendError::UndefinedColumn(message);
    }
    BackendError::Api {
        status,
        code: parsed.code,
        message,
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

/// `in.("a","b")`
fn in_list(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// Window deletes match the scan's `timestamp`, not the server's `created_at`.
fn deletion_filters(target: &ScanDeletion) -> Vec<(&'static str, String)> {
    match target {
        ScanDeletion::ById(id) => vec![("id", eq(id))],
        ScanDeletion::ByWindow {
            barcode,
            organization_id,
            from,
            to,
        } => vec![
            ("bottle_barcode", eq(barcode)),
            ("organization_id", eq(organization_id)),
            ("timestamp", format!("gte.{}", from.to_rfc3339())),
            ("timestamp", format!("lte.{}", to.to_rfc3339())),
        ],
    }
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Backend for PostgrestBackend {
    async fn find_bottle(
        &self,
        barcode: &str,
        organization_id: TenantId,
    ) -> Result<Option<BottleRecord>, BackendError> {
        let request = self.request(Method::GET, "bottles").query(&[
            ("select", "*".to_string()),
            ("barcode_number", eq(barcode)),
            ("organization_id", eq(organization_id)),
            ("limit", "1".to_string()),
        ]);
        Ok(self.rows(request).await?.into_iter().next())
    }

    async fn insert_scan(&self, row: &ScanInsert) -> Result<Option<String>, BackendError> {
        let request = Self::returning(self.request(Method::POST, ScanTable::Primary.name())).json(&[row]);
        let rows: Vec<Value> = self.rows(request).await?;
        Ok(rows.first().and_then(row_id))
    }

    async fn insert_legacy_scan(&self, row: &LegacyScanInsert) -> Result<(), BackendError> {
        let request = self.request(Method::POST, ScanTable::Legacy.name()).json(&[row]);
        self.send(request).await?;
        Ok(())
    }

    async fn update_bottle_state(
        &self,
        barcode: &str,
        organization_id: TenantId,
        update: &BottleStateUpdate,
    ) -> Result<(), BackendError> {
        let request = self
            .request(Method::PATCH, "bottles")
            .query(&[
                ("barcode_number", eq(barcode)),
                ("organization_id", eq(organization_id)),
            ])
            .json(update);
        self.send(request).await?;
        Ok(())
    }

    async fn upsert(&self, table: UpsertTable, row: Value) -> Result<(), BackendError> {
        let request = self
            .request(Method::POST, table.name())
            .header("Prefer", MERGE_DUPLICATES)
            .json(&[row]);
        self.send(request).await?;
        Ok(())
    }

    async fn backfill_order_number(
        &self,
        table: ScanTable,
        barcodes: &[String],
        organization_id: TenantId,
        order_number: &str,
    ) -> Result<u64, BackendError> {
        if barcodes.is_empty() {
            return Ok(0);
        }
        let request = Self::returning(self.request(Method::PATCH, table.name()))
            .query(&[
                (table.barcode_column(), in_list(barcodes)),
                ("organization_id", eq(organization_id)),
            ])
            .json(&json!({ "order_number": order_number }));
        let rows: Vec<Value> = self.rows(request).await?;
        Ok(rows.len() as u64)
    }

    async fn find_order(
        &self,
        order_number: &str,
        organization_id: TenantId,
    ) -> Result<Option<OrderRecord>, BackendError> {
        let request = self.request(Method::GET, "sales_orders").query(&[
            ("select", "*".to_string()),
            ("sales_order_number", eq(order_number)),
            ("organization_id", eq(organization_id)),
            ("limit", "1".to_string()),
        ]);
        Ok(self.rows(request).await?.into_iter().next())
    }

    async fn insert_order(&self, order: &OrderRecord) -> Result<OrderRecord, BackendError> {
        let request = Self::returning(self.request(Method::POST, "sales_orders")).json(&[order]);
        self.rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Parse("order insert returned no rows".into()))
    }

    async fn update_order_notes(&self, order_id: &str, notes: &str) -> Result<OrderRecord, BackendError> {
        let request = Self::returning(self.request(Method::PATCH, "sales_orders"))
            .query(&[("id", eq(order_id))])
            .json(&json!({ "notes": notes }));
        self.rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Parse(format!("order {order_id} not found")))
    }

    async fn delete_scans(&self, target: &ScanDeletion) -> Result<u64, BackendError> {
        let filters = deletion_filters(target);
        let request = Self::returning(self.request(Method::DELETE, ScanTable::Primary.name())).query(&filters);
        let rows: Vec<Value> = self.rows(request).await?;
        Ok(rows.len() as u64)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let request = self
            .request(Method::GET, ScanTable::Primary.name())
            .query(&[("select", "id"), ("limit", "1")]);
        self.send(request).await?;
        Ok(())
    }

    async fn fetch_bottles(
        &self,
        organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<BottleRecord>, BackendError> {
        let request = self.request(Method::GET, "bottles").query(&[
            ("select", "*".to_string()),
            ("organization_id", eq(organization_id)),
            ("limit", limit.to_string()),
        ]);
        self.rows(request).await
    }

    async fn fetch_customers(
        &self,
        organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<CustomerRecord>, BackendError> {
        let request = self.request(Method::GET, "customers").query(&[
            ("select", "*".to_string()),
            ("organization_id", eq(organization_id)),
            ("limit", limit.to_string()),
        ]);
        self.rows(request).await
    }

    async fn fetch_active_rentals(
        &self,
        organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<RentalRecord>, BackendError> {
        let request = self.request(Method::GET, "rentals").query(&[
            ("select", "*".to_string()),
            ("organization_id", eq(organization_id)),
            ("status", eq("active")),
            ("limit", limit.to_string()),
        ]);
        self.rows(request).await
    }
}
