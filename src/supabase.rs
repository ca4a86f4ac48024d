use crate::http::build_client;
use crate::models::{EstimateRecord, LotId, StoreRow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_with::skip_serializing_none;
use thiserror::Error;

const PENDING_COLUMNS: &str = "lot_inv_num,lot_url,year,make,model,odometer";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// The shared listing table: where work comes from and where estimates land.
#[async_trait]
pub trait LotStore: Send + Sync {
    /// Rows with a listing URL and no usable repair estimate, ordered by URL.
    async fn fetch_pending(&self, limit: Option<usize>) -> Result<Vec<StoreRow>, StoreError>;

    /// Writes the estimate to every row whose URL contains the lot id.
    /// Returns the number of rows touched.
    async fn update_estimate(&self, lot: &LotId, record: &EstimateRecord)
    -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    table: String,
    http: Client,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, PartialEq)]
struct EstimateUpdate<'a> {
    repair_estimate: f64,
    repair_details: &'a str,
    est_retail_value: Option<f64>,
    resale_details: &'a str,
}

impl<'a> From<&'a EstimateRecord> for EstimateUpdate<'a> {
    fn from(record: &'a EstimateRecord) -> Self {
        Self {
            repair_estimate: record.repair_cost,
            repair_details: &record.repair_detail,
            est_retail_value: record.outlook.resale_value(),
            resale_details: record.outlook.details(),
        }
    }
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let table = std::env::var("STORE_TABLE")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "cars".into());
        Some(Self::new(&base_url, service_key, table))
    }

    pub fn new(base_url: &str, service_key: String, table: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            table,
            http: build_client(),
        }
    }

    fn pending_url(&self, limit: Option<usize>) -> String {
        let mut url = format!(
            "{}/rest/v1/{}?select={}&lot_url=not.is.null&or=(repair_estimate.is.null,repair_estimate.eq.0)&order=lot_url.asc",
            self.base_url, self.table, PENDING_COLUMNS
        );
        if let Some(limit) = limit {
            url.push_str(&format!("&limit={limit}"));
        }
        url
    }

    fn update_url(&self, lot: &LotId) -> String {
        let pattern = format!("like.*{}*", lot.as_str());
        format!(
            "{}/rest/v1/{}?lot_url={}&select=lot_url",
            self.base_url,
            self.table,
            urlencoding::encode(&pattern)
        )
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }
}

#[async_trait]
impl LotStore for SupabaseClient {
    async fn fetch_pending(&self, limit: Option<usize>) -> Result<Vec<StoreRow>, StoreError> {
        let response = self
            .authed(self.http.get(self.pending_url(limit)))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Vec<StoreRow>>()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn update_estimate(
        &self,
        lot: &LotId,
        record: &EstimateRecord,
    ) -> Result<u64, StoreError> {
        let response = self
            .authed(self.http.patch(self.update_url(lot)))
            .header("Prefer", "return=representation")
            .json(&EstimateUpdate::from(record))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let touched: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(touched.len() as u64)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    /// In-memory table keyed by URL with the same pending/update semantics.
    #[derive(Default)]
    pub struct MemoryStore {
        rows: Mutex<Vec<(StoreRow, Option<EstimateRecord>)>>,
        pub updates: AtomicUsize,
        pub fail_updates: AtomicBool,
    }

    impl MemoryStore {
        pub fn with_urls(urls: &[&str]) -> Self {
            let store = Self::default();
            for url in urls {
                store.insert(StoreRow {
                    lot_inv_num: None,
                    lot_url: url.to_string(),
                    year: None,
                    make: None,
                    model: None,
                    odometer: None,
                });
            }
            store
        }

        pub fn insert(&self, row: StoreRow) {
            self.rows.lock().unwrap().push((row, None));
        }

        pub fn estimate_for(&self, url: &str) -> Option<EstimateRecord> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|(row, _)| row.lot_url == url)
                .and_then(|(_, estimate)| estimate.clone())
        }

        pub fn updates(&self) -> usize {
            self.updates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LotStore for MemoryStore {
        async fn fetch_pending(&self, limit: Option<usize>) -> Result<Vec<StoreRow>, StoreError> {
            let mut pending = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, estimate)| {
                    estimate
                        .as_ref()
                        .map(|e| e.repair_cost == 0.0)
                        .unwrap_or(true)
                })
                .map(|(row, _)| row.clone())
                .collect::<Vec<_>>();
            pending.sort_by(|a, b| a.lot_url.cmp(&b.lot_url));
            if let Some(limit) = limit {
                pending.truncate(limit);
            }
            Ok(pending)
        }

        async fn update_estimate(
            &self,
            lot: &LotId,
            record: &EstimateRecord,
        ) -> Result<u64, StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(StoreError::Request("HTTP 503 Service Unavailable".into()));
            }
            let mut touched = 0;
            for (row, estimate) in self.rows.lock().unwrap().iter_mut() {
                if row.lot_url.contains(lot.as_str()) {
                    *estimate = Some(record.clone());
                    touched += 1;
                }
            }
            Ok(touched)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResaleOutlook;
    use serde_json::json;

    fn client() -> SupabaseClient {
        SupabaseClient::new("https://db.example.co/", "key".into(), "cars".into())
    }

    #[test]
    fn pending_query_filters_missing_estimates() {
        let url = client().pending_url(Some(20));
        assert!(url.starts_with("https://db.example.co/rest/v1/cars?select="));
        assert!(url.contains("lot_url=not.is.null"));
        assert!(url.contains("or=(repair_estimate.is.null,repair_estimate.eq.0)"));
        assert!(url.contains("order=lot_url.asc"));
        assert!(url.ends_with("&limit=20"));
        assert!(!client().pending_url(None).contains("limit="));
    }

    #[test]
    fn update_matches_url_containing_lot_id() {
        let url = client().update_url(&LotId::parse("12345").unwrap());
        assert!(url.contains("lot_url=like.%2A12345%2A"));
    }

    #[test]
    fn range_update_carries_resale_value() {
        let record = EstimateRecord {
            repair_cost: 2400.0,
            repair_detail: "Bumper".into(),
            outlook: ResaleOutlook::Range {
                low: 9000.0,
                high: 11000.0,
                average: 10000.0,
                details: "Clean".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(EstimateUpdate::from(&record)).unwrap(),
            json!({
                "repair_estimate": 2400.0,
                "repair_details": "Bumper",
                "est_retail_value": 10000.0,
                "resale_details": "Clean"
            })
        );
    }

    #[test]
    fn evaluation_update_omits_resale_value() {
        let record = EstimateRecord {
            repair_cost: 800.0,
            repair_detail: "Scratches".into(),
            outlook: ResaleOutlook::Evaluation {
                score: 6.0,
                details: "Decent flip".into(),
            },
        };
        let body = serde_json::to_value(EstimateUpdate::from(&record)).unwrap();
        assert!(body.get("est_retail_value").is_none());
        assert_eq!(body["resale_details"], json!("Decent flip"));
    }

    #[tokio::test]
    async fn memory_store_drops_rows_once_estimated() {
        let store = testing::MemoryStore::with_urls(&[
            "https://www.copart.com/lot/222/b",
            "https://www.copart.com/lot/111/a",
        ]);
        let pending = store.fetch_pending(None).await.unwrap();
        assert_eq!(pending[0].lot_url, "https://www.copart.com/lot/111/a");

        let record = EstimateRecord {
            repair_cost: 100.0,
            repair_detail: String::new(),
            outlook: ResaleOutlook::Evaluation {
                score: 0.0,
                details: String::new(),
            },
        };
        let touched = store
            .update_estimate(&LotId::parse("111").unwrap(), &record)
            .await
            .unwrap();
        assert_eq!(touched, 1);
        assert_eq!(store.fetch_pending(Some(5)).await.unwrap().len(), 1);
    }
}
