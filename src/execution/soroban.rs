use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{ExternalPayment, LedgerClient, SettlementResult};
use crate::amount::Stroops;
use crate::error::SettlementError;

/// Error text from the relay / host that means "this entry point is not there".
const UNSUPPORTED_MARKERS: &[&str] = &[
    "missingvalue",
    "non-existent contract function",
    "unknown method",
    "method not found",
];

/// Error text that means the host ran the call but its result could not be read back.
const AMBIGUOUS_MARKERS: &[&str] = &["bad union switch", "failed to decode"];

/// Upper bound on Horizon pages read for one account's history.
const MAX_HISTORY_PAGES: usize = 50;

#[derive(Debug, Clone)]
pub struct SorobanConfig {
    pub relay_url: String,
    pub contract_id: String,
    pub horizon_url: String,
    pub asset_code: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    method: &'a str,
    args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    tx_hash: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RelayError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct HorizonPage {
    #[serde(rename = "_embedded")]
    embedded: HorizonEmbedded,
    #[serde(rename = "_links", default)]
    links: Option<HorizonLinks>,
}

#[derive(Debug, Deserialize)]
struct HorizonLinks {
    next: Option<HorizonLink>,
}

#[derive(Debug, Deserialize)]
struct HorizonLink {
    href: String,
}

#[derive(Debug, Deserialize)]
struct HorizonEmbedded {
    records: Vec<HorizonPaymentRecord>,
}

#[derive(Debug, Deserialize)]
struct HorizonPaymentRecord {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    transaction_hash: String,
    created_at: DateTime<Utc>,
    from: Option<String>,
    to: Option<String>,
    asset_type: Option<String>,
    asset_code: Option<String>,
    amount: Option<String>,
    // create_account operations
    funder: Option<String>,
    account: Option<String>,
    starting_balance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HorizonAccount {
    balances: Vec<HorizonBalance>,
}

#[derive(Debug, Deserialize)]
struct HorizonBalance {
    balance: String,
    asset_type: String,
    asset_code: Option<String>,
}

/// Ledger client over a Soroban settlement relay (writes) and Horizon (reads)
pub struct SorobanLedgerClient {
    config: SorobanConfig,
    client: reqwest::Client,
}

impl SorobanLedgerClient {
    pub fn new(config: SorobanConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    /// Invoke a contract method through the relay and return its tx hash and decoded result.
    async fn invoke(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> SettlementResult<(Option<String>, serde_json::Value)> {
        let url = format!(
            "{}/contracts/{}/invoke",
            self.config.relay_url.trim_end_matches('/'),
            self.config.contract_id
        );
        debug!("Invoking contract method {} via {}", method, url);

        let response = self
            .client
            .post(&url)
            .json(&InvokeRequest { method, args })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<RelayError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(classify(status, &message));
        }

        let decoded: InvokeResponse = response
            .json()
            .await
            .map_err(|e| SettlementError::Ambiguous(format!("failed to decode relay result: {}", e)))?;

        Ok((decoded.tx_hash, decoded.result))
    }

    async fn invoke_for_tx(&self, method: &str, args: serde_json::Value) -> SettlementResult<String> {
        let (tx_hash, _) = self.invoke(method, args).await?;
        let tx_hash = tx_hash.ok_or_else(|| {
            SettlementError::Ambiguous(format!("{} returned no transaction hash", method))
        })?;
        info!("⛓️ {} submitted: {}", method, tx_hash);
        Ok(tx_hash)
    }

    async fn horizon_get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> SettlementResult<Option<T>> {
        let url = format!("{}{}", self.config.horizon_url.trim_end_matches('/'), path);
        self.horizon_fetch(&url).await
    }

    async fn horizon_fetch<T: for<'de> Deserialize<'de>>(&self, url: &str) -> SettlementResult<Option<T>> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SettlementError::Hard(format!("horizon returned {}: {}", status, body)));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| SettlementError::Ambiguous(format!("failed to decode horizon response: {}", e)))
    }
}

fn transport_error(e: reqwest::Error) -> SettlementError {
    if e.is_timeout() {
        SettlementError::Timeout
    } else {
        SettlementError::Hard(format!("transport error: {}", e))
    }
}

/// The single place where raw error text decides hard vs soft vs ambiguous.
fn classify(status: reqwest::StatusCode, message: &str) -> SettlementError {
    let lowered = message.to_lowercase();
    if status == reqwest::StatusCode::NOT_IMPLEMENTED
        || UNSUPPORTED_MARKERS.iter().any(|marker| lowered.contains(marker))
    {
        SettlementError::Soft(message.to_string())
    } else if AMBIGUOUS_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        SettlementError::Ambiguous(message.to_string())
    } else if status == reqwest::StatusCode::GATEWAY_TIMEOUT {
        SettlementError::Timeout
    } else {
        SettlementError::Hard(message.to_string())
    }
}

fn decode_amount(raw: &str) -> SettlementResult<Stroops> {
    Stroops::parse(raw).map_err(|e| SettlementError::Ambiguous(format!("undecodable amount: {}", e)))
}

impl HorizonPaymentRecord {
    fn into_payment(self, native_code: &str) -> SettlementResult<Option<ExternalPayment>> {
        let (from, to, asset_code, amount) = match self.kind.as_str() {
            "payment" => {
                let asset_code = match self.asset_type.as_deref() {
                    Some("native") => native_code.to_string(),
                    _ => self.asset_code.unwrap_or_default(),
                };
                (self.from, self.to, asset_code, self.amount)
            }
            "create_account" => (
                self.funder,
                self.account,
                native_code.to_string(),
                self.starting_balance,
            ),
            _ => return Ok(None),
        };

        let (Some(to), Some(amount)) = (to, amount) else {
            return Ok(None);
        };

        Ok(Some(ExternalPayment {
            id: self.id,
            tx_ref: self.transaction_hash,
            from,
            to,
            asset_code,
            amount: decode_amount(&amount)?,
            created_at: self.created_at,
        }))
    }
}

impl HorizonPage {
    fn next_href(&self) -> Option<String> {
        self.links
            .as_ref()
            .and_then(|links| links.next.as_ref())
            .map(|link| link.href.clone())
    }
}

/// Payments into `account`; a record that cannot be decoded is logged and skipped.
fn collect_incoming(records: Vec<HorizonPaymentRecord>, account: &str, native_code: &str) -> Vec<ExternalPayment> {
    let mut payments = Vec::new();
    for record in records {
        let id = record.id.clone();
        match record.into_payment(native_code) {
            Ok(Some(payment)) if payment.to == account => payments.push(payment),
            Ok(_) => {}
            Err(e) => warn!("Skipping undecodable payment {} for {}: {}", id, account, e),
        }
    }
    payments
}

#[async_trait]
impl LedgerClient for SorobanLedgerClient {
    async fn collect_premium(&self, account: &str, amount: Stroops) -> SettlementResult<String> {
        self.invoke_for_tx(
            "collect_premium",
            serde_json::json!({ "user": account, "amount": amount.value() }),
        )
        .await
    }

    async fn collect_premium_with_ref(
        &self,
        account: &str,
        amount: Stroops,
        reference: &str,
    ) -> SettlementResult<String> {
        self.invoke_for_tx(
            "collect_premium_with_ref",
            serde_json::json!({ "user": account, "amount": amount.value(), "ref": reference }),
        )
        .await
    }

    async fn activate_policy(
        &self,
        account: &str,
        product_id: &str,
        amount: Stroops,
        reference: &str,
    ) -> SettlementResult<String> {
        self.invoke_for_tx(
            "activate_policy",
            serde_json::json!({
                "user": account,
                "product": product_id,
                "amount": amount.value(),
                "ref": reference,
            }),
        )
        .await
    }

    async fn payout(&self, account: &str, amount: Stroops) -> SettlementResult<String> {
        self.invoke_for_tx(
            "payout",
            serde_json::json!({ "user": account, "amount": amount.value() }),
        )
        .await
    }

    async fn pause_policy(&self, account: &str, policy_id: Uuid) -> SettlementResult<()> {
        self.invoke(
            "pause_policy",
            serde_json::json!({ "user": account, "policy": policy_id.to_string() }),
        )
        .await
        .map(|_| ())
    }

    async fn get_balance(&self, account: &str) -> SettlementResult<Stroops> {
        let Some(details) = self
            .horizon_get::<HorizonAccount>(&format!("/accounts/{}", account))
            .await?
        else {
            warn!("Account {} not found on horizon, reporting zero balance", account);
            return Ok(Stroops::ZERO);
        };

        let native = self.config.asset_code == "XLM";
        let balance = details.balances.into_iter().find(|b| {
            if native {
                b.asset_type == "native"
            } else {
                b.asset_code.as_deref() == Some(self.config.asset_code.as_str())
            }
        });

        match balance {
            Some(b) => decode_amount(&b.balance),
            None => Ok(Stroops::ZERO),
        }
    }

    async fn get_policy(&self, policy_id: Uuid) -> SettlementResult<serde_json::Value> {
        let (_, result) = self
            .invoke("get_policy", serde_json::json!({ "policy": policy_id.to_string() }))
            .await?;
        Ok(result)
    }

    async fn payment_history(&self, account: &str) -> SettlementResult<Vec<ExternalPayment>> {
        let mut url = format!(
            "{}/accounts/{}/payments?order=desc&limit=200",
            self.config.horizon_url.trim_end_matches('/'),
            account
        );
        let mut payments = Vec::new();

        for _ in 0..MAX_HISTORY_PAGES {
            let Some(page) = self.horizon_fetch::<HorizonPage>(&url).await? else {
                break;
            };
            if page.embedded.records.is_empty() {
                break;
            }

            let next = page.next_href();
            payments.extend(collect_incoming(page.embedded.records, account, &self.config.asset_code));

            match next {
                Some(href) if href != url => url = href,
                _ => break,
            }
        }
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_classify_missing_entry_point_as_soft() {
        let err = classify(
            StatusCode::BAD_REQUEST,
            "HostError: Error(WasmVm, MissingValue) non-existent contract function",
        );
        assert!(err.is_soft());
        assert!(classify(StatusCode::NOT_IMPLEMENTED, "nope").is_soft());
    }

    #[test]
    fn test_classify_unreadable_result_as_ambiguous() {
        let err = classify(StatusCode::BAD_REQUEST, "xdr: bad union switch 4");
        assert!(matches!(err, SettlementError::Ambiguous(_)));
        assert!(!err.is_soft());
    }

    #[test]
    fn test_classify_rejection_as_hard() {
        let err = classify(StatusCode::BAD_REQUEST, "Error(Contract, #3) insufficient allowance");
        assert!(matches!(err, SettlementError::Hard(_)));
        assert_eq!(classify(StatusCode::GATEWAY_TIMEOUT, "upstream"), SettlementError::Timeout);
    }

    #[test]
    fn test_horizon_payment_decoding() {
        let raw = serde_json::json!({
            "_embedded": { "records": [
                {
                    "id": "1",
                    "type": "payment",
                    "transaction_hash": "abc",
                    "created_at": "2024-01-01T00:00:00Z",
                    "from": "GFROM",
                    "to": "GTO",
                    "asset_type": "native",
                    "amount": "60.0000000"
                },
                {
                    "id": "2",
                    "type": "manage_offer",
                    "transaction_hash": "def",
                    "created_at": "2024-01-01T00:00:00Z"
                }
            ]}
        });
        let page: HorizonPage = serde_json::from_value(raw).unwrap();
        let payments: Vec<ExternalPayment> = page
            .embedded
            .records
            .into_iter()
            .filter_map(|r| r.into_payment("XLM").unwrap())
            .collect();

        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, Stroops(600_000_000));
        assert_eq!(payments[0].asset_code, "XLM");
        assert_eq!(payments[0].tx_ref, "abc");
    }

    #[test]
    fn test_bad_record_is_skipped_and_next_link_read() {
        let raw = serde_json::json!({
            "_links": { "next": { "href": "https://horizon.local/accounts/GTO/payments?cursor=9" } },
            "_embedded": { "records": [
                {
                    "id": "8",
                    "type": "payment",
                    "transaction_hash": "bad",
                    "created_at": "2024-01-01T00:00:00Z",
                    "to": "GTO",
                    "asset_type": "native",
                    "amount": "12,5"
                },
                {
                    "id": "9",
                    "type": "payment",
                    "transaction_hash": "good",
                    "created_at": "2024-01-01T00:00:00Z",
                    "to": "GTO",
                    "asset_type": "native",
                    "amount": "5"
                },
                {
                    "id": "10",
                    "type": "payment",
                    "transaction_hash": "outgoing",
                    "created_at": "2024-01-01T00:00:00Z",
                    "to": "GELSEWHERE",
                    "asset_type": "native",
                    "amount": "5"
                }
            ]}
        });
        let page: HorizonPage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            page.next_href().as_deref(),
            Some("https://horizon.local/accounts/GTO/payments?cursor=9")
        );

        let payments = collect_incoming(page.embedded.records, "GTO", "XLM");
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].tx_ref, "good");
        assert!(matches!(decode_amount("12,5"), Err(SettlementError::Ambiguous(_))));
    }
}
