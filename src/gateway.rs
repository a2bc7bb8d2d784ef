//! The request pipeline: challenge → parse receipt → verify → consume →
//! proxy → settlement receipt.
//!
//! One [`Gateway`] per process owns the pricing table, invoice store,
//! verifier, provider registry, and proxy as explicit dependencies; handlers
//! hold it behind an `Arc`. Everything a request touches flows through
//! [`Gateway::handle`].

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::chain::ChainClient;
use crate::config::{CHAIN_TAG, GatewayConfig};
use crate::facilitator::FacilitatorClient;
use crate::invoice::{Invoice, InvoiceStore, MarkUsed, StoreError};
use crate::pricing::{self, PricingTable};
use crate::providers::{ProviderRecord, ProviderRegistry, ProviderTier, SelectionStrategy};
use crate::proxy::UpstreamProxy;
use crate::types::{
    PaymentAccept, PaymentChallenge, PaymentErrorCode, PaymentReceipt, ReceiptError, RpcEnvelope,
    Scheme, SettlementReceipt,
};
use crate::verifier::{PaymentVerifier, VerificationRequest};

/// Successful pipeline outcomes.
#[derive(Debug)]
pub enum RpcReply {
    /// 402 with a freshly minted invoice.
    Challenge(PaymentChallenge),
    /// 200 with the upstream body and the settlement receipt header.
    Proxied {
        body: Value,
        receipt: SettlementReceipt,
    },
}

/// Non-success pipeline outcomes; the handler layer maps these onto HTTP.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A 402 without a fresh invoice.
    #[error("{code}: {message}")]
    Payment {
        code: PaymentErrorCode,
        message: String,
        details: Option<String>,
    },
    /// The invoice store could not serve the request; the caller was not
    /// charged.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    /// The invoice could not be consumed after verification succeeded. The
    /// caller has paid; operators must reconcile.
    #[error("failed to consume invoice {payment_id}")]
    Consume {
        payment_id: Uuid,
        tx_signature: String,
    },
}

impl GatewayError {
    fn payment(code: PaymentErrorCode, message: &str, details: Option<String>) -> Self {
        GatewayError::Payment {
            code,
            message: message.to_string(),
            details,
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    pricing: PricingTable,
    store: InvoiceStore,
    verifier: PaymentVerifier,
    facilitator: FacilitatorClient,
    proxy: UpstreamProxy,
    registry: Arc<ProviderRegistry>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, store: InvoiceStore, registry: Arc<ProviderRegistry>) -> Self {
        let pricing = PricingTable::new(config.price_per_query, &config.method_prices);
        let chain = ChainClient::new(config.chain_rpc_url.clone());
        let facilitator = FacilitatorClient::new(
            config.facilitator_verify_url.clone(),
            config.facilitator_settle_url.clone(),
        );
        let verifier = PaymentVerifier::new(chain, facilitator.clone());
        let strategy = if config.prefer_cheapest {
            SelectionStrategy::Cheapest
        } else {
            SelectionStrategy::Balanced
        };
        let proxy = UpstreamProxy::new(registry.clone(), strategy);
        Gateway {
            config,
            pricing,
            store,
            verifier,
            facilitator,
            proxy,
            registry,
        }
    }

    pub fn store(&self) -> &InvoiceStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Runs one request through the pipeline. `payment_header` is the raw
    /// `X-Payment` value when the caller presented one.
    #[instrument(skip_all, fields(method = %envelope.method, paid = payment_header.is_some()))]
    pub async fn handle(
        &self,
        payment_header: Option<&str>,
        envelope: RpcEnvelope,
    ) -> Result<RpcReply, GatewayError> {
        match payment_header {
            None => {
                let challenge = self.mint_challenge(&envelope, "Payment required").await?;
                Ok(RpcReply::Challenge(challenge))
            }
            Some(raw) => self.consume_receipt(raw, envelope).await,
        }
    }

    /// Prices the call, mints an invoice, and produces the 402 body. Every
    /// call mints a fresh `paymentId`; the price for identical requests is
    /// identical.
    async fn mint_challenge(
        &self,
        envelope: &RpcEnvelope,
        message: &str,
    ) -> Result<PaymentChallenge, GatewayError> {
        let amount = self
            .pricing
            .quote_amount(&envelope.method, envelope.params.as_ref());
        let payment_id = Uuid::new_v4();
        let invoice = Invoice::new(
            amount.clone(),
            self.config.billing_mint.clone(),
            self.config.payment_wallet_address.clone(),
            envelope.method.clone(),
        );
        self.store.create(payment_id, invoice).await?;
        tracing::debug!(%payment_id, amount = %amount, "minted payment challenge");
        Ok(PaymentChallenge {
            error: PaymentErrorCode::PaymentRequired,
            message: message.to_string(),
            accepts: vec![PaymentAccept {
                asset: self.config.billing_asset.clone(),
                chain: CHAIN_TAG.to_string(),
                amount,
                payment_address: self.config.payment_wallet_address.clone(),
                payment_id,
                scheme: Scheme::Exact,
                method: envelope.method.clone(),
            }],
        })
    }

    async fn consume_receipt(
        &self,
        raw_header: &str,
        envelope: RpcEnvelope,
    ) -> Result<RpcReply, GatewayError> {
        let receipt = PaymentReceipt::from_header(raw_header).map_err(|e| match e {
            ReceiptError::Header(details) => GatewayError::payment(
                PaymentErrorCode::InvalidPaymentHeader,
                "X-Payment header is not decodable",
                Some(details),
            ),
            ReceiptError::Payload(details) => GatewayError::payment(
                PaymentErrorCode::InvalidPaymentPayload,
                "X-Payment payload is malformed",
                Some(details),
            ),
        })?;

        let Some(invoice) = self.store.get(receipt.payment_id).await? else {
            // Expired and never-issued ids look the same; either way the
            // caller may redo the flow against a fresh invoice.
            let challenge = self
                .mint_challenge(&envelope, "Payment ID not found or expired")
                .await?;
            return Ok(RpcReply::Challenge(challenge));
        };

        if invoice.used {
            return Err(GatewayError::payment(
                PaymentErrorCode::PaymentAlreadyUsed,
                "Payment has already been used",
                None,
            ));
        }

        let Some(expected_amount) =
            Decimal::from_str(&invoice.amount).ok().and_then(pricing::to_base_units)
        else {
            // Unreadable terms: fail closed, nothing is charged.
            return Err(GatewayError::payment(
                PaymentErrorCode::PaymentInvalid,
                "Payment verification failed",
                Some("invoice amount unreadable".to_string()),
            ));
        };

        let verification = self
            .verifier
            .verify(&VerificationRequest {
                tx_signature: &receipt.tx_signature,
                payment_id: receipt.payment_id,
                expected_amount,
                mint: &invoice.mint,
                recipient: &invoice.recipient,
                amount_display: &invoice.amount,
            })
            .await;
        if !verification.valid {
            return Err(GatewayError::payment(
                PaymentErrorCode::PaymentInvalid,
                "Payment verification failed",
                verification.reason,
            ));
        }

        // The consumption must commit before the proxied call runs; a lost
        // claim here is the concurrent-consumer race resolving against us.
        match self.store.mark_used(receipt.payment_id).await {
            Ok(MarkUsed::Claimed { .. }) => {}
            Ok(MarkUsed::AlreadyUsed) => {
                return Err(GatewayError::payment(
                    PaymentErrorCode::PaymentAlreadyUsed,
                    "Payment has already been used",
                    None,
                ));
            }
            Err(e) => {
                tracing::error!(
                    payment_id = %receipt.payment_id,
                    tx_signature = %receipt.tx_signature,
                    error = %e,
                    "invoice could not be marked used after successful verification; manual reconciliation required"
                );
                return Err(GatewayError::Consume {
                    payment_id: receipt.payment_id,
                    tx_signature: receipt.tx_signature,
                });
            }
        }

        let (body, settled) = tokio::join!(
            self.proxy.forward(&envelope),
            self.facilitator
                .notify_settlement(&receipt.tx_signature, receipt.payment_id),
        );

        Ok(RpcReply::Proxied {
            body,
            receipt: SettlementReceipt {
                tx_signature: receipt.tx_signature,
                payment_id: receipt.payment_id,
                settled,
            },
        })
    }
}

/// Builds the provider registry from configuration: the default upstream,
/// plus the fallback when enabled.
pub fn seeded_registry(config: &GatewayConfig) -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new());
    registry.add(ProviderRecord {
        id: "default".to_string(),
        name: "Default archive".to_string(),
        url: config.upstream_default_url.clone(),
        tier: ProviderTier::Premium,
        price_multiplier: 1.0,
        reputation: 90.0,
        uptime: 99.9,
        latency_ms: 200.0,
        features: vec!["historical".to_string()],
    });
    if config.use_fallback {
        if let Some(url) = &config.upstream_fallback_url {
            registry.add(ProviderRecord {
                id: "fallback".to_string(),
                name: "Fallback archive".to_string(),
                url: url.clone(),
                tier: ProviderTier::Public,
                price_multiplier: 0.8,
                reputation: 75.0,
                uptime: 99.0,
                latency_ms: 400.0,
                features: vec!["historical".to_string()],
            });
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    const WALLET: &str = "11111111111111111111111111111111";
    const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn config() -> GatewayConfig {
        GatewayConfig {
            port: 0,
            payment_wallet_address: WALLET.to_string(),
            billing_mint: MINT.to_string(),
            billing_asset: "USDC".to_string(),
            price_per_query: pricing::default_price_per_query(),
            method_prices: HashMap::new(),
            chain_rpc_url: "http://127.0.0.1:1".to_string(),
            upstream_default_url: "http://127.0.0.1:1".to_string(),
            upstream_fallback_url: None,
            use_fallback: false,
            prefer_cheapest: false,
            facilitator_verify_url: None,
            facilitator_settle_url: None,
            invoice_store_url: None,
            invoice_store_token: None,
            invoice_ttl: Duration::from_secs(900),
            rate_limit_window_ms: 60_000,
            rate_limit_max: 100,
        }
    }

    fn gateway() -> Gateway {
        let config = config();
        let store = InvoiceStore::in_memory(config.invoice_ttl);
        let registry = seeded_registry(&config);
        Gateway::new(config, store, registry)
    }

    fn envelope(method: &str, params: Value) -> RpcEnvelope {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unpaid_requests_mint_distinct_invoices_with_equal_terms() {
        let gateway = gateway();
        let first = gateway
            .handle(None, envelope("getBlock", json!([14000000])))
            .await
            .unwrap();
        let second = gateway
            .handle(None, envelope("getBlock", json!([14000000])))
            .await
            .unwrap();

        let (RpcReply::Challenge(first), RpcReply::Challenge(second)) = (first, second) else {
            panic!("expected challenges");
        };
        let (a, b) = (&first.accepts[0], &second.accepts[0]);
        assert_ne!(a.payment_id, b.payment_id);
        assert_eq!(a.amount, b.amount);
        assert_eq!(a.amount, "0.001000");
        assert_eq!(a.payment_address, b.payment_address);
        assert_eq!(a.method, "getBlock");
        assert_eq!(a.chain, "solana");
    }

    #[tokio::test]
    async fn unknown_payment_id_yields_a_fresh_challenge() {
        let gateway = gateway();
        let header = crate::types::Base64Bytes::encode(
            json!({
                "txSignature": "5".repeat(88),
                "paymentId": Uuid::new_v4().to_string(),
            })
            .to_string(),
        );
        let header = String::from_utf8(header.0.into_owned()).unwrap();

        let reply = gateway
            .handle(Some(&header), envelope("getBlock", json!([14000000])))
            .await
            .unwrap();
        let RpcReply::Challenge(challenge) = reply else {
            panic!("expected a fresh challenge");
        };
        assert_eq!(challenge.message, "Payment ID not found or expired");
        assert_eq!(challenge.error, PaymentErrorCode::PaymentRequired);
    }

    #[tokio::test]
    async fn garbage_header_is_rejected_before_any_lookup() {
        let gateway = gateway();
        let error = gateway
            .handle(Some("%%%"), envelope("getSlot", json!([])))
            .await
            .unwrap_err();
        let GatewayError::Payment { code, .. } = error else {
            panic!("expected a payment error");
        };
        assert_eq!(code, PaymentErrorCode::InvalidPaymentHeader);
    }
}
