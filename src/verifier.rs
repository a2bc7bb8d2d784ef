//! Payment verifier: decides whether a receipt proves an on-chain transfer of
//! the invoiced amount of the invoiced mint.
//!
//! Failure is always reported as an invalid [`Verification`] with a reason;
//! nothing here errors past the contract. If the chain client or facilitator
//! is unreachable the verifier fails closed and the caller is not charged.

use uuid::Uuid;

use crate::chain::{ChainClient, ConfirmedTransaction};
use crate::facilitator::FacilitatorClient;

/// Base-unit slack allowed between the observed balance delta and the
/// invoiced amount. Absorbs rounding from decimal→integer conversion on the
/// payer side only; it is not a fee allowance and is never adjusted
/// per-call.
pub const AMOUNT_TOLERANCE: u64 = 100;

/// Everything needed to check one receipt against one invoice.
#[derive(Debug, Clone)]
pub struct VerificationRequest<'a> {
    pub tx_signature: &'a str,
    pub payment_id: Uuid,
    /// Invoiced amount in base units.
    pub expected_amount: u64,
    pub mint: &'a str,
    pub recipient: &'a str,
    /// Human-readable invoiced amount, echoed into failure reasons.
    pub amount_display: &'a str,
}

/// Verification decision. `reason` is present exactly when `valid` is false.
#[derive(Debug, Clone)]
pub struct Verification {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Verification {
    fn valid() -> Self {
        Verification {
            valid: true,
            reason: None,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Verification {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct PaymentVerifier {
    chain: ChainClient,
    facilitator: FacilitatorClient,
}

impl PaymentVerifier {
    pub fn new(chain: ChainClient, facilitator: FacilitatorClient) -> Self {
        PaymentVerifier { chain, facilitator }
    }

    /// Runs the verification algorithm: facilitator first when one is
    /// configured (only an explicit pass is trusted), then the on-chain
    /// balance-delta check.
    pub async fn verify(&self, request: &VerificationRequest<'_>) -> Verification {
        if self.facilitator.has_verifier()
            && self
                .facilitator
                .passes_verification(request.tx_signature, request.payment_id)
                .await
        {
            return Verification::valid();
        }
        self.verify_on_chain(request).await
    }

    async fn verify_on_chain(&self, request: &VerificationRequest<'_>) -> Verification {
        let transaction = match self.chain.transaction(request.tx_signature).await {
            Ok(Some(transaction)) => transaction,
            Ok(None) => return Verification::invalid("tx not found"),
            Err(e) => {
                tracing::warn!(error = %e, tx = request.tx_signature, "chain lookup failed");
                return Verification::invalid(format!("chain lookup failed: {e}"));
            }
        };
        if transaction.failed {
            return Verification::invalid("tx failed");
        }
        if transaction.pre_token_balances.is_empty() || transaction.post_token_balances.is_empty() {
            return Verification::invalid("no token balance changes");
        }

        match self.find_matching_transfer(&transaction, request) {
            TransferMatch::Found => Verification::valid(),
            TransferMatch::WrongMint(actual) => Verification::invalid(format!(
                "wrong mint: actual={actual} expected={}",
                request.mint
            )),
            TransferMatch::None => Verification::invalid(format!(
                "no valid transfer of {} to {}",
                request.amount_display, request.recipient
            )),
        }
    }

    /// Walks post-balance entries paired with pre-balance entries by account
    /// index (a credited account absent from the pre table counts from zero)
    /// looking for a positive delta within [`AMOUNT_TOLERANCE`] of the
    /// invoiced amount on the invoiced mint.
    fn find_matching_transfer(
        &self,
        transaction: &ConfirmedTransaction,
        request: &VerificationRequest<'_>,
    ) -> TransferMatch {
        let mut wrong_mint: Option<String> = None;
        for post in &transaction.post_token_balances {
            if post.mint != request.mint {
                wrong_mint.get_or_insert_with(|| post.mint.clone());
                continue;
            }
            let pre_units = transaction
                .pre_token_balances
                .iter()
                .find(|pre| pre.account_index == post.account_index)
                .map(|pre| pre.base_units())
                .unwrap_or(0);
            let delta = post.base_units() - pre_units;
            if delta > 0 && delta.abs_diff(i128::from(request.expected_amount)) < u128::from(AMOUNT_TOLERANCE)
            {
                // TODO: require the paymentId in an on-chain memo so one
                // transfer cannot be claimed against two open invoices with
                // the same recipient and amount.
                return TransferMatch::Found;
            }
        }
        match wrong_mint {
            Some(actual) => TransferMatch::WrongMint(actual),
            None => TransferMatch::None,
        }
    }
}

enum TransferMatch {
    Found,
    WrongMint(String),
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const RECIPIENT: &str = "11111111111111111111111111111111";

    fn signature() -> String {
        "5".repeat(88)
    }

    fn request(expected_amount: u64, sig: &str) -> VerificationRequest<'_> {
        VerificationRequest {
            tx_signature: sig,
            payment_id: Uuid::nil(),
            expected_amount,
            mint: MINT,
            recipient: RECIPIENT,
            amount_display: "0.001000",
        }
    }

    fn balance(account_index: u8, mint: &str, amount: &str) -> Value {
        json!({
            "accountIndex": account_index,
            "mint": mint,
            "owner": "tokenAccountOwner",
            "uiTokenAmount": { "amount": amount, "decimals": 6 },
        })
    }

    fn tx_body(pre: Vec<Value>, post: Vec<Value>) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "slot": 1,
                "meta": {
                    "err": null,
                    "preTokenBalances": pre,
                    "postTokenBalances": post,
                },
            },
        })
        .to_string()
    }

    async fn verifier_for(body: String) -> (mockito::ServerGuard, PaymentVerifier) {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/").with_body(body).create_async().await;
        let verifier = PaymentVerifier::new(
            ChainClient::new(server.url()),
            FacilitatorClient::new(None, None),
        );
        (server, verifier)
    }

    #[tokio::test]
    async fn accepts_an_exact_transfer() {
        let body = tx_body(
            vec![balance(1, MINT, "1000000")],
            vec![balance(1, MINT, "1001000")],
        );
        let (_server, verifier) = verifier_for(body).await;
        let sig = signature();
        let verification = verifier.verify(&request(1_000, &sig)).await;
        assert!(verification.valid, "reason: {:?}", verification.reason);
    }

    #[tokio::test]
    async fn tolerance_boundary_accepts_99_rejects_100() {
        let sig = signature();
        // Delta of 1099 against an expected 1000: off by 99, inside tolerance.
        let body = tx_body(
            vec![balance(1, MINT, "1000000")],
            vec![balance(1, MINT, "1001099")],
        );
        let (_server, verifier) = verifier_for(body).await;
        assert!(verifier.verify(&request(1_000, &sig)).await.valid);

        // Off by exactly 100: outside tolerance.
        let body = tx_body(
            vec![balance(1, MINT, "1000000")],
            vec![balance(1, MINT, "1001100")],
        );
        let (_server, verifier) = verifier_for(body).await;
        let verification = verifier.verify(&request(1_000, &sig)).await;
        assert!(!verification.valid);
        assert!(verification.reason.unwrap().contains("no valid transfer"));
    }

    #[tokio::test]
    async fn rejects_debits_even_when_magnitudes_match() {
        let sig = signature();
        let body = tx_body(
            vec![balance(1, MINT, "1001000")],
            vec![balance(1, MINT, "1000000")],
        );
        let (_server, verifier) = verifier_for(body).await;
        assert!(!verifier.verify(&request(1_000, &sig)).await.valid);
    }

    #[tokio::test]
    async fn credit_to_a_fresh_account_counts_from_zero() {
        let sig = signature();
        let body = tx_body(
            vec![balance(2, MINT, "5000000")],
            vec![
                balance(2, MINT, "4999000"),
                balance(3, MINT, "1000"),
            ],
        );
        let (_server, verifier) = verifier_for(body).await;
        assert!(verifier.verify(&request(1_000, &sig)).await.valid);
    }

    #[tokio::test]
    async fn wrong_mint_is_named_in_the_reason() {
        let sig = signature();
        let body = tx_body(
            vec![balance(1, "WrongMint1111111111111111111111111111111111", "0")],
            vec![balance(1, "WrongMint1111111111111111111111111111111111", "1000")],
        );
        let (_server, verifier) = verifier_for(body).await;
        let verification = verifier.verify(&request(1_000, &sig)).await;
        assert!(!verification.valid);
        let reason = verification.reason.unwrap();
        assert!(reason.contains("wrong mint"));
        assert!(reason.contains("WrongMint1111111111111111111111111111111111"));
        assert!(reason.contains(MINT));
    }

    #[tokio::test]
    async fn missing_transaction_is_invalid() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":null}"#.to_string();
        let (_server, verifier) = verifier_for(body).await;
        let sig = signature();
        let verification = verifier.verify(&request(1_000, &sig)).await;
        assert!(!verification.valid);
        assert_eq!(verification.reason.as_deref(), Some("tx not found"));
    }

    #[tokio::test]
    async fn failed_execution_is_invalid() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "slot": 1, "meta": { "err": {"InstructionError": [0, "Custom"]} } },
        })
        .to_string();
        let (_server, verifier) = verifier_for(body).await;
        let sig = signature();
        let verification = verifier.verify(&request(1_000, &sig)).await;
        assert!(!verification.valid);
        assert_eq!(verification.reason.as_deref(), Some("tx failed"));
    }

    #[tokio::test]
    async fn empty_balance_tables_are_invalid() {
        let body = tx_body(vec![], vec![]);
        let (_server, verifier) = verifier_for(body).await;
        let sig = signature();
        let verification = verifier.verify(&request(1_000, &sig)).await;
        assert!(!verification.valid);
        assert_eq!(
            verification.reason.as_deref(),
            Some("no token balance changes")
        );
    }

    #[tokio::test]
    async fn unreachable_chain_fails_closed() {
        let verifier = PaymentVerifier::new(
            ChainClient::new("http://127.0.0.1:1"),
            FacilitatorClient::new(None, None),
        );
        let sig = signature();
        let verification = verifier.verify(&request(1_000, &sig)).await;
        assert!(!verification.valid);
        assert!(verification.reason.unwrap().contains("chain lookup failed"));
    }

    #[tokio::test]
    async fn facilitator_pass_short_circuits_the_chain() {
        let mut facilitator_server = mockito::Server::new_async().await;
        facilitator_server
            .mock("POST", "/verify")
            .with_body(r#"{"verified":true}"#)
            .create_async()
            .await;
        // Chain endpoint is unreachable; a facilitator pass must not need it.
        let verifier = PaymentVerifier::new(
            ChainClient::new("http://127.0.0.1:1"),
            FacilitatorClient::new(
                Some(format!("{}/verify", facilitator_server.url())),
                None,
            ),
        );
        let sig = signature();
        assert!(verifier.verify(&request(1_000, &sig)).await.valid);
    }

    #[tokio::test]
    async fn facilitator_rejection_falls_through_to_chain() {
        let mut facilitator_server = mockito::Server::new_async().await;
        facilitator_server
            .mock("POST", "/verify")
            .with_body(r#"{"valid":false}"#)
            .create_async()
            .await;
        let mut chain_server = mockito::Server::new_async().await;
        chain_server
            .mock("POST", "/")
            .with_body(tx_body(
                vec![balance(1, MINT, "1000000")],
                vec![balance(1, MINT, "1001000")],
            ))
            .create_async()
            .await;
        let verifier = PaymentVerifier::new(
            ChainClient::new(chain_server.url()),
            FacilitatorClient::new(
                Some(format!("{}/verify", facilitator_server.url())),
                None,
            ),
        );
        let sig = signature();
        assert!(verifier.verify(&request(1_000, &sig)).await.valid);
    }
}
