//! M-Pesa STK-push payment gateway client.
//!
//! Implements the Daraja OAuth + STK-push flow for payment initiation. An
//! accepted push only means the subscriber's handset has been prompted; the
//! actual confirmation arrives later through the asynchronous payment-result
//! callback, so an accepted request maps to [`PaymentOutcome::Pending`].

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::billing::payment::{whole_units, PaymentGateway, PaymentOutcome};
use crate::config::MpesaConfig;

/// M-Pesa client for the Daraja sandbox/production API.
#[derive(Clone)]
pub struct MpesaGateway {
    client: Client,
    config: MpesaConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// STK-push initiation request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'a str,
    amount: u64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    account_reference: String,
    transaction_desc: &'a str,
}

/// STK-push initiation response.
#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "ResponseCode", default)]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: String,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Fetch an OAuth access token.
    async fn access_token(&self) -> Result<String, AppError> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );

        let response = self
            .client
            .get(&url)
            .basic_auth(
                self.config.consumer_key.expose_secret(),
                Some(self.config.consumer_secret.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("M-Pesa token request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::BadGateway(format!("M-Pesa token request rejected: {}", e)))?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("M-Pesa token response invalid: {}", e)))?;

        Ok(token.access_token)
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    async fn request_payment(
        &self,
        phone: &str,
        amount: Decimal,
        invoice_id: Uuid,
    ) -> Result<PaymentOutcome, AppError> {
        let token = self.access_token().await?;

        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode,
            self.config.passkey.expose_secret(),
            timestamp
        ));

        let request = StkPushRequest {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount: whole_units(amount),
            party_a: phone,
            party_b: &self.config.shortcode,
            phone_number: phone,
            callback_url: &self.config.callback_url,
            account_reference: format!("INV{}", invoice_id.simple()),
            transaction_desc: "Internet subscription",
        };

        let response = self
            .client
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.config.base_url
            ))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("M-Pesa STK push failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::BadGateway(format!("M-Pesa STK push rejected: {}", e)))?;

        let body: StkPushResponse = response
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("M-Pesa STK response invalid: {}", e)))?;

        if body.response_code == "0" {
            tracing::info!(
                invoice_id = %invoice_id,
                checkout_request_id = %body.checkout_request_id,
                "STK push accepted; awaiting subscriber confirmation"
            );
            Ok(PaymentOutcome::Pending)
        } else {
            tracing::warn!(
                invoice_id = %invoice_id,
                response_code = %body.response_code,
                description = %body.response_description,
                "STK push declined"
            );
            Ok(PaymentOutcome::Failed)
        }
    }
}
